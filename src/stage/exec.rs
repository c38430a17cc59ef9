use super::ResolvedCommand;
use crate::cancel::CancelFlag;
use crate::config::{render_template, TemplateVars};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Combined stdout/stderr of a trial, kept in its working directory.
pub(crate) const TRIAL_LOG_NAME: &str = "trial.log";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Fully rendered command line for one run of a tool.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    program: PathBuf,
    args: Vec<String>,
    workdir: PathBuf,
}

impl Invocation {
    pub(crate) fn new(
        command: &ResolvedCommand,
        templates: &[String],
        vars: &TemplateVars,
        workdir: &Path,
    ) -> Self {
        let mut args = command.leading_args.clone();
        args.extend(
            templates
                .iter()
                .map(|template| render_template(template, vars)),
        );
        Self {
            program: command.program.clone(),
            args,
            workdir: workdir.to_path_buf(),
        }
    }

    pub(crate) fn log_path(&self) -> PathBuf {
        self.workdir.join(TRIAL_LOG_NAME)
    }

    pub(crate) fn command_line(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.display().to_string());
        words.extend(self.args.iter().cloned());
        shell_words::join(words)
    }
}

/// How the external process ended.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Spawn the invocation in its working directory and block until it exits,
/// the timeout elapses, or cancellation is requested. In the last two cases
/// the child is killed before returning.
pub(crate) fn execute(
    invocation: &Invocation,
    timeout: Option<Duration>,
    cancel: &CancelFlag,
) -> Result<ExecOutcome> {
    fs::create_dir_all(&invocation.workdir)
        .with_context(|| format!("create {}", invocation.workdir.display()))?;
    let log_path = invocation.log_path();
    let log = fs::File::create(&log_path)
        .with_context(|| format!("create {}", log_path.display()))?;
    let log_for_stderr = log
        .try_clone()
        .with_context(|| format!("clone handle for {}", log_path.display()))?;

    tracing::debug!(
        command = %invocation.command_line(),
        cwd = %invocation.workdir.display(),
        "spawning tool"
    );
    let start = Instant::now();
    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .current_dir(&invocation.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_for_stderr))
        .spawn()
        .with_context(|| format!("spawn {}", invocation.program.display()))?;

    let mut outcome = wait_for_child(&mut child, start, timeout, cancel)?;
    outcome.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    Ok(outcome)
}

fn wait_for_child(
    child: &mut Child,
    start: Instant,
    timeout: Option<Duration>,
    cancel: &CancelFlag,
) -> Result<ExecOutcome> {
    loop {
        if let Some(status) = child.try_wait().context("poll child process")? {
            return Ok(ExecOutcome {
                exit_code: status.code(),
                ..ExecOutcome::default()
            });
        }
        let timed_out = timeout.is_some_and(|limit| start.elapsed() >= limit);
        let cancelled = cancel.is_cancelled();
        if timed_out || cancelled {
            // The child may have exited between the poll and the kill.
            let _ = child.kill();
            let status = child.wait().context("reap killed child process")?;
            return Ok(ExecOutcome {
                exit_code: status.code(),
                timed_out,
                cancelled,
                duration_ms: 0,
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}
