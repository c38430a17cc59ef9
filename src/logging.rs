//! Log setup: a console layer on stderr plus one timestamped file per run.
use crate::util::now_epoch_ms;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Target for events that belong in the run log but not on the console.
pub const LOG_FILE_TARGET: &str = "run_log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn from_flags(quiet: bool, verbose: bool) -> Self {
        match (quiet, verbose) {
            (true, _) => Verbosity::Quiet,
            (false, true) => Verbosity::Verbose,
            (false, false) => Verbosity::Normal,
        }
    }

    fn console_level(self) -> &'static str {
        match self {
            Verbosity::Quiet => "warn",
            Verbosity::Normal => "info",
            Verbosity::Verbose => "debug",
        }
    }
}

/// Path of the log file for a run started at `epoch_ms`.
pub fn log_file_path(logs_dir: &Path, epoch_ms: u128) -> PathBuf {
    logs_dir.join(format!("pipeline_{epoch_ms}.log"))
}

/// Install the global subscriber. `RUST_LOG` overrides the console level.
/// Returns the path of this run's log file.
pub fn init(logs_dir: &Path, verbosity: Verbosity) -> Result<PathBuf> {
    fs::create_dir_all(logs_dir).with_context(|| format!("create {}", logs_dir.display()))?;
    let log_path = log_file_path(logs_dir, now_epoch_ms()?);
    let file =
        fs::File::create(&log_path).with_context(|| format!("create {}", log_path.display()))?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.console_level()))
        .add_directive(
            format!("{LOG_FILE_TARGET}=off")
                .parse::<Directive>()
                .context("parse console log directive")?,
        );
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);
    let run_log = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(console)
        .with(run_log)
        .try_init()
        .context("install log subscriber")?;
    Ok(log_path)
}
