//! Stage runner.
//!
//! Executes one external tool across a sweep of K values and run indices.
//! Each (K, run) pair is an independent trial with its own working directory
//! and captured log; a failed trial is recorded and the sweep continues.
//! Whether the stage as a whole is acceptable is decided by the pipeline.
mod exec;
mod metric;

use crate::cancel::CancelFlag;
use crate::config::{render_template, SatisfactionPolicy, TemplateVars, ToolSpec};
use crate::error::TrialExecutionError;
use crate::util::tail_string;
use anyhow::{anyhow, Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use exec::{execute, ExecOutcome, Invocation, TRIAL_LOG_NAME};
use metric::MetricExtractor;

/// Bytes of captured output kept on a failed trial for the summary.
const MAX_OUTPUT_EXCERPT_BYTES: usize = 2048;

/// Seeds for different K values are spaced this far apart.
const SEED_K_STRIDE: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Admixture,
    Structure,
    Clumpak,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [
        StageKind::Admixture,
        StageKind::Structure,
        StageKind::Clumpak,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Admixture => "admixture",
            StageKind::Structure => "structure",
            StageKind::Clumpak => "clumpak",
        }
    }

    /// Position in the pipeline, starting at 1.
    pub fn ordinal(&self) -> usize {
        match self {
            StageKind::Admixture => 1,
            StageKind::Structure => 2,
            StageKind::Clumpak => 3,
        }
    }

    /// Stages whose algorithm depends on a random seed.
    pub fn is_stochastic(&self) -> bool {
        !matches!(self, StageKind::Clumpak)
    }

    /// Working directory of one trial below the stage's trial root.
    pub fn trial_dir(&self, trial_root: &Path, key: TrialKey) -> PathBuf {
        match self {
            StageKind::Admixture => trial_root.join(format!("K{}_run{}", key.k, key.run)),
            StageKind::Structure => trial_root
                .join(format!("K{}", key.k))
                .join(format!("run{}", key.run)),
            StageKind::Clumpak => trial_root.join(format!("K{}", key.k)),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TrialKey {
    pub k: u32,
    pub run: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialResult {
    pub key: TrialKey,
    pub status: TrialStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub workdir: PathBuf,
    pub primary_output: PathBuf,
    pub log_path: PathBuf,
    /// `None` when the tool did not report the metric ("NA").
    pub metric: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// True when `--resume` accepted an existing artifact without running.
    pub reused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TrialExecutionError>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output_excerpt: String,
}

impl TrialResult {
    pub fn succeeded(&self) -> bool {
        self.status == TrialStatus::Success
    }
}

pub type StageResults = BTreeMap<TrialKey, TrialResult>;

/// Program path resolved once per stage plus the leading words of the
/// configured executable.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

impl ResolvedCommand {
    pub fn resolve(tool: &ToolSpec) -> Result<Self> {
        let mut words = tool.command_words()?;
        let name = words.remove(0);
        let program =
            which::which(&name).with_context(|| format!("resolve executable {name:?}"))?;
        Ok(Self {
            program,
            leading_args: words,
        })
    }
}

/// Everything needed to run one stage's trials.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub kind: StageKind,
    pub tool: ToolSpec,
    pub command: ResolvedCommand,
    pub trial_root: PathBuf,
    /// Stage-wide placeholder values; per-trial values are added on top.
    pub vars: TemplateVars,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub jobs: usize,
    pub timeout: Option<Duration>,
    pub base_seed: u64,
    pub resume: bool,
    pub cancel: CancelFlag,
}

/// Deterministic, distinct seed per (K, run) for fewer than 1000 runs per K.
pub fn derive_seed(base_seed: u64, k: u32, run: u32) -> u64 {
    base_seed
        .wrapping_add(u64::from(k).wrapping_mul(SEED_K_STRIDE))
        .wrapping_add(u64::from(run))
}

/// Run every (K, run) trial of a stage and collect the results.
pub fn run_stage(
    spec: &StageSpec,
    ks: &[u32],
    runs_per_k: u32,
    options: &RunnerOptions,
) -> Result<StageResults> {
    let extractor = spec
        .tool
        .metric
        .as_ref()
        .map(MetricExtractor::new)
        .transpose()?;
    let keys: Vec<TrialKey> = ks
        .iter()
        .flat_map(|&k| (1..=runs_per_k.max(1)).map(move |run| TrialKey { k, run }))
        .collect();
    tracing::info!(
        stage = %spec.kind,
        step = spec.kind.ordinal(),
        trials = keys.len(),
        jobs = options.jobs,
        "stage started"
    );

    let results: Vec<TrialResult> = if options.jobs <= 1 {
        keys.iter()
            .map(|key| run_trial(spec, *key, extractor.as_ref(), options))
            .collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.jobs)
            .build()
            .context("build trial worker pool")?;
        pool.install(|| {
            keys.par_iter()
                .map(|key| run_trial(spec, *key, extractor.as_ref(), options))
                .collect()
        })
    };

    let succeeded = results.iter().filter(|result| result.succeeded()).count();
    tracing::info!(
        stage = %spec.kind,
        succeeded,
        failed = results.len() - succeeded,
        "stage finished"
    );
    Ok(results
        .into_iter()
        .map(|result| (result.key, result))
        .collect())
}

fn run_trial(
    spec: &StageSpec,
    key: TrialKey,
    extractor: Option<&MetricExtractor>,
    options: &RunnerOptions,
) -> TrialResult {
    let workdir = spec.kind.trial_dir(&spec.trial_root, key);
    let seed = spec
        .kind
        .is_stochastic()
        .then(|| derive_seed(options.base_seed, key.k, key.run));

    let mut vars = spec.vars.clone();
    vars.insert("k", key.k.to_string());
    vars.insert("run", key.run.to_string());
    vars.insert("output_dir", workdir.display().to_string());
    if let Some(seed) = seed {
        vars.insert("seed", seed.to_string());
    }
    let primary_output = workdir.join(render_template(
        spec.tool.primary_output.as_deref().unwrap_or_default(),
        &vars,
    ));
    let log_path = workdir.join(TRIAL_LOG_NAME);

    let mut result = TrialResult {
        key,
        status: TrialStatus::Failure,
        seed,
        workdir: workdir.clone(),
        primary_output: primary_output.clone(),
        log_path: log_path.clone(),
        metric: None,
        exit_code: None,
        duration_ms: 0,
        reused: false,
        error: None,
        output_excerpt: String::new(),
    };

    if options.cancel.is_cancelled() {
        result.error = Some(TrialExecutionError::Cancelled);
        return result;
    }

    if options.resume && artifact_is_nonempty(&primary_output) {
        tracing::info!(
            stage = %spec.kind,
            k = key.k,
            run = key.run,
            "reusing existing trial output"
        );
        result.status = TrialStatus::Success;
        result.reused = true;
        result.metric = extractor.and_then(|extractor| extractor.extract_from(&result));
        return result;
    }

    if spec.tool.primary_output.is_some() {
        if let Err(err) = remove_stale_output(&primary_output) {
            let message = format!("{err:#}");
            tracing::warn!(
                stage = %spec.kind,
                k = key.k,
                run = key.run,
                error = %message,
                "previous output could not be removed"
            );
            result.error = Some(TrialExecutionError::StaleOutput {
                path: primary_output,
                message,
            });
            return result;
        }
    }

    let invocation = Invocation::new(&spec.command, &spec.tool.args, &vars, &workdir);
    let outcome = match execute(&invocation, options.timeout, &options.cancel) {
        Ok(outcome) => outcome,
        Err(err) => {
            let message = format!("{err:#}");
            tracing::warn!(
                stage = %spec.kind,
                k = key.k,
                run = key.run,
                error = %message,
                "trial did not start"
            );
            result.error = Some(TrialExecutionError::Spawn {
                program: spec.command.program.display().to_string(),
                message,
            });
            return result;
        }
    };

    result.exit_code = outcome.exit_code;
    result.duration_ms = outcome.duration_ms;
    let (status, error) = classify_trial(&outcome, &primary_output, options.timeout);
    result.status = status;
    result.error = error;

    match result.status {
        TrialStatus::Success => {
            if outcome.exit_code != Some(0) {
                tracing::warn!(
                    stage = %spec.kind,
                    k = key.k,
                    run = key.run,
                    exit_code = ?outcome.exit_code,
                    "tool exited abnormally but produced its output"
                );
            }
            result.metric = extractor.and_then(|extractor| extractor.extract_from(&result));
            tracing::info!(
                stage = %spec.kind,
                k = key.k,
                run = key.run,
                elapsed_ms = outcome.duration_ms,
                metric = ?result.metric,
                "trial succeeded"
            );
        }
        TrialStatus::Failure => {
            let captured = fs::read_to_string(&log_path).unwrap_or_default();
            result.output_excerpt = tail_string(&captured, MAX_OUTPUT_EXCERPT_BYTES);
            let reason = result
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            tracing::warn!(
                stage = %spec.kind,
                k = key.k,
                run = key.run,
                elapsed_ms = outcome.duration_ms,
                %reason,
                "trial failed"
            );
        }
    }
    result
}

/// Decide a trial's status from the process outcome and its artifact.
///
/// A timed-out or cancelled trial always fails. Otherwise the trial succeeds
/// exactly when the primary output exists and is nonempty, whatever the exit
/// code was.
pub fn classify_trial(
    outcome: &ExecOutcome,
    primary_output: &Path,
    timeout: Option<Duration>,
) -> (TrialStatus, Option<TrialExecutionError>) {
    if outcome.cancelled {
        return (TrialStatus::Failure, Some(TrialExecutionError::Cancelled));
    }
    if outcome.timed_out {
        let seconds = timeout.map(|limit| limit.as_secs()).unwrap_or_default();
        return (
            TrialStatus::Failure,
            Some(TrialExecutionError::TimedOut { seconds }),
        );
    }
    if artifact_is_nonempty(primary_output) {
        return (TrialStatus::Success, None);
    }
    (
        TrialStatus::Failure,
        Some(TrialExecutionError::MissingOutput {
            path: primary_output.to_path_buf(),
            exit_code: outcome.exit_code,
        }),
    )
}

/// Delete an artifact left by an earlier run so that only output written by
/// the coming invocation can mark it successful.
fn remove_stale_output(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed previous output");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

pub fn artifact_is_nonempty(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// K values without a single successful trial.
pub fn unsatisfied_ks(results: &StageResults, ks: &[u32]) -> Vec<u32> {
    let satisfied: BTreeSet<u32> = results
        .values()
        .filter(|result| result.succeeded())
        .map(|result| result.key.k)
        .collect();
    ks.iter()
        .copied()
        .filter(|k| !satisfied.contains(k))
        .collect()
}

pub fn stage_satisfied(unsatisfied: &[u32], ks: &[u32], policy: SatisfactionPolicy) -> bool {
    match policy {
        SatisfactionPolicy::EveryK => unsatisfied.is_empty(),
        SatisfactionPolicy::AnyK => unsatisfied.len() < ks.len(),
    }
}

/// Mean metric per K over successful trials that reported one.
pub fn metrics_by_k(results: &StageResults) -> BTreeMap<u32, Option<f64>> {
    let mut grouped: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for result in results.values() {
        let values = grouped.entry(result.key.k).or_default();
        if let (true, Some(metric)) = (result.succeeded(), result.metric) {
            values.push(metric);
        }
    }
    grouped
        .into_iter()
        .map(|(k, values)| {
            let mean =
                (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64);
            (k, mean)
        })
        .collect()
}

/// Outcome of a one-off tool invocation outside a K sweep.
#[derive(Debug, Clone)]
pub struct AuxiliaryOutcome {
    pub succeeded: bool,
    pub primary_output: Option<PathBuf>,
    pub log_path: PathBuf,
    pub detail: String,
}

/// Run a tool once in `workdir`. With a primary output the artifact decides
/// success as for trials; without one a zero exit status does.
pub fn run_auxiliary(
    label: &str,
    tool: &ToolSpec,
    vars: &TemplateVars,
    workdir: &Path,
    options: &RunnerOptions,
) -> Result<AuxiliaryOutcome> {
    if options.cancel.is_cancelled() {
        return Err(anyhow!("{label} cancelled before start"));
    }
    let command = ResolvedCommand::resolve(tool)?;
    let mut vars = vars.clone();
    vars.insert("output_dir", workdir.display().to_string());
    let primary_output = tool
        .primary_output
        .as_deref()
        .map(|template| workdir.join(render_template(template, &vars)));
    if let Some(path) = &primary_output {
        remove_stale_output(path).with_context(|| format!("prepare {label}"))?;
    }
    let invocation = Invocation::new(&command, &tool.args, &vars, workdir);
    let log_path = invocation.log_path();
    let outcome = execute(&invocation, options.timeout, &options.cancel)
        .with_context(|| format!("run {label}"))?;

    let (succeeded, detail) = match &primary_output {
        Some(path) => match classify_trial(&outcome, path, options.timeout) {
            (TrialStatus::Success, _) => (true, String::new()),
            (TrialStatus::Failure, error) => (
                false,
                error.map(|error| error.to_string()).unwrap_or_default(),
            ),
        },
        None if outcome.cancelled => (false, TrialExecutionError::Cancelled.to_string()),
        None if outcome.timed_out => (false, "timed out".to_string()),
        None => match outcome.exit_code {
            Some(0) => (true, String::new()),
            Some(code) => (false, format!("exited with status {code}")),
            None => (false, "terminated by signal".to_string()),
        },
    };
    tracing::info!(
        label,
        succeeded,
        elapsed_ms = outcome.duration_ms,
        "auxiliary tool finished"
    );
    Ok(AuxiliaryOutcome {
        succeeded,
        primary_output,
        log_path,
        detail,
    })
}

#[cfg(test)]
#[path = "stage_tests.rs"]
mod tests;
