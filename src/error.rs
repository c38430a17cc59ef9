//! Error taxonomy for the pipeline.
//!
//! Fatal errors are `PipelineError` values and end the run; trial and staging
//! errors are recorded alongside results and surface in the summary.
use crate::stage::StageKind;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal pipeline errors. Each maps to a process exit code in `main`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing input file(s): {}", join_paths(.files))]
    MissingInput { files: Vec<PathBuf> },

    #[error("insufficient input data: {}", join_display(.violations))]
    InsufficientData { violations: Vec<ThresholdViolation> },

    #[error("missing external executable(s): {}", .executables.join(", "))]
    MissingDependency { executables: Vec<String> },

    #[error("stage {stage} failed: no successful trial for K in {}", join_ks(.unsatisfied))]
    StageFailed {
        stage: StageKind,
        unsatisfied: Vec<u32>,
    },

    #[error("pipeline cancelled during {stage}")]
    Cancelled { stage: String },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

impl PipelineError {
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::InvalidArguments(_) => 2,
            _ => 1,
        }
    }
}

/// One failed shape check from the precondition validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThresholdViolation {
    pub check: String,
    pub measured: u64,
    pub threshold: u64,
}

impl fmt::Display for ThresholdViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is {} (minimum {})",
            self.check, self.measured, self.threshold
        )
    }
}

/// Why a single trial was classified as a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrialExecutionError {
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("timed out after {seconds}s")]
    TimedOut { seconds: u64 },

    #[error("cancelled before completion")]
    Cancelled,

    #[error("could not clear previous output {}: {message}", .path.display())]
    StaleOutput { path: PathBuf, message: String },

    #[error("expected output {} missing or empty (exit {})", .path.display(), exit_label(.exit_code))]
    MissingOutput {
        path: PathBuf,
        exit_code: Option<i32>,
    },
}

/// A non-fatal problem while copying one trial artifact into a prepared dir.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("K{k} run {run}: {reason}")]
pub struct StagingError {
    pub k: u32,
    pub run: u32,
    pub reason: String,
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_ks(ks: &[u32]) -> String {
    let rendered: Vec<String> = ks.iter().map(|k| k.to_string()).collect();
    format!("{{{}}}", rendered.join(", "))
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}
