//! Pipeline controller.
//!
//! Drives one run through
//! `Validating -> Admixture -> Structure -> Alignment -> Reporting -> Done`,
//! with `Aborted` reachable from every state. A stage only hands over to the
//! next one when it is satisfied; skipped stages pass through without running
//! anything. The summary is written whether the run finishes or aborts.
mod cleanup;
mod structure;

use crate::cancel::CancelFlag;
use crate::config::{PipelineConfig, TemplateVars};
use crate::dataset::{Dataset, DatasetStats};
use crate::error::PipelineError;
use crate::estimate::estimate_runtime;
use crate::logging::LOG_FILE_TARGET;
use crate::paths::OutputPaths;
use crate::stage::{
    metrics_by_k, run_auxiliary, run_stage, stage_satisfied, unsatisfied_ks, ResolvedCommand,
    RunnerOptions, StageKind, StageResults, StageSpec,
};
use crate::staging::{
    stage_for_alignment, stage_results, AlignmentInputs, AlignmentSource, ArtifactFormat,
};
use crate::summary::{
    write_cv_errors, write_method_comparison, AnalysisSummary, ComparisonRow, StageSummary,
    StepStatus, TrialFailure,
};
use crate::util::format_duration;
use crate::validate::{required_executables, validate_preconditions};
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Validating,
    Admixture,
    Structure,
    Alignment,
    Reporting,
    Done,
    Aborted,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Validating => "validating",
            PipelineState::Admixture => "admixture",
            PipelineState::Structure => "structure",
            PipelineState::Alignment => "alignment",
            PipelineState::Reporting => "reporting",
            PipelineState::Done => "done",
            PipelineState::Aborted => "aborted",
        }
    }

    fn for_stage(stage: StageKind) -> Self {
        match stage {
            StageKind::Admixture => PipelineState::Admixture,
            StageKind::Structure => PipelineState::Structure,
            StageKind::Clumpak => PipelineState::Alignment,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one stage during the run.
#[derive(Debug, Clone)]
pub struct StageRecord {
    pub status: StepStatus,
    pub results: StageResults,
    pub staged: usize,
    pub unsatisfied: Vec<u32>,
    pub metrics: BTreeMap<u32, Option<f64>>,
}

impl StageRecord {
    fn with_status(status: StepStatus) -> Self {
        Self {
            status,
            results: StageResults::new(),
            staged: 0,
            unsatisfied: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }
}

/// One pipeline invocation: configuration plus everything accumulated so far.
#[derive(Debug)]
pub struct PipelineRun {
    config: PipelineConfig,
    paths: OutputPaths,
    dataset: Dataset,
    cancel: CancelFlag,
    log_path: Option<PathBuf>,
    state: PipelineState,
    stats: Option<DatasetStats>,
    estimate: Duration,
    reporter_available: bool,
    stages: BTreeMap<StageKind, StageRecord>,
    report: StepStatus,
    warnings: Vec<String>,
    error: Option<String>,
}

impl PipelineRun {
    pub fn new(
        config: PipelineConfig,
        cancel: CancelFlag,
        log_path: Option<PathBuf>,
    ) -> Result<Self> {
        let dataset = Dataset::from_prefix(&config.input_prefix)?;
        let paths = OutputPaths::new(config.output_base.clone());
        let stages = StageKind::ALL
            .into_iter()
            .map(|kind| (kind, StageRecord::with_status(StepStatus::NotReached)))
            .collect();
        Ok(Self {
            config,
            paths,
            dataset,
            cancel,
            log_path,
            state: PipelineState::Validating,
            stats: None,
            estimate: Duration::ZERO,
            reporter_available: false,
            stages,
            report: StepStatus::NotReached,
            warnings: Vec::new(),
            error: None,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn paths(&self) -> &OutputPaths {
        &self.paths
    }

    /// Run to `Done` or `Aborted`. The summary is written in both cases;
    /// the error that aborted the run is returned after that.
    pub fn execute(&mut self) -> Result<()> {
        tracing::info!(
            input = %self.dataset.prefix().display(),
            min_k = self.config.k_range.min,
            max_k = self.config.k_range.max,
            output_base = %self.paths.root().display(),
            "pipeline started"
        );
        let outcome = self.drive();
        match &outcome {
            Ok(()) => self.transition(PipelineState::Done),
            Err(err) => {
                let message = format!("{err:#}");
                tracing::error!(state = %self.state, error = %message, "pipeline aborted");
                self.error = Some(message);
                self.transition(PipelineState::Aborted);
            }
        }

        let written = self.write_summary();
        if outcome.is_ok() && self.config.cleanup {
            cleanup::remove_transient_files(self.paths.root());
        }
        outcome?;
        written
    }

    fn drive(&mut self) -> Result<()> {
        self.validate()?;
        for stage in StageKind::ALL {
            self.check_cancel(stage.as_str())?;
            self.transition(PipelineState::for_stage(stage));
            if self.config.skips.is_skipped(stage) {
                tracing::info!(%stage, "stage skipped");
                self.set_record(stage, StageRecord::with_status(StepStatus::Skipped));
                continue;
            }
            match stage {
                StageKind::Admixture => self.run_admixture()?,
                StageKind::Structure => self.run_structure()?,
                StageKind::Clumpak => self.run_alignment()?,
            }
        }
        self.check_cancel("reporting")?;
        self.transition(PipelineState::Reporting);
        self.run_report();
        self.check_cancel("reporting")
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::info!(from = %self.state, to = %next, "pipeline state changed");
        self.state = next;
    }

    fn check_cancel(&self, stage: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled {
                stage: stage.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn warn(&mut self, warning: String) {
        tracing::warn!(%warning, "recorded warning");
        self.warnings.push(warning);
    }

    fn set_record(&mut self, stage: StageKind, record: StageRecord) {
        self.stages.insert(stage, record);
    }

    fn status_of(&self, stage: StageKind) -> StepStatus {
        self.stages
            .get(&stage)
            .map(|record| record.status)
            .unwrap_or(StepStatus::NotReached)
    }

    fn validate(&mut self) -> Result<()> {
        let required = required_executables(&self.config)?;
        let report = validate_preconditions(&self.dataset, &self.config.thresholds, &required)?;
        self.reporter_available = report.reporter_available;
        self.warnings.extend(report.warnings);
        let cores = available_cores();
        let threads = self.config.effective_threads(cores);
        if threads < self.config.threads {
            self.warn(format!(
                "--threads {} exceeds the {cores} available cores; tools get {threads} threads",
                self.config.threads
            ));
        }

        let to_i64 = |value: u64| i64::try_from(value).unwrap_or(i64::MAX);
        let k_count = to_i64(self.config.k_range.count() as u64);
        self.estimate = [StageKind::Admixture, StageKind::Structure]
            .into_iter()
            .filter(|stage| !self.config.skips.is_skipped(*stage))
            .map(|stage| {
                estimate_runtime(
                    k_count,
                    to_i64(report.stats.samples),
                    to_i64(report.stats.variants),
                    i64::from(self.config.runs_for(stage)),
                )
            })
            .fold(Duration::ZERO, Duration::saturating_add);
        tracing::info!(
            samples = report.stats.samples,
            variants = report.stats.variants,
            executables = report.resolved.len(),
            estimate = %format_duration(self.estimate),
            "preconditions passed"
        );
        self.stats = Some(report.stats);
        Ok(())
    }

    fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            jobs: self.config.effective_jobs(available_cores()),
            timeout: self.config.trial_timeout,
            base_seed: self.config.base_seed,
            resume: self.config.resume,
            cancel: self.cancel.clone(),
        }
    }

    /// Placeholder values shared by every tool invocation.
    fn dataset_vars(&self) -> TemplateVars {
        let mut vars = TemplateVars::from([
            ("prefix", self.dataset.prefix().display().to_string()),
            ("bed", self.dataset.genotype_path().display().to_string()),
            ("stem", self.dataset.stem()),
            (
                "threads",
                self.config.effective_threads(available_cores()).to_string(),
            ),
            ("cv_folds", self.config.cv_folds.to_string()),
        ]);
        if let Some(stats) = &self.stats {
            vars.insert("samples", stats.samples.to_string());
            vars.insert("loci", stats.variants.to_string());
        }
        vars
    }

    /// Run every trial of `stage`, stage the successful ones into
    /// `staging_dir`, and decide whether the stage is satisfied.
    fn run_sweep(
        &mut self,
        stage: StageKind,
        ks: &[u32],
        vars: TemplateVars,
        format: ArtifactFormat,
        staging_dir: PathBuf,
    ) -> Result<()> {
        let tool = self.config.tools.for_stage(stage).clone();
        let spec = StageSpec {
            kind: stage,
            command: ResolvedCommand::resolve(&tool)?,
            tool,
            trial_root: self.paths.trial_root(stage),
            vars,
        };
        let results = run_stage(&spec, ks, self.config.runs_for(stage), &self.runner_options())?;
        let required = self.config.k_range.values();
        let unsatisfied = unsatisfied_ks(&results, &required);
        let metrics = metrics_by_k(&results);

        if self.cancel.is_cancelled() {
            self.set_record(
                stage,
                StageRecord {
                    status: StepStatus::Failed,
                    results,
                    staged: 0,
                    unsatisfied,
                    metrics,
                },
            );
            return self.check_cancel(stage.as_str());
        }

        let staging = stage_results(&results, &staging_dir, format)?;
        for warning in &staging.warnings {
            self.warn(format!("{stage} staging: {warning}"));
        }
        let satisfied = stage_satisfied(&unsatisfied, &required, self.config.policy);
        self.set_record(
            stage,
            StageRecord {
                status: if satisfied {
                    StepStatus::Completed
                } else {
                    StepStatus::Failed
                },
                results,
                staged: staging.staged.len(),
                unsatisfied: unsatisfied.clone(),
                metrics,
            },
        );
        if !satisfied {
            return Err(PipelineError::StageFailed { stage, unsatisfied }.into());
        }
        if !unsatisfied.is_empty() {
            let ks: Vec<String> = unsatisfied.iter().map(u32::to_string).collect();
            self.warn(format!(
                "{stage}: no successful trial for K {}; continuing because partial results are allowed",
                ks.join(", ")
            ));
        }
        Ok(())
    }

    fn run_admixture(&mut self) -> Result<()> {
        let ks = self.config.k_range.values();
        let vars = self.dataset_vars();
        let staging_dir = self.paths.prepared_dir(StageKind::Admixture);
        let outcome = self.run_sweep(
            StageKind::Admixture,
            &ks,
            vars,
            ArtifactFormat::Verbatim,
            staging_dir,
        );
        let written = self.write_cv_errors(&ks);
        outcome?;
        written
    }

    fn write_cv_errors(&self, ks: &[u32]) -> Result<()> {
        let Some(record) = self
            .stages
            .get(&StageKind::Admixture)
            .filter(|record| record.status != StepStatus::NotReached)
        else {
            return Ok(());
        };
        let stage_dir = self.paths.stage_dir(StageKind::Admixture);
        fs::create_dir_all(&stage_dir)
            .with_context(|| format!("create {}", stage_dir.display()))?;
        let metric_name = self.metric_name(StageKind::Admixture);
        write_cv_errors(&self.paths.cv_errors_path(), &metric_name, ks, &record.metrics)
    }

    fn run_structure(&mut self) -> Result<()> {
        let stats = self
            .stats
            .clone()
            .ok_or_else(|| anyhow!("dataset was not measured before the structure stage"))?;
        let input_dir = self.paths.structure_input_dir();
        let converter = self.config.tools.converter.clone();
        let conversion = run_auxiliary(
            "structure input conversion",
            &converter,
            &self.dataset_vars(),
            &input_dir,
            &self.runner_options(),
        )?;
        self.check_cancel(StageKind::Structure.as_str())?;
        let input = match (conversion.succeeded, conversion.primary_output) {
            (true, Some(path)) => path,
            _ => {
                self.warn(format!(
                    "structure input conversion failed: {}; see {}",
                    conversion.detail,
                    conversion.log_path.display()
                ));
                let unsatisfied = self.config.k_range.values();
                let mut record = StageRecord::with_status(StepStatus::Failed);
                record.unsatisfied = unsatisfied.clone();
                self.set_record(StageKind::Structure, record);
                return Err(PipelineError::StageFailed {
                    stage: StageKind::Structure,
                    unsatisfied,
                }
                .into());
            }
        };

        let mainparams = self.paths.mainparams_path();
        let extraparams = self.paths.extraparams_path();
        structure::write_parameter_files(
            &mainparams,
            &extraparams,
            &self.config.tools.structure_params,
            &stats,
        )?;

        let mut vars = self.dataset_vars();
        vars.insert("input", input.display().to_string());
        vars.insert("mainparams", mainparams.display().to_string());
        vars.insert("extraparams", extraparams.display().to_string());
        let ks = self.config.k_range.values();
        let staging_dir = self.paths.prepared_dir(StageKind::Structure);
        self.run_sweep(
            StageKind::Structure,
            &ks,
            vars,
            ArtifactFormat::StructureAncestry,
            staging_dir,
        )
    }

    fn run_alignment(&mut self) -> Result<()> {
        let sources: Vec<AlignmentSource> = [StageKind::Admixture, StageKind::Structure]
            .into_iter()
            .filter(|method| self.status_of(*method) == StepStatus::Completed)
            .map(|method| AlignmentSource {
                method,
                prepared_dir: self.paths.prepared_dir(method),
            })
            .collect();
        if sources.is_empty() {
            self.warn(
                "alignment has no upstream matrices; admixture and structure both skipped"
                    .to_string(),
            );
        }
        let ks = self.config.k_range.values();
        let prepared = self.paths.prepared_dir(StageKind::Clumpak);
        let inputs = stage_for_alignment(&sources, &ks, &prepared)?;
        for warning in &inputs.warnings {
            self.warn(format!("alignment: {warning}"));
        }

        let available: Vec<u32> = inputs.per_k.keys().copied().collect();
        let mut vars = self.dataset_vars();
        vars.insert("input_dir", prepared.display().to_string());
        let aligned_dir = self.paths.aligned_dir();
        let outcome = self.run_sweep(
            StageKind::Clumpak,
            &available,
            vars,
            ArtifactFormat::ClumppIndividuals,
            aligned_dir,
        );
        let written = if self.status_of(StageKind::Clumpak) == StepStatus::NotReached {
            Ok(())
        } else {
            self.write_method_comparison(&inputs)
        };
        outcome?;
        written
    }

    fn write_method_comparison(&self, inputs: &AlignmentInputs) -> Result<()> {
        let methods: Vec<StageKind> = [StageKind::Admixture, StageKind::Structure]
            .into_iter()
            .filter(|method| {
                matches!(
                    self.status_of(*method),
                    StepStatus::Completed | StepStatus::Failed
                ) && self.config.tools.for_stage(*method).metric.is_some()
            })
            .collect();
        let columns: Vec<String> = methods
            .iter()
            .map(|method| format!("{method}_{}", self.metric_name(*method)))
            .collect();
        let aligned = self.stages.get(&StageKind::Clumpak);
        let rows: Vec<ComparisonRow> = self
            .config
            .k_range
            .values()
            .into_iter()
            .map(|k| ComparisonRow {
                k,
                metrics: methods
                    .iter()
                    .map(|method| {
                        self.stages
                            .get(method)
                            .and_then(|record| record.metrics.get(&k).copied().flatten())
                    })
                    .collect(),
                methods: inputs.methods_for(k),
                aligned: aligned.is_some_and(|record| {
                    record
                        .results
                        .values()
                        .any(|result| result.key.k == k && result.succeeded())
                }),
            })
            .collect();
        write_method_comparison(&self.paths.method_comparison_path(), &columns, &rows)
    }

    fn run_report(&mut self) {
        if self.config.skips.report {
            tracing::info!("report step skipped");
            self.report = StepStatus::Skipped;
            return;
        }
        if !self.reporter_available {
            self.report = StepStatus::Unavailable;
            return;
        }
        let mut vars = self.dataset_vars();
        vars.insert("input_dir", self.paths.root().display().to_string());
        let reporter = self.config.tools.reporter.clone();
        let visualization = self.paths.visualization_dir();
        match run_auxiliary("report", &reporter, &vars, &visualization, &self.runner_options()) {
            Ok(outcome) if outcome.succeeded => self.report = StepStatus::Completed,
            Ok(outcome) => {
                self.report = StepStatus::Failed;
                self.warn(format!(
                    "report step failed: {}; see {}",
                    outcome.detail,
                    outcome.log_path.display()
                ));
            }
            Err(err) => {
                self.report = StepStatus::Failed;
                self.warn(format!("report step failed: {err:#}"));
            }
        }
    }

    fn metric_name(&self, stage: StageKind) -> String {
        self.config
            .tools
            .for_stage(stage)
            .metric
            .as_ref()
            .map(|metric| metric.name.clone())
            .unwrap_or_else(|| "metric".to_string())
    }

    pub fn summary(&self) -> AnalysisSummary {
        let stages = StageKind::ALL
            .into_iter()
            .map(|stage| {
                let fallback = StageRecord::with_status(StepStatus::NotReached);
                let record = self.stages.get(&stage).unwrap_or(&fallback);
                let succeeded = record.results.values().filter(|r| r.succeeded()).count();
                StageSummary {
                    stage,
                    status: record.status,
                    runs_per_k: self.config.runs_for(stage),
                    trials_succeeded: succeeded,
                    trials_failed: record.results.len() - succeeded,
                    trials_reused: record.results.values().filter(|r| r.reused).count(),
                    staged: record.staged,
                    unsatisfied: record.unsatisfied.clone(),
                    metric_name: self
                        .config
                        .tools
                        .for_stage(stage)
                        .metric
                        .as_ref()
                        .map(|metric| metric.name.clone()),
                    metrics: record.metrics.clone(),
                    failures: record
                        .results
                        .values()
                        .filter(|result| !result.succeeded())
                        .map(|result| TrialFailure {
                            k: result.key.k,
                            run: result.key.run,
                            reason: result
                                .error
                                .as_ref()
                                .map(ToString::to_string)
                                .unwrap_or_else(|| "failed".to_string()),
                        })
                        .collect(),
                }
            })
            .collect();
        AnalysisSummary {
            final_state: self.state,
            dataset: self.stats.clone(),
            k_range: self.config.k_range,
            estimated_runtime_secs: self.estimate.as_secs(),
            stages,
            report: self.report,
            output_base: self.paths.root().to_path_buf(),
            log_path: self.log_path.clone(),
            warnings: self.warnings.clone(),
            error: self.error.clone(),
        }
    }

    fn write_summary(&self) -> Result<()> {
        let summary = self.summary();
        fs::create_dir_all(self.paths.root())
            .with_context(|| format!("create {}", self.paths.root().display()))?;
        summary.write(&self.paths.summary_path(), &self.paths.summary_json_path())?;
        tracing::debug!(target: LOG_FILE_TARGET, "final summary\n{}", summary.render_text());
        tracing::info!(path = %self.paths.summary_path().display(), "summary written");
        Ok(())
    }
}

fn available_cores() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
