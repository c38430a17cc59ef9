//! Run summary and the per-stage metric tables.
//!
//! `AnalysisSummary` is written twice: `analysis_summary.txt` for people and
//! `analysis_summary.json` for scripts. The plain-text tables
//! (`cv_errors.txt`, `method_comparison.txt`) are whitespace separated with
//! `NA` for unavailable metrics.
use crate::config::KRange;
use crate::dataset::DatasetStats;
use crate::pipeline::PipelineState;
use crate::stage::StageKind;
use crate::util::format_duration;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const NOT_AVAILABLE: &str = "NA";

/// Nonzero metrics below this magnitude are printed in exponent form.
const SMALLEST_FIXED_METRIC: f64 = 1e-3;

/// Outcome of one pipeline step as shown in the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Skipped,
    Completed,
    Failed,
    /// The step's program could not be resolved.
    Unavailable,
    NotReached,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Skipped => "skipped",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Unavailable => "unavailable",
            StepStatus::NotReached => "not reached",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialFailure {
    pub k: u32,
    pub run: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: StageKind,
    pub status: StepStatus,
    pub runs_per_k: u32,
    pub trials_succeeded: usize,
    pub trials_failed: usize,
    pub trials_reused: usize,
    pub staged: usize,
    pub unsatisfied: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_name: Option<String>,
    /// Mean metric per K; `None` is reported as NA.
    pub metrics: BTreeMap<u32, Option<f64>>,
    pub failures: Vec<TrialFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub final_state: PipelineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetStats>,
    pub k_range: KRange,
    pub estimated_runtime_secs: u64,
    pub stages: Vec<StageSummary>,
    pub report: StepStatus,
    pub output_base: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisSummary {
    pub fn render_text(&self) -> String {
        self.to_string()
    }

    /// Write the text and JSON forms next to each other.
    pub fn write(&self, text_path: &Path, json_path: &Path) -> Result<()> {
        fs::write(text_path, self.render_text())
            .with_context(|| format!("write {}", text_path.display()))?;
        let json = serde_json::to_string_pretty(self).context("serialize summary")?;
        fs::write(json_path, json + "\n")
            .with_context(|| format!("write {}", json_path.display()))?;
        Ok(())
    }
}

impl fmt::Display for AnalysisSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Ancestry analysis summary")?;
        writeln!(f, "=========================")?;
        writeln!(f, "Final state: {}", self.final_state)?;
        match &self.dataset {
            Some(stats) => writeln!(
                f,
                "Dataset: {} ({} samples, {} variants, {} genotype bytes)",
                stats.prefix, stats.samples, stats.variants, stats.genotype_bytes
            )?,
            None => writeln!(f, "Dataset: not measured")?,
        }
        writeln!(f, "K range: {}-{}", self.k_range.min, self.k_range.max)?;
        writeln!(
            f,
            "Estimated runtime: {} (advisory)",
            format_duration(Duration::from_secs(self.estimated_runtime_secs))
        )?;
        writeln!(f, "Output base: {}", self.output_base.display())?;
        if let Some(log_path) = &self.log_path {
            writeln!(f, "Run log: {}", log_path.display())?;
        }
        self.fmt_stages(f)?;
        self.fmt_metrics(f)?;
        self.fmt_failures(f)?;
        if !self.warnings.is_empty() {
            writeln!(f, "\nWarnings")?;
            for warning in &self.warnings {
                writeln!(f, "  - {warning}")?;
            }
        }
        if let Some(error) = &self.error {
            writeln!(f, "\nError: {error}")?;
        }
        Ok(())
    }
}

impl AnalysisSummary {
    fn fmt_stages(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\nStages")?;
        for stage in &self.stages {
            write!(f, "  {:<10} {}", stage.stage.as_str(), stage.status.as_str())?;
            if matches!(stage.status, StepStatus::Completed | StepStatus::Failed) {
                let total = stage.trials_succeeded + stage.trials_failed;
                write!(
                    f,
                    " ({}/{} trials succeeded, {} staged",
                    stage.trials_succeeded, total, stage.staged
                )?;
                if stage.trials_reused > 0 {
                    write!(f, ", {} reused", stage.trials_reused)?;
                }
                f.write_str(")")?;
            }
            if !stage.unsatisfied.is_empty() {
                write!(f, "; no successful trial for K {}", join_ks(&stage.unsatisfied))?;
            }
            writeln!(f)?;
        }
        writeln!(f, "  {:<10} {}", "report", self.report.as_str())
    }

    fn fmt_metrics(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metric_stages: Vec<&StageSummary> = self
            .stages
            .iter()
            .filter(|stage| stage.metric_name.is_some() && !stage.metrics.is_empty())
            .collect();
        writeln!(f, "\nPer-K metrics")?;
        if metric_stages.is_empty() {
            return writeln!(f, "  (none collected)");
        }
        write!(f, "  {:<4}", "K")?;
        for stage in &metric_stages {
            let label = format!(
                "{}:{}",
                stage.stage,
                stage.metric_name.as_deref().unwrap_or_default()
            );
            write!(f, " {label:>22}")?;
        }
        writeln!(f)?;
        for k in self.k_range.values() {
            write!(f, "  {k:<4}")?;
            for stage in &metric_stages {
                let value = stage.metrics.get(&k).copied().flatten();
                write!(f, " {:>22}", format_metric(value))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }

    fn fmt_failures(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut failures = self
            .stages
            .iter()
            .flat_map(|stage| stage.failures.iter().map(move |failure| (stage.stage, failure)))
            .peekable();
        if failures.peek().is_none() {
            return Ok(());
        }
        writeln!(f, "\nFailed trials")?;
        for (stage, failure) in failures {
            writeln!(
                f,
                "  {stage} K{} run {}: {}",
                failure.k, failure.run, failure.reason
            )?;
        }
        Ok(())
    }
}

/// Fixed six decimals, switching to exponent form for magnitudes that would
/// otherwise print as zero.
pub fn format_metric(value: Option<f64>) -> String {
    match value {
        Some(value) if value != 0.0 && value.abs() < SMALLEST_FIXED_METRIC => {
            format!("{value:e}")
        }
        Some(value) => format!("{value:.6}"),
        None => NOT_AVAILABLE.to_string(),
    }
}

/// `K <metric_name>` table, one row per K in ascending order.
pub fn render_metric_table(
    metric_name: &str,
    ks: &[u32],
    metrics: &BTreeMap<u32, Option<f64>>,
) -> String {
    let mut out = format!("K {metric_name}\n");
    for &k in ks {
        let value = metrics.get(&k).copied().flatten();
        out.push_str(&format!("{k} {}\n", format_metric(value)));
    }
    out
}

pub fn write_cv_errors(
    path: &Path,
    metric_name: &str,
    ks: &[u32],
    metrics: &BTreeMap<u32, Option<f64>>,
) -> Result<()> {
    fs::write(path, render_metric_table(metric_name, ks, metrics))
        .with_context(|| format!("write {}", path.display()))
}

/// One K of the cross-method comparison.
#[derive(Debug, Clone)]
pub struct ComparisonRow {
    pub k: u32,
    /// Values in the same order as the table's metric columns.
    pub metrics: Vec<Option<f64>>,
    pub methods: Vec<StageKind>,
    pub aligned: bool,
}

pub fn render_method_comparison(columns: &[String], rows: &[ComparisonRow]) -> String {
    let mut out = String::from("K");
    for column in columns {
        out.push(' ');
        out.push_str(column);
    }
    out.push_str(" methods aligned\n");
    for row in rows {
        out.push_str(&row.k.to_string());
        for value in &row.metrics {
            out.push(' ');
            out.push_str(&format_metric(*value));
        }
        let methods = if row.methods.is_empty() {
            NOT_AVAILABLE.to_string()
        } else {
            row.methods
                .iter()
                .map(StageKind::as_str)
                .collect::<Vec<_>>()
                .join(",")
        };
        let aligned = if row.aligned { "yes" } else { "no" };
        out.push_str(&format!(" {methods} {aligned}\n"));
    }
    out
}

pub fn write_method_comparison(
    path: &Path,
    columns: &[String],
    rows: &[ComparisonRow],
) -> Result<()> {
    fs::write(path, render_method_comparison(columns, rows))
        .with_context(|| format!("write {}", path.display()))
}

fn join_ks(ks: &[u32]) -> String {
    ks.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
}
