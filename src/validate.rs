//! Precondition checks run once before any stage.
//!
//! Every check is read-only and reports the complete set of problems it finds
//! instead of stopping at the first one:
//! - **Inputs**: the `.bed`, `.bim` and `.fam` companions exist.
//! - **Shape**: genotype bytes, variant count and sample count meet minimums.
//! - **Dependencies**: every program the enabled stages invoke resolves on
//!   the search path.
use crate::config::{PipelineConfig, Thresholds};
use crate::dataset::{Dataset, DatasetStats};
use crate::error::{PipelineError, ThresholdViolation};
use crate::stage::StageKind;
use anyhow::Result;
use std::path::PathBuf;

/// An external program the run needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredExecutable {
    pub program: String,
    pub purpose: &'static str,
    /// Optional programs degrade to a warning when unresolved.
    pub optional: bool,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub stats: DatasetStats,
    pub resolved: Vec<(String, PathBuf)>,
    pub warnings: Vec<String>,
    pub reporter_available: bool,
}

/// Collect the programs needed by the stages that are not skipped.
pub fn required_executables(config: &PipelineConfig) -> Result<Vec<RequiredExecutable>> {
    let tools = &config.tools;
    let mut required = Vec::new();
    for stage in StageKind::ALL {
        if config.skips.is_skipped(stage) {
            continue;
        }
        if stage == StageKind::Structure {
            required.push(RequiredExecutable {
                program: tools.converter.program()?,
                purpose: "structure input conversion",
                optional: false,
            });
        }
        required.push(RequiredExecutable {
            program: tools.for_stage(stage).program()?,
            purpose: stage.as_str(),
            optional: false,
        });
    }
    if !config.skips.report {
        required.push(RequiredExecutable {
            program: tools.reporter.program()?,
            purpose: "report",
            optional: true,
        });
    }
    Ok(required)
}

/// Run all precondition checks. Fatal findings come back as a
/// `PipelineError` inside the `anyhow::Error`.
pub fn validate_preconditions(
    dataset: &Dataset,
    thresholds: &Thresholds,
    executables: &[RequiredExecutable],
) -> Result<ValidationReport> {
    let missing: Vec<PathBuf> = dataset
        .companion_paths()
        .into_iter()
        .filter(|path| !path.is_file())
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::MissingInput { files: missing }.into());
    }

    let stats = dataset.measure()?;
    let violations = threshold_violations(&stats, thresholds);
    if !violations.is_empty() {
        return Err(PipelineError::InsufficientData { violations }.into());
    }

    let mut warnings = Vec::new();
    if let Some(issue) = dataset.consistency_issue(&stats)? {
        tracing::warn!(%issue, "dataset companions disagree");
        warnings.push(issue);
    }

    let mut resolved = Vec::new();
    let mut unresolved = Vec::new();
    let mut reporter_available = true;
    for required in executables {
        match which::which(&required.program) {
            Ok(path) => {
                tracing::debug!(
                    program = %required.program,
                    path = %path.display(),
                    purpose = required.purpose,
                    "resolved executable"
                );
                resolved.push((required.program.clone(), path));
            }
            Err(_) if required.optional => {
                reporter_available = false;
                warnings.push(format!(
                    "{} program {:?} not found; {} step will not run",
                    required.purpose, required.program, required.purpose
                ));
            }
            Err(_) => {
                if !unresolved.contains(&required.program) {
                    unresolved.push(required.program.clone());
                }
            }
        }
    }
    if !unresolved.is_empty() {
        return Err(PipelineError::MissingDependency {
            executables: unresolved,
        }
        .into());
    }

    Ok(ValidationReport {
        stats,
        resolved,
        warnings,
        reporter_available,
    })
}

pub fn threshold_violations(stats: &DatasetStats, thresholds: &Thresholds) -> Vec<ThresholdViolation> {
    let checks = [
        ("genotype file bytes", stats.genotype_bytes, thresholds.min_genotype_bytes),
        ("variant count", stats.variants, thresholds.min_variants),
        ("sample count", stats.samples, thresholds.min_samples),
    ];
    checks
        .into_iter()
        .filter(|(_, measured, threshold)| measured < threshold)
        .map(|(check, measured, threshold)| ThresholdViolation {
            check: check.to_string(),
            measured,
            threshold,
        })
        .collect()
}

#[cfg(test)]
#[path = "validate_tests.rs"]
mod tests;
