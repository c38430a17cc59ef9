//! Scalar metric extraction from tool output text.
//!
//! Extraction is lenient: a missing or unparsable value is recorded as
//! unavailable and never changes the trial's status.
use super::TrialResult;
use crate::config::{MetricSource, MetricSpec};
use anyhow::{Context, Result};
use regex::Regex;
use std::fs;

#[derive(Debug, Clone)]
pub(crate) struct MetricExtractor {
    name: String,
    pattern: Regex,
    source: MetricSource,
}

impl MetricExtractor {
    pub(crate) fn new(spec: &MetricSpec) -> Result<Self> {
        let pattern = Regex::new(&spec.pattern)
            .with_context(|| format!("compile metric pattern for {}", spec.name))?;
        Ok(Self {
            name: spec.name.clone(),
            pattern,
            source: spec.source,
        })
    }

    /// First match in `text`; later matches are ignored.
    pub(crate) fn extract(&self, text: &str) -> Option<f64> {
        let captures = self.pattern.captures(text)?;
        captures.get(1)?.as_str().trim().parse::<f64>().ok()
    }

    pub(crate) fn extract_from(&self, result: &TrialResult) -> Option<f64> {
        let path = match self.source {
            MetricSource::Output => &result.log_path,
            MetricSource::Artifact => &result.primary_output,
        };
        let Ok(text) = fs::read_to_string(path) else {
            tracing::debug!(metric = %self.name, path = %path.display(), "metric source unreadable");
            return None;
        };
        let value = self.extract(&text);
        if value.is_none() {
            tracing::debug!(
                metric = %self.name,
                k = result.key.k,
                run = result.key.run,
                "metric not found; recording NA"
            );
        }
        value
    }
}
