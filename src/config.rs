//! Run configuration.
//!
//! `PipelineConfig` is the validated form of the CLI arguments and is passed
//! explicitly to every component. `ToolsConfig` describes how each external
//! program is invoked; it has built-in defaults and can be overridden with a
//! JSON file so alternative tool builds or wrappers can be swapped in.
use crate::cli::PipelineArgs;
use crate::error::PipelineError;
use crate::stage::StageKind;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest K accepted on the command line.
pub const MAX_K_CEILING: u32 = 20;

pub const TOOLS_CONFIG_SCHEMA_VERSION: u32 = 1;

/// Placeholders that tool templates may reference.
pub const KNOWN_PLACEHOLDERS: &[&str] = &[
    "bed",
    "prefix",
    "stem",
    "k",
    "run",
    "seed",
    "threads",
    "cv_folds",
    "input",
    "input_dir",
    "output",
    "output_dir",
    "mainparams",
    "extraparams",
    "loci",
    "samples",
];

/// Closed range of cluster counts swept by K-parameterized stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KRange {
    pub min: u32,
    pub max: u32,
}

impl KRange {
    pub fn new(min: u32, max: u32) -> Result<Self, PipelineError> {
        if min < 1 {
            return Err(PipelineError::InvalidArguments(format!(
                "minK must be at least 1 (got {min})"
            )));
        }
        if min >= max {
            return Err(PipelineError::InvalidArguments(format!(
                "minK must be smaller than maxK (got {min} and {max})"
            )));
        }
        if max > MAX_K_CEILING {
            return Err(PipelineError::InvalidArguments(format!(
                "maxK must not exceed {MAX_K_CEILING} (got {max})"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn values(&self) -> Vec<u32> {
        (self.min..=self.max).collect()
    }

    pub fn count(&self) -> usize {
        (self.max - self.min + 1) as usize
    }
}

/// Per-stage skip flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageSkips {
    pub admixture: bool,
    pub structure: bool,
    pub clumpak: bool,
    pub report: bool,
}

impl StageSkips {
    pub fn is_skipped(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::Admixture => self.admixture,
            StageKind::Structure => self.structure,
            StageKind::Clumpak => self.clumpak,
        }
    }
}

/// How many K values must succeed for a stage to count as satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SatisfactionPolicy {
    EveryK,
    AnyK,
}

/// Minimal shape expectations for the input dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Thresholds {
    pub min_genotype_bytes: u64,
    pub min_variants: u64,
    pub min_samples: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_genotype_bytes: 1024,
            min_variants: 10,
            min_samples: 5,
        }
    }
}

/// Validated run configuration, built once from the CLI.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input_prefix: PathBuf,
    pub k_range: KRange,
    pub threads: usize,
    pub jobs: usize,
    pub output_base: PathBuf,
    pub skips: StageSkips,
    pub cleanup: bool,
    pub resume: bool,
    pub policy: SatisfactionPolicy,
    pub base_seed: u64,
    pub admixture_runs: u32,
    pub structure_runs: u32,
    pub cv_folds: u32,
    pub trial_timeout: Option<Duration>,
    pub thresholds: Thresholds,
    pub tools: ToolsConfig,
}

impl PipelineConfig {
    /// Validate CLI arguments without touching the filesystem.
    pub fn from_args(args: &PipelineArgs) -> Result<Self, PipelineError> {
        let k_range = KRange::new(args.min_k, args.max_k)?;
        if args.threads == 0 {
            return Err(PipelineError::InvalidArguments(
                "--threads must be at least 1".to_string(),
            ));
        }
        if args.jobs == 0 {
            return Err(PipelineError::InvalidArguments(
                "--jobs must be at least 1".to_string(),
            ));
        }
        if args.admixture_runs == 0 || args.structure_runs == 0 {
            return Err(PipelineError::InvalidArguments(
                "runs per K must be at least 1".to_string(),
            ));
        }
        if args.cv_folds < 2 {
            return Err(PipelineError::InvalidArguments(format!(
                "--cv-folds must be at least 2 (got {})",
                args.cv_folds
            )));
        }
        if args.trial_timeout == Some(0) {
            return Err(PipelineError::InvalidArguments(
                "--trial-timeout must be positive".to_string(),
            ));
        }
        if args.input_prefix.as_os_str().is_empty() {
            return Err(PipelineError::InvalidArguments(
                "input prefix is empty".to_string(),
            ));
        }

        Ok(Self {
            input_prefix: args.input_prefix.clone(),
            k_range,
            threads: args.threads,
            jobs: args.jobs,
            output_base: args.output_base.clone(),
            skips: StageSkips {
                admixture: args.skip_admixture,
                structure: args.skip_structure,
                clumpak: args.skip_clumpak,
                report: args.skip_report,
            },
            cleanup: !args.no_cleanup,
            resume: args.resume,
            policy: if args.allow_partial {
                SatisfactionPolicy::AnyK
            } else {
                SatisfactionPolicy::EveryK
            },
            base_seed: args.seed,
            admixture_runs: args.admixture_runs,
            structure_runs: args.structure_runs,
            cv_folds: args.cv_folds,
            trial_timeout: args.trial_timeout.map(Duration::from_secs),
            thresholds: Thresholds::default(),
            tools: ToolsConfig::default(),
        })
    }

    /// Runs per K for a stage; alignment always runs once per K.
    pub fn runs_for(&self, stage: StageKind) -> u32 {
        match stage {
            StageKind::Admixture => self.admixture_runs,
            StageKind::Structure => self.structure_runs,
            StageKind::Clumpak => 1,
        }
    }

    /// Threads handed to each tool, capped at the cores on this machine.
    pub fn effective_threads(&self, available_cores: usize) -> usize {
        self.threads.clamp(1, available_cores.max(1))
    }

    /// Number of concurrent trials, bounded so that trials times tool threads
    /// never exceeds the cores on this machine.
    pub fn effective_jobs(&self, available_cores: usize) -> usize {
        let threads = self.effective_threads(available_cores);
        let by_cores = (available_cores.max(1) / threads).max(1);
        self.jobs.clamp(1, by_cores)
    }
}

/// Where a metric's text is read from.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    /// Combined stdout/stderr captured for the trial.
    #[default]
    Output,
    /// The trial's primary output artifact.
    Artifact,
}

/// A labeled scalar embedded in a tool's output text.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MetricSpec {
    pub name: String,
    /// Regex with exactly one capture group holding the number.
    pub pattern: String,
    #[serde(default)]
    pub source: MetricSource,
}

/// Invocation template for one external program.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ToolSpec {
    /// Program plus leading words, split with shell rules (`perl CLUMPAK.pl`).
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Artifact whose presence marks success, relative to the trial directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<MetricSpec>,
}

impl ToolSpec {
    /// Split `executable` into program and leading arguments.
    pub fn command_words(&self) -> Result<Vec<String>> {
        let words = shell_words::split(&self.executable)
            .with_context(|| format!("parse executable {:?}", self.executable))?;
        if words.is_empty() {
            return Err(anyhow!("executable is empty"));
        }
        Ok(words)
    }

    /// Program name as looked up on the search path.
    pub fn program(&self) -> Result<String> {
        let mut words = self.command_words()?;
        Ok(words.remove(0))
    }
}

/// Parameters written into STRUCTURE's mainparams/extraparams files.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct StructureParams {
    pub burnin: u64,
    pub numreps: u64,
    pub label: bool,
    pub popdata: bool,
    pub markernames: bool,
    pub mapdistances: bool,
    pub onerowperind: bool,
}

impl Default for StructureParams {
    fn default() -> Self {
        Self {
            burnin: 10_000,
            numreps: 20_000,
            label: true,
            popdata: true,
            markernames: true,
            mapdistances: true,
            onerowperind: false,
        }
    }
}

/// External program table. Omitted entries fall back to the defaults below.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    pub schema_version: u32,
    #[serde(default = "default_admixture_tool")]
    pub admixture: ToolSpec,
    #[serde(default = "default_structure_tool")]
    pub structure: ToolSpec,
    /// Converts the binary dataset into STRUCTURE's text input.
    #[serde(default = "default_converter_tool")]
    pub converter: ToolSpec,
    #[serde(default = "default_clumpak_tool")]
    pub clumpak: ToolSpec,
    /// Plotting program; receives the output base and `visualization/`.
    #[serde(default = "default_reporter_tool")]
    pub reporter: ToolSpec,
    #[serde(default)]
    pub structure_params: StructureParams,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            schema_version: TOOLS_CONFIG_SCHEMA_VERSION,
            admixture: default_admixture_tool(),
            structure: default_structure_tool(),
            converter: default_converter_tool(),
            clumpak: default_clumpak_tool(),
            reporter: default_reporter_tool(),
            structure_params: StructureParams::default(),
        }
    }
}

impl ToolsConfig {
    pub fn for_stage(&self, stage: StageKind) -> &ToolSpec {
        match stage {
            StageKind::Admixture => &self.admixture,
            StageKind::Structure => &self.structure,
            StageKind::Clumpak => &self.clumpak,
        }
    }
}

fn default_admixture_tool() -> ToolSpec {
    ToolSpec {
        executable: "admixture".to_string(),
        args: strings(&[
            "--cv={cv_folds}",
            "-j{threads}",
            "-s",
            "{seed}",
            "{bed}",
            "{k}",
        ]),
        primary_output: Some("{stem}.{k}.Q".to_string()),
        metric: Some(MetricSpec {
            name: "cv_error".to_string(),
            pattern: r"CV error \(K=\d+\):\s*([-+0-9.eE]+)".to_string(),
            source: MetricSource::Output,
        }),
    }
}

fn default_structure_tool() -> ToolSpec {
    ToolSpec {
        executable: "structure".to_string(),
        args: strings(&[
            "-m",
            "{mainparams}",
            "-e",
            "{extraparams}",
            "-K",
            "{k}",
            "-L",
            "{loci}",
            "-N",
            "{samples}",
            "-i",
            "{input}",
            "-o",
            "{output_dir}/structure_out",
            "-D",
            "{seed}",
        ]),
        primary_output: Some("structure_out_f".to_string()),
        metric: Some(MetricSpec {
            name: "ln_prob".to_string(),
            pattern: r"Estimated Ln Prob of Data\s*=\s*([-+0-9.eE]+)".to_string(),
            source: MetricSource::Artifact,
        }),
    }
}

fn default_converter_tool() -> ToolSpec {
    ToolSpec {
        executable: "plink".to_string(),
        args: strings(&[
            "--bfile",
            "{prefix}",
            "--recode",
            "structure",
            "--out",
            "{output_dir}/dataset",
        ]),
        primary_output: Some("dataset.recode.strct_in".to_string()),
        metric: None,
    }
}

fn default_clumpak_tool() -> ToolSpec {
    ToolSpec {
        executable: "CLUMPAK.pl".to_string(),
        args: strings(&[
            "--id",
            "K{k}",
            "--dir",
            "{output_dir}",
            "--file",
            "{input_dir}/K{k}",
            "--inputtype",
            "admixture",
        ]),
        primary_output: Some("MajorCluster/CLUMPP.files/ClumppIndFile.output".to_string()),
        metric: None,
    }
}

fn default_reporter_tool() -> ToolSpec {
    ToolSpec {
        executable: "plot_ancestry".to_string(),
        args: strings(&["{input_dir}", "{output_dir}"]),
        primary_output: None,
        metric: None,
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Load a tools config JSON file and validate it.
pub fn load_tools_config(path: &Path) -> Result<ToolsConfig> {
    let bytes = fs::read(path).with_context(|| format!("read tools config {}", path.display()))?;
    let config: ToolsConfig =
        serde_json::from_slice(&bytes).context("parse tools config JSON")?;
    validate_tools_config(&config)?;
    Ok(config)
}

/// Validate schema, executables, placeholders and metric patterns.
pub fn validate_tools_config(config: &ToolsConfig) -> Result<()> {
    if config.schema_version != TOOLS_CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported tools config schema_version {}",
            config.schema_version
        ));
    }
    let entries = [
        ("admixture", &config.admixture, true),
        ("structure", &config.structure, true),
        ("converter", &config.converter, true),
        ("clumpak", &config.clumpak, true),
        ("reporter", &config.reporter, false),
    ];
    let placeholder = Regex::new(PLACEHOLDER_PATTERN).context("compile placeholder pattern")?;
    for (label, tool, needs_output) in entries {
        tool.command_words()
            .with_context(|| format!("tools config entry {label}"))?;
        if needs_output && tool.primary_output.is_none() {
            return Err(anyhow!("tools config entry {label} needs primary_output"));
        }
        let templates = tool.args.iter().chain(tool.primary_output.iter());
        for template in templates {
            for name in placeholders(&placeholder, template) {
                if !KNOWN_PLACEHOLDERS.contains(&name) {
                    return Err(anyhow!(
                        "tools config entry {label} uses unknown placeholder {{{name}}}"
                    ));
                }
            }
        }
        if let Some(metric) = &tool.metric {
            let regex = Regex::new(&metric.pattern)
                .with_context(|| format!("compile metric pattern for {label}"))?;
            if regex.captures_len() != 2 {
                return Err(anyhow!(
                    "metric pattern for {label} must have exactly one capture group"
                ));
            }
        }
    }
    Ok(())
}

/// Values substituted into `{name}` placeholders.
pub type TemplateVars = BTreeMap<&'static str, String>;

/// Replace every known `{name}` in `template`; unknown braces are left alone.
pub fn render_template(template: &str, vars: &TemplateVars) -> String {
    let mut rendered = template.to_string();
    for (name, value) in vars {
        rendered = rendered.replace(&format!("{{{name}}}"), value);
    }
    rendered
}

const PLACEHOLDER_PATTERN: &str = r"\{([a-z_]+)\}";

fn placeholders<'a>(pattern: &Regex, template: &'a str) -> Vec<&'a str> {
    pattern
        .captures_iter(template)
        .filter_map(|captures| captures.get(1))
        .map(|name| name.as_str())
        .collect()
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
