//! CLI argument parsing for the ancestry pipeline.
//!
//! The CLI stays thin: it only collects raw values. Range checks and derived
//! settings live in `config::PipelineConfig` so they can be tested directly.
use clap::Parser;
use std::path::PathBuf;

/// Default base seed for stochastic stages.
pub const DEFAULT_BASE_SEED: u64 = 42;

/// Default output directory, relative to the working directory.
pub const DEFAULT_OUTPUT_BASE: &str = "ancestry_results";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ancestry-pipeline",
    version,
    about = "Run ADMIXTURE, STRUCTURE and CLUMPAK over a range of K and summarize the results",
    after_help = "Stages:\n  admixture   stage 1, maximum-likelihood ancestry estimation (cv_errors.txt)\n  structure   stage 2, Bayesian clustering (per-K run directories)\n  clumpak     stage 3, alignment of Q matrices across runs and methods\n  report      external plotting program writing into visualization/\n\nExamples:\n  ancestry-pipeline data/cohort 2 6 --threads 4\n  ancestry-pipeline data/cohort 2 4 --skip-structure --skip-clumpak\n  ancestry-pipeline data/cohort 2 8 --tools-config tools.json --resume"
)]
pub struct PipelineArgs {
    /// Dataset prefix; <prefix>.bed, <prefix>.bim and <prefix>.fam must exist
    #[arg(value_name = "INPUT_PREFIX")]
    pub input_prefix: PathBuf,

    /// Smallest K to evaluate
    #[arg(value_name = "MIN_K")]
    pub min_k: u32,

    /// Largest K to evaluate
    #[arg(value_name = "MAX_K")]
    pub max_k: u32,

    /// Threads handed to each external tool invocation
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub threads: usize,

    /// Trials run concurrently within a stage
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub jobs: usize,

    /// Root directory for all stage outputs, logs and the summary
    #[arg(long, value_name = "DIR", default_value = DEFAULT_OUTPUT_BASE)]
    pub output_base: PathBuf,

    /// Do not run ADMIXTURE (stage 1)
    #[arg(long)]
    pub skip_admixture: bool,

    /// Do not run STRUCTURE (stage 2)
    #[arg(long)]
    pub skip_structure: bool,

    /// Do not run CLUMPAK alignment (stage 3)
    #[arg(long)]
    pub skip_clumpak: bool,

    /// Do not invoke the external reporting program
    #[arg(long)]
    pub skip_report: bool,

    /// Keep transient files after a successful run
    #[arg(long)]
    pub no_cleanup: bool,

    /// Only print warnings and errors
    #[arg(long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Print debug events, including every command line
    #[arg(long)]
    pub verbose: bool,

    /// Reuse trials whose primary output already exists
    #[arg(long)]
    pub resume: bool,

    /// Accept a stage when at least one K succeeded instead of every K
    #[arg(long)]
    pub allow_partial: bool,

    /// Base seed; each trial derives its own seed from it
    #[arg(long, value_name = "N", default_value_t = DEFAULT_BASE_SEED)]
    pub seed: u64,

    /// Independent ADMIXTURE runs per K
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub admixture_runs: u32,

    /// Independent STRUCTURE runs per K
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub structure_runs: u32,

    /// Cross-validation folds passed to ADMIXTURE
    #[arg(long, value_name = "N", default_value_t = 5)]
    pub cv_folds: u32,

    /// Kill a trial that runs longer than this many seconds
    #[arg(long, value_name = "SECS")]
    pub trial_timeout: Option<u64>,

    /// JSON file overriding external tool invocations
    #[arg(long, value_name = "PATH")]
    pub tools_config: Option<PathBuf>,
}
