use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;

mod cancel;
mod cli;
mod config;
mod dataset;
mod error;
mod estimate;
mod logging;
mod paths;
mod pipeline;
mod stage;
mod staging;
mod summary;
mod util;
mod validate;

use cancel::CancelFlag;
use cli::PipelineArgs;
use config::{load_tools_config, PipelineConfig};
use error::PipelineError;
use logging::Verbosity;
use pipeline::PipelineRun;

fn main() -> ExitCode {
    let args = PipelineArgs::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<PipelineError>()
                .map_or(1, PipelineError::exit_code);
            ExitCode::from(code)
        }
    }
}

fn run(args: &PipelineArgs) -> Result<()> {
    let mut config = PipelineConfig::from_args(args)?;
    if let Some(path) = &args.tools_config {
        config.tools = load_tools_config(path)
            .map_err(|err| PipelineError::InvalidArguments(format!("{err:#}")))?;
    }
    config.output_base = util::absolute_path(&config.output_base)?;

    let paths = paths::OutputPaths::new(config.output_base.clone());
    let log_path = logging::init(
        &paths.logs_dir(),
        Verbosity::from_flags(args.quiet, args.verbose),
    )?;

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupt received; stopping after running trials are killed");
        handler_flag.cancel();
    })
    .context("install interrupt handler")?;

    let mut run = PipelineRun::new(config, cancel, Some(log_path.clone()))?;
    let outcome = run.execute();
    if !args.quiet {
        eprintln!(
            "{}: {} (log: {})",
            run.state(),
            run.paths().summary_path().display(),
            log_path.display()
        );
    }
    outcome
}
