mod cli;

use anyhow::Context;
use clap::Parser;
use std::io::{self, Write};
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sr_engine::{demo_registry, Executor, RunDescription};

use crate::cli::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level())),
        )
        .init();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every leaf completed.
fn run(cli: &Cli) -> anyhow::Result<bool> {
    let description = RunDescription::from_path(&cli.run)
        .with_context(|| format!("failed to read run description {}", cli.run.display()))?;
    let config = cli.engine_config(description.engine.clone())?;
    debug!(?config, "engine configuration");

    let executor = Executor::new(config, demo_registry());
    let mut handle = executor
        .start(&description.module, &description.samples, &description.globals)
        .with_context(|| format!("failed to start module {}", description.module))?;
    info!(run = %handle.run_id(), "polling for results");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut write_error = None;
    let finished = handle
        .wait_with(|event| {
            if cli.summary_only || write_error.is_some() {
                return;
            }
            let line = serde_json::to_string(&event).map_err(io::Error::from);
            if let Err(e) = line.and_then(|line| writeln!(out, "{line}")) {
                write_error = Some(e);
            }
        })
        .cloned()
        .context("run ended without a summary")?;
    if let Some(e) = write_error {
        return Err(e).context("failed to write run events");
    }

    writeln!(out, "{}", serde_json::to_string(&finished)?)?;
    Ok(finished.all_completed())
}
