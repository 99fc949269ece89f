//! Immiflow command-line runner.

use anyhow::{Context, Result};
use clap::Parser;
use immiflow::config::PipelineConfig;
use std::io::{self, IsTerminal};
use std::process::ExitCode;
use tracing::Level;

mod cli;
mod commands;
mod logging;

use crate::cli::{Cli, Command, LogFormatArg, LogLevelArg};
use crate::logging::{init_logging, LogConfig, LogFormat};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(error) = init_logging(&log_config_from_cli(&cli)) {
        eprintln!("error: failed to initialize logging: {error}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when the command ran but at least one period failed.
async fn run(cli: Cli) -> Result<bool> {
    let overrides = cli.overrides.to_overrides();
    let config = PipelineConfig::load(cli.config.as_deref(), &overrides)
        .context("failed to load configuration")?;

    match cli.command {
        Command::Run { period } => commands::run_periods(&config, &[period]).await,
        Command::Backfill { from, to } => commands::run_backfill(&config, from, to).await,
        Command::Provision => commands::run_provision(&config).await.map(|()| true),
        Command::Graph => commands::run_graph(&config).map(|()| true),
    }
}

fn log_config_from_cli(cli: &Cli) -> LogConfig {
    let level = match cli.log_level {
        LogLevelArg::Error => Level::ERROR,
        LogLevelArg::Warn => Level::WARN,
        LogLevelArg::Info => Level::INFO,
        LogLevelArg::Debug => Level::DEBUG,
        LogLevelArg::Trace => Level::TRACE,
    };
    let format = match cli.log_format {
        LogFormatArg::Pretty => LogFormat::Pretty,
        LogFormatArg::Compact => LogFormat::Compact,
        LogFormatArg::Json => LogFormat::Json,
    };
    LogConfig::default()
        .with_level(level)
        .with_format(format)
        .with_ansi(io::stderr().is_terminal())
}
