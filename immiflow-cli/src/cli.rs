//! Command-line argument definitions.

use clap::{Args, Parser, Subcommand, ValueEnum};
use immiflow::config::ConfigOverrides;
use immiflow::core::ExecutionPeriod;
use immiflow::tasks::quality::GatePolicy;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "immiflow",
    version,
    about = "Period-scoped immigration and temperature ETL",
    long_about = "Stages raw immigration and temperature extracts, loads them into the \
                  warehouse, runs the data quality gate and builds per-period analysis tables."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file.
    #[arg(long, short = 'c', value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence).
    #[arg(long = "log-level", value_enum, default_value = "info", global = true)]
    pub log_level: LogLevelArg,

    /// Log output format.
    #[arg(long = "log-format", value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormatArg,

    #[command(flatten)]
    pub overrides: OverrideArgs,
}

/// Settings that take precedence over the file and the environment.
#[derive(Debug, Args)]
pub struct OverrideArgs {
    /// Object storage root directory.
    #[arg(long = "storage-root", value_name = "DIR", global = true)]
    pub storage_root: Option<PathBuf>,

    /// Warehouse directory.
    #[arg(long = "warehouse-root", value_name = "DIR", global = true)]
    pub warehouse_root: Option<PathBuf>,

    /// Maximum concurrently running nodes.
    #[arg(long = "max-parallel", value_name = "N", global = true)]
    pub max_parallel: Option<usize>,

    /// Skip nodes the run ledger records as succeeded.
    #[arg(long, global = true)]
    pub resume: bool,

    /// Quality gate policy.
    #[arg(long = "gate-policy", value_enum, global = true)]
    pub gate_policy: Option<GatePolicyArg>,
}

impl OverrideArgs {
    pub fn to_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            storage_root: self.storage_root.clone(),
            warehouse_root: self.warehouse_root.clone(),
            max_parallel: self.max_parallel,
            resume: self.resume.then_some(true),
            gate_policy: self.gate_policy.map(|policy| match policy {
                GatePolicyArg::ReportOnly => GatePolicy::ReportOnly,
                GatePolicyArg::Enforce => GatePolicy::Enforce,
            }),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the pipeline for one period.
    Run {
        /// Period as YYYY-MM or a YYYY-MM-DD scheduling date.
        #[arg(long, value_name = "PERIOD")]
        period: ExecutionPeriod,
    },

    /// Run the pipeline for a range of periods, one at a time.
    Backfill {
        /// First period (default: the schedule start).
        #[arg(long, value_name = "PERIOD")]
        from: Option<ExecutionPeriod>,

        /// Last period (default: the schedule end, or the current month).
        #[arg(long, value_name = "PERIOD")]
        to: Option<ExecutionPeriod>,
    },

    /// Create the warehouse schemas and tables.
    Provision,

    /// Print the graph's execution order and edges.
    Graph,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum GatePolicyArg {
    ReportOnly,
    Enforce,
}
