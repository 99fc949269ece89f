//! Task graph building and execution.
//!
//! This module provides:
//! - Node specifications and the validating graph builder
//! - The concurrent DAG executor with per-node retry
//! - The run ledger used to resume periods
//! - The monthly schedule and sequential scheduler

mod builder;
mod dag;
pub mod ledger;
mod retry;
mod schedule;
mod spec;


pub use builder::GraphBuilder;
pub use dag::{ExecutionOptions, GraphRunReport, NodeOutcome, TaskGraph};
pub use ledger::{ledger_key, FileRunLedger, InMemoryRunLedger, NodeRun, RunLedger};
pub use retry::{
    should_retry, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision, RetryState,
};
pub use schedule::{period_range, BackfillReport, Schedule, Scheduler};
pub use spec::NodeSpec;
