//! Core domain model types.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Execution periods and the names derived from them
//! - Task status and kind enums
//! - Task output type with factory methods

mod output;
mod period;
mod status;

pub use output::TaskOutput;
pub use period::{ExecutionPeriod, ParsePeriodError};
pub use status::{TaskKind, TaskStatus};
