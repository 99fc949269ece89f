//! Task status and kind enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Ensures warehouse schemas and tables exist.
    Provision,
    /// Publishes an artifact to the staging area.
    Stage,
    /// Copies staged artifacts into warehouse tables.
    Load,
    /// Derives a table from already loaded data.
    Transform,
    /// Validates loaded data.
    Guard,
    /// Produces a period-versioned output table.
    Analyze,
    /// Any other unit of work.
    #[default]
    Work,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provision => write!(f, "provision"),
            Self::Stage => write!(f, "stage"),
            Self::Load => write!(f, "load"),
            Self::Transform => write!(f, "transform"),
            Self::Guard => write!(f, "guard"),
            Self::Analyze => write!(f, "analyze"),
            Self::Work => write!(f, "work"),
        }
    }
}

/// The execution status of a task within one graph run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task completed successfully.
    Ok,
    /// Task was skipped (already succeeded for this period).
    Skip,
    /// Task failed after exhausting its retries.
    Fail,
    /// Task never ran because a predecessor failed.
    UpstreamFailed,
    /// Task is waiting for its predecessors.
    #[default]
    Pending,
    /// Task is currently running.
    Running,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Skip => write!(f, "skip"),
            Self::Fail => write!(f, "fail"),
            Self::UpstreamFailed => write!(f, "upstream_failed"),
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
        }
    }
}

impl TaskStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ok | Self::Skip | Self::Fail | Self::UpstreamFailed
        )
    }

    /// Returns true if successors may run after this status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::Skip)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail | Self::UpstreamFailed)
    }
}
