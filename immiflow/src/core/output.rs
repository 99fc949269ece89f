//! Task output type with factory methods.

use super::TaskStatus;
use crate::errors::TaskError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The output of a task execution.
///
/// Outputs are immutable once handed to the executor; the factory methods
/// cover each terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    /// The status of the task execution.
    pub status: TaskStatus,

    /// Summary data produced by the task (row counts, keys written, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,

    /// Error message (for failed executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Skip reason (for skipped executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    /// Whether the failure may succeed on another attempt.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl Default for TaskOutput {
    fn default() -> Self {
        Self::ok_empty()
    }
}

impl TaskOutput {
    fn with_status(status: TaskStatus) -> Self {
        Self {
            status,
            data: HashMap::new(),
            error: None,
            skip_reason: None,
            retryable: false,
        }
    }

    /// Creates a successful output with data.
    #[must_use]
    pub fn ok(data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            data,
            ..Self::with_status(TaskStatus::Ok)
        }
    }

    /// Creates a successful output with no data.
    #[must_use]
    pub fn ok_empty() -> Self {
        Self::with_status(TaskStatus::Ok)
    }

    /// Creates a successful output with a single value.
    #[must_use]
    pub fn ok_value(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut data = HashMap::new();
        data.insert(key.into(), value);
        Self::ok(data)
    }

    /// Creates a skip output with a reason.
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            skip_reason: Some(reason.into()),
            ..Self::with_status(TaskStatus::Skip)
        }
    }

    /// Creates a non-retryable failure output.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(TaskStatus::Fail)
        }
    }

    /// Creates a retryable failure output.
    #[must_use]
    pub fn fail_retryable(error: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::fail(error)
        }
    }

    /// Creates the output recorded for a task whose predecessor failed.
    #[must_use]
    pub fn upstream_failed(failed_node: &str) -> Self {
        Self {
            error: Some(format!("upstream node '{failed_node}' failed")),
            ..Self::with_status(TaskStatus::UpstreamFailed)
        }
    }

    /// Converts a task error into a failure output, carrying its retryability.
    #[must_use]
    pub fn from_error(error: &TaskError) -> Self {
        if error.is_retryable() {
            Self::fail_retryable(error.to_string())
        } else {
            Self::fail(error.to_string())
        }
    }

    /// Adds a single data entry.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns true if the output indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if the output indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }

    /// Returns true if the failure can be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Gets a data value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{StagingError, StoreError};

    #[test]
    fn test_ok_value() {
        let output = TaskOutput::ok_value("rows", serde_json::json!(3));
        assert!(output.is_success());
        assert_eq!(output.get("rows"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn test_skip() {
        let output = TaskOutput::skip("already done");
        assert_eq!(output.status, TaskStatus::Skip);
        assert!(output.is_success());
        assert_eq!(output.skip_reason.as_deref(), Some("already done"));
    }

    #[test]
    fn test_fail_variants() {
        assert!(!TaskOutput::fail("boom").is_retryable());
        assert!(TaskOutput::fail_retryable("boom").is_retryable());
        assert!(TaskOutput::fail("boom").is_failure());
    }

    #[test]
    fn test_from_error_keeps_retryability() {
        let transient = TaskError::from(StoreError::not_found("bucket", "key"));
        assert!(TaskOutput::from_error(&transient).is_retryable());

        let invariant = TaskError::from(StagingError::EmptyBatch);
        let output = TaskOutput::from_error(&invariant);
        assert!(!output.is_retryable());
        assert!(output.error.unwrap().contains("empty"));
    }

    #[test]
    fn test_upstream_failed() {
        let output = TaskOutput::upstream_failed("stage_a");
        assert_eq!(output.status, TaskStatus::UpstreamFailed);
        assert!(output.error.unwrap().contains("stage_a"));
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let json = serde_json::to_value(TaskOutput::ok_empty()).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ok"}));
    }
}
