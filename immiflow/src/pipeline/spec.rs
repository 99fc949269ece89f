//! Node specifications.

use super::RetryConfig;
use crate::core::TaskKind;
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use crate::tasks::Task;
use std::sync::Arc;

/// Specification for a single node in a task graph.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// The unique node identifier.
    pub name: String,
    /// The task implementation.
    pub task: Arc<dyn Task>,
    /// Retry policy for this node.
    pub retry: RetryConfig,
    /// Whether the node may run alongside other nodes.
    pub parallel_safe: bool,
    /// The kind of node, taken from the task unless overridden.
    pub kind: TaskKind,
}

impl NodeSpec {
    /// Creates a new node specification with the default retry policy.
    #[must_use]
    pub fn new(name: impl Into<String>, task: Arc<dyn Task>) -> Self {
        let kind = task.kind();
        Self {
            name: name.into(),
            task,
            retry: RetryConfig::default(),
            parallel_safe: true,
            kind,
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Marks the node as unsafe to run concurrently with any other node.
    #[must_use]
    pub fn exclusive(mut self) -> Self {
        self.parallel_safe = false;
        self
    }

    /// Sets the node kind.
    #[must_use]
    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    /// Validates the node identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or contains whitespace.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.is_empty() || self.name.chars().any(char::is_whitespace) {
            return Err(PipelineValidationError::new(format!(
                "Node name '{}' must be non-empty and contain no whitespace",
                self.name
            ))
            .with_nodes(vec![self.name.clone()])
            .with_error_info(ContractErrorInfo::new(
                "GRAPH-006-INVALID_NAME",
                "Invalid node identifier",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::NoOpTask;

    #[test]
    fn test_node_spec_creation() {
        let spec = NodeSpec::new("load", Arc::new(NoOpTask))
            .with_retry(RetryConfig::none())
            .with_kind(TaskKind::Load)
            .exclusive();

        assert_eq!(spec.name, "load");
        assert_eq!(spec.retry.max_attempts, 1);
        assert_eq!(spec.kind, TaskKind::Load);
        assert!(!spec.parallel_safe);
    }

    #[test]
    fn test_node_spec_defaults() {
        let spec = NodeSpec::new("a", Arc::new(NoOpTask));
        assert!(spec.parallel_safe);
        assert_eq!(spec.kind, TaskKind::Work);
        assert_eq!(spec.retry, RetryConfig::default());
    }

    #[test]
    fn test_node_spec_invalid_name() {
        assert!(NodeSpec::new("", Arc::new(NoOpTask)).validate().is_err());
        assert!(NodeSpec::new("a b", Arc::new(NoOpTask)).validate().is_err());
        assert!(NodeSpec::new("a_b", Arc::new(NoOpTask)).validate().is_ok());
    }
}
