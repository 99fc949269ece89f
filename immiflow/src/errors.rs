//! Error types for the immiflow pipeline.
//!
//! Errors are split by layer: graph validation, the individual external
//! collaborators (warehouse, object store, credentials), staging
//! invariants, and the aggregate [`TaskError`] a task returns to the
//! executor.

use crate::core::ExecutionPeriod;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for pipeline operations outside of task bodies.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The graph failed validation.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A cycle was detected in the graph.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A task failed outside of graph execution (e.g. a direct invocation).
    #[error("{0}")]
    Task(#[from] TaskError),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The run ledger could not be read or written.
    #[error("Run ledger error: {0}")]
    Ledger(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata about a graph contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "GRAPH-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when graph validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The nodes involved in the error.
    pub nodes: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            nodes: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the nodes involved.
    #[must_use]
    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the task graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of nodes forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "GRAPH-001-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the edges in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        PipelineValidationError {
            message: err.to_string(),
            nodes: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Invariant violations and decoding failures raised while staging data.
///
/// These are deterministic for a given input and are never retried.
#[derive(Debug, Error)]
pub enum StagingError {
    /// The extract contained no rows after key cleaning.
    #[error("staging batch is empty after removing invalid admission numbers")]
    EmptyBatch,

    /// The batch spans more than one (year, month).
    #[error("staging batch spans multiple periods: years {years:?}, months {months:?}")]
    MixedPeriods {
        /// Distinct years found.
        years: Vec<i32>,
        /// Distinct months found.
        months: Vec<u32>,
    },

    /// The batch period differs from the execution period.
    #[error("staging batch belongs to {found} but the execution period is {expected}")]
    PeriodMismatch {
        /// The execution period.
        expected: ExecutionPeriod,
        /// The period declared by the batch.
        found: ExecutionPeriod,
    },

    /// A record's arrival date falls outside the batch period.
    #[error("admission {admnum} arrived on {arrival}, outside batch period {period}")]
    ArrivalOutsidePeriod {
        /// The admission number.
        admnum: i64,
        /// The decoded arrival date.
        arrival: NaiveDate,
        /// The batch period.
        period: ExecutionPeriod,
    },

    /// A required value is missing.
    #[error("row {row}: missing required value in column '{column}'")]
    MissingValue {
        /// Zero-based data row index.
        row: usize,
        /// Column name.
        column: &'static str,
    },

    /// A value could not be normalized to its target type.
    #[error("row {row}: invalid value '{value}' in column '{column}'")]
    InvalidValue {
        /// Zero-based data row index.
        row: usize,
        /// Column name.
        column: &'static str,
        /// The offending value.
        value: String,
    },

    /// The extract could not be decoded or the artifact encoded.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The encoded artifact could not be finalized.
    #[error("failed to encode staged artifact: {0}")]
    Encode(String),
}

/// Errors raised by object store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist.
    #[error("object not found: {bucket}/{key}")]
    NotFound {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },

    /// The bucket or key is not acceptable to the store.
    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    /// Underlying IO failure.
    #[error("object store IO error for {path}: {source}")]
    Io {
        /// Path being accessed.
        path: String,
        /// The IO error.
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Returns true if the error reports a missing object.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors raised by warehouse implementations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// The SQLite engine rejected a statement.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// An identifier failed validation.
    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    /// A bulk load source could not be fetched.
    #[error("bulk load source unavailable: {0}")]
    Source(#[from] StoreError),

    /// A bulk load source could not be decoded.
    #[error("bulk load decode error: {0}")]
    Decode(#[from] csv::Error),

    /// The target table of a load does not exist.
    #[error("table '{0}' does not exist")]
    MissingTable(String),

    /// A source record does not match the target column count.
    #[error("{table}: source line {line} has {found} fields, expected {expected}")]
    ColumnMismatch {
        /// Target table.
        table: String,
        /// 1-based source line.
        line: u64,
        /// Number of target columns.
        expected: usize,
        /// Number of fields in the record.
        found: usize,
    },

    /// The blocking worker running the statement was lost.
    #[error("warehouse worker failed: {0}")]
    Worker(String),

    /// The warehouse directory could not be accessed.
    #[error("warehouse IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WarehouseError {
    /// Returns true if SQLite rejected a write for violating a table constraint.
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

/// Errors raised when resolving credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No token is available for the reference.
    #[error("credential '{0}' could not be resolved")]
    Unresolved(String),
}

/// Errors raised when rendering SQL templates or quality conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// An identifier failed validation.
    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    /// The template lacks a required placeholder.
    #[error("template is missing the '{placeholder}' placeholder")]
    MissingPlaceholder {
        /// The placeholder name.
        placeholder: &'static str,
    },

    /// A quality condition could not be parsed.
    #[error("invalid success condition '{0}'")]
    InvalidCondition(String),
}

/// The error a task body returns to the executor.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A staging invariant was violated.
    #[error(transparent)]
    Staging(#[from] StagingError),

    /// A warehouse call failed.
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    /// An object store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A credential could not be resolved.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// A SQL template could not be rendered.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The quality gate is enforcing and at least one check failed.
    #[error("quality gate failed: {failed} of {total} checks did not pass")]
    QualityGate {
        /// Number of failed (table, check) pairs.
        failed: usize,
        /// Number of evaluated (table, check) pairs.
        total: usize,
    },
}

impl TaskError {
    /// Returns true if the executor may retry the task after this error.
    ///
    /// External-call failures are retryable; invariant violations and
    /// configuration mistakes are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Warehouse(
                WarehouseError::InvalidIdentifier(_) | WarehouseError::ColumnMismatch { .. },
            ) => false,
            Self::Warehouse(err) if err.is_constraint_violation() => false,
            Self::Warehouse(_) | Self::Store(_) | Self::Credential(_) => true,
            Self::Staging(_) | Self::Template(_) | Self::QualityGate { .. } => false,
        }
    }
}
