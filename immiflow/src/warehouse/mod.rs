//! Relational warehouse seam.
//!
//! Tasks talk to the warehouse through the [`Warehouse`] trait. Per-run
//! values travel as bound parameters; the only text ever spliced into SQL
//! is a table or schema identifier, and those pass [`validate_identifier`]
//! first.

mod sqlite;

pub use sqlite::SqliteWarehouse;

use crate::credentials::AccessToken;
use crate::errors::WarehouseError;
use crate::storage::ObjectLocation;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::OnceLock;

/// A single SQL value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// Double precision float.
    Real(f64),
    /// Text.
    Text(String),
}

impl SqlValue {
    /// Returns the value as a float, converting integers.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Integer(i) => Some(*i as f64),
            Self::Real(f) => Some(*f),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Null => None,
        }
    }

    /// Returns the value as an integer, if it is one.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Real(_) | Self::Null => None,
        }
    }

    /// Returns the text, if the value is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns true for NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Layout of a delimited source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvFormat {
    /// Field delimiter.
    pub delimiter: u8,
    /// Whether the first record is a header to skip.
    pub has_header: bool,
}

impl CsvFormat {
    /// Comma-delimited with a header row.
    #[must_use]
    pub const fn comma_with_header() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
        }
    }

    /// Semicolon-delimited with a header row.
    #[must_use]
    pub const fn semicolon_with_header() -> Self {
        Self {
            delimiter: b';',
            has_header: true,
        }
    }
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self::comma_with_header()
    }
}

/// A request to bulk-load one staged artifact into a table.
///
/// Fields are loaded positionally into `columns` (or all table columns in
/// declaration order). Empty fields load as NULL.
#[derive(Debug, Clone)]
pub struct BulkLoad {
    /// Target table, `schema.table`.
    pub table: String,
    /// Source artifact.
    pub source: ObjectLocation,
    /// Source layout.
    pub format: CsvFormat,
    /// Target columns, if not all of them.
    pub columns: Option<Vec<String>>,
    /// Transient token authorizing the engine to read the source.
    pub token: AccessToken,
}

impl BulkLoad {
    /// Creates a load request with the default (comma, header) format.
    #[must_use]
    pub fn new(table: impl Into<String>, source: ObjectLocation, token: AccessToken) -> Self {
        Self {
            table: table.into(),
            source,
            format: CsvFormat::default(),
            columns: None,
            token,
        }
    }

    /// Sets the source format.
    #[must_use]
    pub fn with_format(mut self, format: CsvFormat) -> Self {
        self.format = format;
        self
    }

    /// Restricts the load to the given columns.
    #[must_use]
    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }
}

/// A relational warehouse with schemas, DDL/DML and bulk loads.
///
/// Implementations open a connection per call and close it afterwards.
#[async_trait]
pub trait Warehouse: Send + Sync + Debug {
    /// Ensures a schema exists. Idempotent.
    async fn create_schema(&self, schema: &str) -> Result<(), WarehouseError>;

    /// Executes a batch of `;`-separated statements.
    async fn execute(&self, sql: &str) -> Result<(), WarehouseError>;

    /// Executes one statement with named parameters (`:name`), returning
    /// the number of affected rows.
    async fn execute_with(
        &self,
        sql: &str,
        params: &[(&str, SqlValue)],
    ) -> Result<usize, WarehouseError>;

    /// Runs a query and returns every row.
    async fn query(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>, WarehouseError>;

    /// Removes every row of a table.
    async fn truncate(&self, table: &str) -> Result<(), WarehouseError>;

    /// Bulk-loads a staged artifact, returning the number of rows loaded.
    async fn bulk_load(&self, request: &BulkLoad) -> Result<u64, WarehouseError>;

    /// Runs a query and returns the first column of the first row, or NULL.
    async fn query_scalar(&self, sql: &str) -> Result<SqlValue, WarehouseError> {
        let rows = self.query(sql).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or(SqlValue::Null))
    }

    /// Returns true if the table exists.
    async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError>;
}

fn identifier_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").ok())
        .as_ref()
}

/// Returns true if `name` is a plain or schema-qualified identifier.
#[must_use]
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_pattern().is_some_and(|pattern| pattern.is_match(name))
}

/// Validates a plain or schema-qualified identifier.
///
/// # Errors
///
/// Returns [`WarehouseError::InvalidIdentifier`] if the name does not match.
pub fn validate_identifier(name: &str) -> Result<&str, WarehouseError> {
    if is_valid_identifier(name) {
        Ok(name)
    } else {
        Err(WarehouseError::InvalidIdentifier(name.to_string()))
    }
}

/// Splits `schema.table` into its parts; unqualified names have no schema.
#[must_use]
pub fn split_qualified(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, name),
    }
}
