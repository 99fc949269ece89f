//! Static code/label mappings for the dimension tables.
//!
//! A default set is embedded in the binary; deployments can point
//! `reference_file` at their own TOML file with the same layout:
//!
//! ```toml
//! [[tables]]
//! table = "entry_channel_codes"
//!
//! [tables.codes]
//! "1" = "Air"
//! ```

use crate::errors::{ContractErrorInfo, PipelineError, PipelineValidationError};
use crate::warehouse::is_valid_identifier;
use figment::providers::{Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

const EMBEDDED: &str = include_str!("../config/reference.toml");

/// One dimension: its table name and the code to label mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceTable {
    /// Unqualified table name, also the staged artifact stem.
    pub table: String,
    /// Code to label, enumerated in code order.
    #[serde(default)]
    pub codes: BTreeMap<String, String>,
}

impl ReferenceTable {
    /// Creates a table from any iterable of pairs.
    #[must_use]
    pub fn new<I, K, V>(table: impl Into<String>, codes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            table: table.into(),
            codes: codes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Number of codes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Returns true if there are no codes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Ordered set of reference tables.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReferenceTables {
    #[serde(default)]
    tables: Vec<ReferenceTable>,
}

impl ReferenceTables {
    /// Creates a set from tables, validating their names.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid or repeated table name.
    pub fn new(tables: Vec<ReferenceTable>) -> Result<Self, PipelineError> {
        let set = Self { tables };
        set.validate()?;
        Ok(set)
    }

    /// The mappings compiled into the crate.
    ///
    /// # Errors
    ///
    /// Returns an error only if the embedded document is malformed.
    pub fn embedded() -> Result<Self, PipelineError> {
        Self::from_toml_str(EMBEDDED)
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed TOML, or a validation
    /// error for bad table names.
    pub fn from_toml_str(toml: &str) -> Result<Self, PipelineError> {
        let set: Self = Figment::from(Toml::string(toml))
            .extract()
            .map_err(Box::new)?;
        set.validate()?;
        Ok(set)
    }

    /// Loads a TOML file.
    ///
    /// # Errors
    ///
    /// Same as [`ReferenceTables::from_toml_str`], plus a missing file.
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        if !path.is_file() {
            return Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("reference file {} not found", path.display()),
            )));
        }
        let set: Self = Figment::from(Toml::file(path))
            .extract()
            .map_err(Box::new)?;
        set.validate()?;
        Ok(set)
    }

    /// Tables in staging order.
    #[must_use]
    pub fn tables(&self) -> &[ReferenceTable] {
        &self.tables
    }

    /// Looks up a table by name.
    #[must_use]
    pub fn get(&self, table: &str) -> Option<&ReferenceTable> {
        self.tables.iter().find(|t| t.table == table)
    }

    /// Table names in staging order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.table.as_str()).collect()
    }

    /// Number of tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns true if there are no tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    fn validate(&self) -> Result<(), PipelineValidationError> {
        let mut seen = HashSet::new();
        for table in &self.tables {
            if table.table.contains('.') || !is_valid_identifier(&table.table) {
                return Err(invalid(
                    "REFERENCE-001-INVALID_TABLE",
                    &table.table,
                    "Use an unqualified name such as `country_codes`.",
                ));
            }
            if !seen.insert(table.table.as_str()) {
                return Err(invalid(
                    "REFERENCE-002-DUPLICATE_TABLE",
                    &table.table,
                    "Merge the codes into a single [[tables]] entry.",
                ));
            }
        }
        Ok(())
    }
}

fn invalid(code: &str, table: &str, hint: &str) -> PipelineValidationError {
    let summary = format!("Reference table '{table}' is not usable");
    PipelineValidationError::new(summary.clone())
        .with_nodes(vec![table.to_string()])
        .with_error_info(
            ContractErrorInfo::new(code, summary)
                .with_fix_hint(hint)
                .with_context_entry("table", table),
        )
}
