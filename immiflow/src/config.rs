//! Pipeline configuration.
//!
//! Configuration is layered with figment, later layers winning:
//!
//! 1. built-in defaults ([`PipelineConfig::default`])
//! 2. an optional TOML file
//! 3. `IMMIFLOW_`-prefixed environment variables, `__` separating nested
//!    keys (`IMMIFLOW_EXECUTION__MAX_PARALLEL=2`)
//! 4. explicit overrides, usually from the command line

use crate::catalog;
use crate::credentials::CredentialRef;
use crate::errors::PipelineError;
use crate::pipeline::{RetryConfig, Schedule};
use crate::reference::ReferenceTables;
use crate::storage::ObjectPrefix;
use crate::tasks::quality::{GatePolicy, QualityCheck};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "IMMIFLOW_";

/// Object storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per bucket.
    pub root: PathBuf,
    /// Bucket for raw and staged artifacts.
    pub bucket: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/objects"),
            bucket: "immiflow".to_string(),
        }
    }
}

/// Key prefixes of raw extracts and staged artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Monthly immigration extracts.
    pub raw_immigration: String,
    /// Temperature extract.
    pub raw_temperatures: String,
    /// Staged dimension tables.
    pub staging_dimensions: String,
    /// Staged immigration artifacts.
    pub staging_immigration: String,
    /// Staged temperature artifact.
    pub staging_temperatures: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_immigration: "raw/immigration-data".to_string(),
            raw_temperatures: "raw/temperatures-data".to_string(),
            staging_dimensions: "staging/immigration-dimensions".to_string(),
            staging_immigration: "staging/immigration-data".to_string(),
            staging_temperatures: "staging/temperatures-data".to_string(),
        }
    }
}

/// Warehouse settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// Directory holding the warehouse database files.
    pub root: PathBuf,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/warehouse"),
        }
    }
}

/// Credential settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Reference the loaders resolve on every invocation.
    pub role: CredentialRef,
    /// Prefix of the environment variables holding tokens.
    pub env_prefix: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            role: CredentialRef::default(),
            env_prefix: "IMMIFLOW_CREDENTIAL_".to_string(),
        }
    }
}

/// Graph execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum concurrently running nodes.
    pub max_parallel: usize,
    /// Skip nodes already succeeded for the period.
    pub resume: bool,
    /// JSON run ledger; no ledger when unset.
    pub ledger_path: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            resume: false,
            ledger_path: Some(PathBuf::from("data/ledger.json")),
        }
    }
}

/// Quality gate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// What a failed check does to the gate node.
    pub policy: GatePolicy,
    /// Tables every check runs against.
    pub tables: Vec<String>,
    /// Checks, in evaluation order.
    pub checks: Vec<QualityCheck>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            policy: GatePolicy::ReportOnly,
            tables: catalog::QUALITY_TABLES.iter().map(ToString::to_string).collect(),
            checks: vec![QualityCheck::row_count()],
        }
    }
}

/// The complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Object storage.
    pub storage: StorageConfig,
    /// Artifact key prefixes.
    pub paths: PathsConfig,
    /// Warehouse location.
    pub warehouse: WarehouseConfig,
    /// Loader credentials.
    pub credentials: CredentialsConfig,
    /// Retry policy applied to every node.
    pub retry: RetryConfig,
    /// Graph execution.
    pub execution: ExecutionConfig,
    /// Quality gate.
    pub quality: QualityConfig,
    /// Monthly schedule.
    pub schedule: Schedule,
    /// Replaces the embedded reference tables when set.
    pub reference_file: Option<PathBuf>,
}

/// Values set explicitly by the caller, applied last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// `storage.root`
    pub storage_root: Option<PathBuf>,
    /// `warehouse.root`
    pub warehouse_root: Option<PathBuf>,
    /// `execution.max_parallel`
    pub max_parallel: Option<usize>,
    /// `execution.resume`
    pub resume: Option<bool>,
    /// `quality.policy`
    pub gate_policy: Option<GatePolicy>,
}

impl ConfigOverrides {
    fn apply(&self, mut figment: Figment) -> Figment {
        if let Some(root) = &self.storage_root {
            figment = figment.merge(Serialized::default("storage.root", root));
        }
        if let Some(root) = &self.warehouse_root {
            figment = figment.merge(Serialized::default("warehouse.root", root));
        }
        if let Some(max_parallel) = self.max_parallel {
            figment = figment.merge(Serialized::default("execution.max_parallel", max_parallel));
        }
        if let Some(resume) = self.resume {
            figment = figment.merge(Serialized::default("execution.resume", resume));
        }
        if let Some(policy) = self.gate_policy {
            figment = figment.merge(Serialized::default("quality.policy", policy));
        }
        figment
    }
}

impl PipelineConfig {
    /// Builds the layered figment without extracting it.
    #[must_use]
    pub fn figment(file: Option<&Path>, overrides: &ConfigOverrides) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(file) = file {
            figment = figment.merge(Toml::file(file));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        overrides.apply(figment)
    }

    /// Loads the layered configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if `file` is given but missing, or a
    /// configuration error if any layer is malformed.
    pub fn load(file: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self, PipelineError> {
        if let Some(file) = file {
            if !file.is_file() {
                return Err(PipelineError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("config file {} not found", file.display()),
                )));
            }
        }
        let config: Self = Self::figment(file, overrides)
            .extract()
            .map_err(Box::new)?;
        Ok(config)
    }

    /// Reference tables: the configured file, or the embedded defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or validated.
    pub fn reference_tables(&self) -> Result<ReferenceTables, PipelineError> {
        match &self.reference_file {
            Some(path) => ReferenceTables::from_file(path),
            None => ReferenceTables::embedded(),
        }
    }

    /// Prefix of the raw immigration extracts.
    #[must_use]
    pub fn raw_immigration(&self) -> ObjectPrefix {
        ObjectPrefix::new(self.storage.bucket.clone(), self.paths.raw_immigration.clone())
    }

    /// Prefix of the raw temperature extract.
    #[must_use]
    pub fn raw_temperatures(&self) -> ObjectPrefix {
        ObjectPrefix::new(self.storage.bucket.clone(), self.paths.raw_temperatures.clone())
    }

    /// Prefix of the staged dimension tables.
    #[must_use]
    pub fn staging_dimensions(&self) -> ObjectPrefix {
        ObjectPrefix::new(self.storage.bucket.clone(), self.paths.staging_dimensions.clone())
    }

    /// Prefix of the staged immigration artifacts.
    #[must_use]
    pub fn staging_immigration(&self) -> ObjectPrefix {
        ObjectPrefix::new(self.storage.bucket.clone(), self.paths.staging_immigration.clone())
    }

    /// Prefix of the staged temperature artifact.
    #[must_use]
    pub fn staging_temperatures(&self) -> ObjectPrefix {
        ObjectPrefix::new(self.storage.bucket.clone(), self.paths.staging_temperatures.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.base_delay_ms, 300_000);
        assert_eq!(config.quality.policy, GatePolicy::ReportOnly);
        assert_eq!(config.quality.tables.len(), 8);
        assert_eq!(config.schedule.start, NaiveDate::from_ymd_opt(2015, 12, 15).unwrap());
        assert_eq!(
            config.staging_immigration().object("i94_jan16_sub.csv").to_string(),
            "immiflow/staging/immigration-data/i94_jan16_sub.csv"
        );
    }

    #[test]
    fn test_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "immiflow.toml",
                r#"
                [storage]
                bucket = "lake"

                [execution]
                max_parallel = 8

                [quality]
                policy = "enforce"

                [[quality.checks]]
                name = "row_count"
                query = "SELECT COUNT(*) FROM {}"
                condition = "{} > 0"

                [schedule]
                start = "2016-01-15"
                "#,
            )?;
            jail.set_env("IMMIFLOW_EXECUTION__MAX_PARALLEL", "2");
            jail.set_env("IMMIFLOW_WAREHOUSE__ROOT", "/tmp/wh");

            let overrides = ConfigOverrides {
                resume: Some(true),
                gate_policy: Some(GatePolicy::ReportOnly),
                ..ConfigOverrides::default()
            };
            let config = PipelineConfig::load(Some(Path::new("immiflow.toml")), &overrides)
                .map_err(|e| e.to_string())?;

            assert_eq!(config.storage.bucket, "lake");
            assert_eq!(config.execution.max_parallel, 2);
            assert!(config.execution.resume);
            assert_eq!(config.warehouse.root, PathBuf::from("/tmp/wh"));
            assert_eq!(config.quality.policy, GatePolicy::ReportOnly);
            assert_eq!(config.quality.checks.len(), 1);
            assert_eq!(config.schedule.start, NaiveDate::from_ymd_opt(2016, 1, 15).unwrap());
            assert_eq!(config.schedule.end, NaiveDate::from_ymd_opt(2016, 12, 15));
            assert_eq!(config.paths, PathsConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = PipelineConfig::load(
            Some(Path::new("/definitely/not/here.toml")),
            &ConfigOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)));
    }

    #[test]
    fn test_reference_tables_default_to_embedded() {
        let config = PipelineConfig::default();
        assert_eq!(config.reference_tables().unwrap().len(), 5);
    }
}
