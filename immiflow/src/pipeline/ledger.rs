//! Run ledger: per-period record of node outcomes.
//!
//! The ledger is the only orchestration state in the system. It lets a
//! rerun of a period skip nodes that already succeeded, and gives the CLI
//! something to report after a backfill.

use crate::core::{ExecutionPeriod, TaskStatus};
use crate::errors::PipelineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Generates the ledger key for a (period, node) pair.
#[must_use]
pub fn ledger_key(period: ExecutionPeriod, node: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{period}:{node}").as_bytes());
    let digest = hasher.finalize();
    format!("run:{}", hex::encode(&digest[..16]))
}

/// The recorded outcome of one node for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRun {
    /// The execution period.
    pub period: ExecutionPeriod,
    /// The node identifier.
    pub node: String,
    /// Final status of the node.
    pub status: TaskStatus,
    /// Number of attempts made.
    pub attempts: u32,
    /// Error message for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The graph run that produced this outcome.
    pub run_id: Uuid,
    /// When the node finished.
    pub finished_at: DateTime<Utc>,
}

impl NodeRun {
    /// The ledger key of this entry.
    #[must_use]
    pub fn key(&self) -> String {
        ledger_key(self.period, &self.node)
    }
}

/// Storage for node outcomes.
#[async_trait]
pub trait RunLedger: Send + Sync + Debug {
    /// Returns the latest outcome of a node for a period.
    async fn get(&self, period: ExecutionPeriod, node: &str)
        -> Result<Option<NodeRun>, PipelineError>;

    /// Records an outcome, replacing any earlier one for the same key.
    async fn record(&self, run: NodeRun) -> Result<(), PipelineError>;

    /// Returns all outcomes recorded for a period, ordered by node.
    async fn runs_for(&self, period: ExecutionPeriod) -> Result<Vec<NodeRun>, PipelineError>;

    /// Removes every outcome of a period.
    async fn clear_period(&self, period: ExecutionPeriod) -> Result<(), PipelineError>;
}

fn runs_in(entries: &BTreeMap<String, NodeRun>, period: ExecutionPeriod) -> Vec<NodeRun> {
    let mut runs: Vec<NodeRun> = entries
        .values()
        .filter(|run| run.period == period)
        .cloned()
        .collect();
    runs.sort_by(|a, b| a.node.cmp(&b.node));
    runs
}

/// In-memory run ledger.
#[derive(Debug, Default)]
pub struct InMemoryRunLedger {
    entries: Mutex<BTreeMap<String, NodeRun>>,
}

impl InMemoryRunLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl RunLedger for InMemoryRunLedger {
    async fn get(
        &self,
        period: ExecutionPeriod,
        node: &str,
    ) -> Result<Option<NodeRun>, PipelineError> {
        Ok(self.entries.lock().get(&ledger_key(period, node)).cloned())
    }

    async fn record(&self, run: NodeRun) -> Result<(), PipelineError> {
        self.entries.lock().insert(run.key(), run);
        Ok(())
    }

    async fn runs_for(&self, period: ExecutionPeriod) -> Result<Vec<NodeRun>, PipelineError> {
        Ok(runs_in(&self.entries.lock(), period))
    }

    async fn clear_period(&self, period: ExecutionPeriod) -> Result<(), PipelineError> {
        self.entries.lock().retain(|_, run| run.period != period);
        Ok(())
    }
}

/// Run ledger persisted as a JSON document.
///
/// The whole document is rewritten on every change, via a temporary file
/// and a rename.
#[derive(Debug)]
pub struct FileRunLedger {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, NodeRun>>,
    // serializes writers so renames land in record order
    write_lock: tokio::sync::Mutex<()>,
}

impl FileRunLedger {
    /// Opens a ledger file, starting empty when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                PipelineError::Ledger(format!("cannot parse {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns the ledger file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), PipelineError> {
        let _guard = self.write_lock.lock().await;
        let bytes = {
            let entries = self.entries.lock();
            serde_json::to_vec_pretty(&*entries)
                .map_err(|e| PipelineError::Ledger(e.to_string()))?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl RunLedger for FileRunLedger {
    async fn get(
        &self,
        period: ExecutionPeriod,
        node: &str,
    ) -> Result<Option<NodeRun>, PipelineError> {
        Ok(self.entries.lock().get(&ledger_key(period, node)).cloned())
    }

    async fn record(&self, run: NodeRun) -> Result<(), PipelineError> {
        self.entries.lock().insert(run.key(), run);
        self.persist().await
    }

    async fn runs_for(&self, period: ExecutionPeriod) -> Result<Vec<NodeRun>, PipelineError> {
        Ok(runs_in(&self.entries.lock(), period))
    }

    async fn clear_period(&self, period: ExecutionPeriod) -> Result<(), PipelineError> {
        self.entries.lock().retain(|_, run| run.period != period);
        self.persist().await
    }
}
