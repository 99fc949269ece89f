//! Staging of the static dimension mappings.

use super::{Task, TaskContext};
use crate::core::{TaskKind, TaskOutput};
use crate::errors::{StagingError, TaskError};
use crate::reference::{ReferenceTable, ReferenceTables};
use crate::storage::{ObjectLocation, ObjectPrefix, ObjectStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Serializes a mapping as `code;name` CSV, sorted by code.
///
/// # Errors
///
/// Returns a CSV error if a record cannot be written.
pub fn render_reference_csv(table: &ReferenceTable) -> Result<Vec<u8>, StagingError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_writer(Vec::new());
    writer.write_record(["code", "name"])?;
    for (code, name) in &table.codes {
        writer.write_record([code, name])?;
    }
    writer
        .into_inner()
        .map_err(|e| StagingError::Encode(e.to_string()))
}

/// Publishes every reference table to `{prefix}/{table}.csv`.
#[derive(Debug, Clone)]
pub struct ReferenceStagingTask {
    store: Arc<dyn ObjectStore>,
    target: ObjectPrefix,
    tables: ReferenceTables,
}

impl ReferenceStagingTask {
    /// Creates a stager writing under `target`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, target: ObjectPrefix, tables: ReferenceTables) -> Self {
        Self {
            store,
            target,
            tables,
        }
    }

    /// Location of one table's staged artifact.
    #[must_use]
    pub fn artifact_for(&self, table: &str) -> ObjectLocation {
        self.target.object(&format!("{table}.csv"))
    }
}

#[async_trait]
impl Task for ReferenceStagingTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Stage
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let mut written = Vec::with_capacity(self.tables.len());
        for table in self.tables.tables() {
            let location = self.artifact_for(&table.table);
            let bytes = render_reference_csv(table)?;
            self.store.put(&location, bytes).await?;
            debug!(key = %location, codes = table.len(), "Reference table staged");
            written.push(location.to_string());
        }
        info!(node = %ctx.node(), tables = written.len(), "Reference tables staged");
        Ok(TaskOutput::ok_value("artifacts", serde_json::json!(written)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionPeriod;
    use crate::storage::InMemoryObjectStore;
    use pretty_assertions::assert_eq;

    fn ctx() -> TaskContext {
        TaskContext::for_period(ExecutionPeriod::new(2016, 1).unwrap(), "stage_immigration_dimensions")
    }

    #[test]
    fn test_render_sorted_semicolon_csv() {
        let table = ReferenceTable::new("entry_channel_codes", [("9", "Not reported"), ("1", "Air")]);
        let csv = String::from_utf8(render_reference_csv(&table).unwrap()).unwrap();
        assert_eq!(csv, "code;name\n1;Air\n9;Not reported\n");
    }

    #[test]
    fn test_render_quotes_embedded_delimiters() {
        let table = ReferenceTable::new("port_codes", [("X", "A;B")]);
        let csv = String::from_utf8(render_reference_csv(&table).unwrap()).unwrap();
        assert_eq!(csv, "code;name\nX;\"A;B\"\n");
    }

    #[tokio::test]
    async fn test_stages_every_table_and_overwrites() {
        let store = Arc::new(InMemoryObjectStore::new());
        let tables = ReferenceTables::embedded().unwrap();
        let task = ReferenceStagingTask::new(
            store.clone(),
            ObjectPrefix::new("bucket", "staging/immigration-dimensions"),
            tables.clone(),
        );

        task.execute(&ctx()).await.unwrap();
        let out = task.execute(&ctx()).await.unwrap();

        assert_eq!(store.len(), tables.len());
        assert_eq!(out.get("artifacts").unwrap().as_array().unwrap().len(), tables.len());

        let bytes = store
            .get(&ObjectLocation::new(
                "bucket",
                "staging/immigration-dimensions/trip_reason_codes.csv",
            ))
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "code;name\n1;Business\n2;Pleasure\n3;Student\n"
        );
    }
}
