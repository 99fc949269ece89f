//! Schema and table provisioning.

use super::{Task, TaskContext};
use crate::catalog;
use crate::core::{TaskKind, TaskOutput};
use crate::errors::TaskError;
use crate::warehouse::Warehouse;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Ensures the warehouse schemas exist, then runs idempotent table DDL.
#[derive(Debug, Clone)]
pub struct ProvisionTask {
    warehouse: Arc<dyn Warehouse>,
    schemas: Vec<String>,
    ddl: String,
}

impl ProvisionTask {
    /// Creates a provisioner for the given schemas and DDL batch.
    #[must_use]
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        schemas: impl IntoIterator<Item = impl Into<String>>,
        ddl: impl Into<String>,
    ) -> Self {
        Self {
            warehouse,
            schemas: schemas.into_iter().map(Into::into).collect(),
            ddl: ddl.into(),
        }
    }

    /// Creates a provisioner for the pipeline's own catalog.
    #[must_use]
    pub fn catalog(warehouse: Arc<dyn Warehouse>) -> Self {
        Self::new(warehouse, catalog::SCHEMAS, catalog::CREATE_TABLES)
    }

    /// Runs provisioning outside of a graph.
    ///
    /// # Errors
    ///
    /// Returns the first schema or DDL failure.
    pub async fn provision(&self) -> Result<(), TaskError> {
        for schema in &self.schemas {
            self.warehouse.create_schema(schema).await?;
        }
        if !self.ddl.trim().is_empty() {
            self.warehouse.execute(&self.ddl).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Task for ProvisionTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Provision
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        self.provision().await?;
        info!(
            node = %ctx.node(),
            schemas = self.schemas.len(),
            "Schemas and tables ensured"
        );
        Ok(TaskOutput::ok_value(
            "schemas",
            serde_json::json!(self.schemas),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionPeriod;
    use crate::storage::InMemoryObjectStore;
    use crate::warehouse::SqliteWarehouse;
    use pretty_assertions::assert_eq;

    fn ctx() -> TaskContext {
        TaskContext::for_period(ExecutionPeriod::new(2016, 1).unwrap(), "create_schemas_and_tables")
    }

    async fn catalog_tables(wh: &SqliteWarehouse) -> Vec<String> {
        let mut names = Vec::new();
        for schema in catalog::SCHEMAS {
            let rows = wh
                .query(&format!(
                    "SELECT name FROM {schema}.sqlite_master WHERE type = 'table' ORDER BY name"
                ))
                .await
                .unwrap();
            names.extend(rows.into_iter().map(|r| format!("{schema}.{}", r[0])));
        }
        names
    }

    #[tokio::test]
    async fn test_provisioning_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let wh = Arc::new(SqliteWarehouse::new(
            dir.path(),
            Arc::new(InMemoryObjectStore::new()),
        ));
        let task = ProvisionTask::catalog(wh.clone());

        let first = task.execute(&ctx()).await.unwrap();
        assert!(first.is_success());
        let after_first = catalog_tables(&wh).await;

        task.execute(&ctx()).await.unwrap();
        assert_eq!(catalog_tables(&wh).await, after_first);

        assert!(wh.table_exists(catalog::US_ENTRIES).await.unwrap());
        assert!(wh.table_exists(catalog::TEMPERATURE_FACT).await.unwrap());
        for dim in catalog::DIMENSION_TABLES {
            assert!(wh.table_exists(&catalog::dimension_table(dim)).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_ddl_error_fails_the_node() {
        let dir = tempfile::tempdir().unwrap();
        let wh = Arc::new(SqliteWarehouse::new(
            dir.path(),
            Arc::new(InMemoryObjectStore::new()),
        ));
        let task = ProvisionTask::new(wh, ["immigration"], "CREATE TABLE nowhere.t (a TEXT);");

        let err = task.execute(&ctx()).await.unwrap_err();
        assert!(matches!(err, TaskError::Warehouse(_)));
    }
}
