//! Derived aggregate tables.

use super::{Task, TaskContext};
use crate::catalog;
use crate::core::{TaskKind, TaskOutput};
use crate::errors::TaskError;
use crate::warehouse::{validate_identifier, Warehouse};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Recomputes an aggregate table from scratch with a drop-and-create batch.
#[derive(Debug, Clone)]
pub struct AggregateTask {
    warehouse: Arc<dyn Warehouse>,
    table: String,
    sql: String,
}

impl AggregateTask {
    /// Creates a task that runs `sql` to rebuild `table`.
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>, table: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            warehouse,
            table: table.into(),
            sql: sql.into(),
        }
    }

    /// The temperature summary: mean and population standard deviation per country.
    #[must_use]
    pub fn temperature_summary(warehouse: Arc<dyn Warehouse>) -> Self {
        Self::new(warehouse, catalog::TEMP_SUMMARY, catalog::TEMPERATURE_SUMMARY)
    }
}

#[async_trait]
impl Task for AggregateTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Transform
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let table = validate_identifier(&self.table)?;
        self.warehouse.execute(&self.sql).await?;
        let rows = self
            .warehouse
            .query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .await?;
        info!(node = %ctx.node(), table = %self.table, rows = %rows, "Aggregate rebuilt");
        Ok(TaskOutput::ok_value("table", serde_json::json!(self.table))
            .add_data("rows", serde_json::json!(rows.as_i64())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionPeriod;
    use crate::storage::InMemoryObjectStore;
    use crate::tasks::provision::ProvisionTask;
    use crate::warehouse::{SqlValue, SqliteWarehouse};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_temperature_summary_full_recompute() {
        let dir = tempfile::tempdir().unwrap();
        let wh = Arc::new(SqliteWarehouse::new(
            dir.path(),
            Arc::new(InMemoryObjectStore::new()),
        ));
        ProvisionTask::catalog(wh.clone()).provision().await.unwrap();
        wh.execute(
            "INSERT INTO temperature.full_temperature_data (dt, averagetemperature, city, country)
             VALUES ('2013-01-01', 2.0, 'Paris', 'France'),
                    ('2013-02-01', 4.0, 'Lyon', 'France'),
                    ('2013-03-01', NULL, 'Lyon', 'France'),
                    ('2013-01-01', 10.0, 'Tokyo', 'Japan');",
        )
        .await
        .unwrap();
        let task = AggregateTask::temperature_summary(wh.clone());
        let ctx = TaskContext::for_period(ExecutionPeriod::new(2016, 1).unwrap(), "run_temperatures_summary");

        task.execute(&ctx).await.unwrap();
        let out = task.execute(&ctx).await.unwrap();

        assert_eq!(out.get("rows"), Some(&serde_json::json!(2)));
        let rows = wh
            .query("SELECT country_name, mean_temp, stddev_temp FROM temperature.temp_summary ORDER BY country_name")
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![SqlValue::Text("FRANCE".into()), SqlValue::Real(3.0), SqlValue::Real(1.0)],
                vec![SqlValue::Text("JAPAN".into()), SqlValue::Real(10.0), SqlValue::Real(0.0)],
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_source_table_fails() {
        let dir = tempfile::tempdir().unwrap();
        let wh = Arc::new(SqliteWarehouse::new(
            dir.path(),
            Arc::new(InMemoryObjectStore::new()),
        ));
        let task = AggregateTask::temperature_summary(wh);
        let ctx = TaskContext::for_period(ExecutionPeriod::new(2016, 1).unwrap(), "run_temperatures_summary");
        assert!(task.execute(&ctx).await.is_err());
    }
}
