//! Warehouse loaders for fact and dimension tables.
//!
//! Both loaders resolve their credential on every invocation and hand the
//! token only to the bulk-load request.

use super::{Task, TaskContext};
use crate::core::{ExecutionPeriod, TaskKind, TaskOutput};
use crate::credentials::{AccessToken, CredentialRef, CredentialResolver};
use crate::errors::TaskError;
use crate::storage::{ObjectLocation, ObjectPrefix};
use crate::warehouse::{validate_identifier, BulkLoad, CsvFormat, Warehouse};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Where a fact load reads its artifact from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// The same artifact every period.
    Fixed(ObjectLocation),
    /// The period's immigration artifact (`i94_{label}{yy}_sub.csv`) under a prefix.
    MonthlyExtract(ObjectPrefix),
}

impl ArtifactSource {
    /// Resolves the artifact for a period.
    #[must_use]
    pub fn resolve(&self, period: ExecutionPeriod) -> ObjectLocation {
        match self {
            Self::Fixed(location) => location.clone(),
            Self::MonthlyExtract(prefix) => prefix.object(&period.immigration_file_name("csv")),
        }
    }
}

/// How a fact load treats rows already in the table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum FactWritePolicy {
    /// Append without touching existing rows.
    #[default]
    Append,
    /// Delete the execution period's rows, then append.
    ReplacePeriod {
        /// Column holding the year.
        year_column: String,
        /// Column holding the month.
        month_column: String,
    },
    /// Remove every row, then append.
    Truncate,
}

impl FactWritePolicy {
    /// Period replacement keyed on the staged arrival columns.
    #[must_use]
    pub fn replace_arrival_period() -> Self {
        Self::ReplacePeriod {
            year_column: "arrival_year".to_string(),
            month_column: "arrival_month".to_string(),
        }
    }
}

async fn resolve_token(
    resolver: &dyn CredentialResolver,
    credential: &CredentialRef,
) -> Result<AccessToken, TaskError> {
    let token = resolver.resolve(credential).await?;
    debug!(credential = %credential, "Credential resolved");
    Ok(token)
}

/// Bulk-loads one staged artifact into a fact table.
#[derive(Debug, Clone)]
pub struct FactLoadTask {
    warehouse: Arc<dyn Warehouse>,
    resolver: Arc<dyn CredentialResolver>,
    credential: CredentialRef,
    table: String,
    source: ArtifactSource,
    format: CsvFormat,
    policy: FactWritePolicy,
}

impl FactLoadTask {
    /// Creates an append-only loader reading comma-delimited CSV with a header.
    #[must_use]
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        resolver: Arc<dyn CredentialResolver>,
        credential: CredentialRef,
        table: impl Into<String>,
        source: ArtifactSource,
    ) -> Self {
        Self {
            warehouse,
            resolver,
            credential,
            table: table.into(),
            source,
            format: CsvFormat::default(),
            policy: FactWritePolicy::default(),
        }
    }

    /// Sets the write policy.
    #[must_use]
    pub fn with_policy(mut self, policy: FactWritePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the source format.
    #[must_use]
    pub fn with_format(mut self, format: CsvFormat) -> Self {
        self.format = format;
        self
    }

    /// Applies the write policy, returning the number of rows removed.
    async fn prepare_table(&self, period: ExecutionPeriod) -> Result<usize, TaskError> {
        match &self.policy {
            FactWritePolicy::Append => Ok(0),
            FactWritePolicy::Truncate => {
                self.warehouse.truncate(&self.table).await?;
                Ok(0)
            }
            FactWritePolicy::ReplacePeriod {
                year_column,
                month_column,
            } => {
                let table = validate_identifier(&self.table)?;
                let year_column = validate_identifier(year_column)?;
                let month_column = validate_identifier(month_column)?;
                let sql = format!(
                    "DELETE FROM {table} WHERE {year_column} = :year AND {month_column} = :month"
                );
                let removed = self
                    .warehouse
                    .execute_with(
                        &sql,
                        &[("year", period.year().into()), ("month", period.month().into())],
                    )
                    .await?;
                Ok(removed)
            }
        }
    }
}

#[async_trait]
impl Task for FactLoadTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Load
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let source = self.source.resolve(ctx.period());
        let token = resolve_token(self.resolver.as_ref(), &self.credential).await?;

        let removed = self.prepare_table(ctx.period()).await?;
        let request = BulkLoad::new(self.table.clone(), source.clone(), token).with_format(self.format);
        let loaded = self.warehouse.bulk_load(&request).await?;

        info!(
            node = %ctx.node(),
            period = %ctx.period(),
            table = %self.table,
            key = %source,
            removed,
            loaded,
            "Fact table loaded"
        );
        Ok(TaskOutput::ok_value("table", serde_json::json!(self.table))
            .add_data("rows_loaded", serde_json::json!(loaded))
            .add_data("rows_replaced", serde_json::json!(removed)))
    }
}

/// Loads `{prefix}/{dimension}.csv` into `{schema}.{dimension}` for each dimension.
///
/// Dimensions load one after another without a spanning transaction.
#[derive(Debug, Clone)]
pub struct DimensionLoadTask {
    warehouse: Arc<dyn Warehouse>,
    resolver: Arc<dyn CredentialResolver>,
    credential: CredentialRef,
    source: ObjectPrefix,
    schema: String,
    dimensions: Vec<String>,
    truncate: bool,
}

impl DimensionLoadTask {
    /// Creates a truncate-and-replace loader.
    #[must_use]
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        resolver: Arc<dyn CredentialResolver>,
        credential: CredentialRef,
        source: ObjectPrefix,
        schema: impl Into<String>,
        dimensions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            warehouse,
            resolver,
            credential,
            source,
            schema: schema.into(),
            dimensions: dimensions.into_iter().map(Into::into).collect(),
            truncate: true,
        }
    }

    /// Enables or disables truncation before each load.
    #[must_use]
    pub fn with_truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }
}

#[async_trait]
impl Task for DimensionLoadTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Load
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let token = resolve_token(self.resolver.as_ref(), &self.credential).await?;
        let mut loaded = BTreeMap::new();

        for dimension in &self.dimensions {
            let table = format!("{}.{dimension}", self.schema);
            validate_identifier(&table)?;
            if self.truncate {
                self.warehouse.truncate(&table).await?;
            }
            let request = BulkLoad::new(
                table.clone(),
                self.source.object(&format!("{dimension}.csv")),
                token.clone(),
            )
            .with_format(CsvFormat::semicolon_with_header());
            let rows = self.warehouse.bulk_load(&request).await?;
            debug!(table = %table, rows, "Dimension loaded");
            loaded.insert(dimension.clone(), rows);
        }

        info!(node = %ctx.node(), dimensions = loaded.len(), "Dimension tables loaded");
        Ok(TaskOutput::ok_value("rows_loaded", serde_json::json!(loaded)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::credentials::StaticCredentialResolver;
    use crate::reference::ReferenceTables;
    use crate::storage::{InMemoryObjectStore, ObjectStore};
    use crate::tasks::provision::ProvisionTask;
    use crate::tasks::reference::ReferenceStagingTask;
    use crate::warehouse::{SqlValue, SqliteWarehouse};
    use pretty_assertions::assert_eq;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<InMemoryObjectStore>,
        warehouse: Arc<SqliteWarehouse>,
        resolver: Arc<StaticCredentialResolver>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let warehouse = Arc::new(SqliteWarehouse::new(dir.path(), store.clone()));
        ProvisionTask::catalog(warehouse.clone())
            .provision()
            .await
            .unwrap();
        Fixture {
            _dir: dir,
            store,
            warehouse,
            resolver: Arc::new(StaticCredentialResolver::new().with_token("loader", "secret")),
        }
    }

    fn ctx(year: i32, month: u32, node: &str) -> TaskContext {
        TaskContext::for_period(ExecutionPeriod::new(year, month).unwrap(), node)
    }

    async fn count(wh: &SqliteWarehouse, sql: &str) -> i64 {
        wh.query_scalar(sql).await.unwrap().as_i64().unwrap()
    }

    fn staged_row(admnum: i64, month: u32) -> String {
        format!("{admnum},30.0,M,2,101,111,NY,1,5,{month},2016,-9999,-9999,-9999,-9999")
    }

    async fn put_staged(store: &InMemoryObjectStore, month: u32, rows: &[i64]) {
        let period = ExecutionPeriod::new(2016, month).unwrap();
        let mut body = crate::tasks::immigration::STAGED_COLUMNS.join(",");
        for admnum in rows {
            body.push('\n');
            body.push_str(&staged_row(*admnum, month));
        }
        body.push('\n');
        store
            .put(
                &ObjectPrefix::new("bucket", "staging/immigration-data")
                    .object(&period.immigration_file_name("csv")),
                body.into_bytes(),
            )
            .await
            .unwrap();
    }

    fn fact_task(fx: &Fixture) -> FactLoadTask {
        FactLoadTask::new(
            fx.warehouse.clone(),
            fx.resolver.clone(),
            CredentialRef::new("loader"),
            catalog::US_ENTRIES,
            ArtifactSource::MonthlyExtract(ObjectPrefix::new("bucket", "staging/immigration-data")),
        )
        .with_policy(FactWritePolicy::replace_arrival_period())
    }

    #[tokio::test]
    async fn test_replace_period_is_idempotent_and_scoped() {
        let fx = fixture().await;
        put_staged(&fx.store, 1, &[1, 2, 3]).await;
        put_staged(&fx.store, 2, &[10, 11]).await;
        let task = fact_task(&fx);

        task.execute(&ctx(2016, 1, "copy")).await.unwrap();
        task.execute(&ctx(2016, 2, "copy")).await.unwrap();
        let rerun = task.execute(&ctx(2016, 1, "copy")).await.unwrap();

        assert_eq!(rerun.get("rows_replaced"), Some(&serde_json::json!(3)));
        assert_eq!(rerun.get("rows_loaded"), Some(&serde_json::json!(3)));
        assert_eq!(count(&fx.warehouse, "SELECT COUNT(*) FROM immigration.us_entries").await, 5);
        assert_eq!(
            count(
                &fx.warehouse,
                "SELECT COUNT(*) FROM immigration.us_entries WHERE arrival_month = 2"
            )
            .await,
            2
        );
    }

    #[tokio::test]
    async fn test_admission_number_may_recur_across_periods() {
        let fx = fixture().await;
        put_staged(&fx.store, 1, &[777]).await;
        put_staged(&fx.store, 2, &[777]).await;
        let task = fact_task(&fx);

        task.execute(&ctx(2016, 1, "copy")).await.unwrap();
        let february = task.execute(&ctx(2016, 2, "copy")).await.unwrap();
        let rerun = task.execute(&ctx(2016, 1, "copy")).await.unwrap();

        assert_eq!(february.get("rows_loaded"), Some(&serde_json::json!(1)));
        assert_eq!(rerun.get("rows_replaced"), Some(&serde_json::json!(1)));
        assert_eq!(
            count(
                &fx.warehouse,
                "SELECT COUNT(*) FROM immigration.us_entries WHERE admnum = 777"
            )
            .await,
            2
        );
    }

    #[tokio::test]
    async fn test_staged_nulls_and_codes_load_as_expected() {
        let fx = fixture().await;
        put_staged(&fx.store, 1, &[42]).await;
        fact_task(&fx).execute(&ctx(2016, 1, "copy")).await.unwrap();

        let rows = fx
            .warehouse
            .query("SELECT admnum, i94bir, i94res, length_of_stay FROM immigration.us_entries")
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![vec![
                SqlValue::Integer(42),
                SqlValue::Real(30.0),
                SqlValue::Text("111".into()),
                SqlValue::Integer(-9999),
            ]]
        );
    }

    #[tokio::test]
    async fn test_truncate_policy_replaces_everything() {
        let fx = fixture().await;
        let source = ObjectLocation::new("bucket", "staging/temperatures-data/cleanTemperatureData.csv");
        fx.store
            .put(
                &source,
                b"dt,AverageTemperature,AverageTemperatureUncertainty,City,Country,Latitude,Longitude\n\
                  2013-01-01,5.0,0.1,Paris,France,48.85N,2.35E\n\
                  2013-02-01,,,Paris,France,48.85N,2.35E\n"
                    .to_vec(),
            )
            .await
            .unwrap();
        let task = FactLoadTask::new(
            fx.warehouse.clone(),
            fx.resolver.clone(),
            CredentialRef::new("loader"),
            catalog::TEMPERATURE_FACT,
            ArtifactSource::Fixed(source),
        )
        .with_policy(FactWritePolicy::Truncate);

        task.execute(&ctx(2016, 1, "copy_temperatures_data")).await.unwrap();
        task.execute(&ctx(2016, 2, "copy_temperatures_data")).await.unwrap();

        assert_eq!(
            count(&fx.warehouse, "SELECT COUNT(*) FROM temperature.full_temperature_data").await,
            2
        );
        assert_eq!(
            count(
                &fx.warehouse,
                "SELECT COUNT(*) FROM temperature.full_temperature_data WHERE averagetemperature IS NULL"
            )
            .await,
            1
        );
    }

    #[tokio::test]
    async fn test_unresolved_credential_fails_before_touching_the_table() {
        let fx = fixture().await;
        put_staged(&fx.store, 1, &[1]).await;
        let task = FactLoadTask::new(
            fx.warehouse.clone(),
            fx.resolver.clone(),
            CredentialRef::new("nobody"),
            catalog::US_ENTRIES,
            ArtifactSource::MonthlyExtract(ObjectPrefix::new("bucket", "staging/immigration-data")),
        );

        let err = task.execute(&ctx(2016, 1, "copy")).await.unwrap_err();
        assert!(matches!(err, TaskError::Credential(_)));
        assert_eq!(count(&fx.warehouse, "SELECT COUNT(*) FROM immigration.us_entries").await, 0);
    }

    #[tokio::test]
    async fn test_dimension_truncate_twice_keeps_one_copy() {
        let fx = fixture().await;
        let tables = ReferenceTables::embedded().unwrap();
        let staging = ObjectPrefix::new("bucket", "staging/immigration-dimensions");
        ReferenceStagingTask::new(fx.store.clone(), staging.clone(), tables.clone())
            .execute(&ctx(2016, 1, "stage"))
            .await
            .unwrap();
        let task = DimensionLoadTask::new(
            fx.warehouse.clone(),
            fx.resolver.clone(),
            CredentialRef::new("loader"),
            staging,
            catalog::DIMENSION_SCHEMA,
            catalog::DIMENSION_TABLES,
        );

        task.execute(&ctx(2016, 1, "copy")).await.unwrap();
        let out = task.execute(&ctx(2016, 1, "copy")).await.unwrap();

        for table in tables.tables() {
            let loaded = count(
                &fx.warehouse,
                &format!("SELECT COUNT(*) FROM immigration.{}", table.table),
            )
            .await;
            assert_eq!(loaded, i64::try_from(table.len()).unwrap(), "{}", table.table);
        }
        assert_eq!(
            out.get("rows_loaded").unwrap()["entry_channel_codes"],
            serde_json::json!(4)
        );
    }

    #[tokio::test]
    async fn test_dimension_without_truncate_appends() {
        let fx = fixture().await;
        let staging = ObjectPrefix::new("bucket", "staging/immigration-dimensions");
        fx.store
            .put(&staging.object("state_codes.csv"), b"code;name\nNY;NEW YORK\n".to_vec())
            .await
            .unwrap();
        let task = DimensionLoadTask::new(
            fx.warehouse.clone(),
            fx.resolver.clone(),
            CredentialRef::new("loader"),
            staging,
            "immigration",
            ["state_codes"],
        )
        .with_truncate(false);

        task.execute(&ctx(2016, 1, "copy")).await.unwrap();
        task.execute(&ctx(2016, 1, "copy")).await.unwrap();

        assert_eq!(count(&fx.warehouse, "SELECT COUNT(*) FROM immigration.state_codes").await, 2);
    }

    #[test]
    fn test_write_policy_serde() {
        let policy: FactWritePolicy = serde_json::from_value(serde_json::json!({
            "mode": "replace_period",
            "year_column": "arrival_year",
            "month_column": "arrival_month"
        }))
        .unwrap();
        assert_eq!(policy, FactWritePolicy::replace_arrival_period());
        assert_eq!(
            serde_json::to_value(FactWritePolicy::Truncate).unwrap(),
            serde_json::json!({"mode": "truncate"})
        );
    }
}
