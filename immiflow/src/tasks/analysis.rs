//! Period-versioned analysis tables.
//!
//! Each analysis writes `outputs.{table_token}_{name}`, e.g.
//! `outputs.jan2016_length_of_stay`. Tables for other periods are never
//! touched; re-running a period drops and rebuilds only its own table.

use super::{Task, TaskContext};
use crate::catalog;
use crate::core::{ExecutionPeriod, TaskKind, TaskOutput};
use crate::errors::{TaskError, TemplateError};
use crate::warehouse::{is_valid_identifier, SqlValue, Warehouse};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// A named `CREATE TABLE {table} AS SELECT ...` statement.
///
/// `{table}` receives the output table name; `:month` and `:year` are
/// bound to the execution period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisTemplate {
    /// Analysis name, the suffix of the output table.
    pub name: String,
    /// Statement template.
    pub sql: String,
}

impl AnalysisTemplate {
    /// Creates a template.
    #[must_use]
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }

    /// The four shipped analyses.
    #[must_use]
    pub fn builtin() -> Vec<Self> {
        catalog::ANALYSES
            .iter()
            .map(|(name, sql)| Self::new(*name, *sql))
            .collect()
    }

    /// Output table for a period, in the given schema.
    #[must_use]
    pub fn output_table(&self, schema: &str, period: ExecutionPeriod) -> String {
        format!("{schema}.{}_{}", period.table_token(), self.name)
    }

    /// Renders the statement for an output table.
    ///
    /// # Errors
    ///
    /// Returns a template error for an invalid table name or a statement
    /// without the `{table}` token.
    pub fn render(&self, table: &str) -> Result<String, TemplateError> {
        if !is_valid_identifier(table) {
            return Err(TemplateError::InvalidIdentifier(table.to_string()));
        }
        if !self.sql.contains("{table}") {
            return Err(TemplateError::MissingPlaceholder {
                placeholder: "{table}",
            });
        }
        let sql = self.sql.replace("{table}", table);
        Ok(sql.trim_end().trim_end_matches(';').to_string())
    }
}

/// Period parameters the statement references.
fn period_params(sql: &str, period: ExecutionPeriod) -> Vec<(&'static str, SqlValue)> {
    let mut params = Vec::with_capacity(2);
    if sql.contains(":month") {
        params.push(("month", SqlValue::from(period.month())));
    }
    if sql.contains(":year") {
        params.push(("year", SqlValue::from(period.year())));
    }
    params
}

/// Builds one analysis table for the execution period.
#[derive(Debug, Clone)]
pub struct AnalysisTask {
    warehouse: Arc<dyn Warehouse>,
    template: AnalysisTemplate,
    schema: String,
}

impl AnalysisTask {
    /// Creates a task writing into the `outputs` schema.
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>, template: AnalysisTemplate) -> Self {
        Self {
            warehouse,
            template,
            schema: catalog::OUTPUT_SCHEMA.to_string(),
        }
    }

    /// Sets the output schema.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// The analysis name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.template.name
    }
}

#[async_trait]
impl Task for AnalysisTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Analyze
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let period = ctx.period();
        let table = self.template.output_table(&self.schema, period);
        let sql = self.template.render(&table)?;

        self.warehouse
            .execute(&format!("DROP TABLE IF EXISTS {table};"))
            .await?;
        self.warehouse
            .execute_with(&sql, &period_params(&sql, period))
            .await?;

        let rows = self
            .warehouse
            .query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .await?;
        info!(
            node = %ctx.node(),
            period = %period,
            table = %table,
            rows = %rows,
            "Analysis table built"
        );
        Ok(TaskOutput::ok_value("table", serde_json::json!(table))
            .add_data("rows", serde_json::json!(rows.as_i64())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;
    use crate::warehouse::SqliteWarehouse;
    use pretty_assertions::assert_eq;

    fn period(year: i32, month: u32) -> ExecutionPeriod {
        ExecutionPeriod::new(year, month).unwrap()
    }

    #[test]
    fn test_output_table_names() {
        let template = AnalysisTemplate::new("length_of_stay", "CREATE TABLE {table} AS SELECT 1");
        assert_eq!(
            template.output_table("outputs", period(2024, 1)),
            "outputs.jan2024_length_of_stay"
        );
        assert_eq!(
            template.render("outputs.jan2024_length_of_stay").unwrap(),
            "CREATE TABLE outputs.jan2024_length_of_stay AS SELECT 1"
        );
    }

    #[test]
    fn test_render_rejects_bad_input() {
        let template = AnalysisTemplate::new("x", "SELECT 1");
        assert!(matches!(
            template.render("outputs.t").unwrap_err(),
            TemplateError::MissingPlaceholder { .. }
        ));
        let template = AnalysisTemplate::new("bad name", "CREATE TABLE {table} AS SELECT 1");
        let table = template.output_table("outputs", period(2016, 1));
        assert!(matches!(
            template.render(&table).unwrap_err(),
            TemplateError::InvalidIdentifier(_)
        ));
    }

    #[test]
    fn test_only_referenced_params_are_bound() {
        let names = |sql: &str| -> Vec<&'static str> {
            period_params(sql, period(2016, 1))
                .into_iter()
                .map(|(n, _)| n)
                .collect()
        };
        assert_eq!(names("WHERE m = :month AND y = :year"), vec!["month", "year"]);
        assert_eq!(names("WHERE y = :year"), vec!["year"]);
        assert!(names("SELECT 1").is_empty());
    }

    #[test]
    fn test_builtin_templates() {
        let names: Vec<String> = AnalysisTemplate::builtin()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "demographics_by_channel",
                "length_of_stay",
                "state_trip_reasons",
                "freqs_and_mean_temps"
            ]
        );
    }

    #[tokio::test]
    async fn test_periods_get_distinct_tables_and_reruns_replace() {
        let dir = tempfile::tempdir().unwrap();
        let wh = Arc::new(SqliteWarehouse::new(
            dir.path(),
            Arc::new(InMemoryObjectStore::new()),
        ));
        wh.create_schema("outputs").await.unwrap();
        wh.execute(
            "CREATE TABLE visits (y INTEGER, m INTEGER);
             INSERT INTO visits VALUES (2024, 1), (2024, 1), (2024, 2);",
        )
        .await
        .unwrap();
        let task = AnalysisTask::new(
            wh.clone(),
            AnalysisTemplate::new(
                "visits",
                "CREATE TABLE {table} AS SELECT COUNT(*) AS n FROM visits WHERE y = :year AND m = :month;",
            ),
        );
        let jan = TaskContext::for_period(period(2024, 1), "analyze_visits");
        let feb = TaskContext::for_period(period(2024, 2), "analyze_visits");

        let out = task.execute(&jan).await.unwrap();
        assert_eq!(out.get("table"), Some(&serde_json::json!("outputs.jan2024_visits")));
        task.execute(&feb).await.unwrap();
        wh.execute("INSERT INTO visits VALUES (2024, 1);").await.unwrap();
        task.execute(&jan).await.unwrap();

        let n = |table: &'static str| {
            let wh = wh.clone();
            async move {
                wh.query_scalar(&format!("SELECT n FROM {table}"))
                    .await
                    .unwrap()
            }
        };
        assert_eq!(n("outputs.jan2024_visits").await, SqlValue::Integer(3));
        assert_eq!(n("outputs.feb2024_visits").await, SqlValue::Integer(1));
        assert!(wh.table_exists("outputs.feb2024_visits").await.unwrap());
    }
}
