//! Data quality gate.
//!
//! A gate evaluates every configured [`QualityCheck`] against every target
//! table. Evaluation is exhaustive: a failing check, or a query that
//! cannot run, is recorded and the remaining pairs still execute. What the
//! gate does with failures is decided by its [`GatePolicy`].

use super::{Task, TaskContext};
use crate::catalog;
use crate::core::{TaskKind, TaskOutput};
use crate::errors::{TaskError, TemplateError};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::warehouse::{is_valid_identifier, Warehouse};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Comparison operator of a success condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `==`
    Eq,
    /// `!=`
    Ne,
}

impl Comparison {
    /// The operator's symbol.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

/// A success condition: `observed <op> threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Condition {
    /// The comparison.
    pub op: Comparison,
    /// The right-hand side.
    pub threshold: f64,
}

impl Condition {
    /// Creates a condition.
    #[must_use]
    pub fn new(op: Comparison, threshold: f64) -> Self {
        Self { op, threshold }
    }

    /// `observed > 0`.
    #[must_use]
    pub fn positive() -> Self {
        Self::new(Comparison::Gt, 0.0)
    }

    /// Tests an observed value.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn holds(&self, observed: f64) -> bool {
        match self.op {
            Comparison::Gt => observed > self.threshold,
            Comparison::Ge => observed >= self.threshold,
            Comparison::Lt => observed < self.threshold,
            Comparison::Le => observed <= self.threshold,
            Comparison::Eq => observed == self.threshold,
            Comparison::Ne => observed != self.threshold,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.symbol(), self.threshold)
    }
}

impl FromStr for Condition {
    type Err = TemplateError;

    /// Parses `> 0`, `>=10` or the legacy `{} > 0` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TemplateError::InvalidCondition(s.to_string());
        let rest = s.trim();
        let rest = rest.strip_prefix("{}").unwrap_or(rest).trim_start();

        // two-character operators first so `>=` is not read as `>`
        let operators = [
            (">=", Comparison::Ge),
            ("<=", Comparison::Le),
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            (">", Comparison::Gt),
            ("<", Comparison::Lt),
            ("=", Comparison::Eq),
        ];
        let (op, threshold) = operators
            .iter()
            .find_map(|(symbol, op)| rest.strip_prefix(symbol).map(|t| (*op, t)))
            .ok_or_else(invalid)?;
        let threshold: f64 = threshold.trim().parse().map_err(|_| invalid())?;
        if !threshold.is_finite() {
            return Err(invalid());
        }
        Ok(Self { op, threshold })
    }
}

impl TryFrom<String> for Condition {
    type Error = TemplateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Condition> for String {
    fn from(condition: Condition) -> Self {
        condition.to_string()
    }
}

/// A named scalar query and the condition its result must satisfy.
///
/// The query names its target with a `{table}` token (the legacy `{}` is
/// also accepted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCheck {
    /// Check name, used in reports.
    pub name: String,
    /// Scalar query template.
    pub query: String,
    /// Success condition.
    pub condition: Condition,
}

impl QualityCheck {
    /// Creates a check.
    #[must_use]
    pub fn new(name: impl Into<String>, query: impl Into<String>, condition: Condition) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            condition,
        }
    }

    /// `SELECT COUNT(*) FROM {table}` must be positive.
    #[must_use]
    pub fn row_count() -> Self {
        Self::new("row_count", catalog::ROW_COUNT_QUERY, Condition::positive())
    }

    /// Renders the query for one table.
    ///
    /// # Errors
    ///
    /// Returns a template error for an invalid table name or a query
    /// without a placeholder.
    pub fn render(&self, table: &str) -> Result<String, TemplateError> {
        if !is_valid_identifier(table) {
            return Err(TemplateError::InvalidIdentifier(table.to_string()));
        }
        if self.query.contains("{table}") {
            Ok(self.query.replace("{table}", table))
        } else if self.query.contains("{}") {
            Ok(self.query.replace("{}", table))
        } else {
            Err(TemplateError::MissingPlaceholder {
                placeholder: "{table}",
            })
        }
    }
}

/// What the gate does when a check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// Record and log failures; the node still succeeds.
    #[default]
    ReportOnly,
    /// Any failure fails the node.
    Enforce,
}

/// Outcome of one (table, check) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Target table.
    pub table: String,
    /// Check name.
    pub check: String,
    /// The scalar the query returned, if numeric.
    pub observed: Option<f64>,
    /// Whether the condition held.
    pub passed: bool,
    /// Why the pair could not be evaluated, if it could not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Every result of one gate evaluation, in (table, check) order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Individual results.
    pub results: Vec<CheckResult>,
}

impl QualityReport {
    /// Returns true if every pair passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// The failed pairs.
    #[must_use]
    pub fn failures(&self) -> Vec<&CheckResult> {
        self.results.iter().filter(|r| !r.passed).collect()
    }

    /// Number of evaluated pairs.
    #[must_use]
    pub fn total(&self) -> usize {
        self.results.len()
    }
}

async fn run_check(warehouse: &dyn Warehouse, table: &str, check: &QualityCheck) -> CheckResult {
    let mut result = CheckResult {
        table: table.to_string(),
        check: check.name.clone(),
        observed: None,
        passed: false,
        error: None,
    };

    let sql = match check.render(table) {
        Ok(sql) => sql,
        Err(e) => {
            result.error = Some(e.to_string());
            return result;
        }
    };

    match warehouse.query_scalar(&sql).await {
        Ok(value) => match value.as_f64() {
            Some(observed) => {
                result.observed = Some(observed);
                result.passed = check.condition.holds(observed);
            }
            None => result.error = Some(format!("query returned non-numeric value {value}")),
        },
        Err(e) => result.error = Some(e.to_string()),
    }
    result
}

/// Evaluates every (table, check) pair.
pub async fn evaluate(
    warehouse: &dyn Warehouse,
    tables: &[String],
    checks: &[QualityCheck],
) -> QualityReport {
    let mut results = Vec::with_capacity(tables.len() * checks.len());
    for table in tables {
        for check in checks {
            results.push(run_check(warehouse, table, check).await);
        }
    }
    QualityReport { results }
}

/// Runs the quality gate as a graph node.
#[derive(Clone)]
pub struct QualityGateTask {
    warehouse: Arc<dyn Warehouse>,
    tables: Vec<String>,
    checks: Vec<QualityCheck>,
    policy: GatePolicy,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for QualityGateTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualityGateTask")
            .field("tables", &self.tables)
            .field("checks", &self.checks)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl QualityGateTask {
    /// Creates a report-only gate.
    #[must_use]
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        tables: impl IntoIterator<Item = impl Into<String>>,
        checks: Vec<QualityCheck>,
    ) -> Self {
        Self {
            warehouse,
            tables: tables.into_iter().map(Into::into).collect(),
            checks,
            policy: GatePolicy::default(),
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the gate policy.
    #[must_use]
    pub fn with_policy(mut self, policy: GatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the sink receiving `quality.check_failed` events.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }
}

#[async_trait]
impl Task for QualityGateTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Guard
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let report = evaluate(self.warehouse.as_ref(), &self.tables, &self.checks).await;
        let failures = report.failures();

        for failure in &failures {
            warn!(
                node = %ctx.node(),
                table = %failure.table,
                check = %failure.check,
                observed = ?failure.observed,
                error = ?failure.error,
                "Data quality check failed"
            );
            self.sink.emit(
                &PipelineEvent::node("quality.check_failed", ctx.period(), ctx.node())
                    .with_data(serde_json::to_value(failure).unwrap_or_default()),
            );
        }
        info!(
            node = %ctx.node(),
            period = %ctx.period(),
            total = report.total(),
            failed = failures.len(),
            policy = ?self.policy,
            "Data quality checks evaluated"
        );

        if self.policy == GatePolicy::Enforce && !failures.is_empty() {
            return Err(TaskError::QualityGate {
                failed: failures.len(),
                total: report.total(),
            });
        }

        Ok(TaskOutput::ok_value("passed", serde_json::json!(report.passed()))
            .add_data("report", serde_json::to_value(&report).unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionPeriod;
    use crate::events::CollectingEventSink;
    use crate::storage::InMemoryObjectStore;
    use crate::warehouse::SqliteWarehouse;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_condition_parsing() {
        assert_eq!(
            "{} > 0".parse::<Condition>().unwrap(),
            Condition::new(Comparison::Gt, 0.0)
        );
        assert_eq!(
            ">=10".parse::<Condition>().unwrap(),
            Condition::new(Comparison::Ge, 10.0)
        );
        assert_eq!(
            " != 2.5 ".parse::<Condition>().unwrap(),
            Condition::new(Comparison::Ne, 2.5)
        );
        assert!("~ 3".parse::<Condition>().is_err());
        assert!("> many".parse::<Condition>().is_err());
        assert_eq!(Condition::positive().to_string(), "> 0");
    }

    #[test]
    fn test_condition_evaluation() {
        assert!(Condition::positive().holds(1.0));
        assert!(!Condition::positive().holds(0.0));
        assert!(Condition::new(Comparison::Le, 3.0).holds(3.0));
        assert!(Condition::new(Comparison::Eq, 0.0).holds(0.0));
    }

    #[test]
    fn test_check_serde_uses_textual_condition() {
        let check: QualityCheck = serde_json::from_value(serde_json::json!({
            "name": "row_count",
            "query": "SELECT COUNT(*) FROM {}",
            "condition": "{} > 0"
        }))
        .unwrap();
        assert_eq!(check.condition, Condition::positive());
        assert_eq!(
            serde_json::to_value(&check).unwrap()["condition"],
            serde_json::json!("> 0")
        );
    }

    #[test]
    fn test_render() {
        let check = QualityCheck::row_count();
        assert_eq!(
            check.render("immigration.us_entries").unwrap(),
            "SELECT COUNT(*) FROM immigration.us_entries"
        );
        assert_eq!(
            check.render("t; DROP TABLE t").unwrap_err(),
            TemplateError::InvalidIdentifier("t; DROP TABLE t".into())
        );
        let no_placeholder = QualityCheck::new("x", "SELECT 1", Condition::positive());
        assert!(matches!(
            no_placeholder.render("t").unwrap_err(),
            TemplateError::MissingPlaceholder { .. }
        ));
    }

    async fn warehouse() -> (tempfile::TempDir, Arc<SqliteWarehouse>) {
        let dir = tempfile::tempdir().unwrap();
        let wh = Arc::new(SqliteWarehouse::new(
            dir.path(),
            Arc::new(InMemoryObjectStore::new()),
        ));
        wh.execute(
            "CREATE TABLE full_t (a INTEGER); INSERT INTO full_t VALUES (1), (2);
             CREATE TABLE empty_t (a INTEGER);",
        )
        .await
        .unwrap();
        (dir, wh)
    }

    fn ctx() -> TaskContext {
        TaskContext::for_period(ExecutionPeriod::new(2016, 1).unwrap(), "run_data_quality_checks")
    }

    #[tokio::test]
    async fn test_evaluation_is_exhaustive() {
        let (_dir, wh) = warehouse().await;
        let tables = vec![
            "empty_t".to_string(),
            "missing_t".to_string(),
            "full_t".to_string(),
        ];
        let checks = vec![
            QualityCheck::row_count(),
            QualityCheck::new("at_most_one", "SELECT COUNT(*) FROM {table}", "<= 1".parse().unwrap()),
        ];

        let report = evaluate(wh.as_ref(), &tables, &checks).await;

        assert_eq!(report.total(), 6);
        let outcome: Vec<(&str, &str, bool)> = report
            .results
            .iter()
            .map(|r| (r.table.as_str(), r.check.as_str(), r.passed))
            .collect();
        assert_eq!(
            outcome,
            vec![
                ("empty_t", "row_count", false),
                ("empty_t", "at_most_one", true),
                ("missing_t", "row_count", false),
                ("missing_t", "at_most_one", false),
                ("full_t", "row_count", true),
                ("full_t", "at_most_one", false),
            ]
        );
        assert_eq!(report.results[0].observed, Some(0.0));
        assert!(report.results[2].error.is_some());
        assert!(!report.passed());
    }

    #[tokio::test]
    async fn test_report_only_gate_succeeds_and_emits_events() {
        let (_dir, wh) = warehouse().await;
        let sink = Arc::new(CollectingEventSink::new());
        let task = QualityGateTask::new(wh, ["empty_t", "full_t"], vec![QualityCheck::row_count()])
            .with_sink(sink.clone());

        let out = task.execute(&ctx()).await.unwrap();

        assert_eq!(out.get("passed"), Some(&serde_json::json!(false)));
        let events = sink.events_of_type("quality.check_failed");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.as_ref().unwrap()["table"], "empty_t");
    }

    #[tokio::test]
    async fn test_enforcing_gate_fails_the_node() {
        let (_dir, wh) = warehouse().await;
        let task = QualityGateTask::new(wh.clone(), ["empty_t", "full_t"], vec![QualityCheck::row_count()])
            .with_policy(GatePolicy::Enforce);

        let err = task.execute(&ctx()).await.unwrap_err();
        assert!(matches!(err, TaskError::QualityGate { failed: 1, total: 2 }));
        assert!(!err.is_retryable());

        let passing = QualityGateTask::new(wh, ["full_t"], vec![QualityCheck::row_count()])
            .with_policy(GatePolicy::Enforce);
        assert!(passing.execute(&ctx()).await.unwrap().is_success());
    }
}
