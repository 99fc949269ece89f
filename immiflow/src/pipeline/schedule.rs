//! Monthly schedule and the sequential period scheduler.

use super::{ExecutionOptions, GraphRunReport, TaskGraph};
use crate::core::ExecutionPeriod;
use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// A monthly cadence between a start date and an optional end date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// First scheduled date.
    pub start: NaiveDate,
    /// Last date a run may be scheduled on (inclusive).
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            start: NaiveDate::from_ymd_opt(2015, 12, 15).unwrap_or_default(),
            end: NaiveDate::from_ymd_opt(2016, 12, 15),
        }
    }
}

impl Schedule {
    /// Creates a schedule.
    #[must_use]
    pub fn new(start: NaiveDate, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    /// Returns the scheduled dates on or before `until` (and the end date).
    ///
    /// Dates fall on the start date's day of month, clamped to shorter months.
    #[must_use]
    pub fn dates_until(&self, until: NaiveDate) -> Vec<NaiveDate> {
        let limit = self.end.map_or(until, |end| end.min(until));
        (0u32..)
            .map_while(|k| self.start.checked_add_months(Months::new(k)))
            .take_while(|date| *date <= limit)
            .collect()
    }

    /// Returns the execution periods of the scheduled dates on or before `until`.
    #[must_use]
    pub fn periods_until(&self, until: NaiveDate) -> Vec<ExecutionPeriod> {
        self.dates_until(until)
            .into_iter()
            .map(ExecutionPeriod::from_date)
            .collect()
    }
}

/// Returns every period from `from` to `to`, inclusive.
#[must_use]
pub fn period_range(from: ExecutionPeriod, to: ExecutionPeriod) -> Vec<ExecutionPeriod> {
    let mut periods = Vec::new();
    let mut current = from;
    while current <= to {
        periods.push(current);
        current = current.next();
    }
    periods
}

/// Outcome of running the graph over several periods.
#[derive(Debug, Default)]
pub struct BackfillReport {
    /// Completed graph runs, in period order.
    pub runs: Vec<GraphRunReport>,
    /// Periods whose run could not complete at all, with the reason.
    pub aborted: Vec<(ExecutionPeriod, String)>,
}

impl BackfillReport {
    /// Returns true if every period ran and succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.aborted.is_empty() && self.runs.iter().all(|run| run.success)
    }

    /// Returns the periods that did not succeed.
    #[must_use]
    pub fn failed_periods(&self) -> Vec<ExecutionPeriod> {
        let mut failed: Vec<ExecutionPeriod> = self
            .runs
            .iter()
            .filter(|run| !run.success)
            .map(|run| run.period)
            .chain(self.aborted.iter().map(|(period, _)| *period))
            .collect();
        failed.sort();
        failed
    }
}

/// Triggers a graph once per period, one run at a time.
#[derive(Debug, Clone)]
pub struct Scheduler {
    graph: Arc<TaskGraph>,
    options: ExecutionOptions,
}

impl Scheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(graph: Arc<TaskGraph>, options: ExecutionOptions) -> Self {
        Self { graph, options }
    }

    /// Returns the graph.
    #[must_use]
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Runs the graph for each period in order.
    ///
    /// A failed period does not stop later ones.
    pub async fn run(&self, periods: &[ExecutionPeriod]) -> BackfillReport {
        let mut report = BackfillReport::default();

        for period in periods {
            info!(period = %period, "Scheduling period");
            match self.graph.execute(*period, &self.options).await {
                Ok(run) => report.runs.push(run),
                Err(e) => {
                    error!(period = %period, error = %e, "Period run aborted");
                    report.aborted.push((*period, e.to_string()));
                }
            }
        }

        report
    }
}
