//! Execution periods and the naming conventions derived from them.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Three-letter month labels, indexed by `month - 1`.
const MONTH_LABELS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// The (year, month) scope a pipeline run processes.
///
/// Every period-scoped artifact, staged file name and output table name is
/// derived from this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExecutionPeriod {
    year: i32,
    month: u32,
}

impl ExecutionPeriod {
    /// Creates a period, returning `None` when the month is outside `1..=12`.
    #[must_use]
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    /// Derives the period from a calendar date.
    #[must_use]
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Derives the period from a scheduling timestamp.
    #[must_use]
    pub fn from_timestamp<Tz: TimeZone>(ts: &DateTime<Tz>) -> Self {
        Self::from_date(ts.date_naive())
    }

    /// Returns the year.
    #[must_use]
    pub fn year(&self) -> i32 {
        self.year
    }

    /// Returns the month (1-12).
    #[must_use]
    pub fn month(&self) -> u32 {
        self.month
    }

    /// Returns the first day of the period.
    #[must_use]
    pub fn first_day(&self) -> NaiveDate {
        // month is validated on construction
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// Returns the following period.
    #[must_use]
    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Returns the lowercase three-letter month label (`jan` .. `dec`).
    #[must_use]
    pub fn month_label(&self) -> &'static str {
        MONTH_LABELS[(self.month - 1) as usize]
    }

    /// Token used in staged artifact names, e.g. `jan16`.
    #[must_use]
    pub fn artifact_token(&self) -> String {
        format!("{}{:02}", self.month_label(), self.year.rem_euclid(100))
    }

    /// Token used in output table names, e.g. `jan2016`.
    #[must_use]
    pub fn table_token(&self) -> String {
        format!("{}{}", self.month_label(), self.year)
    }

    /// File name of the monthly immigration extract, e.g. `i94_jan16_sub.csv`.
    #[must_use]
    pub fn immigration_file_name(&self, extension: &str) -> String {
        format!("i94_{}_sub.{extension}", self.artifact_token())
    }
}

impl fmt::Display for ExecutionPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Error returned when a period string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid execution period '{0}', expected YYYY-MM or YYYY-MM-DD")]
pub struct ParsePeriodError(pub String);

impl FromStr for ExecutionPeriod {
    type Err = ParsePeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return Ok(Self::from_date(date));
        }

        let (year, month) = trimmed
            .split_once('-')
            .ok_or_else(|| ParsePeriodError(s.to_string()))?;
        let year: i32 = year.parse().map_err(|_| ParsePeriodError(s.to_string()))?;
        let month: u32 = month.parse().map_err(|_| ParsePeriodError(s.to_string()))?;
        Self::new(year, month).ok_or_else(|| ParsePeriodError(s.to_string()))
    }
}

impl TryFrom<String> for ExecutionPeriod {
    type Error = ParsePeriodError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExecutionPeriod> for String {
    fn from(period: ExecutionPeriod) -> Self {
        period.to_string()
    }
}
