//! Monthly immigration extract staging.
//!
//! The extract is decoded into [`RawEntry`] rows, cleaned by
//! [`clean_batch`] and published as one CSV artifact in the canonical
//! column order. Cleaning is all-or-nothing: any invariant violation aborts
//! the stage before anything is written.

use super::{Task, TaskContext};
use crate::core::{ExecutionPeriod, TaskKind, TaskOutput};
use crate::errors::{StagingError, TaskError};
use crate::storage::{ObjectLocation, ObjectPrefix, ObjectStore};
use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Value stored in departure parts and length of stay when there is no departure.
pub const MISSING_DEPARTURE: i64 = -9999;

/// Canonical staged column order.
pub const STAGED_COLUMNS: [&str; 15] = [
    "admnum",
    "i94bir",
    "gender",
    "i94visa",
    "i94cit",
    "i94res",
    "i94addr",
    "i94mode",
    "arrival_day",
    "arrival_month",
    "arrival_year",
    "departure_day",
    "departure_month",
    "departure_year",
    "length_of_stay",
];

const VALID_GENDERS: [&str; 4] = ["M", "F", "X", "U"];

fn sas_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1960, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// One row of the raw extract. Every cell is kept as text until cleaning;
/// columns not listed here are ignored.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntry {
    #[serde(default)]
    pub admnum: Option<String>,
    #[serde(default)]
    pub i94yr: Option<String>,
    #[serde(default)]
    pub i94mon: Option<String>,
    #[serde(default)]
    pub i94cit: Option<String>,
    #[serde(default)]
    pub i94res: Option<String>,
    #[serde(default)]
    pub i94visa: Option<String>,
    #[serde(default)]
    pub i94mode: Option<String>,
    #[serde(default)]
    pub i94addr: Option<String>,
    #[serde(default)]
    pub i94bir: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub arrdate: Option<String>,
    #[serde(default)]
    pub depdate: Option<String>,
}

/// A cleaned entry in canonical column order.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedEntry {
    pub admnum: i64,
    pub i94bir: Option<f64>,
    pub gender: Option<String>,
    pub i94visa: Option<String>,
    pub i94cit: Option<String>,
    pub i94res: Option<String>,
    pub i94addr: Option<String>,
    pub i94mode: Option<String>,
    pub arrival_day: i64,
    pub arrival_month: i64,
    pub arrival_year: i64,
    pub departure_day: i64,
    pub departure_month: i64,
    pub departure_year: i64,
    pub length_of_stay: i64,
}

/// Counters describing one cleaning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingReport {
    /// Rows decoded from the extract.
    pub rows_read: usize,
    /// Rows dropped for an admission number of zero.
    pub zero_keys_dropped: usize,
    /// Rows dropped as repeated admission numbers.
    pub duplicates_dropped: usize,
    /// Negative or NaN ages replaced by NULL.
    pub ages_nulled: usize,
    /// Genders outside the known set replaced by NULL.
    pub genders_nulled: usize,
    /// Rows in the staged artifact.
    pub rows_written: usize,
}

/// The result of [`clean_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct StagedBatch {
    /// The single period every entry belongs to.
    pub period: ExecutionPeriod,
    /// Cleaned entries, in input order.
    pub entries: Vec<StagedEntry>,
    /// Cleaning counters.
    pub report: StagingReport,
}

/// Returns the trimmed cell, or `None` for empty and NaN-like cells.
fn present(cell: Option<&String>) -> Option<&str> {
    let value = cell?.trim();
    let missing = value.is_empty()
        || ["nan", "none", "null"]
            .iter()
            .any(|m| value.eq_ignore_ascii_case(m));
    (!missing).then_some(value)
}

/// Parses an integral number that may be written as a float (`2016.0`).
fn parse_integral(value: &str) -> Option<i64> {
    if let Ok(i) = value.parse::<i64>() {
        return Some(i);
    }
    let f: f64 = value.parse().ok()?;
    if !f.is_finite() || f.fract() != 0.0 || f.abs() >= 9.0e15 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let integral = f as i64;
    Some(integral)
}

fn required_integral(
    cell: Option<&String>,
    row: usize,
    column: &'static str,
) -> Result<i64, StagingError> {
    let value = present(cell).ok_or(StagingError::MissingValue { row, column })?;
    parse_integral(value).ok_or_else(|| StagingError::InvalidValue {
        row,
        column,
        value: value.to_string(),
    })
}

/// Canonical text form of a categorical code: integral numbers lose their
/// fractional part (`101.0` becomes `101`), anything else is kept trimmed.
#[must_use]
pub fn normalize_code(cell: Option<&String>) -> Option<String> {
    let value = present(cell)?;
    Some(parse_integral(value).map_or_else(|| value.to_string(), |i| i.to_string()))
}

/// Decodes a SAS date (days since 1960-01-01), flooring fractional days.
///
/// Arrival and departure are floored independently, so length of stay counts
/// calendar days between them rather than rounding the fractional difference.
/// Real extracts carry integral day counts, where both readings agree.
fn sas_date(
    cell: Option<&String>,
    row: usize,
    column: &'static str,
) -> Result<Option<NaiveDate>, StagingError> {
    let Some(value) = present(cell) else {
        return Ok(None);
    };
    let invalid = || StagingError::InvalidValue {
        row,
        column,
        value: value.to_string(),
    };
    let days: f64 = value.parse().map_err(|_| invalid())?;
    if !days.is_finite() || days.abs() > 1.0e6 {
        return Err(invalid());
    }
    #[allow(clippy::cast_possible_truncation)]
    let days = days.floor() as i64;
    sas_epoch()
        .checked_add_signed(Duration::days(days))
        .map(Some)
        .ok_or_else(invalid)
}

/// Decodes a raw extract.
///
/// # Errors
///
/// Returns [`StagingError::Csv`] if the bytes are not valid CSV.
pub fn read_raw_entries(bytes: &[u8]) -> Result<Vec<RawEntry>, StagingError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    reader
        .deserialize()
        .collect::<Result<Vec<RawEntry>, _>>()
        .map_err(StagingError::from)
}

/// Encodes cleaned entries as `,`-delimited CSV with a header row.
///
/// # Errors
///
/// Returns a CSV or encoding error.
pub fn write_staged(entries: &[StagedEntry]) -> Result<Vec<u8>, StagingError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(STAGED_COLUMNS)?;
    for entry in entries {
        writer.serialize(entry)?;
    }
    writer
        .into_inner()
        .map_err(|e| StagingError::Encode(e.to_string()))
}

/// Cleans one period's extract.
///
/// Rows with admission number zero are dropped, then duplicate admission
/// numbers (first occurrence kept). The remaining rows must share a single
/// (year, month) equal to `expected`, and every arrival must fall inside
/// it. Out-of-domain ages and genders are nulled, not dropped.
///
/// # Errors
///
/// Returns the first invariant violation found.
pub fn clean_batch(
    raw: &[RawEntry],
    expected: ExecutionPeriod,
) -> Result<StagedBatch, StagingError> {
    let mut report = StagingReport {
        rows_read: raw.len(),
        ..StagingReport::default()
    };

    // year and month must decode on every row before any filtering
    let mut declared = Vec::with_capacity(raw.len());
    for (row, entry) in raw.iter().enumerate() {
        let year = required_integral(entry.i94yr.as_ref(), row, "i94yr")?;
        let month = required_integral(entry.i94mon.as_ref(), row, "i94mon")?;
        declared.push((year, month));
    }

    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(raw.len());
    for (row, entry) in raw.iter().enumerate() {
        let admnum = required_integral(entry.admnum.as_ref(), row, "admnum")?;
        if admnum == 0 {
            report.zero_keys_dropped += 1;
            continue;
        }
        if !seen.insert(admnum) {
            report.duplicates_dropped += 1;
            continue;
        }
        kept.push((row, admnum));
    }

    if kept.is_empty() {
        return Err(StagingError::EmptyBatch);
    }

    let years: BTreeSet<i64> = kept.iter().map(|(row, _)| declared[*row].0).collect();
    let months: BTreeSet<i64> = kept.iter().map(|(row, _)| declared[*row].1).collect();
    if years.len() != 1 || months.len() != 1 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        return Err(StagingError::MixedPeriods {
            years: years.into_iter().map(|y| y as i32).collect(),
            months: months.into_iter().map(|m| m as u32).collect(),
        });
    }

    let (first_row, _) = kept[0];
    let (year, month) = declared[first_row];
    let period = i32::try_from(year)
        .ok()
        .zip(u32::try_from(month).ok())
        .and_then(|(y, m)| ExecutionPeriod::new(y, m))
        .ok_or_else(|| StagingError::InvalidValue {
            row: first_row,
            column: "i94mon",
            value: format!("{year}-{month}"),
        })?;
    if period != expected {
        return Err(StagingError::PeriodMismatch {
            expected,
            found: period,
        });
    }

    let mut entries = Vec::with_capacity(kept.len());
    for (row, admnum) in kept {
        let entry = &raw[row];

        let age = match present(entry.i94bir.as_ref()) {
            None => None,
            Some(value) => {
                let age: f64 = value.parse().map_err(|_| StagingError::InvalidValue {
                    row,
                    column: "i94bir",
                    value: value.to_string(),
                })?;
                if age.is_nan() || age < 0.0 {
                    report.ages_nulled += 1;
                    None
                } else {
                    Some(age)
                }
            }
        };

        let gender = match present(entry.gender.as_ref()) {
            None => None,
            Some(value) if VALID_GENDERS.contains(&value) => Some(value.to_string()),
            Some(_) => {
                report.genders_nulled += 1;
                None
            }
        };

        let arrival = sas_date(entry.arrdate.as_ref(), row, "arrdate")?.ok_or(
            StagingError::MissingValue {
                row,
                column: "arrdate",
            },
        )?;
        if ExecutionPeriod::from_date(arrival) != period {
            return Err(StagingError::ArrivalOutsidePeriod {
                admnum,
                arrival,
                period,
            });
        }

        let departure = sas_date(entry.depdate.as_ref(), row, "depdate")?;
        let (departure_day, departure_month, departure_year, length_of_stay) = match departure {
            Some(date) => (
                i64::from(date.day()),
                i64::from(date.month()),
                i64::from(date.year()),
                (date - arrival).num_days(),
            ),
            None => (
                MISSING_DEPARTURE,
                MISSING_DEPARTURE,
                MISSING_DEPARTURE,
                MISSING_DEPARTURE,
            ),
        };

        entries.push(StagedEntry {
            admnum,
            i94bir: age,
            gender,
            i94visa: normalize_code(entry.i94visa.as_ref()),
            i94cit: normalize_code(entry.i94cit.as_ref()),
            i94res: normalize_code(entry.i94res.as_ref()),
            i94addr: present(entry.i94addr.as_ref()).map(str::to_string),
            i94mode: normalize_code(entry.i94mode.as_ref()),
            arrival_day: i64::from(arrival.day()),
            arrival_month: i64::from(arrival.month()),
            arrival_year: i64::from(arrival.year()),
            departure_day,
            departure_month,
            departure_year,
            length_of_stay,
        });
    }

    report.rows_written = entries.len();
    Ok(StagedBatch {
        period,
        entries,
        report,
    })
}

/// Stages `{raw}/i94_{label}{yy}_sub.csv` into `{staging}/` under the same name.
#[derive(Debug, Clone)]
pub struct ImmigrationStagingTask {
    store: Arc<dyn ObjectStore>,
    source: ObjectPrefix,
    target: ObjectPrefix,
}

impl ImmigrationStagingTask {
    /// Creates a stager reading from `source` and publishing to `target`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, source: ObjectPrefix, target: ObjectPrefix) -> Self {
        Self {
            store,
            source,
            target,
        }
    }

    /// Raw extract location for a period.
    #[must_use]
    pub fn source_for(&self, period: ExecutionPeriod) -> ObjectLocation {
        self.source.object(&period.immigration_file_name("csv"))
    }

    /// Staged artifact location for a period.
    #[must_use]
    pub fn artifact_for(&self, period: ExecutionPeriod) -> ObjectLocation {
        self.target.object(&period.immigration_file_name("csv"))
    }
}

#[async_trait]
impl Task for ImmigrationStagingTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Stage
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let period = ctx.period();
        let source = self.source_for(period);
        debug!(key = %source, period = %period, "Loading immigration extract");

        let bytes = self.store.get(&source).await?;
        let raw = read_raw_entries(&bytes)?;
        let batch = clean_batch(&raw, period)?;
        let encoded = write_staged(&batch.entries)?;

        let target = self.artifact_for(period);
        self.store.put(&target, encoded).await?;

        let report = batch.report;
        info!(
            node = %ctx.node(),
            period = %period,
            key = %target,
            rows_read = report.rows_read,
            zero_keys_dropped = report.zero_keys_dropped,
            duplicates_dropped = report.duplicates_dropped,
            ages_nulled = report.ages_nulled,
            genders_nulled = report.genders_nulled,
            rows_written = report.rows_written,
            "Immigration extract staged"
        );

        Ok(
            TaskOutput::ok_value("artifact", serde_json::json!(target.to_string()))
                .add_data("report", serde_json::to_value(report).unwrap_or_default()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;
    use pretty_assertions::assert_eq;

    const HEADER: &str = "cicid,i94yr,i94mon,i94cit,i94res,i94port,arrdate,i94mode,i94addr,depdate,i94bir,i94visa,gender,admnum";

    // 2016-01-01 is day 20454 after the SAS epoch.
    const JAN_1_2016: i64 = 20454;

    fn period() -> ExecutionPeriod {
        ExecutionPeriod::new(2016, 1).unwrap()
    }

    fn row(admnum: &str, arr: i64, dep: &str, age: &str, gender: &str) -> String {
        format!("1.0,2016.0,1.0,101.0,111.0,NYC,{arr}.0,1.0,NY,{dep},{age},2.0,{gender},{admnum}")
    }

    fn extract(rows: &[String]) -> Vec<RawEntry> {
        let text = format!("{HEADER}\n{}\n", rows.join("\n"));
        read_raw_entries(text.as_bytes()).unwrap()
    }

    #[test]
    fn test_sas_epoch_offset() {
        let date = sas_date(Some(&JAN_1_2016.to_string()), 0, "arrdate")
            .unwrap()
            .unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2016, 1, 1).unwrap());
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code(Some(&"101.0".to_string())), Some("101".to_string()));
        assert_eq!(normalize_code(Some(&" NY ".to_string())), Some("NY".to_string()));
        assert_eq!(normalize_code(Some(&"nan".to_string())), None);
        assert_eq!(normalize_code(None), None);
    }

    #[test]
    fn test_duplicate_keys_keep_first_occurrence() {
        let raw = extract(&[
            row("100", JAN_1_2016, "", "30", "M"),
            row("100", JAN_1_2016 + 3, "", "40", "F"),
            row("0", JAN_1_2016, "", "50", "F"),
            row("200.0", JAN_1_2016, "", "20", "F"),
        ]);

        let batch = clean_batch(&raw, period()).unwrap();

        assert_eq!(batch.entries.len(), 2);
        assert_eq!(batch.entries[0].admnum, 100);
        assert_eq!(batch.entries[0].i94bir, Some(30.0));
        assert_eq!(batch.entries[1].admnum, 200);
        assert_eq!(batch.report.duplicates_dropped, 1);
        assert_eq!(batch.report.zero_keys_dropped, 1);
        assert_eq!(batch.report.rows_read, 4);
        assert_eq!(batch.report.rows_written, 2);
    }

    #[test]
    fn test_age_and_gender_are_nulled_not_dropped() {
        let raw = extract(&[
            row("1", JAN_1_2016, "", "-3", "M"),
            row("2", JAN_1_2016, "", "44", "Q"),
            row("3", JAN_1_2016, "", "nan", "nan"),
            row("4", JAN_1_2016, "", "61", "X"),
        ]);

        let batch = clean_batch(&raw, period()).unwrap();
        let e = &batch.entries;

        assert_eq!(e.len(), 4);
        assert_eq!((e[0].i94bir, e[0].gender.as_deref()), (None, Some("M")));
        assert_eq!((e[1].i94bir, e[1].gender.as_deref()), (Some(44.0), None));
        assert_eq!((e[2].i94bir, e[2].gender.as_deref()), (None, None));
        assert_eq!((e[3].i94bir, e[3].gender.as_deref()), (Some(61.0), Some("X")));
        assert_eq!(batch.report.ages_nulled, 1);
        assert_eq!(batch.report.genders_nulled, 1);
    }

    #[test]
    fn test_length_of_stay_and_sentinel() {
        let raw = extract(&[
            row("1", JAN_1_2016 + 9, &format!("{}.0", JAN_1_2016 + 40), "30", "M"),
            row("2", JAN_1_2016 + 9, "", "30", "M"),
        ]);

        let batch = clean_batch(&raw, period()).unwrap();
        let stayed = &batch.entries[0];
        assert_eq!(
            (stayed.arrival_day, stayed.arrival_month, stayed.arrival_year),
            (10, 1, 2016)
        );
        assert_eq!(
            (stayed.departure_day, stayed.departure_month, stayed.departure_year),
            (10, 2, 2016)
        );
        assert_eq!(stayed.length_of_stay, 31);

        let open = &batch.entries[1];
        assert_eq!(open.length_of_stay, MISSING_DEPARTURE);
        assert_eq!(open.departure_day, MISSING_DEPARTURE);
        assert_eq!(open.departure_year, MISSING_DEPARTURE);
    }

    #[test]
    fn test_fractional_dates_floor_before_length_of_stay() {
        let arrival = format!("{JAN_1_2016}.9");
        let departure = format!("{}.1", JAN_1_2016 + 1);
        let raw = extract(&[format!(
            "1.0,2016.0,1.0,101.0,111.0,NYC,{arrival},1.0,NY,{departure},30,2.0,M,5"
        )]);

        let batch = clean_batch(&raw, period()).unwrap();
        let entry = &batch.entries[0];

        assert_eq!((entry.arrival_day, entry.departure_day), (1, 2));
        assert_eq!(entry.length_of_stay, 1);
    }

    #[test]
    fn test_codes_are_canonical_text() {
        let batch = clean_batch(&extract(&[row("9", JAN_1_2016, "", "30", "F")]), period()).unwrap();
        let entry = &batch.entries[0];
        assert_eq!(entry.i94cit.as_deref(), Some("101"));
        assert_eq!(entry.i94res.as_deref(), Some("111"));
        assert_eq!(entry.i94visa.as_deref(), Some("2"));
        assert_eq!(entry.i94mode.as_deref(), Some("1"));
        assert_eq!(entry.i94addr.as_deref(), Some("NY"));
    }

    #[test]
    fn test_mixed_periods_are_rejected() {
        let mut feb = row("2", JAN_1_2016 + 35, "", "30", "M");
        feb = feb.replacen(",1.0,101.0", ",2.0,101.0", 1);
        let raw = extract(&[row("1", JAN_1_2016, "", "30", "M"), feb]);

        let err = clean_batch(&raw, period()).unwrap_err();
        assert!(matches!(err, StagingError::MixedPeriods { .. }), "{err}");
    }

    #[test]
    fn test_batch_must_match_execution_period() {
        let raw = extract(&[row("1", JAN_1_2016, "", "30", "M")]);
        let err = clean_batch(&raw, ExecutionPeriod::new(2016, 2).unwrap()).unwrap_err();
        assert!(matches!(err, StagingError::PeriodMismatch { .. }));
    }

    #[test]
    fn test_arrival_outside_period_is_rejected() {
        let raw = extract(&[row("1", JAN_1_2016 - 1, "", "30", "M")]);
        let err = clean_batch(&raw, period()).unwrap_err();
        assert!(matches!(err, StagingError::ArrivalOutsidePeriod { admnum: 1, .. }));
    }

    #[test]
    fn test_empty_and_invalid_batches() {
        let raw = extract(&[row("0", JAN_1_2016, "", "30", "M")]);
        assert!(matches!(
            clean_batch(&raw, period()).unwrap_err(),
            StagingError::EmptyBatch
        ));
        assert!(matches!(
            clean_batch(&[], period()).unwrap_err(),
            StagingError::EmptyBatch
        ));

        let raw = extract(&[row("12.5", JAN_1_2016, "", "30", "M")]);
        assert!(matches!(
            clean_batch(&raw, period()).unwrap_err(),
            StagingError::InvalidValue { column: "admnum", .. }
        ));

        let raw = extract(&[row("nan", JAN_1_2016, "", "30", "M")]);
        assert!(matches!(
            clean_batch(&raw, period()).unwrap_err(),
            StagingError::MissingValue { column: "admnum", .. }
        ));
    }

    #[test]
    fn test_staged_csv_header_and_nulls() {
        let batch = clean_batch(&extract(&[row("7", JAN_1_2016, "", "-1", "Z")]), period()).unwrap();
        let text = String::from_utf8(write_staged(&batch.entries).unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(STAGED_COLUMNS.join(",").as_str()));
        assert_eq!(
            lines.next(),
            Some("7,,,2,101,111,NY,1,1,1,2016,-9999,-9999,-9999,-9999")
        );
    }

    #[tokio::test]
    async fn test_task_publishes_only_on_success() {
        let store = Arc::new(InMemoryObjectStore::new());
        let task = ImmigrationStagingTask::new(
            store.clone(),
            ObjectPrefix::new("bucket", "raw/immigration-data"),
            ObjectPrefix::new("bucket", "staging/immigration-data"),
        );
        let ctx = TaskContext::for_period(period(), "stage_monthly_immigration_data");

        let missing = task.execute(&ctx).await.unwrap_err();
        assert!(missing.is_retryable());

        let bad = format!("{HEADER}\n{}\n", row("1", JAN_1_2016 - 40, "", "30", "M"));
        store
            .put(&task.source_for(period()), bad.into_bytes())
            .await
            .unwrap();
        let err = task.execute(&ctx).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(!store.exists(&task.artifact_for(period())).await.unwrap());

        let good = format!("{HEADER}\n{}\n", row("1", JAN_1_2016, "", "30", "M"));
        store
            .put(&task.source_for(period()), good.into_bytes())
            .await
            .unwrap();
        let out = task.execute(&ctx).await.unwrap();
        assert_eq!(
            out.get("artifact"),
            Some(&serde_json::json!(
                "bucket/staging/immigration-data/i94_jan16_sub.csv"
            ))
        );
        assert_eq!(out.get("report").unwrap()["rows_written"], 1);
    }
}
