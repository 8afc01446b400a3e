use crate::constants::{BIN_DAYS, BIN_MONTHS, BIN_YEARS, MAX_RANGE_DAYS};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Width of one statistics bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "DAYS", alias = "DAY")]
    Day,
    #[serde(rename = "MONTHS", alias = "MONTH")]
    Month,
    #[serde(rename = "YEARS", alias = "YEAR")]
    Year,
}

impl Granularity {
    /// `strftime` pattern producing the bucket label. chrono and SQLite agree
    /// on these three specifiers.
    pub fn label_format(&self) -> &'static str {
        match self {
            Granularity::Day => "%Y-%m-%d",
            Granularity::Month => "%Y-%m",
            Granularity::Year => "%Y",
        }
    }

    pub fn label(&self, day: NaiveDate) -> String {
        match self {
            Granularity::Day => format!("{:04}-{:02}-{:02}", day.year(), day.month(), day.day()),
            Granularity::Month => format!("{:04}-{:02}", day.year(), day.month()),
            Granularity::Year => format!("{:04}", day.year()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => BIN_DAYS,
            Granularity::Month => BIN_MONTHS,
            Granularity::Year => BIN_YEARS,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DAY" | "DAYS" => Ok(Granularity::Day),
            "MONTH" | "MONTHS" => Ok(Granularity::Month),
            "YEAR" | "YEARS" => Ok(Granularity::Year),
            other => Err(LedgerError::Validation(format!(
                "choice must be in [{}, {}, {}], got '{}'",
                BIN_MONTHS, BIN_DAYS, BIN_YEARS, other
            ))),
        }
    }
}

/// Inclusive time range of a statistics query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        if from > to {
            return Err(LedgerError::Validation(format!(
                "invalid time range: {from} is after {to}"
            )));
        }
        if (to - from).num_days() > MAX_RANGE_DAYS {
            return Err(LedgerError::Validation(format!(
                "time range spans more than {MAX_RANGE_DAYS} days"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn contains(&self, at: &DateTime<Utc>) -> bool {
        *at >= self.from && *at <= self.to
    }
}

/// Ordered, de-duplicated bucket labels covering every calendar day from
/// `range.from` to `range.to` inclusive.
///
/// Walks whole days rather than adding 24h to `from`, so a range ending
/// earlier in its last day than it started in its first still covers that
/// last day.
pub fn enumerate_bins(granularity: Granularity, range: &TimeRange) -> Vec<String> {
    let first = range.from.date_naive();
    let last = range.to.date_naive();

    let mut bins: Vec<String> = Vec::new();
    for day in first.iter_days().take_while(|d| *d <= last) {
        let label = granularity.label(day);
        if bins.last() != Some(&label) {
            bins.push(label);
        }
    }
    bins
}
