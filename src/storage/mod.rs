//! Persistence operations over the shared [`Database`](crate::db::Database).
//!
//! Each submodule adds an `impl Database` block for one entity family. Reads
//! take the connection lock and run plain queries; writes that touch more than
//! one row open a [`WriteScope`](crate::db::WriteScope).

pub mod catalog;
pub mod prescription;
pub mod stats;
pub mod workspace;

pub use prescription::{PrescriptionLines, PrescriptionWrite, ResolvedLine};
pub use stats::{
    CategoryStatistic, CategoryStatistics, CommonStatistics, PharmacyPrescriptionTotals, StatsWindow,
    WorkspacePharmacyTotals,
};

use crate::db::encode_ts;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use std::str::FromStr;
use uuid::Uuid;

pub(crate) fn now_ts() -> String {
    encode_ts(&Utc::now())
}

pub(crate) fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::from_str(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::from_str(&s).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))))
        .transpose()
}

pub(crate) fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = LedgerError>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Trim a free-text keyword; blank keywords mean "no filter".
pub(crate) fn normalize_keyword(keyword: Option<&str>) -> Option<String> {
    keyword.map(str::trim).filter(|k| !k.is_empty()).map(str::to_string)
}

pub(crate) fn require_text(field: &str, value: &str, max_chars: Option<usize>) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LedgerError::validation(format!("{field} must not be empty")));
    }
    if let Some(max) = max_chars {
        if value.chars().count() > max {
            return Err(LedgerError::validation(format!(
                "{field} must be at most {max} characters"
            )));
        }
    }
    Ok(())
}
