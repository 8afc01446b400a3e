use crate::constants::{CANCELLED_KEY, DONE_KEY, IN_PROGRESS_KEY};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Visibility of a row. Retired rows stay in the table for audit but are
/// excluded from every business query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Active,
    Retired,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Active => "active",
            RecordState::Retired => "retired",
        }
    }
}

impl FromStr for RecordState {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(RecordState::Active),
            "retired" => Ok(RecordState::Retired),
            other => Err(LedgerError::validation(format!("unknown record state '{other}'"))),
        }
    }
}

/// Prescription lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PrescriptionStatus {
    #[default]
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl PrescriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrescriptionStatus::InProgress => IN_PROGRESS_KEY,
            PrescriptionStatus::Done => DONE_KEY,
            PrescriptionStatus::Cancelled => CANCELLED_KEY,
        }
    }
}

impl fmt::Display for PrescriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrescriptionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            IN_PROGRESS_KEY => Ok(PrescriptionStatus::InProgress),
            DONE_KEY => Ok(PrescriptionStatus::Done),
            CANCELLED_KEY => Ok(PrescriptionStatus::Cancelled),
            other => Err(LedgerError::validation(format!(
                "unknown prescription status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Drug counts inside and outside one category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRatio {
    pub category: i64,
    pub other: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drug {
    pub id: Uuid,
    pub name: String,
    pub category_id: Option<Uuid>,
    pub category_name: Option<String>,
    pub rate: f64,
    pub price: f64,
    pub key: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Fields a client supplies when creating or replacing a drug
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrugInput {
    pub name: String,
    #[serde(default)]
    pub category_id: Option<Uuid>,
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrugFilter {
    pub keyword: Option<String>,
    pub price_from: Option<f64>,
    pub price_to: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSpace {
    pub id: Uuid,
    pub name: String,
    pub owner: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pharmacy {
    pub id: Uuid,
    pub work_space_id: Uuid,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub email: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PharmacyInput {
    pub name: String,
    pub address: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Parent record of a set of prescription lines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prescription {
    pub id: Uuid,
    pub work_space_id: Uuid,
    pub pharmacy_id: Uuid,
    pub status: PrescriptionStatus,
    pub note: Option<String>,
    pub name: Option<String>,
    pub total_price: f64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// One drug line of a prescription. `price_at_the_time` is the drug price
/// captured when the line was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrescriptionLine {
    pub id: Uuid,
    pub prescription_id: Uuid,
    pub drug_id: Uuid,
    pub drug_name: String,
    pub quantity: u32,
    pub price_at_the_time: f64,
    pub is_available: bool,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrescriptionWithLines {
    #[serde(flatten)]
    pub prescription: Prescription,
    pub lines: Vec<PrescriptionLine>,
}

/// A desired line as submitted by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineInput {
    pub drug_id: Uuid,
    pub quantity: u32,
    #[serde(default)]
    pub price_at_the_time: Option<f64>,
    #[serde(default)]
    pub is_available: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrescriptionDraft {
    pub pharmacy_id: Uuid,
    #[serde(default)]
    pub status: PrescriptionStatus,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub lines: Vec<LineInput>,
}

/// Partial update of a prescription. `lines: Some(..)` replaces the line set,
/// `lines: None` leaves it untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrescriptionPatch {
    #[serde(default)]
    pub pharmacy_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<PrescriptionStatus>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub lines: Option<Vec<LineInput>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrescriptionFilter {
    /// Restrict to the UTC day containing this instant
    pub date: Option<DateTime<Utc>>,
    pub keyword: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineSortKey {
    #[default]
    Created,
    Name,
    Price,
    Available,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LineSort {
    pub key: LineSortKey,
    pub direction: SortDirection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_keys() {
        for status in [
            PrescriptionStatus::InProgress,
            PrescriptionStatus::Done,
            PrescriptionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<PrescriptionStatus>().unwrap(), status);
        }
        assert!("PAUSED".parse::<PrescriptionStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_as_key() {
        let json = serde_json::to_string(&PrescriptionStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }

    #[test]
    fn test_draft_defaults() {
        let draft: PrescriptionDraft = serde_json::from_str(
            r#"{"pharmacy_id":"7d8f6f0e-8d55-4a3f-a1c1-2f1f5b0f3a10","lines":[{"drug_id":"0b7b5a53-4b57-4f0c-9f0b-9b2d1e5c6a11","quantity":2}]}"#,
        )
        .unwrap();
        assert_eq!(draft.status, PrescriptionStatus::InProgress);
        assert_eq!(draft.lines[0].price_at_the_time, None);
        assert_eq!(draft.lines[0].is_available, None);
    }
}
