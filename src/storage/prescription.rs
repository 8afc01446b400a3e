//! Prescriptions and their drug lines.
//!
//! Lines are never written one by one: every create or update that carries a
//! line list hands the whole list to [`reconcile`] inside one [`WriteScope`],
//! and the denormalized `total_price` is refreshed after that scope commits.

use super::workspace::load_pharmacy;
use super::{normalize_keyword, now_ts, parse_column, ts_column, uuid_column};
use crate::constants::PRESCRIPTION_NAME_MAX;
use crate::db::{encode_ts, like_pattern, Database, WriteScope};
use crate::error::{LedgerError, Result};
use crate::reconcile::{ensure_unique_keys, reconcile, ExistingRow, Keyed, ReconcileStats, SyncOptions, SyncTable};
use crate::totals::refresh_total;
use crate::types::{
    LineInput, LineSort, LineSortKey, Prescription, PrescriptionDraft, PrescriptionFilter, PrescriptionLine,
    PrescriptionPatch, PrescriptionWithLines, RecordState, SortDirection,
};
use chrono::{Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

const PRESCRIPTION_COLUMNS: &str =
    "id, work_space_id, pharmacy_id, status, note, name, total_price, created, modified";

const LINE_SELECT: &str = "SELECT l.id, l.prescription_id, l.drug_id, d.name, l.quantity,
            l.price_at_the_time, l.is_available, l.created, l.modified
       FROM prescription_lines l
       JOIN drugs d ON d.id = l.drug_id
      WHERE l.prescription_id = ?1 AND l.record_state = 'active'";

/// A desired line with its price snapshot and availability resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLine {
    pub drug_id: Uuid,
    pub quantity: u32,
    pub price_at_the_time: f64,
    pub is_available: bool,
}

impl Keyed for ResolvedLine {
    type Key = Uuid;

    fn key(&self) -> Uuid {
        self.drug_id
    }
}

impl Keyed for LineInput {
    type Key = Uuid;

    fn key(&self) -> Uuid {
        self.drug_id
    }
}

/// `prescription_lines`, scoped by prescription id and keyed by drug id.
pub struct PrescriptionLines;

impl SyncTable for PrescriptionLines {
    type Item = ResolvedLine;
    type Scope = Uuid;

    fn lock_scope(&self, tx: &WriteScope<'_>, prescription: &Uuid) -> Result<Vec<ExistingRow<Uuid>>> {
        let mut stmt = tx.prepare(
            "SELECT id, drug_id, record_state FROM prescription_lines WHERE prescription_id = ?1",
        )?;
        let rows = stmt.query_map(params![prescription.to_string()], |row| {
            Ok(ExistingRow {
                id: uuid_column(row, 0)?,
                key: uuid_column(row, 1)?,
                state: parse_column::<RecordState>(row, 2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn insert_batch(&self, tx: &WriteScope<'_>, prescription: &Uuid, items: &[&ResolvedLine]) -> Result<()> {
        let now = now_ts();
        let mut stmt = tx.prepare(
            "INSERT INTO prescription_lines
                (id, prescription_id, drug_id, quantity, price_at_the_time, is_available, created, modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        )?;
        for line in items {
            stmt.execute(params![
                Uuid::new_v4().to_string(),
                prescription.to_string(),
                line.drug_id.to_string(),
                line.quantity,
                line.price_at_the_time,
                line.is_available,
                now
            ])?;
        }
        Ok(())
    }

    fn update_batch(&self, tx: &WriteScope<'_>, _prescription: &Uuid, rows: &[(Uuid, &ResolvedLine)]) -> Result<()> {
        let now = now_ts();
        let mut stmt = tx.prepare(
            "UPDATE prescription_lines
                SET quantity = ?1, price_at_the_time = ?2, is_available = ?3,
                    record_state = 'active', modified = ?4
              WHERE id = ?5",
        )?;
        for (id, line) in rows {
            stmt.execute(params![
                line.quantity,
                line.price_at_the_time,
                line.is_available,
                now,
                id.to_string()
            ])?;
        }
        Ok(())
    }

    fn retire_batch(&self, tx: &WriteScope<'_>, ids: &[Uuid]) -> Result<()> {
        let now = now_ts();
        let mut stmt = tx.prepare(
            "UPDATE prescription_lines SET record_state = 'retired', modified = ?1 WHERE id = ?2",
        )?;
        for id in ids {
            stmt.execute(params![now, id.to_string()])?;
        }
        Ok(())
    }
}

/// Result of a prescription write: the stored prescription and what the
/// line reconciliation did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrescriptionWrite {
    #[serde(flatten)]
    pub prescription: PrescriptionWithLines,
    pub lines_sync: ReconcileStats,
}

fn prescription_from_row(row: &Row<'_>) -> rusqlite::Result<Prescription> {
    Ok(Prescription {
        id: uuid_column(row, 0)?,
        work_space_id: uuid_column(row, 1)?,
        pharmacy_id: uuid_column(row, 2)?,
        status: parse_column(row, 3)?,
        note: row.get(4)?,
        name: row.get(5)?,
        total_price: row.get(6)?,
        created: ts_column(row, 7)?,
        modified: ts_column(row, 8)?,
    })
}

fn line_from_row(row: &Row<'_>) -> rusqlite::Result<PrescriptionLine> {
    Ok(PrescriptionLine {
        id: uuid_column(row, 0)?,
        prescription_id: uuid_column(row, 1)?,
        drug_id: uuid_column(row, 2)?,
        drug_name: row.get(3)?,
        quantity: row.get(4)?,
        price_at_the_time: row.get(5)?,
        is_available: row.get(6)?,
        created: ts_column(row, 7)?,
        modified: ts_column(row, 8)?,
    })
}

fn validate_name(name: Option<&str>) -> Result<()> {
    if let Some(name) = name {
        if name.chars().count() > PRESCRIPTION_NAME_MAX {
            return Err(LedgerError::validation(format!(
                "name must be at most {PRESCRIPTION_NAME_MAX} characters"
            )));
        }
    }
    Ok(())
}

/// Checks that need no database access, run before any write.
fn validate_lines(lines: &[LineInput]) -> Result<()> {
    ensure_unique_keys(lines)?;
    for line in lines {
        if line.quantity < 1 {
            return Err(LedgerError::validation(format!(
                "quantity of drug {} must be at least 1",
                line.drug_id
            )));
        }
        if let Some(price) = line.price_at_the_time {
            if price < 0.0 || !price.is_finite() {
                return Err(LedgerError::validation(format!(
                    "price of drug {} must be a non-negative number",
                    line.drug_id
                )));
            }
        }
    }
    Ok(())
}

/// Fill in missing price snapshots from the drugs' current prices.
fn resolve_lines(conn: &Connection, lines: &[LineInput]) -> Result<Vec<ResolvedLine>> {
    lines
        .iter()
        .map(|line| {
            let price_at_the_time = match line.price_at_the_time {
                Some(price) => price,
                None => conn
                    .query_row(
                        "SELECT price FROM drugs WHERE id = ?1 AND record_state = 'active'",
                        params![line.drug_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?
                    .ok_or_else(|| LedgerError::not_found(format!("drug {}", line.drug_id)))?,
            };
            Ok(ResolvedLine {
                drug_id: line.drug_id,
                quantity: line.quantity,
                price_at_the_time,
                is_available: line.is_available.unwrap_or(true),
            })
        })
        .collect()
}

fn load_prescription(conn: &Connection, workspace: Uuid, id: Uuid) -> Result<Prescription> {
    conn.query_row(
        &format!(
            "SELECT {PRESCRIPTION_COLUMNS} FROM prescriptions
              WHERE id = ?1 AND work_space_id = ?2 AND record_state = 'active'"
        ),
        params![id.to_string(), workspace.to_string()],
        prescription_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found(format!("prescription {id} in workspace {workspace}")))
}

fn load_lines(conn: &Connection, prescription: Uuid, sort: LineSort) -> Result<Vec<PrescriptionLine>> {
    let column = match sort.key {
        LineSortKey::Created => "l.created",
        LineSortKey::Name => "d.name",
        LineSortKey::Price => "l.price_at_the_time",
        LineSortKey::Available => "l.is_available",
    };
    let direction = match sort.direction {
        SortDirection::Asc => "ASC",
        SortDirection::Desc => "DESC",
    };
    let mut stmt = conn.prepare(&format!(
        "{LINE_SELECT} ORDER BY {column} {direction}, l.rowid {direction}"
    ))?;
    let rows = stmt.query_map(params![prescription.to_string()], line_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn load_with_lines(conn: &Connection, workspace: Uuid, id: Uuid) -> Result<PrescriptionWithLines> {
    let prescription = load_prescription(conn, workspace, id)?;
    let lines = load_lines(conn, id, LineSort::default())?;
    Ok(PrescriptionWithLines { prescription, lines })
}

impl Database {
    /// Insert a prescription and its lines in one locked transaction, then
    /// refresh its total.
    pub fn create_prescription(&self, workspace: Uuid, draft: &PrescriptionDraft) -> Result<PrescriptionWrite> {
        validate_name(draft.name.as_deref())?;
        validate_lines(&draft.lines)?;

        let mut conn = self.lock()?;
        let id = Uuid::new_v4();
        let lines_sync = {
            let tx = WriteScope::begin(&mut conn)?;
            load_pharmacy(&tx, workspace, draft.pharmacy_id)?;
            let desired = resolve_lines(&tx, &draft.lines)?;

            tx.execute(
                "INSERT INTO prescriptions (id, work_space_id, pharmacy_id, status, note, name, total_price, created, modified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
                params![
                    id.to_string(),
                    workspace.to_string(),
                    draft.pharmacy_id.to_string(),
                    draft.status.as_str(),
                    draft.note,
                    draft.name,
                    now_ts()
                ],
            )?;
            let stats = reconcile(&tx, &PrescriptionLines, &id, &desired, SyncOptions::default())?;
            tx.commit()?;
            stats
        };

        refresh_total(&conn, id);
        info!(
            "Created prescription {} in workspace {} with {} lines",
            id, workspace, lines_sync.created
        );
        Ok(PrescriptionWrite {
            prescription: load_with_lines(&conn, workspace, id)?,
            lines_sync,
        })
    }

    /// Partial update. A present `lines` list, even an empty one, replaces
    /// the line set; an absent one leaves it alone.
    pub fn update_prescription(
        &self,
        workspace: Uuid,
        id: Uuid,
        patch: &PrescriptionPatch,
    ) -> Result<PrescriptionWrite> {
        validate_name(patch.name.as_deref())?;
        if let Some(lines) = &patch.lines {
            validate_lines(lines)?;
        }

        let mut conn = self.lock()?;
        let lines_sync = {
            let tx = WriteScope::begin(&mut conn)?;
            load_prescription(&tx, workspace, id)?;
            if let Some(pharmacy_id) = patch.pharmacy_id {
                load_pharmacy(&tx, workspace, pharmacy_id)?;
            }

            tx.execute(
                "UPDATE prescriptions
                    SET pharmacy_id = COALESCE(?1, pharmacy_id),
                        status = COALESCE(?2, status),
                        note = COALESCE(?3, note),
                        name = COALESCE(?4, name),
                        modified = ?5
                  WHERE id = ?6",
                params![
                    patch.pharmacy_id.map(|p| p.to_string()),
                    patch.status.map(|s| s.as_str()),
                    patch.note,
                    patch.name,
                    now_ts(),
                    id.to_string()
                ],
            )?;

            let stats = match &patch.lines {
                Some(lines) => {
                    let desired = resolve_lines(&tx, lines)?;
                    reconcile(&tx, &PrescriptionLines, &id, &desired, SyncOptions::default())?
                }
                None => ReconcileStats::default(),
            };
            tx.commit()?;
            stats
        };

        refresh_total(&conn, id);
        info!(
            "Updated prescription {}: {} created, {} updated, {} deleted lines",
            id, lines_sync.created, lines_sync.updated, lines_sync.deleted
        );
        Ok(PrescriptionWrite {
            prescription: load_with_lines(&conn, workspace, id)?,
            lines_sync,
        })
    }

    pub fn retire_prescription(&self, workspace: Uuid, id: Uuid) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE prescriptions SET record_state = 'retired', modified = ?1
              WHERE id = ?2 AND work_space_id = ?3 AND record_state = 'active'",
            params![now_ts(), id.to_string(), workspace.to_string()],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found(format!("prescription {id} in workspace {workspace}")));
        }
        info!("Retired prescription {}", id);
        Ok(())
    }

    pub fn get_prescription(&self, workspace: Uuid, id: Uuid) -> Result<PrescriptionWithLines> {
        let conn = self.lock()?;
        load_with_lines(&conn, workspace, id)
    }

    /// Prescriptions of `workspace`, newest first. A keyword matches name or
    /// status; name matches come first.
    pub fn list_prescriptions(&self, workspace: Uuid, filter: &PrescriptionFilter) -> Result<Vec<Prescription>> {
        let (day_start, day_end) = match filter.date {
            Some(at) => {
                let start = Utc.from_utc_datetime(&at.date_naive().and_time(chrono::NaiveTime::MIN));
                (Some(encode_ts(&start)), Some(encode_ts(&(start + Duration::days(1)))))
            }
            None => (None, None),
        };
        let keyword = normalize_keyword(filter.keyword.as_deref()).map(|k| like_pattern(&k));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PRESCRIPTION_COLUMNS} FROM prescriptions
              WHERE work_space_id = ?1 AND record_state = 'active'
                AND (?2 IS NULL OR created >= ?2)
                AND (?3 IS NULL OR created < ?3)
                AND (?4 IS NULL OR name LIKE ?4 ESCAPE '\\' OR status LIKE ?4 ESCAPE '\\')
              ORDER BY CASE WHEN ?4 IS NOT NULL AND name LIKE ?4 ESCAPE '\\' THEN 0 ELSE 1 END,
                       created DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(
            params![workspace.to_string(), day_start, day_end, keyword],
            prescription_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_prescription_lines(&self, workspace: Uuid, id: Uuid, sort: LineSort) -> Result<Vec<PrescriptionLine>> {
        let conn = self.lock()?;
        load_prescription(&conn, workspace, id)?;
        load_lines(&conn, id, sort)
    }
}
