//! Workspaces and the pharmacies they own.

use super::{normalize_keyword, now_ts, require_text, ts_column, uuid_column};
use crate::constants::{PHARMACY_ADDRESS_MAX, PHARMACY_NAME_MAX, PHARMACY_PHONE_MAX};
use crate::db::{like_pattern, Database};
use crate::error::{LedgerError, Result};
use crate::types::{Pharmacy, PharmacyInput, WorkSpace};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$").unwrap()
});

static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?[0-9][0-9 \-]*$").unwrap());

const WORKSPACE_COLUMNS: &str = "id, name, owner, created, modified";
const PHARMACY_COLUMNS: &str = "id, work_space_id, name, address, phone, email, created, modified";

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<WorkSpace> {
    Ok(WorkSpace {
        id: uuid_column(row, 0)?,
        name: row.get(1)?,
        owner: row.get(2)?,
        created: ts_column(row, 3)?,
        modified: ts_column(row, 4)?,
    })
}

fn pharmacy_from_row(row: &Row<'_>) -> rusqlite::Result<Pharmacy> {
    Ok(Pharmacy {
        id: uuid_column(row, 0)?,
        work_space_id: uuid_column(row, 1)?,
        name: row.get(2)?,
        address: row.get(3)?,
        phone: row.get(4)?,
        email: row.get(5)?,
        created: ts_column(row, 6)?,
        modified: ts_column(row, 7)?,
    })
}

fn validate_pharmacy(input: &PharmacyInput) -> Result<()> {
    require_text("name", &input.name, Some(PHARMACY_NAME_MAX))?;
    require_text("address", &input.address, Some(PHARMACY_ADDRESS_MAX))?;
    require_text("phone", &input.phone, Some(PHARMACY_PHONE_MAX))?;
    if !PHONE_RE.is_match(input.phone.trim()) {
        return Err(LedgerError::validation(format!("'{}' is not a phone number", input.phone)));
    }
    if let Some(email) = input.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
        if !EMAIL_RE.is_match(email) {
            return Err(LedgerError::validation(format!("'{email}' is not a valid email address")));
        }
    }
    Ok(())
}

pub(crate) fn load_workspace(conn: &Connection, id: Uuid) -> Result<WorkSpace> {
    conn.query_row(
        &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?1 AND record_state = 'active'"),
        params![id.to_string()],
        workspace_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found(format!("workspace {id}")))
}

/// A pharmacy of `workspace`; pharmacies of other workspaces are not found.
pub(crate) fn load_pharmacy(conn: &Connection, workspace: Uuid, id: Uuid) -> Result<Pharmacy> {
    conn.query_row(
        &format!(
            "SELECT {PHARMACY_COLUMNS} FROM pharmacies
              WHERE id = ?1 AND work_space_id = ?2 AND record_state = 'active'"
        ),
        params![id.to_string(), workspace.to_string()],
        pharmacy_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found(format!("pharmacy {id} in workspace {workspace}")))
}

impl Database {
    pub fn create_workspace(&self, name: &str, owner: &str) -> Result<WorkSpace> {
        require_text("workspace name", name, None)?;
        require_text("owner", owner, None)?;
        let conn = self.lock()?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO workspaces (id, name, owner, created, modified) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id.to_string(), name.trim(), owner.trim(), now_ts()],
        )?;
        info!("Created workspace '{}' ({}) for {}", name.trim(), id, owner.trim());
        load_workspace(&conn, id)
    }

    pub fn get_workspace(&self, id: Uuid) -> Result<WorkSpace> {
        let conn = self.lock()?;
        load_workspace(&conn, id)
    }

    pub fn list_workspaces(&self, owner: &str) -> Result<Vec<WorkSpace>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces
              WHERE owner = ?1 AND record_state = 'active'
              ORDER BY created DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![owner], workspace_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn create_pharmacy(&self, workspace: Uuid, input: &PharmacyInput) -> Result<Pharmacy> {
        validate_pharmacy(input)?;
        let conn = self.lock()?;
        load_workspace(&conn, workspace)?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO pharmacies (id, work_space_id, name, address, phone, email, created, modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id.to_string(),
                workspace.to_string(),
                input.name.trim(),
                input.address.trim(),
                input.phone.trim(),
                input.email.as_deref().map(str::trim).filter(|e| !e.is_empty()),
                now_ts()
            ],
        )?;
        info!("Created pharmacy '{}' ({}) in workspace {}", input.name.trim(), id, workspace);
        load_pharmacy(&conn, workspace, id)
    }

    pub fn get_pharmacy(&self, workspace: Uuid, id: Uuid) -> Result<Pharmacy> {
        let conn = self.lock()?;
        load_pharmacy(&conn, workspace, id)
    }

    pub fn update_pharmacy(&self, workspace: Uuid, id: Uuid, input: &PharmacyInput) -> Result<Pharmacy> {
        validate_pharmacy(input)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE pharmacies SET name = ?1, address = ?2, phone = ?3, email = ?4, modified = ?5
              WHERE id = ?6 AND work_space_id = ?7 AND record_state = 'active'",
            params![
                input.name.trim(),
                input.address.trim(),
                input.phone.trim(),
                input.email.as_deref().map(str::trim).filter(|e| !e.is_empty()),
                now_ts(),
                id.to_string(),
                workspace.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found(format!("pharmacy {id} in workspace {workspace}")));
        }
        load_pharmacy(&conn, workspace, id)
    }

    /// Pharmacies of `workspace`, newest first, optionally filtered by name.
    pub fn list_pharmacies(&self, workspace: Uuid, keyword: Option<&str>) -> Result<Vec<Pharmacy>> {
        let conn = self.lock()?;
        load_workspace(&conn, workspace)?;
        let keyword = normalize_keyword(keyword).map(|k| like_pattern(&k));
        let mut stmt = conn.prepare(&format!(
            "SELECT {PHARMACY_COLUMNS} FROM pharmacies
              WHERE work_space_id = ?1 AND record_state = 'active'
                AND (?2 IS NULL OR name LIKE ?2 ESCAPE '\\')
              ORDER BY created DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![workspace.to_string(), keyword], pharmacy_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, phone: &str, email: Option<&str>) -> PharmacyInput {
        PharmacyInput {
            name: name.to_string(),
            address: "1 Main Street".to_string(),
            phone: phone.to_string(),
            email: email.map(str::to_string),
        }
    }

    #[test]
    fn test_workspaces_listed_by_owner() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_workspace("North", "alice").unwrap();
        db.create_workspace("South", "bob").unwrap();

        let listed = db.list_workspaces("alice").unwrap();
        assert_eq!(listed, vec![a]);
    }

    #[test]
    fn test_pharmacy_validation() {
        let db = Database::open_in_memory().unwrap();
        let ws = db.create_workspace("North", "alice").unwrap();

        let long_phone = input("Central", "0123456789012", None);
        assert!(matches!(db.create_pharmacy(ws.id, &long_phone), Err(LedgerError::Validation(_))));

        let bad_email = input("Central", "0123456789", Some("not-an-email"));
        assert!(matches!(db.create_pharmacy(ws.id, &bad_email), Err(LedgerError::Validation(_))));

        let long_name = input(&"x".repeat(129), "0123456789", None);
        assert!(matches!(db.create_pharmacy(ws.id, &long_name), Err(LedgerError::Validation(_))));

        let ok = input("Central", "+84 912 345", Some("central@example.com"));
        assert_eq!(db.create_pharmacy(ws.id, &ok).unwrap().email.as_deref(), Some("central@example.com"));
    }

    #[test]
    fn test_pharmacy_lookup_is_workspace_scoped() {
        let db = Database::open_in_memory().unwrap();
        let north = db.create_workspace("North", "alice").unwrap();
        let south = db.create_workspace("South", "alice").unwrap();
        let pharmacy = db.create_pharmacy(north.id, &input("Central", "0123", None)).unwrap();

        assert!(db.get_pharmacy(north.id, pharmacy.id).is_ok());
        assert!(matches!(db.get_pharmacy(south.id, pharmacy.id), Err(LedgerError::NotFound(_))));
        assert!(matches!(
            db.update_pharmacy(south.id, pharmacy.id, &input("Moved", "0123", None)),
            Err(LedgerError::NotFound(_))
        ));
        assert!(db.list_pharmacies(south.id, None).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_workspace_rejects_pharmacy() {
        let db = Database::open_in_memory().unwrap();
        let err = db.create_pharmacy(Uuid::new_v4(), &input("Central", "0123", None)).unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }
}
