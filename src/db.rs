use crate::config::DatabaseConfig;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::ops::Deref;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS categories (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    record_state  TEXT NOT NULL DEFAULT 'active' CHECK (record_state IN ('active', 'retired')),
    created       TEXT NOT NULL,
    modified      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS drugs (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    category_id   TEXT REFERENCES categories(id) ON DELETE SET NULL,
    rate          REAL NOT NULL DEFAULT 0 CHECK (rate >= 0 AND rate <= 10),
    price         REAL NOT NULL DEFAULT 0 CHECK (price >= 0),
    key           TEXT,
    record_state  TEXT NOT NULL DEFAULT 'active' CHECK (record_state IN ('active', 'retired')),
    created       TEXT NOT NULL,
    modified      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_drugs_category ON drugs(category_id);

CREATE TABLE IF NOT EXISTS workspaces (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    owner         TEXT NOT NULL,
    record_state  TEXT NOT NULL DEFAULT 'active' CHECK (record_state IN ('active', 'retired')),
    created       TEXT NOT NULL,
    modified      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pharmacies (
    id            TEXT PRIMARY KEY,
    work_space_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    name          TEXT NOT NULL,
    address       TEXT NOT NULL,
    phone         TEXT NOT NULL,
    email         TEXT,
    record_state  TEXT NOT NULL DEFAULT 'active' CHECK (record_state IN ('active', 'retired')),
    created       TEXT NOT NULL,
    modified      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pharmacies_workspace ON pharmacies(work_space_id);

CREATE TABLE IF NOT EXISTS prescriptions (
    id            TEXT PRIMARY KEY,
    work_space_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    pharmacy_id   TEXT NOT NULL REFERENCES pharmacies(id) ON DELETE CASCADE,
    status        TEXT NOT NULL DEFAULT 'IN_PROGRESS' CHECK (status IN ('IN_PROGRESS', 'DONE', 'CANCELLED')),
    note          TEXT,
    name          TEXT,
    total_price   REAL NOT NULL DEFAULT 0 CHECK (total_price >= 0),
    record_state  TEXT NOT NULL DEFAULT 'active' CHECK (record_state IN ('active', 'retired')),
    created       TEXT NOT NULL,
    modified      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_prescriptions_pharmacy_created ON prescriptions(pharmacy_id, created);
CREATE INDEX IF NOT EXISTS idx_prescriptions_workspace_created ON prescriptions(work_space_id, created);

CREATE TABLE IF NOT EXISTS prescription_lines (
    id                TEXT PRIMARY KEY,
    prescription_id   TEXT NOT NULL REFERENCES prescriptions(id) ON DELETE CASCADE,
    drug_id           TEXT NOT NULL REFERENCES drugs(id),
    quantity          INTEGER NOT NULL CHECK (quantity >= 1),
    price_at_the_time REAL NOT NULL DEFAULT 0 CHECK (price_at_the_time >= 0),
    is_available      INTEGER NOT NULL DEFAULT 1,
    record_state      TEXT NOT NULL DEFAULT 'active' CHECK (record_state IN ('active', 'retired')),
    created           TEXT NOT NULL,
    modified          TEXT NOT NULL,
    UNIQUE (prescription_id, drug_id)
);
"#;

/// Owner of the SQLite connection shared by the CLI and the HTTP server.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if needed) a file database and apply the schema.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("Opening database at {}", config.path.display());
        let conn = Connection::open(&config.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn, Duration::from_millis(config.busy_timeout_ms))
    }

    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(&DatabaseConfig {
            path: path.as_ref().to_path_buf(),
            ..DatabaseConfig::default()
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, Duration::from_millis(0))
    }

    fn from_connection(conn: Connection, busy_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Lock the connection, returning an error if the mutex is poisoned.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::ConsistencyAssertion("database connection poisoned".to_string()))
    }
}

/// An open write transaction that already holds the database write lock.
///
/// Begun with `BEGIN IMMEDIATE`: a concurrent writer blocks (up to the busy
/// timeout) until this scope commits or rolls back, and then reads the
/// committed state. Dropping the scope without `commit` rolls back.
pub struct WriteScope<'c> {
    tx: Transaction<'c>,
}

impl<'c> WriteScope<'c> {
    pub fn begin(conn: &'c mut Connection) -> Result<Self> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(Self { tx })
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

impl Deref for WriteScope<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

/// Fixed-width UTC timestamp text: lexical order equals time order and
/// SQLite's `strftime` understands it.
pub fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::ConsistencyAssertion(format!("invalid stored timestamp '{raw}': {e}")))
}

/// Escape `%`, `_` and `\` so user keywords match literally inside `LIKE`.
pub fn like_pattern(keyword: &str) -> String {
    let mut out = String::with_capacity(keyword.len() + 2);
    out.push('%');
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_codec_is_fixed_width_and_ordered() {
        let a = Utc.with_ymd_and_hms(2024, 1, 9, 23, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 10, 1, 0, 0).unwrap();
        let (ea, eb) = (encode_ts(&a), encode_ts(&b));
        assert_eq!(ea, "2024-01-09T23:00:00.000000Z");
        assert_eq!(ea.len(), eb.len());
        assert!(ea < eb);
        assert_eq!(decode_ts(&ea).unwrap(), a);
    }

    #[test]
    fn test_corrupt_stored_timestamp_is_not_a_caller_error() {
        let err = decode_ts("yesterday-ish").unwrap_err();
        assert!(matches!(err, LedgerError::ConsistencyAssertion(_)));
    }

    #[test]
    fn test_sqlite_buckets_encoded_timestamps() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let ts = encode_ts(&Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 0).unwrap());
        let bucket: String = conn
            .query_row("SELECT strftime('%Y-%m', ?1)", [&ts], |row| row.get(0))
            .unwrap();
        assert_eq!(bucket, "2024-03");
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn test_dropped_scope_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let mut conn = db.lock().unwrap();
        {
            let scope = WriteScope::begin(&mut conn).unwrap();
            scope
                .execute(
                    "INSERT INTO workspaces (id, name, owner, created, modified) VALUES ('w', 'n', 'o', 'x', 'x')",
                    [],
                )
                .unwrap();
        }
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM workspaces", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
