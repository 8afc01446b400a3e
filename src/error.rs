use rusqlite::ErrorCode;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Consistency assertion failed: {0}")]
    ConsistencyAssertion(String),

    #[error("Total recomputation failed for prescription {prescription_id}: {message}")]
    Recomputation { prescription_id: Uuid, message: String },

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    pub fn validation(message: impl Into<String>) -> Self {
        LedgerError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        LedgerError::NotFound(message.into())
    }
}

/// SQLite rejects constraint failures (foreign key, unique, check, not null)
/// with `SQLITE_CONSTRAINT`; those surface as `ConstraintViolation` so callers
/// can tell bad references apart from infrastructure failures.
impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
                LedgerError::ConstraintViolation(
                    msg.clone().unwrap_or_else(|| e.to_string()),
                )
            }
            _ => LedgerError::Database(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_foreign_key_failure_is_constraint_violation() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE parent (id TEXT PRIMARY KEY);
             CREATE TABLE child (id TEXT PRIMARY KEY, parent_id TEXT NOT NULL REFERENCES parent(id));",
        )
        .unwrap();

        let err: LedgerError = conn
            .execute("INSERT INTO child (id, parent_id) VALUES ('c', 'missing')", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, LedgerError::ConstraintViolation(_)));
    }

    #[test]
    fn test_other_sqlite_errors_stay_database_errors() {
        let conn = Connection::open_in_memory().unwrap();
        let err: LedgerError = conn.execute("SELECT * FROM nowhere", []).unwrap_err().into();
        assert!(matches!(err, LedgerError::Database(_)));
    }
}
