//! Derived prescription totals.
//!
//! `total_price` is a cache of the sum of `price_at_the_time * quantity` over
//! the active, available lines of a prescription. It is recomputed after the
//! write that changed the lines has committed, so a failure here never undoes
//! that write.

use crate::db::encode_ts;
use crate::error::{LedgerError, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{debug, warn};
use uuid::Uuid;

/// Sum the active, available lines of `prescription_id` and store the result.
pub fn recompute_total(conn: &Connection, prescription_id: Uuid) -> Result<f64> {
    let id = prescription_id.to_string();
    let total: Option<f64> = conn.query_row(
        "SELECT SUM(price_at_the_time * quantity)
           FROM prescription_lines
          WHERE prescription_id = ?1
            AND record_state = 'active'
            AND is_available = 1",
        params![id],
        |row| row.get(0),
    )?;
    let total = total.unwrap_or(0.0);

    let changed = conn.execute(
        "UPDATE prescriptions SET total_price = ?1, modified = ?2 WHERE id = ?3",
        params![total, encode_ts(&Utc::now()), id],
    )?;
    if changed == 0 {
        return Err(LedgerError::Recomputation {
            prescription_id,
            message: "prescription row is missing".to_string(),
        });
    }

    debug!("Prescription {} total recomputed: {}", prescription_id, total);
    Ok(total)
}

/// Best-effort variant used on the write path: failures are logged and
/// counted, and the stale total stays until the next successful write.
pub fn refresh_total(conn: &Connection, prescription_id: Uuid) -> Option<f64> {
    match recompute_total(conn, prescription_id) {
        Ok(total) => Some(total),
        Err(e) => {
            warn!("Failed to recompute total of prescription {}: {}", prescription_id, e);
            crate::metrics::record_recompute_failure();
            None
        }
    }
}
