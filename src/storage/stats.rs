//! Statistics read path: SQL-backed amount sources plus the derived
//! dashboards (common counters, category shares).

use super::uuid_column;
use super::workspace::{load_pharmacy, load_workspace};
use crate::aggregate::{aggregate_flat, aggregate_grouped, AmountSource, BucketSum, GroupRef, GroupedSeries, Series};
use crate::bins::{Granularity, TimeRange};
use crate::config::RangeScope;
use crate::constants::{CANCELLED_KEY, DONE_KEY, IN_PROGRESS_KEY};
use crate::db::{decode_ts, encode_ts, Database};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

/// Sums of one pharmacy's prescription totals per bucket.
pub struct PharmacyPrescriptionTotals<'c> {
    pub conn: &'c Connection,
    pub pharmacy_id: Uuid,
}

impl AmountSource for PharmacyPrescriptionTotals<'_> {
    fn bucket_sums(&self, granularity: Granularity, range: &TimeRange) -> Result<Vec<BucketSum>> {
        let query = || -> rusqlite::Result<Vec<BucketSum>> {
            let mut stmt = self.conn.prepare(
                "SELECT strftime(?1, created) AS bucket, SUM(total_price)
                   FROM prescriptions
                  WHERE pharmacy_id = ?2
                    AND record_state = 'active'
                    AND created BETWEEN ?3 AND ?4
                  GROUP BY bucket
                  ORDER BY bucket",
            )?;
            let rows = stmt.query_map(
                params![
                    granularity.label_format(),
                    self.pharmacy_id.to_string(),
                    encode_ts(&range.from),
                    encode_ts(&range.to)
                ],
                |row| {
                    Ok(BucketSum {
                        group: None,
                        bucket: row.get(0)?,
                        amount: row.get(1)?,
                    })
                },
            )?;
            rows.collect()
        };
        query().map_err(|e| {
            error!("[stats] pharmacy {} bucket query failed: {}", self.pharmacy_id, e);
            LedgerError::from(e)
        })
    }
}

/// Sums of prescription totals per (pharmacy, bucket) across a workspace.
pub struct WorkspacePharmacyTotals<'c> {
    pub conn: &'c Connection,
    pub workspace_id: Uuid,
}

impl AmountSource for WorkspacePharmacyTotals<'_> {
    fn bucket_sums(&self, granularity: Granularity, range: &TimeRange) -> Result<Vec<BucketSum>> {
        let query = || -> rusqlite::Result<Vec<BucketSum>> {
            let mut stmt = self.conn.prepare(
                "SELECT ph.id, ph.name, strftime(?1, pr.created) AS bucket, SUM(pr.total_price)
                   FROM prescriptions pr
                   JOIN pharmacies ph ON ph.id = pr.pharmacy_id
                  WHERE ph.work_space_id = ?2
                    AND ph.record_state = 'active'
                    AND pr.record_state = 'active'
                    AND pr.created BETWEEN ?3 AND ?4
                  GROUP BY ph.id, ph.name, bucket
                  ORDER BY ph.name, ph.id, bucket",
            )?;
            let rows = stmt.query_map(
                params![
                    granularity.label_format(),
                    self.workspace_id.to_string(),
                    encode_ts(&range.from),
                    encode_ts(&range.to)
                ],
                |row| {
                    Ok(BucketSum {
                        group: Some(GroupRef {
                            id: uuid_column(row, 0)?,
                            name: row.get(1)?,
                        }),
                        bucket: row.get(2)?,
                        amount: row.get(3)?,
                    })
                },
            )?;
            rows.collect()
        };
        query().map_err(|e| {
            error!("[stats] workspace {} bucket query failed: {}", self.workspace_id, e);
            LedgerError::from(e)
        })
    }
}

/// Optional explicit bounds of a statistics query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsWindow {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

/// What a statistics query is about, for scoped range resolution.
enum RangeSubject {
    Pharmacy(Uuid),
    Workspace(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommonStatistics {
    pub total_pres_works: i64,
    pub total_pres_done: i64,
    pub total_pres_cancelled: i64,
    pub money: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryStatistic {
    pub id: Uuid,
    pub name: String,
    pub total: Option<i64>,
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryStatistics {
    pub number_of_groups: i64,
    pub number_of_drugs: i64,
    pub statistic: Vec<CategoryStatistic>,
}

/// Round to three significant digits.
fn round_significant(value: f64) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let magnitude = value.abs().log10().ceil() as i32;
    let factor = 10f64.powi(3 - magnitude);
    (value * factor).round() / factor
}

fn created_bounds(
    conn: &Connection,
    scope: RangeScope,
    subject: &RangeSubject,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let mut sql = String::from("SELECT MIN(created), MAX(created) FROM prescriptions WHERE record_state = 'active'");
    let mut args: Vec<String> = Vec::new();
    if scope == RangeScope::Scoped {
        match subject {
            RangeSubject::Pharmacy(id) => {
                sql.push_str(" AND pharmacy_id = ?1");
                args.push(id.to_string());
            }
            RangeSubject::Workspace(id) => {
                sql.push_str(" AND work_space_id = ?1");
                args.push(id.to_string());
            }
        }
    }
    let (min, max): (Option<String>, Option<String>) =
        conn.query_row(&sql, params_from_iter(args.iter()), |row| Ok((row.get(0)?, row.get(1)?)))?;
    match (min, max) {
        (Some(min), Some(max)) => Ok(Some((decode_ts(&min)?, decode_ts(&max)?))),
        _ => Ok(None),
    }
}

/// Explicit bounds win; missing bounds come from the prescriptions' created
/// timestamps. `None` means there is nothing to chart.
fn resolve_range(
    conn: &Connection,
    scope: RangeScope,
    subject: &RangeSubject,
    window: StatsWindow,
) -> Result<Option<TimeRange>> {
    if let (Some(from), Some(to)) = (window.from, window.to) {
        return TimeRange::new(from, to).map(Some);
    }
    if scope == RangeScope::Global {
        debug!("Resolving statistics range over all prescriptions");
    }
    match created_bounds(conn, scope, subject)? {
        Some((min, max)) => TimeRange::new(window.from.unwrap_or(min), window.to.unwrap_or(max)).map(Some),
        None => Ok(None),
    }
}

impl Database {
    /// Per-bucket sums of one pharmacy's prescription totals.
    pub fn pharmacy_statistics(
        &self,
        workspace: Uuid,
        pharmacy: Uuid,
        granularity: Granularity,
        window: StatsWindow,
        scope: RangeScope,
    ) -> Result<Series> {
        crate::metrics::record_stats_query("pharmacy");
        let conn = self.lock()?;
        load_pharmacy(&conn, workspace, pharmacy)?;

        let Some(range) = resolve_range(&conn, scope, &RangeSubject::Pharmacy(pharmacy), window)? else {
            return Ok(Series::empty());
        };
        let source = PharmacyPrescriptionTotals {
            conn: &conn,
            pharmacy_id: pharmacy,
        };
        aggregate_flat(&source, granularity, &range)
    }

    /// Per-bucket sums for every pharmacy of `workspace` that has data.
    pub fn pharmacies_statistics(
        &self,
        workspace: Uuid,
        granularity: Granularity,
        window: StatsWindow,
        scope: RangeScope,
    ) -> Result<GroupedSeries> {
        crate::metrics::record_stats_query("pharmacies");
        let conn = self.lock()?;
        load_workspace(&conn, workspace)?;

        let Some(range) = resolve_range(&conn, scope, &RangeSubject::Workspace(workspace), window)? else {
            return Ok(GroupedSeries::empty());
        };
        let source = WorkspacePharmacyTotals {
            conn: &conn,
            workspace_id: workspace,
        };
        aggregate_grouped(&source, granularity, &range)
    }

    /// Counters over the prescriptions of `workspace` created at or after
    /// `since`. `money` sums the totals of work that is done or in progress.
    pub fn common_statistics(&self, workspace: Uuid, since: DateTime<Utc>) -> Result<CommonStatistics> {
        crate::metrics::record_stats_query("common");
        let conn = self.lock()?;
        load_workspace(&conn, workspace)?;

        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = ?3 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = ?4 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status IN (?3, ?5) THEN total_price ELSE 0 END), 0)
               FROM prescriptions
              WHERE work_space_id = ?1 AND record_state = 'active' AND created >= ?2",
            params![
                workspace.to_string(),
                encode_ts(&since),
                DONE_KEY,
                CANCELLED_KEY,
                IN_PROGRESS_KEY
            ],
            |row| {
                Ok(CommonStatistics {
                    total_pres_works: row.get(0)?,
                    total_pres_done: row.get(1)?,
                    total_pres_cancelled: row.get(2)?,
                    money: row.get(3)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// Share of active drugs per active category.
    pub fn category_statistics(&self) -> Result<CategoryStatistics> {
        crate::metrics::record_stats_query("categories");
        let conn = self.lock()?;

        let number_of_drugs: i64 = conn.query_row(
            "SELECT COUNT(*) FROM drugs WHERE record_state = 'active'",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, COUNT(d.id)
               FROM categories c
               LEFT JOIN drugs d ON d.category_id = c.id AND d.record_state = 'active'
              WHERE c.record_state = 'active'
              GROUP BY c.id, c.name
              ORDER BY c.created, c.rowid",
        )?;
        let rows = stmt.query_map([], |row| Ok((uuid_column(row, 0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?)))?;

        let mut statistic = Vec::new();
        for row in rows {
            let (id, name, total) = row?;
            let (total, percentage) = if total > 0 && number_of_drugs > 0 {
                (
                    Some(total),
                    Some(round_significant(total as f64 / number_of_drugs as f64 * 100.0)),
                )
            } else {
                (None, None)
            };
            statistic.push(CategoryStatistic {
                id,
                name,
                total,
                percentage,
            });
        }

        Ok(CategoryStatistics {
            number_of_groups: statistic.len() as i64,
            number_of_drugs,
            statistic,
        })
    }
}
