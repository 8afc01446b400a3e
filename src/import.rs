//! Demo data loading: the default category list and drug imports from a
//! JSON export of a public drug-review dataset.

use crate::constants::{DEFAULT_CATEGORIES, DRUG_RATE_MAX, IMPORT_PRICE_MAX, IMPORT_PRICE_MIN};
use crate::db::{encode_ts, Database, WriteScope};
use crate::error::Result;
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

/// Default number of records taken from an import file.
pub const DEFAULT_IMPORT_LIMIT: usize = 100;

/// One entry of an import file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrugRecord {
    #[serde(default)]
    pub drug_name: Option<String>,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub price: Option<f64>,
    /// Category name; unknown or missing names get a random category.
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

pub fn read_drug_records<P: AsRef<Path>>(path: P) -> Result<Vec<DrugRecord>> {
    let content = fs::read_to_string(path.as_ref())?;
    let records: Vec<DrugRecord> = serde_json::from_str(&content)?;
    info!("Read {} drug records from {}", records.len(), path.as_ref().display());
    Ok(records)
}

/// Insert up to `limit` records in one transaction. Records without a name
/// or with an out-of-range rating or price are skipped.
pub fn import_drugs<R: Rng>(db: &Database, records: &[DrugRecord], limit: usize, rng: &mut R) -> Result<ImportSummary> {
    let mut conn = db.lock()?;
    let tx = WriteScope::begin(&mut conn)?;

    let categories: Vec<(String, String)> = {
        let mut stmt = tx.prepare("SELECT id, name FROM categories WHERE record_state = 'active'")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut summary = ImportSummary::default();
    let now = encode_ts(&Utc::now());
    {
        let mut insert = tx.prepare(
            "INSERT INTO drugs (id, name, category_id, rate, price, created, modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )?;
        for record in records.iter().take(limit) {
            let Some(name) = record.drug_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) else {
                summary.skipped += 1;
                continue;
            };
            if !(0.0..=DRUG_RATE_MAX).contains(&record.rating) {
                warn!("Skipping '{}': rating {} out of range", name, record.rating);
                summary.skipped += 1;
                continue;
            }
            let price = match record.price {
                Some(price) if price >= 0.0 => price,
                Some(price) => {
                    warn!("Skipping '{}': negative price {}", name, price);
                    summary.skipped += 1;
                    continue;
                }
                None => f64::from(rng.gen_range(IMPORT_PRICE_MIN..=IMPORT_PRICE_MAX)),
            };
            let category = record
                .category
                .as_deref()
                .and_then(|wanted| categories.iter().find(|(_, n)| n.eq_ignore_ascii_case(wanted.trim())))
                .or_else(|| categories.choose(rng))
                .map(|(id, _)| id.clone());

            insert.execute(params![Uuid::new_v4().to_string(), name, category, record.rating, price, now])?;
            summary.imported += 1;
        }
    }
    tx.commit()?;

    info!("Imported {} drugs ({} skipped)", summary.imported, summary.skipped);
    Ok(summary)
}

/// Insert the default categories when the catalog has none. Returns how many
/// were inserted.
pub fn seed_categories(db: &Database) -> Result<usize> {
    if db.count_categories()? > 0 {
        info!("Categories exist, nothing to seed");
        return Ok(0);
    }

    let mut conn = db.lock()?;
    let tx = WriteScope::begin(&mut conn)?;
    {
        let mut insert = tx.prepare("INSERT INTO categories (id, name, created, modified) VALUES (?1, ?2, ?3, ?3)")?;
        for name in DEFAULT_CATEGORIES {
            insert.execute(params![Uuid::new_v4().to_string(), name, encode_ts(&Utc::now())])?;
        }
    }
    tx.commit()?;

    info!("Seeded {} categories", DEFAULT_CATEGORIES.len());
    Ok(DEFAULT_CATEGORIES.len())
}
