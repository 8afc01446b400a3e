//! Drug categories and drugs.

use super::{normalize_keyword, now_ts, opt_uuid_column, require_text, ts_column, uuid_column};
use crate::constants::{BULK_CREATED_DRUG_PRICE, DRUG_KEY_MAX, DRUG_RATE_MAX};
use crate::db::{like_pattern, Database, WriteScope};
use crate::error::{LedgerError, Result};
use crate::types::{Category, CategoryRatio, Drug, DrugFilter, DrugInput};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

const CATEGORY_COLUMNS: &str = "id, name, created, modified";

const DRUG_SELECT: &str = "SELECT d.id, d.name, d.category_id, c.name, d.rate, d.price, d.key, d.created, d.modified
       FROM drugs d
       LEFT JOIN categories c ON c.id = d.category_id AND c.record_state = 'active'
      WHERE d.record_state = 'active'";

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: uuid_column(row, 0)?,
        name: row.get(1)?,
        created: ts_column(row, 2)?,
        modified: ts_column(row, 3)?,
    })
}

fn drug_from_row(row: &Row<'_>) -> rusqlite::Result<Drug> {
    Ok(Drug {
        id: uuid_column(row, 0)?,
        name: row.get(1)?,
        category_id: opt_uuid_column(row, 2)?,
        category_name: row.get(3)?,
        rate: row.get(4)?,
        price: row.get(5)?,
        key: row.get(6)?,
        created: ts_column(row, 7)?,
        modified: ts_column(row, 8)?,
    })
}

fn validate_drug(input: &DrugInput) -> Result<()> {
    require_text("drug name", &input.name, None)?;
    if !(0.0..=DRUG_RATE_MAX).contains(&input.rate) {
        return Err(LedgerError::validation(format!(
            "rate must be between 0 and {DRUG_RATE_MAX}"
        )));
    }
    if input.price < 0.0 || !input.price.is_finite() {
        return Err(LedgerError::validation("price must be a non-negative number"));
    }
    if let Some(key) = &input.key {
        if key.chars().count() > DRUG_KEY_MAX {
            return Err(LedgerError::validation(format!(
                "key must be at most {DRUG_KEY_MAX} characters"
            )));
        }
    }
    Ok(())
}

fn ensure_category_exists(conn: &Connection, id: Uuid) -> Result<()> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM categories WHERE id = ?1 AND record_state = 'active'",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(LedgerError::not_found(format!("category {id}"))),
    }
}

fn load_category(conn: &Connection, id: Uuid) -> Result<Category> {
    conn.query_row(
        &format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?1 AND record_state = 'active'"),
        params![id.to_string()],
        category_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found(format!("category {id}")))
}

fn load_drug(conn: &Connection, id: Uuid) -> Result<Drug> {
    conn.query_row(&format!("{DRUG_SELECT} AND d.id = ?1"), params![id.to_string()], drug_from_row)
        .optional()?
        .ok_or_else(|| LedgerError::not_found(format!("drug {id}")))
}

impl Database {
    pub fn create_category(&self, name: &str) -> Result<Category> {
        require_text("category name", name, None)?;
        let conn = self.lock()?;
        let id = Uuid::new_v4();
        let now = now_ts();
        conn.execute(
            "INSERT INTO categories (id, name, created, modified) VALUES (?1, ?2, ?3, ?3)",
            params![id.to_string(), name.trim(), now],
        )?;
        info!("Created category '{}' ({})", name.trim(), id);
        load_category(&conn, id)
    }

    pub fn get_category(&self, id: Uuid) -> Result<Category> {
        let conn = self.lock()?;
        load_category(&conn, id)
    }

    /// Active categories, newest first, optionally filtered by name.
    pub fn list_categories(&self, keyword: Option<&str>) -> Result<Vec<Category>> {
        let conn = self.lock()?;
        let keyword = normalize_keyword(keyword).map(|k| like_pattern(&k));
        let mut stmt = conn.prepare(&format!(
            "SELECT {CATEGORY_COLUMNS} FROM categories
              WHERE record_state = 'active'
                AND (?1 IS NULL OR name LIKE ?1 ESCAPE '\\')
              ORDER BY created DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![keyword], category_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn rename_category(&self, id: Uuid, name: &str) -> Result<Category> {
        require_text("category name", name, None)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE categories SET name = ?1, modified = ?2 WHERE id = ?3 AND record_state = 'active'",
            params![name.trim(), now_ts(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found(format!("category {id}")));
        }
        load_category(&conn, id)
    }

    pub fn retire_category(&self, id: Uuid) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE categories SET record_state = 'retired', modified = ?1 WHERE id = ?2 AND record_state = 'active'",
            params![now_ts(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found(format!("category {id}")));
        }
        info!("Retired category {}", id);
        Ok(())
    }

    /// Active drugs inside `id` versus every other active drug.
    pub fn category_ratio(&self, id: Uuid) -> Result<CategoryRatio> {
        let conn = self.lock()?;
        ensure_category_exists(&conn, id)?;
        let (category, other) = conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN category_id = ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN category_id IS NULL OR category_id <> ?1 THEN 1 ELSE 0 END), 0)
               FROM drugs WHERE record_state = 'active'",
            params![id.to_string()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(CategoryRatio { category, other })
    }

    pub fn create_drug(&self, input: &DrugInput) -> Result<Drug> {
        validate_drug(input)?;
        let conn = self.lock()?;
        if let Some(category_id) = input.category_id {
            ensure_category_exists(&conn, category_id)?;
        }
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO drugs (id, name, category_id, rate, price, key, created, modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id.to_string(),
                input.name.trim(),
                input.category_id.map(|c| c.to_string()),
                input.rate,
                input.price,
                input.key,
                now_ts()
            ],
        )?;
        info!("Created drug '{}' ({})", input.name.trim(), id);
        load_drug(&conn, id)
    }

    pub fn get_drug(&self, id: Uuid) -> Result<Drug> {
        let conn = self.lock()?;
        load_drug(&conn, id)
    }

    pub fn update_drug(&self, id: Uuid, input: &DrugInput) -> Result<Drug> {
        validate_drug(input)?;
        let conn = self.lock()?;
        if let Some(category_id) = input.category_id {
            ensure_category_exists(&conn, category_id)?;
        }
        let changed = conn.execute(
            "UPDATE drugs SET name = ?1, category_id = ?2, rate = ?3, price = ?4, key = ?5, modified = ?6
              WHERE id = ?7 AND record_state = 'active'",
            params![
                input.name.trim(),
                input.category_id.map(|c| c.to_string()),
                input.rate,
                input.price,
                input.key,
                now_ts(),
                id.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found(format!("drug {id}")));
        }
        load_drug(&conn, id)
    }

    pub fn retire_drug(&self, id: Uuid) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE drugs SET record_state = 'retired', modified = ?1 WHERE id = ?2 AND record_state = 'active'",
            params![now_ts(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(LedgerError::not_found(format!("drug {id}")));
        }
        info!("Retired drug {}", id);
        Ok(())
    }

    /// Active drugs matching `filter`. Keyword hits on `key` rank above hits
    /// on `name`; ties go to the most recently modified drug.
    pub fn list_drugs(&self, filter: &DrugFilter) -> Result<Vec<Drug>> {
        if let (Some(from), Some(to)) = (filter.price_from, filter.price_to) {
            if from > to {
                return Err(LedgerError::validation("price filter range is invalid"));
            }
        }
        let keyword = normalize_keyword(filter.keyword.as_deref()).map(|k| like_pattern(&k));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{DRUG_SELECT}
                AND (?1 IS NULL OR d.key LIKE ?1 ESCAPE '\\' OR d.name LIKE ?1 ESCAPE '\\')
                AND (?2 IS NULL OR d.price >= ?2)
                AND (?3 IS NULL OR d.price <= ?3)
              ORDER BY CASE WHEN ?1 IS NOT NULL AND d.key LIKE ?1 ESCAPE '\\' THEN 0 ELSE 1 END,
                       d.modified DESC, d.rowid DESC"
        ))?;
        let rows = stmt.query_map(params![keyword, filter.price_from, filter.price_to], drug_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Create one drug per distinct name, all or nothing. New drugs land in
    /// the oldest category with the placeholder bulk price.
    pub fn bulk_create_drugs(&self, names: &[String]) -> Result<Vec<Drug>> {
        let mut seen = HashSet::new();
        let names: Vec<&str> = names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .filter(|n| seen.insert(n.to_string()))
            .collect();
        if names.is_empty() {
            return Err(LedgerError::validation("at least one drug name is required"));
        }

        let mut conn = self.lock()?;
        let tx = WriteScope::begin(&mut conn)?;

        for name in &names {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM drugs WHERE name = ?1 AND record_state = 'active' LIMIT 1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(LedgerError::validation(format!("{name} exists in the inventory")));
            }
        }

        let category: Option<String> = tx
            .query_row(
                "SELECT id FROM categories WHERE record_state = 'active' ORDER BY created ASC, rowid ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let now = now_ts();
        let mut ids = Vec::with_capacity(names.len());
        {
            let mut insert = tx.prepare(
                "INSERT INTO drugs (id, name, category_id, rate, price, created, modified)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5)",
            )?;
            for name in &names {
                let id = Uuid::new_v4();
                insert.execute(params![id.to_string(), name, category, BULK_CREATED_DRUG_PRICE, now])?;
                ids.push(id);
            }
        }

        let drugs = ids
            .iter()
            .map(|id| load_drug(&tx, *id))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;

        info!("Bulk created {} drugs", drugs.len());
        Ok(drugs)
    }

    pub(crate) fn count_categories(&self) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM categories WHERE record_state = 'active'",
            [],
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drug(name: &str, price: f64, key: Option<&str>) -> DrugInput {
        DrugInput {
            name: name.to_string(),
            price,
            key: key.map(str::to_string),
            ..DrugInput::default()
        }
    }

    #[test]
    fn test_category_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let cat = db.create_category("antibiotics").unwrap();
        assert_eq!(db.get_category(cat.id).unwrap().name, "antibiotics");

        let renamed = db.rename_category(cat.id, "anti-infectives").unwrap();
        assert_eq!(renamed.name, "anti-infectives");
        assert_eq!(db.list_categories(Some("infect")).unwrap().len(), 1);

        db.retire_category(cat.id).unwrap();
        assert!(matches!(db.get_category(cat.id), Err(LedgerError::NotFound(_))));
        assert!(db.list_categories(None).unwrap().is_empty());
    }

    #[test]
    fn test_drug_validation() {
        let db = Database::open_in_memory().unwrap();
        let mut input = drug("Aspirin", -1.0, None);
        assert!(matches!(db.create_drug(&input), Err(LedgerError::Validation(_))));
        input.price = 1.0;
        input.rate = 11.0;
        assert!(matches!(db.create_drug(&input), Err(LedgerError::Validation(_))));
        input.rate = 4.5;
        input.category_id = Some(Uuid::new_v4());
        assert!(matches!(db.create_drug(&input), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn test_drug_keyword_ranks_key_match_first() {
        let db = Database::open_in_memory().unwrap();
        let by_name = db.create_drug(&drug("Paracetamol", 10.0, Some("P-100"))).unwrap();
        let by_key = db.create_drug(&drug("Ibuprofen", 20.0, Some("para-ib"))).unwrap();
        db.create_drug(&drug("Codeine", 30.0, None)).unwrap();

        let hits = db
            .list_drugs(&DrugFilter {
                keyword: Some("para".to_string()),
                ..DrugFilter::default()
            })
            .unwrap();
        let ids: Vec<Uuid> = hits.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![by_key.id, by_name.id]);
    }

    #[test]
    fn test_drug_price_filter() {
        let db = Database::open_in_memory().unwrap();
        db.create_drug(&drug("A", 5.0, None)).unwrap();
        db.create_drug(&drug("B", 15.0, None)).unwrap();
        db.create_drug(&drug("C", 25.0, None)).unwrap();

        let hits = db
            .list_drugs(&DrugFilter {
                price_from: Some(10.0),
                price_to: Some(20.0),
                ..DrugFilter::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "B");

        let err = db
            .list_drugs(&DrugFilter {
                price_from: Some(20.0),
                price_to: Some(10.0),
                ..DrugFilter::default()
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "Validation error: price filter range is invalid");
    }

    #[test]
    fn test_keyword_wildcards_are_literal() {
        let db = Database::open_in_memory().unwrap();
        db.create_drug(&drug("50% solution", 1.0, None)).unwrap();
        db.create_drug(&drug("500 tablets", 1.0, None)).unwrap();
        let hits = db
            .list_drugs(&DrugFilter {
                keyword: Some("50%".to_string()),
                ..DrugFilter::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_bulk_create_uses_oldest_category_and_dedupes() {
        let db = Database::open_in_memory().unwrap();
        let oldest = db.create_category("first").unwrap();
        db.create_category("second").unwrap();

        let names = vec!["Aspirin".to_string(), " Aspirin ".to_string(), "Heparin".to_string()];
        let drugs = db.bulk_create_drugs(&names).unwrap();
        assert_eq!(drugs.len(), 2);
        assert!(drugs.iter().all(|d| d.category_id == Some(oldest.id)));
        assert!(drugs.iter().all(|d| d.price == BULK_CREATED_DRUG_PRICE));
    }

    #[test]
    fn test_bulk_create_rejects_existing_name_atomically() {
        let db = Database::open_in_memory().unwrap();
        db.create_drug(&drug("Heparin", 3.0, None)).unwrap();

        let names = vec!["Aspirin".to_string(), "Heparin".to_string()];
        let err = db.bulk_create_drugs(&names).unwrap_err();
        assert_eq!(err.to_string(), "Validation error: Heparin exists in the inventory");
        assert_eq!(db.list_drugs(&DrugFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_category_ratio() {
        let db = Database::open_in_memory().unwrap();
        let cat = db.create_category("cardio").unwrap();
        let mut input = drug("A", 1.0, None);
        input.category_id = Some(cat.id);
        db.create_drug(&input).unwrap();
        db.create_drug(&drug("B", 1.0, None)).unwrap();
        db.create_drug(&drug("C", 1.0, None)).unwrap();

        assert_eq!(db.category_ratio(cat.id).unwrap(), CategoryRatio { category: 1, other: 2 });
    }
}
