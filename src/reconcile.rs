//! Set reconciliation of a child collection against a desired list.
//!
//! Clients describe child rows by business key only (e.g. "drug X, quantity
//! 2"), never by row id. [`reconcile`] infers row identity from key equality
//! and makes the table match the desired list:
//!
//! 1. read every row of the scope, active or retired, under the write lock
//!    already held by the [`WriteScope`]
//! 2. diff the desired list against those rows by key
//! 3. insert unmatched desired items in one batch
//! 4. overwrite the payload of matched rows in one batch (reviving retired ones)
//! 5. retire active rows whose key is no longer desired
//!
//! Everything runs inside the caller's transaction; an error in any phase
//! leaves nothing applied once the scope is dropped.

use crate::db::WriteScope;
use crate::error::{LedgerError, Result};
use crate::types::RecordState;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use tracing::debug;
use uuid::Uuid;

/// Something with a business identity independent of its row id.
pub trait Keyed {
    type Key: Eq + Hash + Clone + Debug;

    fn key(&self) -> Self::Key;
}

/// A row already present in the scope, as seen by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingRow<K> {
    pub id: Uuid,
    pub key: K,
    pub state: RecordState,
}

/// Storage of one child entity family that can be reconciled.
pub trait SyncTable {
    type Item: Keyed;
    /// Which rows participate, e.g. "lines of prescription P".
    type Scope;

    /// All rows of the scope, retired included.
    fn lock_scope(
        &self,
        tx: &WriteScope<'_>,
        scope: &Self::Scope,
    ) -> Result<Vec<ExistingRow<<Self::Item as Keyed>::Key>>>;

    fn insert_batch(&self, tx: &WriteScope<'_>, scope: &Self::Scope, items: &[&Self::Item]) -> Result<()>;

    /// Overwrite payload fields of existing rows and mark them active.
    fn update_batch(
        &self,
        tx: &WriteScope<'_>,
        scope: &Self::Scope,
        rows: &[(Uuid, &Self::Item)],
    ) -> Result<()>;

    fn retire_batch(&self, tx: &WriteScope<'_>, ids: &[Uuid]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub skip_creates: bool,
    pub skip_updates: bool,
    pub skip_deletes: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Outcome of diffing existing rows against the desired list.
#[derive(Debug)]
pub struct ReconcilePlan<'a, T> {
    pub creates: Vec<&'a T>,
    pub updates: Vec<(Uuid, &'a T)>,
    pub retires: Vec<Uuid>,
}

/// Reject desired lists in which two items share a key.
pub fn ensure_unique_keys<T: Keyed>(desired: &[T]) -> Result<()> {
    let mut seen = HashSet::with_capacity(desired.len());
    for item in desired {
        let key = item.key();
        if !seen.insert(key.clone()) {
            return Err(LedgerError::Validation(format!(
                "duplicate key {key:?} in desired items"
            )));
        }
    }
    Ok(())
}

/// Three-way diff of `existing` rows against `desired` items.
///
/// Matched rows are popped from the key map while partitioning, so whatever
/// remains afterwards is exactly the set no longer desired. Only the active
/// part of that remainder is retired.
pub fn plan<T: Keyed>(existing: Vec<ExistingRow<T::Key>>, desired: &[T]) -> Result<ReconcilePlan<'_, T>> {
    ensure_unique_keys(desired)?;

    let mut by_key: HashMap<T::Key, ExistingRow<T::Key>> = HashMap::with_capacity(existing.len());
    for row in existing {
        if let Some(previous) = by_key.insert(row.key.clone(), row) {
            return Err(LedgerError::ConsistencyAssertion(format!(
                "scope holds two rows with key {:?} (row {})",
                previous.key, previous.id
            )));
        }
    }

    let mut creates = Vec::new();
    let mut updates = Vec::new();
    for item in desired {
        match by_key.remove(&item.key()) {
            Some(row) => updates.push((row.id, item)),
            None => creates.push(item),
        }
    }

    let mut retires: Vec<Uuid> = by_key
        .into_values()
        .filter(|row| row.state == RecordState::Active)
        .map(|row| row.id)
        .collect();
    retires.sort();

    debug_assert_eq!(creates.len() + updates.len(), desired.len());

    Ok(ReconcilePlan {
        creates,
        updates,
        retires,
    })
}

/// Make the rows of `scope` in `table` match `desired`.
pub fn reconcile<S: SyncTable>(
    tx: &WriteScope<'_>,
    table: &S,
    scope: &S::Scope,
    desired: &[S::Item],
    options: SyncOptions,
) -> Result<ReconcileStats> {
    ensure_unique_keys(desired)?;

    let existing = table.lock_scope(tx, scope)?;
    let plan = plan(existing, desired)?;

    let mut stats = ReconcileStats::default();

    if !options.skip_creates && !plan.creates.is_empty() {
        table.insert_batch(tx, scope, &plan.creates)?;
        stats.created = plan.creates.len();
    }

    if !options.skip_updates && !plan.updates.is_empty() {
        table.update_batch(tx, scope, &plan.updates)?;
        stats.updated = plan.updates.len();
    }

    if !options.skip_deletes && !plan.retires.is_empty() {
        table.retire_batch(tx, &plan.retires)?;
        stats.deleted = plan.retires.len();
    }

    crate::metrics::record_reconcile(&stats);
    debug!(
        "{} created, {} updated, {} deleted",
        stats.created, stats.updated, stats.deleted
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Line {
        drug: &'static str,
        qty: u32,
    }

    impl Keyed for Line {
        type Key = &'static str;

        fn key(&self) -> Self::Key {
            self.drug
        }
    }

    fn row(id: u128, key: &'static str, state: RecordState) -> ExistingRow<&'static str> {
        ExistingRow {
            id: Uuid::from_u128(id),
            key,
            state,
        }
    }

    #[test]
    fn test_plan_partitions_by_key() {
        let existing = vec![
            row(1, "a", RecordState::Active),
            row(2, "b", RecordState::Active),
        ];
        let desired = vec![Line { drug: "b", qty: 3 }, Line { drug: "c", qty: 1 }];

        let plan = plan(existing, &desired).unwrap();
        assert_eq!(plan.creates, vec![&desired[1]]);
        assert_eq!(plan.updates, vec![(Uuid::from_u128(2), &desired[0])]);
        assert_eq!(plan.retires, vec![Uuid::from_u128(1)]);
    }

    #[test]
    fn test_plan_revives_retired_row_instead_of_creating() {
        let existing = vec![row(7, "a", RecordState::Retired)];
        let desired = vec![Line { drug: "a", qty: 1 }];

        let plan = plan(existing, &desired).unwrap();
        assert!(plan.creates.is_empty());
        assert_eq!(plan.updates.len(), 1);
        assert!(plan.retires.is_empty());
    }

    #[test]
    fn test_plan_leaves_unmatched_retired_rows_alone() {
        let existing = vec![
            row(1, "a", RecordState::Retired),
            row(2, "b", RecordState::Active),
        ];
        let desired: Vec<Line> = vec![];

        let plan = plan(existing, &desired).unwrap();
        assert_eq!(plan.retires, vec![Uuid::from_u128(2)]);
    }

    #[test]
    fn test_duplicate_desired_keys_rejected() {
        let desired = vec![Line { drug: "a", qty: 1 }, Line { drug: "a", qty: 2 }];
        let err = plan(vec![], &desired).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_plan_conserves_desired_count() {
        let existing = vec![
            row(1, "a", RecordState::Active),
            row(2, "b", RecordState::Retired),
            row(3, "x", RecordState::Active),
        ];
        let desired = vec![
            Line { drug: "a", qty: 1 },
            Line { drug: "b", qty: 1 },
            Line { drug: "c", qty: 1 },
            Line { drug: "d", qty: 1 },
        ];
        let plan = plan(existing, &desired).unwrap();
        assert_eq!(plan.creates.len() + plan.updates.len(), desired.len());
        assert_eq!(plan.retires, vec![Uuid::from_u128(3)]);
    }
}
