use anyhow::Result;
use rx_ledger::reconcile::{reconcile, ReconcileStats, SyncOptions};
use rx_ledger::storage::{PrescriptionLines, ResolvedLine};
use rx_ledger::totals::recompute_total;
use rx_ledger::types::{DrugInput, LineInput, PharmacyInput, PrescriptionDraft, PrescriptionPatch};
use rx_ledger::{Database, LedgerError, WriteScope};
use uuid::Uuid;

struct Ledger {
    db: Database,
    workspace: Uuid,
    prescription: Uuid,
    drugs: Vec<Uuid>,
}

fn ledger() -> Result<Ledger> {
    let db = Database::open_in_memory()?;
    let workspace = db.create_workspace("North", "alice")?.id;
    let pharmacy = db
        .create_pharmacy(
            workspace,
            &PharmacyInput {
                name: "Central".to_string(),
                address: "1 Main Street".to_string(),
                phone: "0123456789".to_string(),
                email: None,
            },
        )?
        .id;
    let mut drugs = Vec::new();
    for (name, price) in [("D1", 100.0), ("D2", 25.0), ("D3", 4.0)] {
        drugs.push(
            db.create_drug(&DrugInput {
                name: name.to_string(),
                price,
                ..DrugInput::default()
            })?
            .id,
        );
    }
    let prescription = db
        .create_prescription(
            workspace,
            &PrescriptionDraft {
                pharmacy_id: pharmacy,
                ..PrescriptionDraft::default()
            },
        )?
        .prescription
        .prescription
        .id;
    Ok(Ledger {
        db,
        workspace,
        prescription,
        drugs,
    })
}

fn resolved(drug: Uuid, quantity: u32, price: f64) -> ResolvedLine {
    ResolvedLine {
        drug_id: drug,
        quantity,
        price_at_the_time: price,
        is_available: true,
    }
}

/// Reconcile inside a fresh write scope, commit, then recompute the total.
fn sync(ledger: &Ledger, desired: &[ResolvedLine], options: SyncOptions) -> Result<(ReconcileStats, f64)> {
    let mut conn = ledger.db.lock()?;
    let tx = WriteScope::begin(&mut conn)?;
    let stats = reconcile(&tx, &PrescriptionLines, &ledger.prescription, desired, options)?;
    tx.commit()?;
    let total = recompute_total(&conn, ledger.prescription)?;
    Ok((stats, total))
}

fn active_line_count(ledger: &Ledger) -> Result<i64> {
    let conn = ledger.db.lock()?;
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM prescription_lines WHERE prescription_id = ?1 AND record_state = 'active'",
        [ledger.prescription.to_string()],
        |row| row.get(0),
    )?)
}

#[test]
fn scenario_a_first_sync_creates() -> Result<()> {
    let ledger = ledger()?;
    let (stats, total) = sync(&ledger, &[resolved(ledger.drugs[0], 2, 100.0)], SyncOptions::default())?;

    assert_eq!(stats, ReconcileStats { created: 1, updated: 0, deleted: 0 });
    assert_eq!(total, 200.0);
    Ok(())
}

#[test]
fn scenario_b_repeat_sync_updates_in_place() -> Result<()> {
    let ledger = ledger()?;
    let desired = [resolved(ledger.drugs[0], 2, 100.0)];
    sync(&ledger, &desired, SyncOptions::default())?;

    let (stats, total) = sync(&ledger, &desired, SyncOptions::default())?;
    assert_eq!(stats, ReconcileStats { created: 0, updated: 1, deleted: 0 });
    assert_eq!(total, 200.0);
    assert_eq!(active_line_count(&ledger)?, 1);
    Ok(())
}

#[test]
fn scenario_c_empty_desired_retires_everything() -> Result<()> {
    let ledger = ledger()?;
    sync(
        &ledger,
        &[resolved(ledger.drugs[0], 1, 100.0), resolved(ledger.drugs[1], 3, 25.0)],
        SyncOptions::default(),
    )?;

    let (stats, total) = sync(&ledger, &[], SyncOptions::default())?;
    assert_eq!(stats, ReconcileStats { created: 0, updated: 0, deleted: 2 });
    assert_eq!(total, 0.0);
    assert_eq!(active_line_count(&ledger)?, 0);

    let conn = ledger.db.lock()?;
    let retained: i64 = conn.query_row(
        "SELECT COUNT(*) FROM prescription_lines WHERE prescription_id = ?1",
        [ledger.prescription.to_string()],
        |row| row.get(0),
    )?;
    assert_eq!(retained, 2, "retired rows stay for audit");
    Ok(())
}

#[test]
fn mixed_sync_conserves_counts() -> Result<()> {
    let ledger = ledger()?;
    sync(
        &ledger,
        &[resolved(ledger.drugs[0], 1, 100.0), resolved(ledger.drugs[1], 1, 25.0)],
        SyncOptions::default(),
    )?;

    let desired = [resolved(ledger.drugs[1], 4, 25.0), resolved(ledger.drugs[2], 5, 4.0)];
    let (stats, total) = sync(&ledger, &desired, SyncOptions::default())?;

    assert_eq!(stats.created + stats.updated, desired.len());
    assert_eq!(stats, ReconcileStats { created: 1, updated: 1, deleted: 1 });
    assert_eq!(total, 4.0 * 25.0 + 5.0 * 4.0);
    assert_eq!(active_line_count(&ledger)?, 2);
    Ok(())
}

#[test]
fn unavailable_lines_do_not_count_towards_total() -> Result<()> {
    let ledger = ledger()?;
    let mut unavailable = resolved(ledger.drugs[1], 2, 25.0);
    unavailable.is_available = false;
    let (_, total) = sync(
        &ledger,
        &[resolved(ledger.drugs[0], 1, 100.0), unavailable],
        SyncOptions::default(),
    )?;
    assert_eq!(total, 100.0);
    Ok(())
}

#[test]
fn dangling_drug_rolls_back_whole_sync() -> Result<()> {
    let ledger = ledger()?;
    sync(&ledger, &[resolved(ledger.drugs[0], 1, 100.0)], SyncOptions::default())?;

    let desired = [resolved(ledger.drugs[1], 1, 25.0), resolved(Uuid::new_v4(), 1, 1.0)];
    let err = sync(&ledger, &desired, SyncOptions::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::ConstraintViolation(_))
    ));

    // The earlier line is neither retired nor joined by the valid new one.
    let lines = ledger.db.get_prescription(ledger.workspace, ledger.prescription)?.lines;
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].drug_id, ledger.drugs[0]);
    Ok(())
}

#[test]
fn duplicate_keys_rejected_before_any_write() -> Result<()> {
    let ledger = ledger()?;
    let desired = [resolved(ledger.drugs[0], 1, 100.0), resolved(ledger.drugs[0], 2, 100.0)];
    let err = sync(&ledger, &desired, SyncOptions::default()).unwrap_err();
    assert!(matches!(err.downcast_ref::<LedgerError>(), Some(LedgerError::Validation(_))));
    assert_eq!(active_line_count(&ledger)?, 0);
    Ok(())
}

#[test]
fn skipped_phases_report_zero() -> Result<()> {
    let ledger = ledger()?;
    sync(&ledger, &[resolved(ledger.drugs[0], 1, 100.0)], SyncOptions::default())?;

    let options = SyncOptions {
        skip_deletes: true,
        ..SyncOptions::default()
    };
    let (stats, _) = sync(&ledger, &[resolved(ledger.drugs[1], 1, 25.0)], options)?;
    assert_eq!(stats, ReconcileStats { created: 1, updated: 0, deleted: 0 });
    assert_eq!(active_line_count(&ledger)?, 2);
    Ok(())
}

#[test]
fn update_path_reconciles_and_refreshes_total() -> Result<()> {
    let ledger = ledger()?;
    let line = |drug: Uuid, quantity: u32| LineInput {
        drug_id: drug,
        quantity,
        price_at_the_time: None,
        is_available: None,
    };

    let first = ledger.db.update_prescription(
        ledger.workspace,
        ledger.prescription,
        &PrescriptionPatch {
            lines: Some(vec![line(ledger.drugs[0], 2), line(ledger.drugs[1], 1)]),
            ..PrescriptionPatch::default()
        },
    )?;
    assert_eq!(first.lines_sync, ReconcileStats { created: 2, updated: 0, deleted: 0 });
    assert_eq!(first.prescription.prescription.total_price, 225.0);

    let second = ledger.db.update_prescription(
        ledger.workspace,
        ledger.prescription,
        &PrescriptionPatch {
            lines: Some(vec![line(ledger.drugs[1], 1)]),
            ..PrescriptionPatch::default()
        },
    )?;
    assert_eq!(second.lines_sync, ReconcileStats { created: 0, updated: 1, deleted: 1 });
    assert_eq!(second.prescription.prescription.total_price, 25.0);
    Ok(())
}
