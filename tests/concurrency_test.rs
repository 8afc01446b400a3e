use anyhow::Result;
use rx_ledger::types::{DrugInput, LineInput, PharmacyInput, PrescriptionDraft, PrescriptionPatch};
use rx_ledger::{Database, WriteScope};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use uuid::Uuid;

fn line(drug: Uuid, quantity: u32) -> LineInput {
    LineInput {
        drug_id: drug,
        quantity,
        price_at_the_time: None,
        is_available: None,
    }
}

#[test]
fn write_scope_blocks_second_writer_until_commit() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ledger.db");
    let first = Database::open_path(&path)?;
    let second = Database::open_path(&path)?;

    let (locked_tx, locked_rx) = mpsc::channel();
    let holder = thread::spawn(move || -> Result<()> {
        let mut conn = first.lock()?;
        let scope = WriteScope::begin(&mut conn)?;
        scope.execute(
            "INSERT INTO workspaces (id, name, owner, created, modified)
             VALUES ('w1', 'held', 'alice', '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:00.000000Z')",
            [],
        )?;
        locked_tx.send(())?;
        thread::sleep(Duration::from_millis(300));
        scope.commit()?;
        Ok(())
    });

    locked_rx.recv()?;
    let started = Instant::now();
    {
        let mut conn = second.lock()?;
        let scope = WriteScope::begin(&mut conn)?;
        // Acquired only after the holder committed, so its row is visible.
        let count: i64 = scope.query_row("SELECT COUNT(*) FROM workspaces WHERE id = 'w1'", [], |row| row.get(0))?;
        assert_eq!(count, 1);
        scope.commit()?;
    }
    assert!(started.elapsed() >= Duration::from_millis(200));

    holder.join().expect("holder thread panicked")?;
    Ok(())
}

#[test]
fn concurrent_updates_of_one_prescription_serialize() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ledger.db");
    let setup = Database::open_path(&path)?;

    let workspace = setup.create_workspace("North", "alice")?.id;
    let pharmacy = setup
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
    for i in 0..6 {
        drugs.push(
            setup
                .create_drug(&DrugInput {
                    name: format!("drug-{i}"),
                    price: 10.0,
                    ..DrugInput::default()
                })?
                .id,
        );
    }
    let prescription = setup
        .create_prescription(
            workspace,
            &PrescriptionDraft {
                pharmacy_id: pharmacy,
                lines: vec![line(drugs[0], 1)],
                ..PrescriptionDraft::default()
            },
        )?
        .prescription
        .prescription
        .id;

    // Each writer has its own connection; only SQLite's write lock orders them.
    let sets: Vec<Vec<Uuid>> = vec![drugs[0..3].to_vec(), drugs[2..6].to_vec()];
    let barrier = Arc::new(Barrier::new(sets.len()));
    let handles: Vec<_> = sets
        .iter()
        .cloned()
        .map(|set| {
            let path = path.clone();
            let barrier = barrier.clone();
            thread::spawn(move || -> Result<()> {
                let db = Database::open_path(&path)?;
                barrier.wait();
                for _ in 0..5 {
                    db.update_prescription(
                        workspace,
                        prescription,
                        &PrescriptionPatch {
                            lines: Some(set.iter().map(|d| line(*d, 2)).collect()),
                            ..PrescriptionPatch::default()
                        },
                    )?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread panicked")?;
    }

    let result = setup.get_prescription(workspace, prescription)?;
    let mut final_set: Vec<Uuid> = result.lines.iter().map(|l| l.drug_id).collect();
    final_set.sort();
    let matches_one_writer = sets.iter().any(|set| {
        let mut expected = set.clone();
        expected.sort();
        expected == final_set
    });
    assert!(matches_one_writer, "final lines must equal one writer's desired set");
    assert_eq!(result.prescription.total_price, 20.0 * final_set.len() as f64);

    let conn = setup.lock()?;
    let duplicates: i64 = conn.query_row(
        "SELECT COUNT(*) FROM (
            SELECT drug_id FROM prescription_lines
             WHERE prescription_id = ?1 AND record_state = 'active'
             GROUP BY drug_id HAVING COUNT(*) > 1)",
        [prescription.to_string()],
        |row| row.get(0),
    )?;
    assert_eq!(duplicates, 0);
    Ok(())
}
