//! PostgreSQL-backed store tests.
//!
//! Skipped unless TEST_DATABASE_URL points at a disposable database.

mod common;

use chrono::Utc;
use common::{init_tracing, HEADER};
use reconciliation_service::jobs::{IngestionService, JobProcessor, TaskQueue};
use reconciliation_service::models::{
    Actor, AuditAction, AuditSource, ColumnMapping, IngestedRecord, JobStatus, MatchStatus,
    NewAuditEntry, NewUploadJob, Snapshot, SnapshotValue, DEFAULT_TOLERANCE,
};
use reconciliation_service::services::{
    AuditStore, ConfigStore, Database, JobStore, RecordStore, StoreError, Stores,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

async fn connect() -> Option<Arc<Database>> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    init_tracing();
    let db = Database::new(&url, 5, 1)
        .await
        .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Failed to run migrations");
    Some(Arc::new(db))
}

async fn new_job(db: &Database) -> Uuid {
    db.create_job(NewUploadJob {
        user_id: Uuid::new_v4(),
        file_name: "bank.csv".to_string(),
        file_path: "/tmp/bank.csv".to_string(),
        file_hash: Uuid::new_v4().simple().to_string(),
        file_size: 10,
    })
    .await
    .expect("Failed to create job")
    .id
}

fn record(job_id: Uuid, transaction_id: &str, reference: &str, amount: i64) -> IngestedRecord {
    IngestedRecord {
        id: Uuid::new_v4(),
        upload_job_id: job_id,
        transaction_id: transaction_id.to_string(),
        ref_number: reference.to_string(),
        amount: Decimal::new(amount, 2),
        date: None,
        created_utc: Utc::now(),
    }
}

#[tokio::test]
async fn audit_rows_cannot_be_changed_or_removed() {
    let Some(db) = connect().await else { return };
    let entry = db
        .append_entry(NewAuditEntry {
            record_id: Some(Uuid::new_v4()),
            upload_job_id: None,
            action: AuditAction::ManualUpdate,
            field_name: Some("amount".to_string()),
            old_value: Some(Snapshot::new().with("amount", SnapshotValue::Decimal(Decimal::ONE))),
            new_value: Some(Snapshot::new().with("amount", SnapshotValue::Decimal(Decimal::TWO))),
            actor: Actor::User {
                id: Uuid::new_v4(),
                email: "reviewer@example.com".to_string(),
                role: "analyst".to_string(),
            },
            source: AuditSource::Ui,
            description: "Manual correction: Amount: 1 → 2".to_string(),
        })
        .await
        .unwrap();

    let update = sqlx::query("UPDATE audit_logs SET description = 'edited' WHERE audit_id = $1")
        .bind(entry.id)
        .execute(db.pool())
        .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM audit_logs WHERE audit_id = $1")
        .bind(entry.id)
        .execute(db.pool())
        .await;
    assert!(delete.is_err());

    let stored = db.entries_for_record(entry.record_id.unwrap()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].description, entry.description);
    assert_eq!(stored[0].actor, entry.actor);
    assert_eq!(stored[0].new_value, entry.new_value);
}

#[tokio::test]
async fn duplicate_hash_is_a_conflict() {
    let Some(db) = connect().await else { return };
    let hash = Uuid::new_v4().simple().to_string();
    let job = || NewUploadJob {
        user_id: Uuid::new_v4(),
        file_name: "a.csv".to_string(),
        file_path: "/tmp/a.csv".to_string(),
        file_hash: hash.clone(),
        file_size: 1,
    };

    let created = db.create_job(job()).await.unwrap();
    assert_eq!(created.status, JobStatus::Validating);
    assert!(matches!(
        db.create_job(job()).await,
        Err(StoreError::Conflict(_))
    ));
    let found = db.find_job_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(found.id, created.id);
}

#[tokio::test]
async fn candidates_come_from_other_jobs_oldest_first() {
    let Some(db) = connect().await else { return };
    let tag = Uuid::new_v4().simple().to_string();
    let tx = format!("TX-{}", tag);
    let reference = format!("REF-{}", tag);

    let system_job = new_job(&db).await;
    let upload_job = new_job(&db).await;
    let older = record(system_job, &tx, "", 1000);
    let newer = record(system_job, "other", &reference, 2000);
    db.insert_records(&[older.clone(), newer.clone()]).await.unwrap();
    db.insert_records(&[record(upload_job, &tx, &reference, 1000)])
        .await
        .unwrap();

    let candidates = db
        .find_candidates(upload_job, &[tx.clone()], &[reference.clone()])
        .await
        .unwrap();
    let ids: Vec<Uuid> = candidates.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![older.id, newer.id]);
    assert_eq!(candidates[0].amount, Decimal::new(1000, 2));

    // Re-inserting existing ids is reported as a partial write.
    let again = db
        .insert_records(&[older.clone(), record(system_job, "fresh", "", 5)])
        .await;
    assert!(matches!(
        again,
        Err(StoreError::PartialWrite {
            written: 1,
            failed: 1
        })
    ));
}

#[tokio::test]
async fn rejected_row_does_not_sink_its_chunk() {
    let Some(db) = connect().await else { return };
    let job_id = new_job(&db).await;
    let good = record(job_id, "TX-good", "", 100);
    // Postgres refuses NUL bytes in TEXT columns.
    let bad = record(job_id, "TX\0bad", "", 200);

    let outcome = db.insert_records(&[bad, good.clone()]).await;
    assert!(matches!(
        outcome,
        Err(StoreError::PartialWrite {
            written: 1,
            failed: 1
        })
    ));
    let stored = db.records_by_ids(&[good.id]).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].transaction_id, "TX-good");
}

#[tokio::test]
async fn settings_round_trip_and_return_previous_value() {
    let Some(db) = connect().await else { return };
    let key = format!("test_setting_{}", Uuid::new_v4().simple());

    assert_eq!(db.get_setting(&key).await.unwrap(), None);
    let previous = db
        .put_setting(&key, serde_json::json!("0.02"), "test")
        .await
        .unwrap();
    assert_eq!(previous, None);

    let previous = db
        .put_setting(&key, serde_json::json!("0.05"), "test")
        .await
        .unwrap();
    assert_eq!(previous, Some(serde_json::json!("0.02")));
    assert_eq!(
        db.get_setting(&key).await.unwrap(),
        Some(serde_json::json!("0.05"))
    );
}

#[tokio::test]
async fn pipeline_runs_against_postgres() {
    let Some(db) = connect().await else { return };
    let stores = Stores::from_backend(db.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let queue: Arc<dyn TaskQueue> = Arc::new(tx);
    let service = IngestionService::new(stores.clone(), queue, 20);
    let processor = JobProcessor::new(stores.clone(), 2, DEFAULT_TOLERANCE);
    let dir = tempfile::tempdir().unwrap();
    let tag = Uuid::new_v4().simple().to_string();

    let write = |name: &str, lines: Vec<String>| {
        let path = dir.path().join(name);
        let mut contents = String::from(HEADER);
        for line in lines {
            contents.push('\n');
            contents.push_str(&line);
        }
        std::fs::write(&path, contents).unwrap();
        path
    };
    let system_path = write(
        "system.csv",
        vec![
            format!("A-{tag},100.00,RA-{tag},2024-01-01"),
            format!("C-{tag},100.00,RC-{tag},2024-01-02"),
        ],
    );
    let bank_path = write(
        "bank.csv",
        vec![
            format!("A-{tag},100.00,RA-{tag},2024-01-01"),
            format!("X-{tag},99.00,RC-{tag},2024-01-02"),
            format!("D-{tag},5.00,,"),
            format!("D-{tag},5.00,,"),
        ],
    );

    let mut jobs = Vec::new();
    for (name, path) in [("system.csv", &system_path), ("bank.csv", &bank_path)] {
        let upload = service.upload(Uuid::new_v4(), name, path).await.unwrap();
        service
            .submit_mapping(upload.job.id, ColumnMapping::default())
            .await
            .unwrap();
        let task = rx.try_recv().unwrap();
        jobs.push(processor.run(&task).await.unwrap());
    }

    let bank = &jobs[1];
    assert_eq!(bank.status, JobStatus::Completed);
    assert_eq!(bank.counters.processed, 4);
    assert_eq!(bank.counters.total_matched, 1);
    assert_eq!(bank.counters.total_partial, 1);
    assert_eq!(bank.counters.total_unmatched, 1);
    assert_eq!(bank.counters.total_duplicate, 1);

    let partial = service
        .results(bank.id, Some(MatchStatus::PartiallyMatched), 1, 10)
        .await
        .unwrap();
    assert_eq!(partial.total, 1);
    assert_eq!(partial.results[0].result.match_score, Decimal::new(99, 0));
    assert_eq!(
        partial.results[0]
            .system_record
            .as_ref()
            .map(|r| r.upload_job_id),
        Some(jobs[0].id)
    );

    let entries = db.entries_for_job(bank.id).await.unwrap();
    assert_eq!(entries.len(), 4);
    assert!(entries
        .iter()
        .any(|e| e.description == "Reference matched; amount variance 1.0%"));
}
