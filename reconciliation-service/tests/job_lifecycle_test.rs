//! Integration tests for the upload job lifecycle.

mod common;

use common::Harness;
use reconciliation_service::jobs::{IngestionService, ProcessingTask, TaskQueue};
use reconciliation_service::models::{ColumnMapping, JobStatus, MatchStatus};
use reconciliation_service::services::{AuditStore, JobStore, RecordStore, ResultStore};
use rust_decimal::Decimal;
use rust_xlsxwriter::{ExcelDateTime, Format, Formula, Workbook};
use service_core::error::AppError;
use std::sync::Arc;

/// Queue whose backing worker pool has gone away.
struct ClosedQueue;

impl TaskQueue for ClosedQueue {
    fn enqueue(&self, _task: ProcessingTask) -> Result<(), AppError> {
        Err(AppError::ServiceUnavailable)
    }
}

#[tokio::test]
async fn upload_waits_for_mapping_with_preview() {
    let harness = Harness::new();
    let path = harness.write_csv("bank.csv", &["TX1,10,REF1,2024-01-01", "TX2,20,REF2,"]);

    let outcome = harness
        .service
        .upload(harness.user_id, "bank.csv", &path)
        .await
        .unwrap();

    assert!(!outcome.reused);
    assert_eq!(outcome.job.status, JobStatus::PendingMapping);
    assert_eq!(outcome.job.file_name, "bank.csv");
    assert_eq!(outcome.job.file_hash.len(), 64);
    assert_eq!(
        outcome.preview.headers,
        vec!["transactionId", "amount", "refNumber", "date"]
    );
    assert_eq!(outcome.preview.rows.len(), 2);
    assert_eq!(
        outcome.preview.rows[0].get("refNumber").map(String::as_str),
        Some("REF1")
    );
}

#[tokio::test]
async fn identical_bytes_reuse_the_first_job() {
    let harness = Harness::new();
    let first = harness.write_csv("a.csv", &["TX1,10,REF1,"]);
    let second = harness.write_csv("b.csv", &["TX1,10,REF1,"]);

    let original = harness
        .service
        .upload(harness.user_id, "a.csv", &first)
        .await
        .unwrap();
    let again = harness
        .service
        .upload(harness.user_id, "b.csv", &second)
        .await
        .unwrap();

    assert!(again.reused);
    assert_eq!(again.job.id, original.job.id);
    assert_eq!(again.job.file_name, "a.csv");
    assert_eq!(again.preview.rows.len(), 1);
}

#[tokio::test]
async fn resubmitting_the_same_mapping_keeps_results() {
    let mut harness = Harness::new();
    let job = harness
        .ingest("bank.csv", &["TX1,10,REF1,", "TX2,20,REF2,"])
        .await;
    assert_eq!(job.status, JobStatus::Completed);
    let results_before = harness.service.results(job.id, None, 1, 10).await.unwrap();

    let outcome = harness
        .service
        .submit_mapping(job.id, ColumnMapping::default())
        .await
        .unwrap();

    assert!(outcome.reused);
    assert!(harness.queued().is_empty());
    assert_eq!(outcome.job.counters, job.counters);
    let results_after = harness.service.results(job.id, None, 1, 10).await.unwrap();
    assert_eq!(results_after.results, results_before.results);
}

#[tokio::test]
async fn changed_mapping_regenerates_results_and_keeps_audit() {
    let mut harness = Harness::new();
    let job = harness
        .ingest("bank.csv", &["TX1,10,REF1,", "TX2,20,REF2,", "TX2,20,REF2,"])
        .await;
    assert_eq!(job.counters.total_duplicate, 1);
    let audit_before = harness.stores.audit.entries_for_job(job.id).await.unwrap();
    assert_eq!(audit_before.len(), 3);

    // Use the reference column as the identifier this time.
    let mapping = ColumnMapping {
        transaction_id: "refNumber".to_string(),
        ..ColumnMapping::default()
    };
    let outcome = harness
        .service
        .submit_mapping(job.id, mapping.clone())
        .await
        .unwrap();
    assert!(!outcome.reused);
    assert_eq!(outcome.job.counters.processed, 0);
    assert_eq!(outcome.job.column_mapping, Some(mapping));

    let rerun = harness.process_queued().await.unwrap().unwrap();
    assert_eq!(rerun.status, JobStatus::Completed);
    assert_eq!(rerun.counters.processed, 3);
    assert_eq!(rerun.counters.total_duplicate, 1);

    let records = harness.stores.records.count_records_for_job(job.id).await.unwrap();
    let results = harness.stores.results.count_results(job.id, None).await.unwrap();
    assert_eq!(records, 3);
    assert_eq!(results, 3);

    let latest = harness
        .stores
        .records
        .latest_record_for_job(job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.transaction_id, "REF2");

    let audit_after = harness.stores.audit.entries_for_job(job.id).await.unwrap();
    assert_eq!(audit_after.len(), 6);
    assert!(audit_before.iter().all(|e| audit_after.contains(e)));
}

#[tokio::test]
async fn unqueued_remap_fails_the_job_instead_of_leaving_it_completed() {
    let mut harness = Harness::new();
    let job = harness
        .ingest("bank.csv", &["TX1,10,REF1,", "TX2,20,REF2,"])
        .await;
    assert_eq!(job.status, JobStatus::Completed);

    let closed = IngestionService::new(harness.stores.clone(), Arc::new(ClosedQueue), 20);
    let mapping = ColumnMapping {
        transaction_id: "refNumber".to_string(),
        ..ColumnMapping::default()
    };
    let err = closed.submit_mapping(job.id, mapping.clone()).await.unwrap_err();
    assert!(matches!(err, AppError::ServiceUnavailable));

    let stored = harness.stores.jobs.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.counters.processed, 0);

    // The same mapping is accepted again once the queue is back.
    let outcome = harness
        .service
        .submit_mapping(job.id, mapping)
        .await
        .unwrap();
    assert!(!outcome.reused);
    let rerun = harness.process_queued().await.unwrap().unwrap();
    assert_eq!(rerun.status, JobStatus::Completed);
    let results = harness.stores.results.count_results(job.id, None).await.unwrap();
    assert_eq!(results, 2);
}

#[tokio::test]
async fn records_rejected_by_bulk_insert_count_as_failed() {
    let mut harness = Harness::new();
    harness.memory.reject_records_with("TX2").await;

    let job = harness
        .ingest("bank.csv", &["TX1,10,,", "TX2,20,,", "TX3,30,,"])
        .await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.processed, 2);
    assert_eq!(job.counters.failed, 1);
    assert_eq!(job.counters.total_unmatched, 2);

    let page = harness.service.results(job.id, None, 1, 10).await.unwrap();
    assert_eq!(page.total, 2);
    assert!(page
        .results
        .iter()
        .all(|d| d.record.as_ref().is_some_and(|r| r.transaction_id != "TX2")));
}

#[tokio::test]
async fn unreadable_file_fails_the_run() {
    let mut harness = Harness::new();
    let path = harness.write_csv("gone.csv", &["TX1,10,,"]);
    let upload = harness
        .service
        .upload(harness.user_id, "gone.csv", &path)
        .await
        .unwrap();
    std::fs::remove_file(&path).unwrap();

    harness
        .service
        .submit_mapping(upload.job.id, ColumnMapping::default())
        .await
        .unwrap();
    let outcome = harness.process_queued().await.unwrap();
    assert!(outcome.is_err());

    let job = harness.stores.jobs.get_job(upload.job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.counters.processed, 0);

    // Status queries still answer without the file.
    let view = harness.service.job_status(upload.job.id).await.unwrap();
    assert_eq!(view.job.status, JobStatus::Failed);
    assert!(view.preview.headers.is_empty());
    assert!(view.latest_record.is_none());
}

#[tokio::test]
async fn failed_job_can_be_reprocessed() {
    let mut harness = Harness::new();
    let path = harness.write_csv("retry.csv", &["TX1,10,,"]);
    let upload = harness
        .service
        .upload(harness.user_id, "retry.csv", &path)
        .await
        .unwrap();
    let contents = std::fs::read(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    harness
        .service
        .submit_mapping(upload.job.id, ColumnMapping::default())
        .await
        .unwrap();
    assert!(harness.process_queued().await.unwrap().is_err());

    std::fs::write(&path, contents).unwrap();
    harness
        .service
        .submit_mapping(upload.job.id, ColumnMapping::default())
        .await
        .unwrap();
    let job = harness.process_queued().await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.processed, 1);
}

#[tokio::test]
async fn active_job_and_history_are_per_user() {
    let mut harness = Harness::new();
    let pending_path = harness.write_csv("pending.csv", &["TX1,10,,"]);
    let pending = harness
        .service
        .upload(harness.user_id, "pending.csv", &pending_path)
        .await
        .unwrap()
        .job;
    let done = harness.ingest("done.csv", &["TX2,10,,"]).await;

    let active = harness.service.active_job(harness.user_id).await.unwrap();
    assert_eq!(active.map(|j| j.id), Some(pending.id));
    assert!(harness
        .service
        .active_job(uuid::Uuid::new_v4())
        .await
        .unwrap()
        .is_none());

    let history = harness
        .service
        .upload_history(harness.user_id, None)
        .await
        .unwrap();
    let ids: Vec<_> = history.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![done.id, pending.id]);

    let latest_only = harness
        .service
        .upload_history(harness.user_id, Some(1))
        .await
        .unwrap();
    assert_eq!(latest_only.len(), 1);
    assert_eq!(latest_only[0].id, done.id);
}

#[tokio::test]
async fn results_are_paged_and_filtered() {
    let mut harness = Harness::new();
    let job = harness
        .ingest(
            "bank.csv",
            &["TX1,1,,", "TX2,2,,", "TX3,3,,", "TX1,1,,", "TX4,4,,"],
        )
        .await;

    let first = harness.service.results(job.id, None, 1, 2).await.unwrap();
    assert_eq!(first.total, 5);
    assert_eq!(first.total_pages, 3);
    assert_eq!(first.page, 1);
    assert_eq!(first.results.len(), 2);
    assert!(first.results.iter().all(|d| d.record.is_some()));
    assert!(first.results.iter().all(|d| d.system_record.is_none()));

    let last = harness.service.results(job.id, None, 3, 2).await.unwrap();
    assert_eq!(last.results.len(), 1);

    let beyond = harness.service.results(job.id, None, 4, 2).await.unwrap();
    assert!(beyond.results.is_empty());

    let duplicates = harness
        .service
        .results(job.id, Some(MatchStatus::Duplicate), 1, 10)
        .await
        .unwrap();
    assert_eq!(duplicates.total, 1);
    assert_eq!(duplicates.total_pages, 1);
    let duplicate = &duplicates.results[0];
    assert_eq!(duplicate.result.match_score, Decimal::ZERO);
    assert_eq!(
        duplicate.record.as_ref().map(|r| r.transaction_id.as_str()),
        Some("TX1")
    );

    let err = harness.service.results(job.id, None, 0, 2).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn spreadsheets_are_ingested_like_delimited_files() {
    let mut harness = Harness::new();
    let path = harness.path("bank.xlsx");

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (col, header) in ["transactionId", "amount", "refNumber", "date"]
        .iter()
        .enumerate()
    {
        sheet.write_string(0, col as u16, *header).unwrap();
    }
    sheet.write_string(1, 0, "TX1").unwrap();
    sheet.write_number(1, 1, 10000.0).unwrap();
    sheet.write_string(1, 2, "REF1").unwrap();
    sheet.write_string(1, 3, "2024-01-01").unwrap();
    sheet.write_string(2, 0, "TX2").unwrap();
    sheet.write_number(2, 1, 25.5).unwrap();
    workbook.save(&path).unwrap();

    let upload = harness
        .service
        .upload(harness.user_id, "bank.xlsx", &path)
        .await
        .unwrap();
    assert_eq!(upload.preview.headers.len(), 4);
    assert_eq!(upload.preview.rows.len(), 2);

    harness
        .service
        .submit_mapping(upload.job.id, ColumnMapping::default())
        .await
        .unwrap();
    let job = harness.process_queued().await.unwrap().unwrap();
    assert_eq!(job.counters.processed, 2);

    let records = harness
        .service
        .results(job.id, None, 1, 10)
        .await
        .unwrap()
        .results
        .into_iter()
        .filter_map(|d| d.record)
        .collect::<Vec<_>>();
    let tx1 = records.iter().find(|r| r.transaction_id == "TX1").unwrap();
    assert_eq!(tx1.amount, Decimal::new(10000, 0));
    assert_eq!(tx1.date, chrono::NaiveDate::from_ymd_opt(2024, 1, 1));
    let tx2 = records.iter().find(|r| r.transaction_id == "TX2").unwrap();
    assert_eq!(tx2.amount, Decimal::new(255, 1));
    assert_eq!(tx2.date, None);
}

#[tokio::test]
async fn spreadsheet_cells_read_as_displayed_values() {
    let mut harness = Harness::new();
    let path = harness.path("styled.xlsx");

    let bold = Format::new().set_bold();
    let plain = Format::new();
    let date_format = Format::new().set_num_format("yyyy-mm-dd");
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (col, header) in ["transactionId", "amount", "refNumber", "date"]
        .iter()
        .enumerate()
    {
        sheet.write_string(0, col as u16, *header).unwrap();
    }
    sheet
        .write_rich_string(1, 0, &[(&bold, "TX"), (&plain, "1")])
        .unwrap();
    sheet
        .write_formula(1, 1, Formula::new("=5000*2").set_result("10000"))
        .unwrap();
    sheet.write_string(1, 2, "REF1").unwrap();
    let date = ExcelDateTime::from_ymd(2024, 1, 31).unwrap();
    sheet
        .write_datetime_with_format(1, 3, &date, &date_format)
        .unwrap();
    workbook.save(&path).unwrap();

    let upload = harness
        .service
        .upload(harness.user_id, "styled.xlsx", &path)
        .await
        .unwrap();
    let row = &upload.preview.rows[0];
    assert_eq!(row.get("transactionId").map(String::as_str), Some("TX1"));
    assert_eq!(row.get("amount").map(String::as_str), Some("10000"));
    assert_eq!(row.get("date").map(String::as_str), Some("2024-01-31"));

    harness
        .service
        .submit_mapping(upload.job.id, ColumnMapping::default())
        .await
        .unwrap();
    let job = harness.process_queued().await.unwrap().unwrap();
    assert_eq!(job.counters.processed, 1);

    let record = harness
        .stores
        .records
        .latest_record_for_job(job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.transaction_id, "TX1");
    assert_eq!(record.amount, Decimal::new(10000, 0));
    assert_eq!(record.date, chrono::NaiveDate::from_ymd_opt(2024, 1, 31));
}

#[tokio::test]
async fn spreadsheet_headers_come_from_the_first_row_only() {
    let mut harness = Harness::new();
    let path = harness.path("offset.xlsx");

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (col, header) in ["transactionId", "amount", "refNumber", "date"]
        .iter()
        .enumerate()
    {
        sheet.write_string(1, col as u16, *header).unwrap();
    }
    sheet.write_string(2, 0, "TX1").unwrap();
    sheet.write_number(2, 1, 10.0).unwrap();
    workbook.save(&path).unwrap();

    let upload = harness
        .service
        .upload(harness.user_id, "offset.xlsx", &path)
        .await
        .unwrap();
    assert!(upload.preview.headers.is_empty());

    harness
        .service
        .submit_mapping(upload.job.id, ColumnMapping::default())
        .await
        .unwrap();
    let job = harness.process_queued().await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.processed, 0);
}
