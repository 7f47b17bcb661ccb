//! One processing run of an upload job.

use crate::audit::current_tolerance;
use crate::ingest::{normalize, Batcher, FileFormat, RowStream};
use crate::jobs::state;
use crate::matching;
use crate::models::{ColumnMapping, IngestedRecord, JobCounters, JobStatus, UploadJob};
use crate::services::metrics;
use crate::services::store::{StoreError, Stores};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// A queued request to (re)process one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTask {
    pub job_id: Uuid,
    pub file_path: PathBuf,
    pub file_name: String,
    pub mapping: ColumnMapping,
}

/// Row tallies of a run that never reach the job counters directly.
#[derive(Debug, Default)]
struct RunTally {
    failed: i64,
    dropped: u64,
}

#[derive(Clone)]
pub struct JobProcessor {
    stores: Stores,
    batch_size: usize,
    default_tolerance: Decimal,
}

impl JobProcessor {
    pub fn new(stores: Stores, batch_size: usize, default_tolerance: Decimal) -> Self {
        Self {
            stores,
            batch_size,
            default_tolerance,
        }
    }

    /// Run `task` to completion.
    ///
    /// Safe to repeat for the same job: every run starts by clearing the
    /// job's counters, records and results. Audit entries are kept. Batches
    /// are processed strictly one after another.
    #[instrument(skip(self, task), fields(job_id = %task.job_id, file_name = %task.file_name))]
    pub async fn run(&self, task: &ProcessingTask) -> Result<UploadJob, AppError> {
        let started = Instant::now();
        let job = self.load_job(task.job_id).await?;
        let status = state::transition(job.status, JobStatus::Processing)?;
        self.stores.jobs.set_job_status(job.id, status).await?;
        info!("Processing run started");

        let mut tally = RunTally::default();
        let outcome = self.process(task, &mut tally).await;

        let final_status = match &outcome {
            Ok(()) => JobStatus::Completed,
            Err(e) => {
                error!(error = %e, failed = tally.failed, "Processing run failed");
                metrics::record_error("job_run");
                JobStatus::Failed
            }
        };
        let final_status = state::transition(JobStatus::Processing, final_status)?;
        self.stores
            .jobs
            .finish_job(job.id, final_status, tally.failed)
            .await?;
        metrics::record_rows("dropped", tally.dropped);
        metrics::record_rows("failed", tally.failed as u64);
        metrics::record_job_run(final_status.as_str(), started.elapsed().as_secs_f64());

        outcome?;
        let job = self.load_job(job.id).await?;
        info!(
            processed = job.counters.processed,
            matched = job.counters.total_matched,
            partial = job.counters.total_partial,
            unmatched = job.counters.total_unmatched,
            duplicate = job.counters.total_duplicate,
            failed = job.counters.failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "Processing run completed"
        );
        Ok(job)
    }

    async fn load_job(&self, job_id: Uuid) -> Result<UploadJob, AppError> {
        self.stores
            .jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Upload job {} not found", job_id)))
    }

    async fn process(&self, task: &ProcessingTask, tally: &mut RunTally) -> Result<(), AppError> {
        let job_id = task.job_id;
        self.stores.jobs.reset_counters(job_id).await?;
        let records = self.stores.records.delete_records_for_job(job_id).await?;
        let results = self.stores.results.delete_results_for_job(job_id).await?;
        if records > 0 || results > 0 {
            info!(records, results, "Cleared previous run");
        }

        let tolerance =
            current_tolerance(self.stores.config.as_ref(), self.default_tolerance).await?;
        let format = FileFormat::from_file_name(&task.file_name);
        let mut stream = RowStream::open(&task.file_path, format).await?;
        info!(
            tolerance = %tolerance,
            format = ?format,
            columns = stream.headers().len(),
            "Streaming file"
        );

        let mut batcher = Batcher::new(self.batch_size);
        while let Some(row) = stream.next().await {
            let row = match row {
                Ok(row) => row,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed row");
                    tally.failed += 1;
                    continue;
                }
            };

            let Some(record) = normalize(&row, &task.mapping, job_id) else {
                tally.dropped += 1;
                continue;
            };
            if let Some(batch) = batcher.push(record) {
                self.process_batch(job_id, batch, tolerance, format, tally)
                    .await?;
            }
        }
        if let Some(batch) = batcher.finish() {
            self.process_batch(job_id, batch, tolerance, format, tally)
                .await?;
        }

        Ok(())
    }

    async fn process_batch(
        &self,
        job_id: Uuid,
        batch: Vec<IngestedRecord>,
        tolerance: Decimal,
        format: FileFormat,
        tally: &mut RunTally,
    ) -> Result<(), AppError> {
        let persisted = self.persist(batch, tally).await?;
        let counts = matching::reconcile(&persisted, job_id, tolerance, &self.stores).await?;
        self.stores
            .jobs
            .increment_counters(job_id, &JobCounters::for_batch(persisted.len(), &counts))
            .await?;

        metrics::record_batch(&format!("{:?}", format).to_lowercase());
        metrics::record_rows("ingested", persisted.len() as u64);
        Ok(())
    }

    /// Insert a batch and return the records that actually landed, in file order.
    async fn persist(
        &self,
        batch: Vec<IngestedRecord>,
        tally: &mut RunTally,
    ) -> Result<Vec<IngestedRecord>, AppError> {
        match self.stores.records.insert_records(&batch).await {
            Ok(_) => Ok(batch),
            Err(StoreError::PartialWrite { written, failed }) => {
                warn!(written, failed, "Bulk insert incomplete, re-reading batch");
                metrics::record_error("record_write");

                let ids: Vec<Uuid> = batch.iter().map(|r| r.id).collect();
                let landed: HashSet<Uuid> = self
                    .stores
                    .records
                    .records_by_ids(&ids)
                    .await?
                    .into_iter()
                    .map(|r| r.id)
                    .collect();

                let persisted: Vec<IngestedRecord> = batch
                    .into_iter()
                    .filter(|r| landed.contains(&r.id))
                    .collect();
                tally.failed += (ids.len() - persisted.len()) as i64;
                Ok(persisted)
            }
            Err(e) => Err(e.into()),
        }
    }
}
