//! Upload, mapping submission and job queries.

use crate::audit::AuditTrail;
use crate::ingest::{preview, FileFormat, Preview};
use crate::jobs::processor::ProcessingTask;
use crate::jobs::state;
use crate::models::{
    AuditLogEntry, ColumnMapping, IngestedRecord, JobStatus, MatchStatus, NewUploadJob,
    ResultDetail, UploadJob,
};
use crate::services::store::{StoreError, Stores};
use serde::Serialize;
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Where mapping submissions send their processing runs.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: ProcessingTask) -> Result<(), AppError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub job: UploadJob,
    pub preview: Preview,
    /// True when the bytes matched an existing job.
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingOutcome {
    pub job: UploadJob,
    /// True when a completed job already had this mapping and nothing was queued.
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job: UploadJob,
    pub preview: Preview,
    pub latest_record: Option<IngestedRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultPage {
    pub results: Vec<ResultDetail>,
    pub total: u64,
    pub total_pages: u64,
    pub page: usize,
}

#[derive(Clone)]
pub struct IngestionService {
    stores: Stores,
    queue: Arc<dyn TaskQueue>,
    audit: AuditTrail,
    preview_rows: usize,
}

impl IngestionService {
    pub fn new(stores: Stores, queue: Arc<dyn TaskQueue>, preview_rows: usize) -> Self {
        Self {
            audit: AuditTrail::new(stores.clone()),
            stores,
            queue,
            preview_rows,
        }
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Register an uploaded file.
    ///
    /// Identical bytes map to the job that first received them; a new hash
    /// creates a job that passes through VALIDATING to PENDING_MAPPING.
    #[instrument(skip(self, path), fields(user_id = %user_id, file_name = %file_name))]
    pub async fn upload(
        &self,
        user_id: Uuid,
        file_name: &str,
        path: &Path,
    ) -> Result<UploadOutcome, AppError> {
        let bytes = tokio::fs::read(path).await?;
        let file_hash = hex::encode(Sha256::digest(&bytes));
        let format = FileFormat::from_file_name(file_name);

        if let Some(job) = self.stores.jobs.find_job_by_hash(&file_hash).await? {
            return self.reuse(job, format).await;
        }

        let created = self
            .stores
            .jobs
            .create_job(NewUploadJob {
                user_id,
                file_name: file_name.to_string(),
                file_path: path.display().to_string(),
                file_hash: file_hash.clone(),
                file_size: bytes.len() as i64,
            })
            .await;
        let job = match created {
            Ok(job) => job,
            Err(StoreError::Conflict(_)) => {
                let job = self
                    .stores
                    .jobs
                    .find_job_by_hash(&file_hash)
                    .await?
                    .ok_or_else(|| {
                        AppError::InternalError(anyhow::anyhow!(
                            "Upload job for hash {} vanished",
                            file_hash
                        ))
                    })?;
                return self.reuse(job, format).await;
            }
            Err(e) => return Err(e.into()),
        };

        let preview = match preview(path, format, self.preview_rows).await {
            Ok(preview) => preview,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Uploaded file is unreadable");
                let status = state::transition(job.status, JobStatus::Failed)?;
                self.stores.jobs.set_job_status(job.id, status).await?;
                return Err(e.into());
            }
        };

        let status = state::transition(job.status, JobStatus::PendingMapping)?;
        self.stores.jobs.set_job_status(job.id, status).await?;
        let job = self.load_job(job.id).await?;
        info!(job_id = %job.id, file_hash = %file_hash, "Upload registered");

        Ok(UploadOutcome {
            job,
            preview,
            reused: false,
        })
    }

    async fn reuse(&self, job: UploadJob, format: FileFormat) -> Result<UploadOutcome, AppError> {
        info!(job_id = %job.id, status = job.status.as_str(), "Reusing job for identical upload");
        let preview = preview(&job.file_path, format, self.preview_rows).await?;
        Ok(UploadOutcome {
            job,
            preview,
            reused: true,
        })
    }

    /// Store `mapping` and queue a processing run, unless the job already
    /// completed with exactly this mapping.
    ///
    /// The job is PROCESSING from here on. A run that cannot be queued
    /// leaves it FAILED.
    #[instrument(skip(self, mapping), fields(job_id = %job_id))]
    pub async fn submit_mapping(
        &self,
        job_id: Uuid,
        mapping: ColumnMapping,
    ) -> Result<MappingOutcome, AppError> {
        let job = self.load_job(job_id).await?;
        if job.status == JobStatus::Completed && job.column_mapping.as_ref() == Some(&mapping) {
            info!("Mapping unchanged, reusing existing results");
            return Ok(MappingOutcome { job, reused: true });
        }
        // The job leaves COMPLETED before its results are cleared.
        let status = state::transition(job.status, JobStatus::Processing)?;
        self.stores.jobs.set_job_status(job_id, status).await?;

        self.stores.jobs.set_column_mapping(job_id, &mapping).await?;
        self.stores.jobs.reset_counters(job_id).await?;
        let cleared = self.stores.results.delete_results_for_job(job_id).await?;

        let queued = self.queue.enqueue(ProcessingTask {
            job_id,
            file_path: job.file_path.clone().into(),
            file_name: job.file_name.clone(),
            mapping,
        });
        if let Err(e) = queued {
            error!(error = %e, "Failed to queue processing run");
            let status = state::transition(status, JobStatus::Failed)?;
            self.stores.jobs.set_job_status(job_id, status).await?;
            return Err(e);
        }
        info!(cleared_results = cleared, "Mapping submitted, processing queued");

        Ok(MappingOutcome {
            job: self.load_job(job_id).await?,
            reused: false,
        })
    }

    /// The job, a preview of its file and its most recently ingested record.
    pub async fn job_status(&self, job_id: Uuid) -> Result<JobStatusView, AppError> {
        let job = self.load_job(job_id).await?;
        let latest_record = self.stores.records.latest_record_for_job(job_id).await?;

        let format = FileFormat::from_file_name(&job.file_name);
        let preview = preview(&job.file_path, format, self.preview_rows)
            .await
            .unwrap_or_else(|e| {
                warn!(job_id = %job_id, error = %e, "Failed to read file for job status");
                Preview::default()
            });

        Ok(JobStatusView {
            job,
            preview,
            latest_record,
        })
    }

    /// The user's newest job that is still waiting for a mapping or running.
    pub async fn active_job(&self, user_id: Uuid) -> Result<Option<UploadJob>, AppError> {
        Ok(self.stores.jobs.find_active_job(user_id).await?)
    }

    pub async fn upload_history(
        &self,
        user_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<UploadJob>, AppError> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        Ok(self.stores.jobs.list_jobs_for_user(user_id, limit).await?)
    }

    /// One page (1-based) of a job's results, newest first, joined with
    /// the uploaded and matched records.
    pub async fn results(
        &self,
        job_id: Uuid,
        status: Option<MatchStatus>,
        page: usize,
        page_size: usize,
    ) -> Result<ResultPage, AppError> {
        if page == 0 || page_size == 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "page and page size must be at least 1"
            )));
        }

        let results = self
            .stores
            .results
            .list_results(job_id, status, (page - 1) * page_size, page_size)
            .await?;
        let total = self.stores.results.count_results(job_id, status).await?;

        let ids: Vec<Uuid> = results
            .iter()
            .flat_map(|r| std::iter::once(r.record_id).chain(r.system_record_id))
            .collect();
        let records: HashMap<Uuid, IngestedRecord> = self
            .stores
            .records
            .records_by_ids(&ids)
            .await?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        let results = results
            .into_iter()
            .map(|result| ResultDetail {
                record: records.get(&result.record_id).cloned(),
                system_record: result
                    .system_record_id
                    .and_then(|id| records.get(&id).cloned()),
                result,
            })
            .collect();

        Ok(ResultPage {
            results,
            total,
            total_pages: total.div_ceil(page_size as u64),
            page,
        })
    }

    pub async fn record_timeline(&self, record_id: Uuid) -> Result<Vec<AuditLogEntry>, AppError> {
        self.audit.record_timeline(record_id).await
    }

    async fn load_job(&self, job_id: Uuid) -> Result<UploadJob, AppError> {
        self.stores
            .jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Upload job {} not found", job_id)))
    }
}
