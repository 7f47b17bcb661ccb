//! Persistence seams for the ingestion pipeline.
//!
//! Every backend implements the five store traits. The audit store exposes
//! append and read operations only: audit entries cannot be updated or deleted
//! through any type in this crate.

use crate::models::{
    AuditLogEntry, ColumnMapping, IngestedRecord, JobCounters, JobStatus, MatchStatus,
    NewAuditEntry, NewUploadJob, ReconciliationResult, UploadJob,
};
use async_trait::async_trait;
use service_core::error::AppError;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(anyhow::Error),

    #[error("Bulk write incomplete: {written} written, {failed} failed")]
    PartialWrite { written: usize, failed: usize },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            StoreError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            other => AppError::DatabaseError(anyhow::Error::new(other)),
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fails with `StoreError::Conflict` when a job with the same content hash exists.
    async fn create_job(&self, job: NewUploadJob) -> Result<UploadJob, StoreError>;
    async fn get_job(&self, job_id: Uuid) -> Result<Option<UploadJob>, StoreError>;
    async fn find_job_by_hash(&self, file_hash: &str) -> Result<Option<UploadJob>, StoreError>;
    /// Newest job of the user whose status is in `JobStatus::active()`.
    async fn find_active_job(&self, user_id: Uuid) -> Result<Option<UploadJob>, StoreError>;
    /// Newest first.
    async fn list_jobs_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<UploadJob>, StoreError>;
    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError>;
    async fn set_column_mapping(
        &self,
        job_id: Uuid,
        mapping: &ColumnMapping,
    ) -> Result<(), StoreError>;
    async fn reset_counters(&self, job_id: Uuid) -> Result<(), StoreError>;
    /// Atomically adds `delta` to the job's counters.
    async fn increment_counters(&self, job_id: Uuid, delta: &JobCounters)
        -> Result<(), StoreError>;
    /// Writes the final status together with the failed-row count.
    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        failed: i64,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Unordered bulk insert. Returns `StoreError::PartialWrite` when only some rows landed.
    async fn insert_records(&self, records: &[IngestedRecord]) -> Result<usize, StoreError>;
    async fn records_by_ids(&self, ids: &[Uuid]) -> Result<Vec<IngestedRecord>, StoreError>;
    /// Records of jobs other than `exclude_job_id` whose transaction id or
    /// reference number is in the given sets, oldest first.
    async fn find_candidates(
        &self,
        exclude_job_id: Uuid,
        transaction_ids: &[String],
        ref_numbers: &[String],
    ) -> Result<Vec<IngestedRecord>, StoreError>;
    async fn get_record(&self, record_id: Uuid) -> Result<Option<IngestedRecord>, StoreError>;
    async fn latest_record_for_job(
        &self,
        job_id: Uuid,
    ) -> Result<Option<IngestedRecord>, StoreError>;
    async fn count_records_for_job(&self, job_id: Uuid) -> Result<u64, StoreError>;
    async fn update_record(&self, record: &IngestedRecord) -> Result<(), StoreError>;
    async fn delete_records_for_job(&self, job_id: Uuid) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn insert_results(&self, results: &[ReconciliationResult]) -> Result<usize, StoreError>;
    /// Newest first, optionally filtered by status.
    async fn list_results(
        &self,
        job_id: Uuid,
        status: Option<MatchStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ReconciliationResult>, StoreError>;
    async fn count_results(
        &self,
        job_id: Uuid,
        status: Option<MatchStatus>,
    ) -> Result<u64, StoreError>;
    async fn delete_results_for_job(&self, job_id: Uuid) -> Result<u64, StoreError>;
}

/// Append-only audit trail.
///
/// There is deliberately no update or delete operation:
///
/// ```compile_fail
/// # use reconciliation_service::services::store::AuditStore;
/// # async fn tamper(store: &dyn AuditStore, id: uuid::Uuid) {
/// store.delete_entry(id).await;
/// # }
/// ```
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_entry(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, StoreError>;
    /// Unordered bulk append. Returns `StoreError::PartialWrite` when only some entries landed.
    async fn append_entries(&self, entries: Vec<NewAuditEntry>) -> Result<usize, StoreError>;
    /// Oldest first.
    async fn entries_for_record(&self, record_id: Uuid)
        -> Result<Vec<AuditLogEntry>, StoreError>;
    /// Oldest first.
    async fn entries_for_job(&self, job_id: Uuid) -> Result<Vec<AuditLogEntry>, StoreError>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;
    /// Upserts the setting and returns the previous value.
    async fn put_setting(
        &self,
        key: &str,
        value: serde_json::Value,
        description: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;
}

/// The set of stores the pipeline runs against.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub records: Arc<dyn RecordStore>,
    pub results: Arc<dyn ResultStore>,
    pub audit: Arc<dyn AuditStore>,
    pub config: Arc<dyn ConfigStore>,
}

impl Stores {
    /// Use one backend for every store.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: JobStore + RecordStore + ResultStore + AuditStore + ConfigStore + 'static,
    {
        Self {
            jobs: backend.clone(),
            records: backend.clone(),
            results: backend.clone(),
            audit: backend.clone(),
            config: backend,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(crate::services::memory::MemoryStore::new()))
    }
}
