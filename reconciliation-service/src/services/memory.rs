//! In-process store backend.
//!
//! Used when no database is configured and by the test suites. All state
//! lives behind a single `RwLock`, so every operation is atomic with respect
//! to the others.

use crate::models::{
    AuditLogEntry, ColumnMapping, IngestedRecord, JobCounters, JobStatus, MatchStatus,
    NewAuditEntry, NewUploadJob, ReconciliationResult, UploadJob,
};
use crate::services::store::{
    AuditStore, ConfigStore, JobStore, RecordStore, ResultStore, StoreError,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, UploadJob>,
    records: Vec<IngestedRecord>,
    results: Vec<ReconciliationResult>,
    audit: Vec<AuditLogEntry>,
    settings: HashMap<String, serde_json::Value>,
    rejected_transaction_ids: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `insert_records` drop every record with this transaction id and
    /// report a partial write. Lets callers exercise bulk-insert recovery.
    pub async fn reject_records_with(&self, transaction_id: &str) {
        self.inner
            .write()
            .await
            .rejected_transaction_ids
            .insert(transaction_id.to_string());
    }

    fn touch(job: &mut UploadJob) {
        job.updated_utc = Utc::now();
    }
}

fn job_mut<'a>(inner: &'a mut Inner, job_id: Uuid) -> Result<&'a mut UploadJob, StoreError> {
    inner
        .jobs
        .get_mut(&job_id)
        .ok_or_else(|| StoreError::NotFound(format!("upload job {}", job_id)))
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: NewUploadJob) -> Result<UploadJob, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.jobs.values().any(|j| j.file_hash == job.file_hash) {
            return Err(StoreError::Conflict(format!(
                "upload job with hash {} already exists",
                job.file_hash
            )));
        }

        let now = Utc::now();
        let created = UploadJob {
            id: Uuid::new_v4(),
            user_id: job.user_id,
            file_name: job.file_name,
            file_path: job.file_path,
            file_hash: job.file_hash,
            file_size: job.file_size,
            column_mapping: None,
            status: JobStatus::Validating,
            counters: JobCounters::default(),
            created_utc: now,
            updated_utc: now,
        };
        inner.jobs.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<UploadJob>, StoreError> {
        Ok(self.inner.read().await.jobs.get(&job_id).cloned())
    }

    async fn find_job_by_hash(&self, file_hash: &str) -> Result<Option<UploadJob>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .values()
            .find(|j| j.file_hash == file_hash)
            .cloned())
    }

    async fn find_active_job(&self, user_id: Uuid) -> Result<Option<UploadJob>, StoreError> {
        let active = JobStatus::active();
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.user_id == user_id && active.contains(&j.status))
            .max_by_key(|j| j.created_utc)
            .cloned())
    }

    async fn list_jobs_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<UploadJob>, StoreError> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<UploadJob> = inner
            .jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = job_mut(&mut inner, job_id)?;
        job.status = status;
        Self::touch(job);
        Ok(())
    }

    async fn set_column_mapping(
        &self,
        job_id: Uuid,
        mapping: &ColumnMapping,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = job_mut(&mut inner, job_id)?;
        job.column_mapping = Some(mapping.clone());
        Self::touch(job);
        Ok(())
    }

    async fn reset_counters(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = job_mut(&mut inner, job_id)?;
        job.counters = JobCounters::default();
        Self::touch(job);
        Ok(())
    }

    async fn increment_counters(
        &self,
        job_id: Uuid,
        delta: &JobCounters,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = job_mut(&mut inner, job_id)?;
        job.counters.add(delta);
        Self::touch(job);
        Ok(())
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        failed: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = job_mut(&mut inner, job_id)?;
        job.status = status;
        job.counters.failed = failed;
        Self::touch(job);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_records(&self, records: &[IngestedRecord]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let mut failed = 0;
        for record in records {
            if inner.rejected_transaction_ids.contains(&record.transaction_id) {
                failed += 1;
                continue;
            }
            inner.records.push(record.clone());
        }

        let written = records.len() - failed;
        if failed > 0 {
            return Err(StoreError::PartialWrite { written, failed });
        }
        Ok(written)
    }

    async fn records_by_ids(&self, ids: &[Uuid]) -> Result<Vec<IngestedRecord>, StoreError> {
        let wanted: HashSet<&Uuid> = ids.iter().collect();
        Ok(self
            .inner
            .read()
            .await
            .records
            .iter()
            .filter(|r| wanted.contains(&r.id))
            .cloned()
            .collect())
    }

    async fn find_candidates(
        &self,
        exclude_job_id: Uuid,
        transaction_ids: &[String],
        ref_numbers: &[String],
    ) -> Result<Vec<IngestedRecord>, StoreError> {
        let tx_ids: HashSet<&str> = transaction_ids.iter().map(String::as_str).collect();
        let refs: HashSet<&str> = ref_numbers.iter().map(String::as_str).collect();

        Ok(self
            .inner
            .read()
            .await
            .records
            .iter()
            .filter(|r| r.upload_job_id != exclude_job_id)
            .filter(|r| {
                tx_ids.contains(r.transaction_id.as_str())
                    || (!r.ref_number.is_empty() && refs.contains(r.ref_number.as_str()))
            })
            .cloned()
            .collect())
    }

    async fn get_record(&self, record_id: Uuid) -> Result<Option<IngestedRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .iter()
            .find(|r| r.id == record_id)
            .cloned())
    }

    async fn latest_record_for_job(
        &self,
        job_id: Uuid,
    ) -> Result<Option<IngestedRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .iter()
            .rev()
            .find(|r| r.upload_job_id == job_id)
            .cloned())
    }

    async fn count_records_for_job(&self, job_id: Uuid) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .iter()
            .filter(|r| r.upload_job_id == job_id)
            .count() as u64)
    }

    async fn update_record(&self, record: &IngestedRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| StoreError::NotFound(format!("record {}", record.id)))?;
        *stored = record.clone();
        Ok(())
    }

    async fn delete_records_for_job(&self, job_id: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.records.len();
        inner.records.retain(|r| r.upload_job_id != job_id);
        Ok((before - inner.records.len()) as u64)
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn insert_results(&self, results: &[ReconciliationResult]) -> Result<usize, StoreError> {
        self.inner
            .write()
            .await
            .results
            .extend(results.iter().cloned());
        Ok(results.len())
    }

    async fn list_results(
        &self,
        job_id: Uuid,
        status: Option<MatchStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ReconciliationResult>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .results
            .iter()
            .rev()
            .filter(|r| r.upload_job_id == job_id)
            .filter(|r| status.map_or(true, |s| r.status == s))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_results(
        &self,
        job_id: Uuid,
        status: Option<MatchStatus>,
    ) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .results
            .iter()
            .filter(|r| r.upload_job_id == job_id)
            .filter(|r| status.map_or(true, |s| r.status == s))
            .count() as u64)
    }

    async fn delete_results_for_job(&self, job_id: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.results.len();
        inner.results.retain(|r| r.upload_job_id != job_id);
        Ok((before - inner.results.len()) as u64)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_entry(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, StoreError> {
        let entry = AuditLogEntry::from_new(entry, Utc::now());
        self.inner.write().await.audit.push(entry.clone());
        Ok(entry)
    }

    async fn append_entries(&self, entries: Vec<NewAuditEntry>) -> Result<usize, StoreError> {
        let now = Utc::now();
        let count = entries.len();
        self.inner
            .write()
            .await
            .audit
            .extend(entries.into_iter().map(|e| AuditLogEntry::from_new(e, now)));
        Ok(count)
    }

    async fn entries_for_record(
        &self,
        record_id: Uuid,
    ) -> Result<Vec<AuditLogEntry>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .audit
            .iter()
            .filter(|e| e.record_id == Some(record_id))
            .cloned()
            .collect())
    }

    async fn entries_for_job(&self, job_id: Uuid) -> Result<Vec<AuditLogEntry>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .audit
            .iter()
            .filter(|e| e.upload_job_id == Some(job_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.inner.read().await.settings.get(key).cloned())
    }

    async fn put_setting(
        &self,
        key: &str,
        value: serde_json::Value,
        _description: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .inner
            .write()
            .await
            .settings
            .insert(key.to_string(), value))
    }
}
