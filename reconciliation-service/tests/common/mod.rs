//! Common test utilities for reconciliation-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use reconciliation_service::config::{IngestionConfig, PipelineConfig};
use reconciliation_service::jobs::{IngestionService, JobProcessor, ProcessingTask, TaskQueue};
use reconciliation_service::models::{
    AuditLogEntry, ColumnMapping, NewAuditEntry, UploadJob, DEFAULT_TOLERANCE,
};
use reconciliation_service::services::{AuditStore, MemoryStore, StoreError, Stores};
use reconciliation_service::workers::WorkerConfig;
use service_core::config::Config as CommonConfig;
use service_core::error::AppError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,reconciliation_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const HEADER: &str = "transactionId,amount,refNumber,date";

/// Test configuration running on in-memory stores with an ephemeral port.
pub fn test_config() -> IngestionConfig {
    IngestionConfig {
        common: CommonConfig {
            port: 0,
            environment: "test".to_string(),
        },
        service_name: "reconciliation-service-test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: None,
        workers: WorkerConfig {
            worker_count: 2,
            queue_size: 16,
        },
        pipeline: PipelineConfig::default(),
    }
}

/// Audit store wrapper that records appended entries and can be told to fail.
pub struct ScriptedAudit {
    inner: Arc<MemoryStore>,
    failing: AtomicBool,
    appended: Mutex<Vec<AuditLogEntry>>,
}

impl ScriptedAudit {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            appended: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn appended(&self) -> Vec<AuditLogEntry> {
        self.appended.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Database(anyhow::anyhow!("audit store offline")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AuditStore for ScriptedAudit {
    async fn append_entry(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, StoreError> {
        self.check()?;
        let entry = self.inner.append_entry(entry).await?;
        self.appended.lock().unwrap().push(entry.clone());
        Ok(entry)
    }

    async fn append_entries(&self, entries: Vec<NewAuditEntry>) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.append_entries(entries).await
    }

    async fn entries_for_record(
        &self,
        record_id: Uuid,
    ) -> Result<Vec<AuditLogEntry>, StoreError> {
        self.inner.entries_for_record(record_id).await
    }

    async fn entries_for_job(&self, job_id: Uuid) -> Result<Vec<AuditLogEntry>, StoreError> {
        self.inner.entries_for_job(job_id).await
    }
}

/// In-memory pipeline whose queued tasks are run on demand.
pub struct Harness {
    pub memory: Arc<MemoryStore>,
    pub audit: Arc<ScriptedAudit>,
    pub stores: Stores,
    pub service: IngestionService,
    pub processor: JobProcessor,
    pub user_id: Uuid,
    tasks: mpsc::UnboundedReceiver<ProcessingTask>,
    dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_batch_size(1000)
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        init_tracing();

        let memory = Arc::new(MemoryStore::new());
        let audit = Arc::new(ScriptedAudit::new(memory.clone()));
        let mut stores = Stores::from_backend(memory.clone());
        stores.audit = audit.clone();

        let (tx, tasks) = mpsc::unbounded_channel();
        let queue: Arc<dyn TaskQueue> = Arc::new(tx);
        let service = IngestionService::new(stores.clone(), queue, 20);
        let processor = JobProcessor::new(stores.clone(), batch_size, DEFAULT_TOLERANCE);

        Self {
            memory,
            audit,
            stores,
            service,
            processor,
            user_id: Uuid::new_v4(),
            tasks,
            dir: tempfile::tempdir().expect("Failed to create temp dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a delimited file with the standard header and the given lines.
    pub fn write_csv(&self, name: &str, lines: &[&str]) -> PathBuf {
        let mut contents = String::from(HEADER);
        for line in lines {
            contents.push('\n');
            contents.push_str(line);
        }
        contents.push('\n');

        let path = self.path(name);
        std::fs::write(&path, contents).expect("Failed to write fixture");
        path
    }

    pub fn queued(&mut self) -> Vec<ProcessingTask> {
        let mut tasks = Vec::new();
        while let Ok(task) = self.tasks.try_recv() {
            tasks.push(task);
        }
        tasks
    }

    /// Run every queued task and return the outcome of the last one.
    pub async fn process_queued(&mut self) -> Option<Result<UploadJob, AppError>> {
        let mut last = None;
        for task in self.queued() {
            last = Some(self.processor.run(&task).await);
        }
        last
    }

    /// Upload `lines` as a new file, submit `mapping` and run the job.
    pub async fn ingest(&mut self, name: &str, lines: &[&str]) -> UploadJob {
        let path = self.write_csv(name, lines);
        let upload = self
            .service
            .upload(self.user_id, name, &path)
            .await
            .expect("upload failed");
        self.service
            .submit_mapping(upload.job.id, ColumnMapping::default())
            .await
            .expect("mapping submission failed");
        self.process_queued()
            .await
            .expect("no task queued")
            .expect("processing run failed")
    }
}
