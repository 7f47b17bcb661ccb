//! PostgreSQL store backend for reconciliation-service.

use crate::models::{
    Actor, AuditAction, AuditLogEntry, AuditSource, ColumnMapping, IngestedRecord, JobCounters,
    JobStatus, MatchStatus, NewAuditEntry, NewUploadJob, ReconciliationResult, Snapshot,
    UploadJob,
};
use crate::services::metrics::{record_error, DB_QUERY_DURATION};
use crate::services::store::{
    AuditStore, ConfigStore, JobStore, RecordStore, ResultStore, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Rows per multi-row INSERT, well under the bind parameter limit.
const INSERT_CHUNK: usize = 1000;

const JOB_COLUMNS: &str = "upload_job_id, user_id, file_name, file_path, file_hash, file_size, \
     column_mapping, status, processed, failed, total_matched, total_partial, total_unmatched, \
     total_duplicate, created_utc, updated_utc";

const RECORD_COLUMNS: &str =
    "record_id, upload_job_id, transaction_id, ref_number, amount, record_date, created_utc";

const RESULT_COLUMNS: &str =
    "result_id, record_id, system_record_id, upload_job_id, status, match_score, created_utc";

const AUDIT_COLUMNS: &str = "audit_id, record_id, upload_job_id, action_type, field_name, \
     old_value, new_value, actor_id, actor_email, actor_role, source, description, logged_utc";

fn query_failed(operation: &str, err: sqlx::Error) -> StoreError {
    record_error("database");
    StoreError::Database(anyhow::anyhow!("Failed to {}: {}", operation, err))
}

#[derive(Debug, FromRow)]
struct JobRow {
    upload_job_id: Uuid,
    user_id: Uuid,
    file_name: String,
    file_path: String,
    file_hash: String,
    file_size: i64,
    column_mapping: Option<Json<ColumnMapping>>,
    status: String,
    processed: i64,
    failed: i64,
    total_matched: i64,
    total_partial: i64,
    total_unmatched: i64,
    total_duplicate: i64,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<JobRow> for UploadJob {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.upload_job_id,
            user_id: row.user_id,
            file_name: row.file_name,
            file_path: row.file_path,
            file_hash: row.file_hash,
            file_size: row.file_size,
            column_mapping: row.column_mapping.map(|m| m.0),
            status: JobStatus::from_str(&row.status),
            counters: JobCounters {
                processed: row.processed,
                failed: row.failed,
                total_matched: row.total_matched,
                total_partial: row.total_partial,
                total_unmatched: row.total_unmatched,
                total_duplicate: row.total_duplicate,
            },
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct RecordRow {
    record_id: Uuid,
    upload_job_id: Uuid,
    transaction_id: String,
    ref_number: String,
    amount: Decimal,
    record_date: Option<NaiveDate>,
    created_utc: DateTime<Utc>,
}

impl From<RecordRow> for IngestedRecord {
    fn from(row: RecordRow) -> Self {
        Self {
            id: row.record_id,
            upload_job_id: row.upload_job_id,
            transaction_id: row.transaction_id,
            ref_number: row.ref_number,
            amount: row.amount,
            date: row.record_date,
            created_utc: row.created_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct ResultRow {
    result_id: Uuid,
    record_id: Uuid,
    system_record_id: Option<Uuid>,
    upload_job_id: Uuid,
    status: String,
    match_score: Decimal,
    created_utc: DateTime<Utc>,
}

impl From<ResultRow> for ReconciliationResult {
    fn from(row: ResultRow) -> Self {
        Self {
            id: row.result_id,
            record_id: row.record_id,
            system_record_id: row.system_record_id,
            upload_job_id: row.upload_job_id,
            status: MatchStatus::from_str(&row.status),
            match_score: row.match_score,
            created_utc: row.created_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct AuditRow {
    audit_id: Uuid,
    record_id: Option<Uuid>,
    upload_job_id: Option<Uuid>,
    action_type: String,
    field_name: Option<String>,
    old_value: Option<Json<Snapshot>>,
    new_value: Option<Json<Snapshot>>,
    actor_id: Option<Uuid>,
    actor_email: String,
    actor_role: String,
    source: String,
    description: String,
    logged_utc: DateTime<Utc>,
}

impl From<AuditRow> for AuditLogEntry {
    fn from(row: AuditRow) -> Self {
        let actor = match row.actor_id {
            Some(id) => Actor::User {
                id,
                email: row.actor_email,
                role: row.actor_role,
            },
            None => Actor::System,
        };
        Self {
            id: row.audit_id,
            record_id: row.record_id,
            upload_job_id: row.upload_job_id,
            action: AuditAction::from_str(&row.action_type),
            field_name: row.field_name,
            old_value: row.old_value.map(|v| v.0),
            new_value: row.new_value.map(|v| v.0),
            actor,
            source: AuditSource::from_str(&row.source),
            description: row.description,
            timestamp: row.logged_utc,
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "reconciliation-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Inserts one batch of records, returning the rows actually written.
    async fn insert_record_rows(&self, records: &[IngestedRecord]) -> Result<u64, sqlx::Error> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO ingested_records (record_id, upload_job_id, transaction_id, ref_number, amount, record_date, created_utc) ",
        );
        builder.push_values(records, |mut row, record| {
            row.push_bind(record.id)
                .push_bind(record.upload_job_id)
                .push_bind(record.transaction_id.clone())
                .push_bind(record.ref_number.clone())
                .push_bind(record.amount)
                .push_bind(record.date)
                .push_bind(record.created_utc);
        });
        builder.push(" ON CONFLICT (record_id) DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

// =========================================================================
// Upload Job Operations
// =========================================================================

#[async_trait]
impl JobStore for Database {
    #[instrument(skip(self, job), fields(file_hash = %job.file_hash))]
    async fn create_job(&self, job: NewUploadJob) -> Result<UploadJob, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_job"])
            .start_timer();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO upload_jobs (upload_job_id, user_id, file_name, file_path, file_hash, file_size, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(job.user_id)
        .bind(&job.file_name)
        .bind(&job.file_path)
        .bind(&job.file_hash)
        .bind(job.file_size)
        .bind(JobStatus::Validating.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(format!(
                "upload job with hash {} already exists",
                job.file_hash
            )),
            e => query_failed("create upload job", e),
        })?;

        timer.observe_duration();
        info!(upload_job_id = %row.upload_job_id, "Upload job created");
        Ok(row.into())
    }

    #[instrument(skip(self), fields(upload_job_id = %job_id))]
    async fn get_job(&self, job_id: Uuid) -> Result<Option<UploadJob>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_job"])
            .start_timer();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM upload_jobs WHERE upload_job_id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("get upload job", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn find_job_by_hash(&self, file_hash: &str) -> Result<Option<UploadJob>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_job_by_hash"])
            .start_timer();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM upload_jobs WHERE file_hash = $1",
            JOB_COLUMNS
        ))
        .bind(file_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("find upload job by hash", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn find_active_job(&self, user_id: Uuid) -> Result<Option<UploadJob>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_active_job"])
            .start_timer();

        let active: Vec<String> = JobStatus::active()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {}
            FROM upload_jobs
            WHERE user_id = $1 AND status = ANY($2)
            ORDER BY created_utc DESC
            LIMIT 1
            "#,
            JOB_COLUMNS
        ))
        .bind(user_id)
        .bind(active)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("find active upload job", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn list_jobs_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<UploadJob>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_jobs_for_user"])
            .start_timer();

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {}
            FROM upload_jobs
            WHERE user_id = $1
            ORDER BY created_utc DESC
            LIMIT $2
            "#,
            JOB_COLUMNS
        ))
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("list upload jobs", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), fields(upload_job_id = %job_id, status = status.as_str()))]
    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_job_status"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE upload_jobs SET status = $2, updated_utc = NOW() WHERE upload_job_id = $1",
        )
        .bind(job_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("set upload job status", e))?;

        timer.observe_duration();
        expect_row(result.rows_affected(), job_id)
    }

    #[instrument(skip(self, mapping), fields(upload_job_id = %job_id))]
    async fn set_column_mapping(
        &self,
        job_id: Uuid,
        mapping: &ColumnMapping,
    ) -> Result<(), StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_column_mapping"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE upload_jobs SET column_mapping = $2, updated_utc = NOW() WHERE upload_job_id = $1",
        )
        .bind(job_id)
        .bind(Json(mapping))
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("set column mapping", e))?;

        timer.observe_duration();
        expect_row(result.rows_affected(), job_id)
    }

    #[instrument(skip(self), fields(upload_job_id = %job_id))]
    async fn reset_counters(&self, job_id: Uuid) -> Result<(), StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reset_counters"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE upload_jobs
            SET processed = 0, failed = 0, total_matched = 0, total_partial = 0,
                total_unmatched = 0, total_duplicate = 0, updated_utc = NOW()
            WHERE upload_job_id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("reset job counters", e))?;

        timer.observe_duration();
        expect_row(result.rows_affected(), job_id)
    }

    #[instrument(skip(self, delta), fields(upload_job_id = %job_id, processed = delta.processed))]
    async fn increment_counters(
        &self,
        job_id: Uuid,
        delta: &JobCounters,
    ) -> Result<(), StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["increment_counters"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE upload_jobs
            SET processed = processed + $2,
                failed = failed + $3,
                total_matched = total_matched + $4,
                total_partial = total_partial + $5,
                total_unmatched = total_unmatched + $6,
                total_duplicate = total_duplicate + $7,
                updated_utc = NOW()
            WHERE upload_job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(delta.processed)
        .bind(delta.failed)
        .bind(delta.total_matched)
        .bind(delta.total_partial)
        .bind(delta.total_unmatched)
        .bind(delta.total_duplicate)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("increment job counters", e))?;

        timer.observe_duration();
        expect_row(result.rows_affected(), job_id)
    }

    #[instrument(skip(self), fields(upload_job_id = %job_id, status = status.as_str()))]
    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        failed: i64,
    ) -> Result<(), StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finish_job"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE upload_jobs
            SET status = $2, failed = $3, updated_utc = NOW()
            WHERE upload_job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(failed)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("finish upload job", e))?;

        timer.observe_duration();
        expect_row(result.rows_affected(), job_id)
    }
}

fn expect_row(rows_affected: u64, job_id: Uuid) -> Result<(), StoreError> {
    if rows_affected == 0 {
        Err(StoreError::NotFound(format!("upload job {}", job_id)))
    } else {
        Ok(())
    }
}

// =========================================================================
// Record Operations
// =========================================================================

#[async_trait]
impl RecordStore for Database {
    /// Rows whose id already exists, or that the database rejects, are
    /// skipped and reported as failed.
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn insert_records(&self, records: &[IngestedRecord]) -> Result<usize, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_records"])
            .start_timer();

        let mut written = 0usize;
        for chunk in records.chunks(INSERT_CHUNK) {
            match self.insert_record_rows(chunk).await {
                Ok(rows) => written += rows as usize,
                Err(e) => {
                    // Retry row by row so one bad row only loses itself.
                    warn!(error = %e, chunk = chunk.len(), "Record chunk rejected, retrying rows");
                    for record in chunk {
                        match self.insert_record_rows(std::slice::from_ref(record)).await {
                            Ok(rows) => written += rows as usize,
                            Err(e) => warn!(
                                error = %e,
                                record_id = %record.id,
                                transaction_id = %record.transaction_id.escape_debug(),
                                "Record rejected"
                            ),
                        }
                    }
                }
            }
        }

        timer.observe_duration();
        let failed = records.len() - written;
        if failed > 0 {
            record_error("database");
            warn!(written, failed, "Record insert incomplete");
            return Err(StoreError::PartialWrite { written, failed });
        }
        Ok(written)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn records_by_ids(&self, ids: &[Uuid]) -> Result<Vec<IngestedRecord>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["records_by_ids"])
            .start_timer();

        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {} FROM ingested_records WHERE record_id = ANY($1) ORDER BY seq",
            RECORD_COLUMNS
        ))
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("fetch records by id", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(
        skip(self, transaction_ids, ref_numbers),
        fields(upload_job_id = %exclude_job_id, transaction_ids = transaction_ids.len(), ref_numbers = ref_numbers.len())
    )]
    async fn find_candidates(
        &self,
        exclude_job_id: Uuid,
        transaction_ids: &[String],
        ref_numbers: &[String],
    ) -> Result<Vec<IngestedRecord>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_candidates"])
            .start_timer();

        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            SELECT {}
            FROM ingested_records
            WHERE upload_job_id <> $1
              AND (transaction_id = ANY($2) OR (ref_number <> '' AND ref_number = ANY($3)))
            ORDER BY created_utc, seq
            "#,
            RECORD_COLUMNS
        ))
        .bind(exclude_job_id)
        .bind(transaction_ids.to_vec())
        .bind(ref_numbers.to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("fetch match candidates", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), fields(record_id = %record_id))]
    async fn get_record(&self, record_id: Uuid) -> Result<Option<IngestedRecord>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_record"])
            .start_timer();

        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {} FROM ingested_records WHERE record_id = $1",
            RECORD_COLUMNS
        ))
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("get record", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(upload_job_id = %job_id))]
    async fn latest_record_for_job(
        &self,
        job_id: Uuid,
    ) -> Result<Option<IngestedRecord>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_record_for_job"])
            .start_timer();

        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {} FROM ingested_records WHERE upload_job_id = $1 ORDER BY seq DESC LIMIT 1",
            RECORD_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("get latest record", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(upload_job_id = %job_id))]
    async fn count_records_for_job(&self, job_id: Uuid) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ingested_records WHERE upload_job_id = $1")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| query_failed("count records", e))?;
        Ok(count as u64)
    }

    #[instrument(skip(self, record), fields(record_id = %record.id))]
    async fn update_record(&self, record: &IngestedRecord) -> Result<(), StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_record"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE ingested_records
            SET transaction_id = $2, ref_number = $3, amount = $4, record_date = $5
            WHERE record_id = $1
            "#,
        )
        .bind(record.id)
        .bind(&record.transaction_id)
        .bind(&record.ref_number)
        .bind(record.amount)
        .bind(record.date)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("update record", e))?;

        timer.observe_duration();
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("record {}", record.id)));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(upload_job_id = %job_id))]
    async fn delete_records_for_job(&self, job_id: Uuid) -> Result<u64, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_records_for_job"])
            .start_timer();

        let result = sqlx::query("DELETE FROM ingested_records WHERE upload_job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| query_failed("delete records", e))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }
}

// =========================================================================
// Result Operations
// =========================================================================

#[async_trait]
impl ResultStore for Database {
    #[instrument(skip(self, results), fields(count = results.len()))]
    async fn insert_results(&self, results: &[ReconciliationResult]) -> Result<usize, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_results"])
            .start_timer();

        let mut written = 0usize;
        for chunk in results.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO reconciliation_results (result_id, record_id, system_record_id, upload_job_id, status, match_score, created_utc) ",
            );
            builder.push_values(chunk, |mut row, result| {
                row.push_bind(result.id)
                    .push_bind(result.record_id)
                    .push_bind(result.system_record_id)
                    .push_bind(result.upload_job_id)
                    .push_bind(result.status.as_str())
                    .push_bind(result.match_score)
                    .push_bind(result.created_utc);
            });
            builder.push(" ON CONFLICT (result_id) DO NOTHING");

            // Chunks are independent; keep going so one bad chunk does not lose the rest.
            match builder.build().execute(&self.pool).await {
                Ok(result) => written += result.rows_affected() as usize,
                Err(e) => warn!(error = %e, chunk = chunk.len(), "Result chunk rejected"),
            }
        }

        timer.observe_duration();
        let failed = results.len() - written;
        if failed > 0 {
            record_error("database");
            return Err(StoreError::PartialWrite { written, failed });
        }
        Ok(written)
    }

    #[instrument(skip(self), fields(upload_job_id = %job_id))]
    async fn list_results(
        &self,
        job_id: Uuid,
        status: Option<MatchStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ReconciliationResult>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_results"])
            .start_timer();

        let rows = sqlx::query_as::<_, ResultRow>(&format!(
            r#"
            SELECT {}
            FROM reconciliation_results
            WHERE upload_job_id = $1 AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_utc DESC, seq DESC
            OFFSET $3
            LIMIT $4
            "#,
            RESULT_COLUMNS
        ))
        .bind(job_id)
        .bind(status.map(|s| s.as_str()))
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("list results", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), fields(upload_job_id = %job_id))]
    async fn count_results(
        &self,
        job_id: Uuid,
        status: Option<MatchStatus>,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM reconciliation_results
            WHERE upload_job_id = $1 AND ($2::TEXT IS NULL OR status = $2)
            "#,
        )
        .bind(job_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_failed("count results", e))?;
        Ok(count as u64)
    }

    #[instrument(skip(self), fields(upload_job_id = %job_id))]
    async fn delete_results_for_job(&self, job_id: Uuid) -> Result<u64, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_results_for_job"])
            .start_timer();

        let result = sqlx::query("DELETE FROM reconciliation_results WHERE upload_job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| query_failed("delete results", e))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }
}

// =========================================================================
// Audit Operations
// =========================================================================

fn push_audit_values(builder: &mut QueryBuilder<'_, Postgres>, entries: Vec<AuditLogEntry>) {
    builder.push_values(entries, |mut row, entry| {
        row.push_bind(entry.id)
            .push_bind(entry.record_id)
            .push_bind(entry.upload_job_id)
            .push_bind(entry.action.as_str())
            .push_bind(entry.field_name)
            .push_bind(entry.old_value.map(Json))
            .push_bind(entry.new_value.map(Json))
            .push_bind(entry.actor.user_id())
            .push_bind(entry.actor.email().to_string())
            .push_bind(entry.actor.role().to_string())
            .push_bind(entry.source.as_str())
            .push_bind(entry.description)
            .push_bind(entry.timestamp);
    });
}

const AUDIT_INSERT: &str = "INSERT INTO audit_logs (audit_id, record_id, upload_job_id, action_type, field_name, \
     old_value, new_value, actor_id, actor_email, actor_role, source, description, logged_utc) ";

#[async_trait]
impl AuditStore for Database {
    #[instrument(skip(self, entry), fields(action = entry.action.as_str()))]
    async fn append_entry(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_audit_entry"])
            .start_timer();

        let entry = AuditLogEntry::from_new(entry, Utc::now());
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(AUDIT_INSERT);
        push_audit_values(&mut builder, vec![entry.clone()]);
        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| query_failed("append audit entry", e))?;

        timer.observe_duration();
        Ok(entry)
    }

    #[instrument(skip(self, entries), fields(count = entries.len()))]
    async fn append_entries(&self, entries: Vec<NewAuditEntry>) -> Result<usize, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_audit_entries"])
            .start_timer();

        let now = Utc::now();
        let total = entries.len();
        let entries: Vec<AuditLogEntry> = entries
            .into_iter()
            .map(|e| AuditLogEntry::from_new(e, now))
            .collect();

        let mut written = 0usize;
        for chunk in entries.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(AUDIT_INSERT);
            push_audit_values(&mut builder, chunk.to_vec());
            match builder.build().execute(&self.pool).await {
                Ok(result) => written += result.rows_affected() as usize,
                Err(e) => warn!(error = %e, chunk = chunk.len(), "Audit chunk rejected"),
            }
        }

        timer.observe_duration();
        if written < total {
            record_error("database");
            return Err(StoreError::PartialWrite {
                written,
                failed: total - written,
            });
        }
        Ok(written)
    }

    #[instrument(skip(self), fields(record_id = %record_id))]
    async fn entries_for_record(
        &self,
        record_id: Uuid,
    ) -> Result<Vec<AuditLogEntry>, StoreError> {
        let rows = sqlx::query_as::<_, AuditRow>(&format!(
            "SELECT {} FROM audit_logs WHERE record_id = $1 ORDER BY logged_utc, seq",
            AUDIT_COLUMNS
        ))
        .bind(record_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("fetch record audit trail", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), fields(upload_job_id = %job_id))]
    async fn entries_for_job(&self, job_id: Uuid) -> Result<Vec<AuditLogEntry>, StoreError> {
        let rows = sqlx::query_as::<_, AuditRow>(&format!(
            "SELECT {} FROM audit_logs WHERE upload_job_id = $1 ORDER BY logged_utc, seq",
            AUDIT_COLUMNS
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("fetch job audit trail", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// =========================================================================
// Settings Operations
// =========================================================================

#[async_trait]
impl ConfigStore for Database {
    #[instrument(skip(self))]
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT value FROM system_settings WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("get setting", e))
    }

    #[instrument(skip(self, value, description))]
    async fn put_setting(
        &self,
        key: &str,
        value: serde_json::Value,
        description: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        sqlx::query_scalar::<_, Option<serde_json::Value>>(
            r#"
            WITH previous AS (
                SELECT value FROM system_settings WHERE key = $1 FOR UPDATE
            )
            INSERT INTO system_settings (key, value, description, updated_utc)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value, description = EXCLUDED.description, updated_utc = NOW()
            RETURNING (SELECT value FROM previous)
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_failed("put setting", e))
    }
}
