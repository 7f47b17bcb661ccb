//! Domain models for reconciliation-service.

#![allow(clippy::should_implement_trait)]

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Config store key holding the partial-match tolerance fraction.
pub const TOLERANCE_CONFIG_KEY: &str = "reconciliation_variance";

/// Tolerance used when the config store has no value (2%).
pub const DEFAULT_TOLERANCE: Decimal = Decimal::from_parts(2, 0, 0, false, 2);

// ============================================================================
// Upload Job Models
// ============================================================================

/// Lifecycle of an upload job. Legal transitions live in `jobs::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    PendingMapping,
    Validating,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingMapping => "PENDING_MAPPING",
            Self::Validating => "VALIDATING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "PENDING_MAPPING" => Self::PendingMapping,
            "VALIDATING" => Self::Validating,
            "PROCESSING" => Self::Processing,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            _ => Self::PendingMapping,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses reported by `find_active_by_user`.
    pub fn active() -> [JobStatus; 3] {
        [Self::PendingMapping, Self::Validating, Self::Processing]
    }
}

/// Maps each canonical field to the source column that holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub transaction_id: String,
    pub amount: String,
    pub ref_number: String,
    pub date: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            transaction_id: "transactionId".to_string(),
            amount: "amount".to_string(),
            ref_number: "refNumber".to_string(),
            date: "date".to_string(),
        }
    }
}

/// Running counters of a job. Batch deltas are added, never assigned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub processed: i64,
    pub failed: i64,
    pub total_matched: i64,
    pub total_partial: i64,
    pub total_unmatched: i64,
    pub total_duplicate: i64,
}

impl JobCounters {
    /// Counter delta for one reconciled batch of `batch_len` records.
    pub fn for_batch(batch_len: usize, counts: &StatusCounts) -> Self {
        Self {
            processed: batch_len as i64,
            failed: 0,
            total_matched: counts.matched as i64,
            total_partial: counts.partially_matched as i64,
            total_unmatched: counts.not_matched as i64,
            total_duplicate: counts.duplicate as i64,
        }
    }

    pub fn add(&mut self, delta: &JobCounters) {
        self.processed += delta.processed;
        self.failed += delta.failed;
        self.total_matched += delta.total_matched;
        self.total_partial += delta.total_partial;
        self.total_unmatched += delta.total_unmatched;
        self.total_duplicate += delta.total_duplicate;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_name: String,
    pub file_path: String,
    pub file_hash: String,
    pub file_size: i64,
    pub column_mapping: Option<ColumnMapping>,
    pub status: JobStatus,
    pub counters: JobCounters,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Fields supplied when a job is first created for a content hash.
#[derive(Debug, Clone)]
pub struct NewUploadJob {
    pub user_id: Uuid,
    pub file_name: String,
    pub file_path: String,
    pub file_hash: String,
    pub file_size: i64,
}

// ============================================================================
// Record Models
// ============================================================================

/// A normalized transaction row belonging to one upload job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedRecord {
    pub id: Uuid,
    pub upload_job_id: Uuid,
    pub transaction_id: String,
    pub ref_number: String,
    pub amount: Decimal,
    /// `None` marks a missing or unparsable source date.
    pub date: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
}

/// A manual change to a single record. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordCorrection {
    pub amount: Option<Decimal>,
    pub ref_number: Option<String>,
}

// ============================================================================
// Reconciliation Result Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    Matched,
    PartiallyMatched,
    NotMatched,
    Duplicate,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "MATCHED",
            Self::PartiallyMatched => "PARTIALLY_MATCHED",
            Self::NotMatched => "NOT_MATCHED",
            Self::Duplicate => "DUPLICATE",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "MATCHED" => Self::Matched,
            "PARTIALLY_MATCHED" => Self::PartiallyMatched,
            "DUPLICATE" => Self::Duplicate,
            _ => Self::NotMatched,
        }
    }

    /// Audit action recorded for a system decision with this outcome.
    pub fn audit_action(&self) -> AuditAction {
        match self {
            Self::Matched => AuditAction::SystemMatch,
            Self::PartiallyMatched => AuditAction::SystemPartial,
            Self::Duplicate => AuditAction::SystemDuplicate,
            Self::NotMatched => AuditAction::Create,
        }
    }
}

/// Per-status tally returned for each reconciled batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub matched: usize,
    pub partially_matched: usize,
    pub not_matched: usize,
    pub duplicate: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: MatchStatus) {
        match status {
            MatchStatus::Matched => self.matched += 1,
            MatchStatus::PartiallyMatched => self.partially_matched += 1,
            MatchStatus::NotMatched => self.not_matched += 1,
            MatchStatus::Duplicate => self.duplicate += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.matched + self.partially_matched + self.not_matched + self.duplicate
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub id: Uuid,
    pub record_id: Uuid,
    /// Record from a different job that this record was matched against.
    pub system_record_id: Option<Uuid>,
    pub upload_job_id: Uuid,
    pub status: MatchStatus,
    pub match_score: Decimal,
    pub created_utc: DateTime<Utc>,
}

/// A result joined with the records it refers to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultDetail {
    pub result: ReconciliationResult,
    pub record: Option<IngestedRecord>,
    pub system_record: Option<IngestedRecord>,
}

// ============================================================================
// Audit Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    SystemMatch,
    SystemPartial,
    SystemDuplicate,
    ManualUpdate,
    ConfigUpdate,
    StatusChange,
    Reprocess,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::SystemMatch => "SYSTEM_MATCH",
            Self::SystemPartial => "SYSTEM_PARTIAL",
            Self::SystemDuplicate => "SYSTEM_DUPLICATE",
            Self::ManualUpdate => "MANUAL_UPDATE",
            Self::ConfigUpdate => "CONFIG_UPDATE",
            Self::StatusChange => "STATUS_CHANGE",
            Self::Reprocess => "REPROCESS",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "SYSTEM_MATCH" => Self::SystemMatch,
            "SYSTEM_PARTIAL" => Self::SystemPartial,
            "SYSTEM_DUPLICATE" => Self::SystemDuplicate,
            "MANUAL_UPDATE" => Self::ManualUpdate,
            "CONFIG_UPDATE" => Self::ConfigUpdate,
            "STATUS_CHANGE" => Self::StatusChange,
            "REPROCESS" => Self::Reprocess,
            _ => Self::Create,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditSource {
    Ui,
    System,
    Api,
}

impl AuditSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ui => "UI",
            Self::System => "SYSTEM",
            Self::Api => "API",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "UI" => Self::Ui,
            "API" => Self::Api,
            _ => Self::System,
        }
    }
}

/// Who performed an audited action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    System,
    User {
        id: Uuid,
        email: String,
        role: String,
    },
}

impl Actor {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::System => None,
            Self::User { id, .. } => Some(*id),
        }
    }

    pub fn email(&self) -> &str {
        match self {
            Self::System => "SYSTEM",
            Self::User { email, .. } => email,
        }
    }

    pub fn role(&self) -> &str {
        match self {
            Self::System => "SYSTEM",
            Self::User { role, .. } => role,
        }
    }
}

/// A single typed value inside an audit snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SnapshotValue {
    Null,
    Text(String),
    Decimal(Decimal),
    Id(Uuid),
    Date(Option<NaiveDate>),
    Timestamp(DateTime<Utc>),
}

impl From<Option<Uuid>> for SnapshotValue {
    fn from(id: Option<Uuid>) -> Self {
        id.map(SnapshotValue::Id).unwrap_or(SnapshotValue::Null)
    }
}

/// Field-to-value map captured before or after an audited change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, SnapshotValue>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: SnapshotValue) -> Self {
        self.0.insert(field.to_string(), value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&SnapshotValue> {
        self.0.get(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&IngestedRecord> for Snapshot {
    fn from(record: &IngestedRecord) -> Self {
        Snapshot::new()
            .with("id", SnapshotValue::Id(record.id))
            .with("uploadJobId", SnapshotValue::Id(record.upload_job_id))
            .with(
                "transactionId",
                SnapshotValue::Text(record.transaction_id.clone()),
            )
            .with("refNumber", SnapshotValue::Text(record.ref_number.clone()))
            .with("amount", SnapshotValue::Decimal(record.amount))
            .with("date", SnapshotValue::Date(record.date))
    }
}

/// An audit entry as submitted for appending. The store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub record_id: Option<Uuid>,
    pub upload_job_id: Option<Uuid>,
    pub action: AuditAction,
    pub field_name: Option<String>,
    pub old_value: Option<Snapshot>,
    pub new_value: Option<Snapshot>,
    pub actor: Actor,
    pub source: AuditSource,
    pub description: String,
}

/// A persisted audit entry. Stores hand out copies; there is no way to write one back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub record_id: Option<Uuid>,
    pub upload_job_id: Option<Uuid>,
    pub action: AuditAction,
    pub field_name: Option<String>,
    pub old_value: Option<Snapshot>,
    pub new_value: Option<Snapshot>,
    pub actor: Actor,
    pub source: AuditSource,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn from_new(entry: NewAuditEntry, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_id: entry.record_id,
            upload_job_id: entry.upload_job_id,
            action: entry.action,
            field_name: entry.field_name,
            old_value: entry.old_value,
            new_value: entry.new_value,
            actor: entry.actor,
            source: entry.source,
            description: entry.description,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tolerance_is_two_percent() {
        assert_eq!(DEFAULT_TOLERANCE.to_string(), "0.02");
        assert_eq!(DEFAULT_TOLERANCE, Decimal::new(2, 2));
    }

    #[test]
    fn job_status_round_trips_through_storage_names() {
        for status in [
            JobStatus::PendingMapping,
            JobStatus::Validating,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()), status);
        }
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn status_counts_total_every_recorded_status() {
        let mut counts = StatusCounts::default();
        counts.record(MatchStatus::Matched);
        counts.record(MatchStatus::Duplicate);
        counts.record(MatchStatus::NotMatched);
        counts.record(MatchStatus::NotMatched);

        assert_eq!(counts.total(), 4);
        assert_eq!(counts.not_matched, 2);
    }

    #[test]
    fn batch_counters_accumulate() {
        let counts = StatusCounts {
            matched: 2,
            partially_matched: 1,
            not_matched: 3,
            duplicate: 1,
        };
        let mut counters = JobCounters::default();
        counters.add(&JobCounters::for_batch(7, &counts));
        counters.add(&JobCounters::for_batch(7, &counts));

        assert_eq!(counters.processed, 14);
        assert_eq!(counters.total_matched, 4);
        assert_eq!(counters.total_duplicate, 2);
    }

    #[test]
    fn snapshot_serializes_as_tagged_map() {
        let snapshot = Snapshot::new()
            .with("refNumber", SnapshotValue::Text("REF100".to_string()))
            .with("systemRecordId", SnapshotValue::Null);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["refNumber"]["type"], "text");
        assert_eq!(json["refNumber"]["value"], "REF100");
        assert_eq!(json["systemRecordId"]["type"], "null");

        let back: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }
}
