//! Identifier-then-tolerance matching of one batch.

use crate::matching::candidates::CandidatePool;
use crate::models::{
    Actor, AuditSource, IngestedRecord, MatchStatus, NewAuditEntry, ReconciliationResult,
    Snapshot, SnapshotValue, StatusCounts,
};
use crate::services::metrics;
use crate::services::store::{StoreError, Stores};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Largest absolute difference still treated as an exact amount match.
const EXACT_AMOUNT_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Outcome for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub status: MatchStatus,
    pub score: Decimal,
    pub system_record: Option<IngestedRecord>,
    /// Amount variance in percent of the candidate amount, for partial matches.
    pub variance_pct: Option<Decimal>,
}

impl Decision {
    fn unmatched(status: MatchStatus) -> Self {
        Self {
            status,
            score: Decimal::ZERO,
            system_record: None,
            variance_pct: None,
        }
    }

    /// Human-readable description stored with the audit entry.
    pub fn describe(&self) -> String {
        match self.status {
            MatchStatus::Matched => "System matched Transaction ID and Amount".to_string(),
            MatchStatus::PartiallyMatched => {
                let mut variance = self.variance_pct.unwrap_or_default();
                variance.rescale(1);
                format!("Reference matched; amount variance {}%", variance)
            }
            MatchStatus::Duplicate => "Duplicate Transaction ID detected".to_string(),
            MatchStatus::NotMatched => "No matching system record found".to_string(),
        }
    }
}

/// Decide the status of `record`.
///
/// `seen` holds the transaction ids already decided in this batch. A matched
/// candidate is taken out of `pool`.
pub fn decide(
    record: &IngestedRecord,
    seen: &mut HashSet<String>,
    pool: &mut CandidatePool,
    tolerance: Decimal,
) -> Decision {
    if !seen.insert(record.transaction_id.clone()) {
        return Decision::unmatched(MatchStatus::Duplicate);
    }

    let exact = pool
        .by_transaction_id(&record.transaction_id)
        .filter(|c| (c.amount - record.amount).abs() < EXACT_AMOUNT_EPSILON)
        .map(|c| c.id);
    if let Some(id) = exact {
        return Decision {
            status: MatchStatus::Matched,
            score: HUNDRED,
            system_record: pool.take(id),
            variance_pct: None,
        };
    }

    let partial = pool.by_reference(&record.ref_number).and_then(|c| {
        let diff = (c.amount - record.amount).abs();
        if diff <= c.amount * tolerance {
            Some((c.id, variance_pct(diff, c.amount)))
        } else {
            None
        }
    });
    if let Some((id, variance)) = partial {
        return Decision {
            status: MatchStatus::PartiallyMatched,
            score: (HUNDRED - variance).max(Decimal::ZERO).round_dp(2),
            system_record: pool.take(id),
            variance_pct: Some(variance),
        };
    }

    Decision::unmatched(MatchStatus::NotMatched)
}

fn variance_pct(diff: Decimal, base: Decimal) -> Decimal {
    if base.is_zero() {
        // Only reachable with diff == 0.
        Decimal::ZERO
    } else {
        diff / base * HUNDRED
    }
}

/// Reconcile one persisted batch of `job_id` against other jobs' records.
///
/// Writes one result and one audit entry per record. Failures of those bulk
/// writes are logged and do not fail the batch; a failed candidate fetch does.
#[instrument(skip(batch, stores), fields(job_id = %job_id, batch_size = batch.len()))]
pub async fn reconcile(
    batch: &[IngestedRecord],
    job_id: Uuid,
    tolerance: Decimal,
    stores: &Stores,
) -> Result<StatusCounts, StoreError> {
    let mut counts = StatusCounts::default();
    if batch.is_empty() {
        return Ok(counts);
    }

    let transaction_ids: Vec<String> = batch
        .iter()
        .map(|r| r.transaction_id.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let ref_numbers: Vec<String> = batch
        .iter()
        .filter(|r| !r.ref_number.is_empty())
        .map(|r| r.ref_number.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let candidates = stores
        .records
        .find_candidates(job_id, &transaction_ids, &ref_numbers)
        .await?;
    debug!(candidates = candidates.len(), "Candidate pool loaded");

    let mut pool = CandidatePool::new(candidates);
    let mut seen = HashSet::with_capacity(batch.len());
    let mut results = Vec::with_capacity(batch.len());
    let mut entries = Vec::with_capacity(batch.len());
    let now = Utc::now();

    for record in batch {
        let decision = decide(record, &mut seen, &mut pool, tolerance);
        counts.record(decision.status);
        metrics::record_match_decision(decision.status.as_str());

        let system_record_id = decision.system_record.as_ref().map(|r| r.id);
        entries.push(NewAuditEntry {
            record_id: Some(record.id),
            upload_job_id: Some(job_id),
            action: decision.status.audit_action(),
            field_name: None,
            old_value: None,
            new_value: Some(
                Snapshot::new()
                    .with(
                        "status",
                        SnapshotValue::Text(decision.status.as_str().to_string()),
                    )
                    .with("matchScore", SnapshotValue::Decimal(decision.score))
                    .with("systemRecordId", system_record_id.into()),
            ),
            actor: Actor::System,
            source: AuditSource::System,
            description: decision.describe(),
        });
        results.push(ReconciliationResult {
            id: Uuid::new_v4(),
            record_id: record.id,
            system_record_id,
            upload_job_id: job_id,
            status: decision.status,
            match_score: decision.score,
            created_utc: now,
        });
    }

    if let Err(e) = stores.results.insert_results(&results).await {
        warn!(error = %e, "Result write incomplete, continuing");
        metrics::record_error("result_write");
    }
    if let Err(e) = stores.audit.append_entries(entries).await {
        warn!(error = %e, "Audit write incomplete, continuing");
        metrics::record_error("audit_write");
    }

    Ok(counts)
}
