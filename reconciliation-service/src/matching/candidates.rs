//! Per-batch index of system records eligible for matching.

use crate::models::IngestedRecord;
use std::collections::HashMap;
use uuid::Uuid;

/// System records indexed by transaction id and by reference number.
///
/// Built from one bulk fetch per batch and dropped when the batch is done.
/// When several records share a key, the last one supplied owns the slot.
/// A taken record leaves both indexes, so it can match at most once.
#[derive(Debug, Default)]
pub struct CandidatePool {
    records: HashMap<Uuid, IngestedRecord>,
    by_transaction: HashMap<String, Uuid>,
    by_reference: HashMap<String, Uuid>,
}

impl CandidatePool {
    /// `candidates` must be ordered oldest first.
    pub fn new(candidates: Vec<IngestedRecord>) -> Self {
        let mut pool = Self::default();
        for record in candidates {
            pool.by_transaction
                .insert(record.transaction_id.clone(), record.id);
            if !record.ref_number.is_empty() {
                pool.by_reference.insert(record.ref_number.clone(), record.id);
            }
            pool.records.insert(record.id, record);
        }
        pool
    }

    pub fn by_transaction_id(&self, transaction_id: &str) -> Option<&IngestedRecord> {
        self.by_transaction
            .get(transaction_id)
            .and_then(|id| self.records.get(id))
    }

    pub fn by_reference(&self, ref_number: &str) -> Option<&IngestedRecord> {
        if ref_number.is_empty() {
            return None;
        }
        self.by_reference
            .get(ref_number)
            .and_then(|id| self.records.get(id))
    }

    /// Remove a matched record from the pool.
    pub fn take(&mut self, id: Uuid) -> Option<IngestedRecord> {
        let record = self.records.remove(&id)?;
        if self.by_transaction.get(&record.transaction_id) == Some(&id) {
            self.by_transaction.remove(&record.transaction_id);
        }
        if self.by_reference.get(&record.ref_number) == Some(&id) {
            self.by_reference.remove(&record.ref_number);
        }
        Some(record)
    }

    /// Number of records not yet taken.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
