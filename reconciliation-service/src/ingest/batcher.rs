//! Fixed-size grouping of normalized records.

use crate::models::IngestedRecord;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Accumulates records and hands them out in batches of `capacity`.
///
/// The final batch may be shorter. An empty batch is never produced.
#[derive(Debug)]
pub struct Batcher {
    capacity: usize,
    pending: Vec<IngestedRecord>,
}

impl Batcher {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            pending: Vec::with_capacity(capacity),
        }
    }

    /// Returns a full batch once `capacity` records have been pushed.
    pub fn push(&mut self, record: IngestedRecord) -> Option<Vec<IngestedRecord>> {
        self.pending.push(record);
        if self.pending.len() >= self.capacity {
            Some(std::mem::replace(
                &mut self.pending,
                Vec::with_capacity(self.capacity),
            ))
        } else {
            None
        }
    }

    /// Drains whatever is left.
    pub fn finish(self) -> Option<Vec<IngestedRecord>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending)
        }
    }
}

impl Default for Batcher {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}
