//! Upload job transition table.
//!
//! Callers never assign a status directly; they ask this module first.

use crate::models::JobStatus;
use service_core::error::AppError;

/// Whether `from -> to` is a legal step.
///
/// `PROCESSING -> PROCESSING` is allowed so that a redelivered task, or a
/// mapping resubmitted for a run that crashed, can restart the job.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Validating, PendingMapping)
            | (PendingMapping, Processing)
            | (Processing, Processing)
            | (Completed, Processing)
            | (Failed, Processing)
            | (Processing, Completed)
            | (Validating, Failed)
            | (PendingMapping, Failed)
            | (Processing, Failed)
    )
}

/// Check a transition, returning the target status or a conflict.
pub fn transition(from: JobStatus, to: JobStatus) -> Result<JobStatus, AppError> {
    if can_transition(from, to) {
        Ok(to)
    } else {
        Err(AppError::Conflict(anyhow::anyhow!(
            "Illegal job transition {} -> {}",
            from.as_str(),
            to.as_str()
        )))
    }
}
