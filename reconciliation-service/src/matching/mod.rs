//! Matching engine: candidate pool and per-record decisions.

pub mod candidates;
pub mod engine;

pub use candidates::CandidatePool;
pub use engine::{decide, reconcile, Decision};
