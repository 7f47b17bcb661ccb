//! Reconciliation Service - bulk transaction ingestion with identifier and
//! tolerance based matching and an append-only audit trail.

pub mod audit;
pub mod config;
pub mod ingest;
pub mod jobs;
pub mod matching;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
