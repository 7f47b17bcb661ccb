//! Services module for reconciliation-service.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod store;

pub use database::Database;
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics, record_error};
pub use store::{AuditStore, ConfigStore, JobStore, RecordStore, ResultStore, StoreError, Stores};
