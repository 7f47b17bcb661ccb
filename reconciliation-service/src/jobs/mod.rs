//! Upload job lifecycle.

pub mod processor;
pub mod service;
pub mod state;

pub use processor::{JobProcessor, ProcessingTask};
pub use service::{
    IngestionService, JobStatusView, MappingOutcome, ResultPage, TaskQueue, UploadOutcome,
};
