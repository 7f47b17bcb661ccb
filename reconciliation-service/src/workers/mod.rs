mod orchestrator;

pub use orchestrator::{QueueHandle, WorkerConfig, WorkerOrchestrator};
