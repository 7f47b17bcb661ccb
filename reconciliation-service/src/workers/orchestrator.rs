use crate::jobs::{JobProcessor, ProcessingTask, TaskQueue};
use service_core::error::AppError;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    pub queue_size: usize,
}

/// Cloneable sending side of the processing queue.
#[derive(Clone)]
pub struct QueueHandle {
    task_tx: mpsc::Sender<ProcessingTask>,
}

impl TaskQueue for QueueHandle {
    fn enqueue(&self, task: ProcessingTask) -> Result<(), AppError> {
        self.task_tx
            .try_send(task)
            .map_err(|_| AppError::InternalError(anyhow::anyhow!("Job queue full")))
    }
}

/// Unbounded in-process queue for callers that drain tasks themselves,
/// such as one-shot runs.
impl TaskQueue for mpsc::UnboundedSender<ProcessingTask> {
    fn enqueue(&self, task: ProcessingTask) -> Result<(), AppError> {
        self.send(task)
            .map_err(|_| AppError::InternalError(anyhow::anyhow!("Job queue closed")))
    }
}

/// Distributes processing tasks over a fixed set of workers.
///
/// Tasks are routed by job id, so every task of one job lands on the same
/// worker and runs after the previous one for that job has finished.
pub struct WorkerOrchestrator {
    config: WorkerConfig,
    processor: JobProcessor,
    task_rx: Option<mpsc::Receiver<ProcessingTask>>,
    shutdown_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerOrchestrator {
    pub fn new(config: WorkerConfig, processor: JobProcessor) -> (Self, QueueHandle) {
        let (task_tx, task_rx) = mpsc::channel(config.queue_size.max(1));

        let orchestrator = Self {
            config,
            processor,
            task_rx: Some(task_rx),
            shutdown_token: CancellationToken::new(),
            handles: Vec::new(),
        };

        (orchestrator, QueueHandle { task_tx })
    }

    pub fn start(&mut self) -> Result<(), AppError> {
        let mut task_rx = self.task_rx.take().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Worker pool already started"))
        })?;
        let worker_count = self.config.worker_count.max(1);

        tracing::info!(worker_count, "Starting worker pool");

        let mut senders = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let (tx, rx) = mpsc::channel(self.config.queue_size.max(1));
            senders.push(tx);
            let worker = Worker {
                id: worker_id,
                processor: self.processor.clone(),
            };
            let shutdown = self.shutdown_token.clone();
            self.handles
                .push(tokio::spawn(async move { worker.run(rx, shutdown).await }));
        }

        let shutdown = self.shutdown_token.clone();
        self.handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Task distributor shutting down");
                        break;
                    }
                    task = task_rx.recv() => {
                        match task {
                            Some(task) => {
                                let worker_id = route(task.job_id, senders.len());
                                tracing::info!(
                                    worker_id,
                                    job_id = %task.job_id,
                                    "Dispatching task to worker"
                                );
                                if senders[worker_id].send(task).await.is_err() {
                                    tracing::error!(worker_id, "Worker stopped, dropping task");
                                }
                            }
                            None => {
                                tracing::info!("Channel closed, task distributor exiting");
                                break;
                            }
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    /// Stop accepting tasks and wait for in-flight runs to finish.
    pub async fn shutdown(mut self) {
        tracing::info!("Initiating worker pool shutdown");
        self.shutdown_token.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }
}

fn route(job_id: Uuid, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    job_id.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

struct Worker {
    id: usize,
    processor: JobProcessor,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<ProcessingTask>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => self.process(task).await,
                    None => break,
                },
            }
        }
        tracing::debug!(worker_id = self.id, "Worker exiting");
    }

    async fn process(&self, task: ProcessingTask) {
        tracing::info!(worker_id = self.id, job_id = %task.job_id, "Processing task started");

        match self.processor.run(&task).await {
            Ok(job) => tracing::info!(
                worker_id = self.id,
                job_id = %job.id,
                status = job.status.as_str(),
                "Processing task finished"
            ),
            Err(e) => tracing::error!(
                worker_id = self.id,
                job_id = %task.job_id,
                error = %e,
                "Processing task failed"
            ),
        }
    }
}
