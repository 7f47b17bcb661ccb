//! Application startup and lifecycle management.

use crate::config::IngestionConfig;
use crate::jobs::{IngestionService, JobProcessor, TaskQueue};
use crate::models::{ColumnMapping, UploadJob};
use crate::services::{get_metrics, init_metrics, Database, Stores};
use crate::workers::WorkerOrchestrator;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use service_core::error::AppError;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use uuid::Uuid;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service: IngestionService,
    /// `None` when running on in-memory stores.
    pub db: Option<Arc<Database>>,
}

/// Connect the configured store backend, running migrations for PostgreSQL.
pub async fn connect_stores(
    config: &IngestionConfig,
    run_migrations: bool,
) -> Result<(Stores, Option<Arc<Database>>), AppError> {
    let Some(database) = &config.database else {
        tracing::warn!("DATABASE_URL not set - using in-memory stores");
        return Ok((Stores::in_memory(), None));
    };

    let db = Database::new(
        &database.url,
        database.max_connections,
        database.min_connections,
    )
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "Failed to connect to PostgreSQL");
        e
    })?;

    if run_migrations {
        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;
    }

    let db = Arc::new(db);
    Ok((Stores::from_backend(db.clone()), Some(db)))
}

async fn store_health(db: &Option<Arc<Database>>) -> Result<(), AppError> {
    match db {
        Some(db) => db.health_check().await,
        None => Ok(()),
    }
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = if state.db.is_some() { "postgres" } else { "memory" };
    match store_health(&state.db).await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "reconciliation-service",
                    "store": store,
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "reconciliation-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match store_health(&state.db).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
    orchestrator: WorkerOrchestrator,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: IngestionConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: IngestionConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: IngestionConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let (stores, db) = connect_stores(&config, run_migrations).await?;
        let processor = JobProcessor::new(
            stores.clone(),
            config.pipeline.batch_size,
            config.pipeline.default_tolerance,
        );
        let (mut orchestrator, queue) = WorkerOrchestrator::new(config.workers.clone(), processor);
        orchestrator.start()?;

        let service = IngestionService::new(stores, Arc::new(queue), config.pipeline.preview_rows);
        service.audit().initialize_defaults().await?;

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Reconciliation service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state: AppState { service, db },
            orchestrator,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// The ingestion service handed to upload collaborators.
    pub fn service(&self) -> &IngestionService {
        &self.state.service
    }

    /// Serve the operational endpoints until `shutdown` resolves, then drain
    /// the worker pool.
    pub async fn run_until_stopped(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
            )
            .with_state(self.state);

        tracing::info!(
            service = "reconciliation-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, http_router)
            .with_graceful_shutdown(shutdown)
            .await;

        self.orchestrator.shutdown().await;

        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server error");
            return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
        }
        Ok(())
    }
}

/// Upload one file on behalf of a local operator and process it in place.
///
/// Returns the job after the run. A completed job with an identical
/// mapping is returned as is.
pub async fn run_once(
    config: &IngestionConfig,
    file: &Path,
    mapping: ColumnMapping,
) -> Result<UploadJob, AppError> {
    init_metrics();

    let (stores, _db) = connect_stores(config, true).await?;
    let processor = JobProcessor::new(
        stores.clone(),
        config.pipeline.batch_size,
        config.pipeline.default_tolerance,
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let queue: Arc<dyn TaskQueue> = Arc::new(tx);
    let service = IngestionService::new(stores, queue, config.pipeline.preview_rows);
    service.audit().initialize_defaults().await?;

    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());
    let upload = service.upload(Uuid::nil(), &file_name, file).await?;
    tracing::info!(
        job_id = %upload.job.id,
        reused = upload.reused,
        columns = ?upload.preview.headers,
        "File registered"
    );

    let outcome = service.submit_mapping(upload.job.id, mapping).await?;
    if outcome.reused {
        return Ok(outcome.job);
    }

    let mut job = outcome.job;
    while let Ok(task) = rx.try_recv() {
        job = processor.run(&task).await?;
    }
    Ok(job)
}
