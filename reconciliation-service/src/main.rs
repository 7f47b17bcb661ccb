//! Reconciliation Service entry point.
//!
//! With no arguments the service runs until Ctrl+C or SIGTERM. Given a file
//! (and optionally a JSON column mapping) it ingests that file once and exits.

use reconciliation_service::config::IngestionConfig;
use reconciliation_service::models::ColumnMapping;
use reconciliation_service::services::init_metrics;
use reconciliation_service::startup::{run_once, Application};

use service_core::observability::init_tracing;
use std::path::{Path, PathBuf};
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

fn load_mapping(path: Option<&Path>) -> std::io::Result<ColumnMapping> {
    let Some(path) = path else {
        return Ok(ColumnMapping::default());
    };
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| {
        std::io::Error::other(format!("Invalid column mapping {}: {}", path.display(), e))
    })
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load configuration
    let config = IngestionConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    // Initialize tracing
    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        otlp_endpoint = ?config.otlp_endpoint,
        "Starting reconciliation-service"
    );

    // Initialize metrics
    init_metrics();

    // Log configuration (mask sensitive values)
    let store = if config.database.is_some() {
        "postgres"
    } else {
        "memory"
    };
    tracing::info!(
        service_name = %config.service_name,
        environment = %config.common.environment,
        http_port = %config.common.port,
        store = store,
        worker_count = config.workers.worker_count,
        batch_size = config.pipeline.batch_size,
        default_tolerance = %config.pipeline.default_tolerance,
        "Configuration loaded"
    );

    let args: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if let Some(file) = args.first() {
        let mapping = load_mapping(args.get(1).map(PathBuf::as_path))?;
        let job = run_once(&config, file, mapping).await.map_err(|e| {
            tracing::error!(error = %e, file = %file.display(), "Ingestion failed");
            std::io::Error::other(format!("Ingestion failed: {}", e))
        })?;

        tracing::info!(
            job_id = %job.id,
            status = job.status.as_str(),
            processed = job.counters.processed,
            failed = job.counters.failed,
            matched = job.counters.total_matched,
            partial = job.counters.total_partial,
            unmatched = job.counters.total_unmatched,
            duplicate = job.counters.total_duplicate,
            "Ingestion finished"
        );
        return Ok(());
    }

    // Build and run application
    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    app.run_until_stopped(shutdown_signal()).await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}
