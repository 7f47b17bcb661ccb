//! Configuration module for reconciliation-service.

use crate::ingest::DEFAULT_BATCH_SIZE;
use crate::models::DEFAULT_TOLERANCE;
use crate::workers::WorkerConfig;
use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// `None` runs every store in process memory.
    pub database: Option<DatabaseConfig>,
    pub workers: WorkerConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub preview_rows: usize,
    /// Used when the settings store has no tolerance.
    pub default_tolerance: Decimal,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            preview_rows: 20,
            default_tolerance: DEFAULT_TOLERANCE,
        }
    }
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl IngestionConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let database = env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(|url| DatabaseConfig {
                url,
                max_connections: parsed("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parsed("DATABASE_MIN_CONNECTIONS", 2),
            });

        let default_tolerance: Decimal = parsed("DEFAULT_TOLERANCE", DEFAULT_TOLERANCE);
        if default_tolerance < Decimal::ZERO || default_tolerance > Decimal::ONE {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DEFAULT_TOLERANCE must be between 0 and 1"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "reconciliation-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database,
            workers: WorkerConfig {
                worker_count: parsed("WORKER_COUNT", 2),
                queue_size: parsed("WORKER_QUEUE_SIZE", 100),
            },
            pipeline: PipelineConfig {
                batch_size: parsed("INGEST_BATCH_SIZE", DEFAULT_BATCH_SIZE),
                preview_rows: parsed("PREVIEW_ROWS", 20),
                default_tolerance,
            },
        })
    }
}
