//! Prometheus metrics for reconciliation-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Rows read from uploaded files, by outcome (ingested, dropped, failed).
pub static ROWS_INGESTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_rows_total",
        "Total number of rows read from uploaded files",
        &["outcome"]
    )
    .expect("Failed to register ROWS_INGESTED")
});

/// Batches reconciled, by format of the source file.
pub static BATCHES_PROCESSED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_batches_total",
        "Total number of reconciled batches",
        &["format"]
    )
    .expect("Failed to register BATCHES_PROCESSED")
});

/// Matching decisions by resulting status.
pub static MATCH_DECISIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_match_decisions_total",
        "Total number of matching decisions",
        &["status"]
    )
    .expect("Failed to register MATCH_DECISIONS")
});

/// Processing runs by final job status.
pub static JOB_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_job_runs_total",
        "Total number of processing runs",
        &["status"]
    )
    .expect("Failed to register JOB_RUNS")
});

/// Histogram for processing run duration.
pub static JOB_RUN_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_job_run_duration_seconds",
        "Processing run duration in seconds",
        &["status"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    )
    .expect("Failed to register JOB_RUN_DURATION")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&ROWS_INGESTED);
    Lazy::force(&BATCHES_PROCESSED);
    Lazy::force(&MATCH_DECISIONS);
    Lazy::force(&JOB_RUNS);
    Lazy::force(&JOB_RUN_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record `count` rows with the given outcome.
pub fn record_rows(outcome: &str, count: u64) {
    if count > 0 {
        ROWS_INGESTED
            .with_label_values(&[outcome])
            .inc_by(count as f64);
    }
}

pub fn record_batch(format: &str) {
    BATCHES_PROCESSED.with_label_values(&[format]).inc();
}

pub fn record_match_decision(status: &str) {
    MATCH_DECISIONS.with_label_values(&[status]).inc();
}

/// Record a finished processing run and its duration.
pub fn record_job_run(status: &str, duration_secs: f64) {
    JOB_RUNS.with_label_values(&[status]).inc();
    JOB_RUN_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
