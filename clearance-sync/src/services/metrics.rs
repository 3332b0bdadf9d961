//! Prometheus metrics for clearance-sync.
//!
//! Service metrics live in the default `prometheus` registry. HTTP metrics
//! recorded by the shared middleware go through the `metrics` facade and are
//! rendered from its Prometheus recorder.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for gRPC requests by method and status.
pub static GRPC_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clearance_sync_grpc_requests_total",
        "Total number of gRPC requests",
        &["method", "status"]
    )
    .expect("Failed to register GRPC_REQUESTS")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "clearance_sync_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for finished reconciliation runs by trigger and status.
pub static SYNC_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clearance_sync_runs_total",
        "Total number of finished reconciliation runs",
        &["trigger", "status"]
    )
    .expect("Failed to register SYNC_RUNS")
});

/// Counter for ACS grant/revoke operations by final outcome.
pub static ACS_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clearance_sync_acs_operations_total",
        "Total number of ACS grant and revoke operations",
        &["action", "outcome"]
    )
    .expect("Failed to register ACS_OPERATIONS")
});

/// Histogram for ACS operation duration, retries included.
pub static ACS_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "clearance_sync_acs_duration_seconds",
        "ACS operation duration in seconds",
        &["operation"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register ACS_DURATION")
});

/// Counter for audit entries that could not be persisted.
pub static AUDIT_WRITE_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clearance_sync_audit_write_failures_total",
        "Total number of audit entries that could not be written",
        &["action"]
    )
    .expect("Failed to register AUDIT_WRITE_FAILURES")
});

/// Handle to the recorder behind the `metrics` facade.
static RECORDER_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize all metrics and install the facade recorder. Safe to call more
/// than once.
pub fn init_metrics() {
    Lazy::force(&GRPC_REQUESTS);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&SYNC_RUNS);
    Lazy::force(&ACS_OPERATIONS);
    Lazy::force(&ACS_DURATION);
    Lazy::force(&AUDIT_WRITE_FAILURES);

    RECORDER_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already installed, HTTP metrics not exported");
        }
        handle
    });
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    let mut text = String::from_utf8(buffer).unwrap_or_default();

    if let Some(handle) = RECORDER_HANDLE.get() {
        text.push_str(&handle.render());
    }
    text
}

/// Record a gRPC request.
pub fn record_grpc_request(method: &str, status: &str) {
    GRPC_REQUESTS.with_label_values(&[method, status]).inc();
}

/// Record a finished run.
pub fn record_sync_run(trigger: &str, status: &str) {
    SYNC_RUNS.with_label_values(&[trigger, status]).inc();
}

/// Record the final outcome of an ACS operation.
pub fn record_acs_operation(action: &str, outcome: &str) {
    ACS_OPERATIONS.with_label_values(&[action, outcome]).inc();
}

pub fn record_audit_write_failure(action: &str) {
    AUDIT_WRITE_FAILURES.with_label_values(&[action]).inc();
}
