//! Prometheus metrics for the storage adapter.
//!
//! Metrics are recorded through the `metrics` facade and are no-ops until a
//! recorder is installed.  [`init_metrics`] installs the global Prometheus
//! recorder from `metrics-exporter-prometheus`; [`render`] produces the
//! exposition text.

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Total remote object-store calls (counter). Labels: operation, status.
pub const REMOTE_OPERATIONS_TOTAL: &str = "s3_storage_remote_operations_total";

/// Total bytes uploaded, after compression (counter).
pub const BYTES_UPLOADED_TOTAL: &str = "s3_storage_bytes_uploaded_total";

/// Total bytes downloaded, as stored (counter).
pub const BYTES_DOWNLOADED_TOTAL: &str = "s3_storage_bytes_downloaded_total";

/// Total saves stored with gzip content-encoding (counter).
pub const GZIP_SAVES_TOTAL: &str = "s3_storage_gzip_saves_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder.  Calling it again returns
/// the handle installed first.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(
        REMOTE_OPERATIONS_TOTAL,
        "Total remote object-store calls by operation and status"
    );
    describe_counter!(BYTES_UPLOADED_TOTAL, "Total bytes uploaded");
    describe_counter!(BYTES_DOWNLOADED_TOTAL, "Total bytes downloaded");
    describe_counter!(GZIP_SAVES_TOTAL, "Total saves stored gzip-compressed");
}

/// Prometheus exposition text, if the recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}

// -- Recording helpers --------------------------------------------------------

pub fn record_operation(operation: &'static str, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    counter!(REMOTE_OPERATIONS_TOTAL, "operation" => operation, "status" => status).increment(1);
}

pub fn record_bytes_uploaded(bytes: u64) {
    counter!(BYTES_UPLOADED_TOTAL).increment(bytes);
}

pub fn record_bytes_downloaded(bytes: u64) {
    counter!(BYTES_DOWNLOADED_TOTAL).increment(bytes);
}

pub fn record_gzip_save() {
    counter!(GZIP_SAVES_TOTAL).increment(1);
}

// -- Tests --------------------------------------------------------------------
