//! Prometheus instrumentation.
//!
//! Recording goes through the `metrics` facade and is fire-and-forget: when
//! no recorder is installed every call is a no-op, so job and registry code
//! never fails because of metrics.
//!
//! | Metric | Type | Labels |
//! |---|---|---|
//! | `kbhub_operations_total` | counter | `project_id`, `operation`, `status` |
//! | `kbhub_operation_duration_seconds` | histogram | `operation` |
//! | `kbhub_indexing_chunks_total` | counter | `project_id` |
//! | `kbhub_chat_context_chunks` | histogram | |
//! | `kbhub_errors_total` | counter | `operation`, `error_kind` |
//! | `kbhub_jobs_enqueued_total` | counter | `queue` |
//! | `kbhub_projects_total` | gauge | |
//! | `kbhub_project_chunks` | gauge | `project_id`, `project_name` |
//! | `kbhub_project_storage_bytes` | gauge | `project_id`, `project_name` |
//! | `kbhub_http_requests_total` | counter | `method`, `status` |

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::models::Project;

const DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0];
const CONTEXT_BUCKETS: &[f64] = &[1.0, 2.0, 3.0, 5.0, 10.0, 20.0];

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

fn builder() -> Result<PrometheusBuilder, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("kbhub_operation_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full("kbhub_chat_context_chunks".to_string()),
            CONTEXT_BUCKETS,
        )
}

/// Install the process-wide recorder once and return the render handle.
/// Later calls return the same handle. `None` if installation failed.
pub fn install() -> Option<PrometheusHandle> {
    HANDLE
        .get_or_init(|| match builder().and_then(|b| b.install_recorder()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "metrics recorder not installed");
                None
            }
        })
        .clone()
}

/// Standalone worker processes serve their own scrape endpoint. Must be
/// called inside a tokio runtime.
pub fn install_with_listener(addr: SocketAddr) -> anyhow::Result<()> {
    builder()?.with_http_listener(addr).install()?;
    tracing::info!(%addr, "metrics listener started");
    Ok(())
}

pub fn record_operation(project_id: &str, operation: &str, status: &str, duration: Duration) {
    metrics::counter!(
        "kbhub_operations_total",
        "project_id" => project_id.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(
        "kbhub_operation_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_indexed_chunks(project_id: &str, chunks: u64) {
    metrics::counter!("kbhub_indexing_chunks_total", "project_id" => project_id.to_string())
        .increment(chunks);
}

pub fn record_chat_context(chunks: usize) {
    metrics::histogram!("kbhub_chat_context_chunks").record(chunks as f64);
}

pub fn record_error(operation: &str, error_kind: &str) {
    metrics::counter!(
        "kbhub_errors_total",
        "operation" => operation.to_string(),
        "error_kind" => error_kind.to_string()
    )
    .increment(1);
}

pub fn record_enqueued(queue: &str) {
    metrics::counter!("kbhub_jobs_enqueued_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_http_request(method: &str, status: u16) {
    metrics::counter!(
        "kbhub_http_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn set_project_gauges(project: &Project) {
    let labels = [
        ("project_id", project.id.clone()),
        ("project_name", project.name.clone()),
    ];
    metrics::gauge!("kbhub_project_chunks", &labels).set(project.total_chunks as f64);
    metrics::gauge!("kbhub_project_storage_bytes", &labels).set(project.storage_size as f64);
}

/// Zero a deleted project's series.
pub fn clear_project_gauges(project: &Project) {
    let labels = [
        ("project_id", project.id.clone()),
        ("project_name", project.name.clone()),
    ];
    metrics::gauge!("kbhub_project_chunks", &labels).set(0.0);
    metrics::gauge!("kbhub_project_storage_bytes", &labels).set(0.0);
}

/// Refresh every registry gauge from a full project listing. Called at
/// scrape time because workers in other processes update stats too.
pub fn refresh_project_gauges(projects: &[Project]) {
    metrics::gauge!("kbhub_projects_total").set(projects.len() as f64);
    for project in projects {
        set_project_gauges(project);
    }
}
