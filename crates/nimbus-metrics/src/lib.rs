//! Resource metrics for worker instances.
//!
//! Collects memory, CPU, disk and read-throughput statistics from the
//! telemetry service, reduces them into a summary, and publishes the metrics
//! artifacts (dense table, summary report, per-process tables, HTML page and
//! lock) under `<job_id>.metrics/` in the job's log bucket.

pub mod chunk;
pub mod collector;
pub mod publish;
pub mod report;

pub use chunk::{POINT_LIMIT, TimeChunk, chunk_window};
pub use collector::{
    DATA_MOUNT_PATH, Dimension, IDLE_READ_BYTES, InstanceTarget, Reducer, ResourceMetrics,
    ResourceMetricsCollector,
};
pub use publish::{
    COST_KEYS, PublishOutcome, PublishRequest, publish_report, top_log_key, update_html_only,
};
pub use report::{
    HTML_REPORT, LOCK, METRICS_TABLE, MISSING, SUMMARY_REPORT, SummaryReport, TOP_CPU_TABLE,
    TOP_MEM_TABLE, artifact_key, metrics_table, render_html,
};

use nimbus_core::ClientError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Telemetry query failed: {0}")]
    Telemetry(ClientError),
    #[error("Report storage failed: {0}")]
    Storage(ClientError),
    #[error("Missing report artifact: {0}")]
    MissingArtifact(String),
}
