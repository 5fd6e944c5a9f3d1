//! Publishing report artifacts to the job's log bucket.

use crate::MetricsError;
use crate::collector::{InstanceTarget, ResourceMetricsCollector};
use crate::report::{
    HTML_REPORT, LOCK, METRICS_TABLE, SUMMARY_REPORT, SummaryReport, TOP_CPU_TABLE,
    TOP_MEM_TABLE, artifact_key, metrics_table, render_html,
};
use chrono::{DateTime, Utc};
use nimbus_core::BlobStore;
use nimbus_top::{Metric, TableOptions, TopSeries, write_table};

/// Summary lines written by the cost pipeline, kept across regenerations.
pub const COST_KEYS: [&str; 3] = ["Cost", "Estimated_Cost", "Estimated_Cost_Type"];

/// Commands kept in the per-process tables.
const MAX_TOP_COMMANDS: usize = 16;

/// Key of the sampler log written by the worker.
pub fn top_log_key(job_id: &str) -> String {
    format!("{}.top", job_id)
}

/// What to publish for one job.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub job_id: String,
    pub log_bucket: String,
    pub target: InstanceTarget,
    pub instance_type: String,
    pub start: DateTime<Utc>,
    /// End of the job; the report covers up to now when unset.
    pub end: Option<DateTime<Utc>>,
    /// Lock the report once written.
    pub job_complete: bool,
    /// Regenerate even when a locked report exists.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A locked report already exists.
    AlreadyPublished,
    Published {
        /// Keys written, in write order.
        artifacts: Vec<String>,
        locked: bool,
    },
}

async fn read_text(
    blobs: &dyn BlobStore,
    bucket: &str,
    key: &str,
) -> Result<Option<String>, MetricsError> {
    blobs
        .get_string(bucket, key)
        .await
        .map_err(MetricsError::Storage)
}

async fn write_text(
    blobs: &dyn BlobStore,
    bucket: &str,
    key: &str,
    body: &str,
) -> Result<(), MetricsError> {
    blobs
        .put_string(bucket, key, body)
        .await
        .map_err(MetricsError::Storage)
}

/// Collect metrics and write every report artifact.
///
/// Skips regeneration when both the HTML report and the lock exist, unless
/// forced. The lock is only written for complete jobs.
pub async fn publish_report(
    blobs: &dyn BlobStore,
    collector: &ResourceMetricsCollector,
    request: &PublishRequest,
    now: DateTime<Utc>,
) -> Result<PublishOutcome, MetricsError> {
    let bucket = request.log_bucket.as_str();
    let job_id = request.job_id.as_str();

    if !request.force {
        let has_html = blobs
            .exists(bucket, &artifact_key(job_id, HTML_REPORT))
            .await
            .map_err(MetricsError::Storage)?;
        let has_lock = blobs
            .exists(bucket, &artifact_key(job_id, LOCK))
            .await
            .map_err(MetricsError::Storage)?;
        if has_html && has_lock {
            tracing::info!("Metrics report for job {} is already published", job_id);
            return Ok(PublishOutcome::AlreadyPublished);
        }
    }

    let end = request.end.unwrap_or(now);
    let metrics = collector.collect(&request.target, request.start, end).await?;
    let table = metrics_table(&metrics);
    let mut report = SummaryReport::from_metrics(&metrics, &request.instance_type);

    let report_key = artifact_key(job_id, SUMMARY_REPORT);
    if let Some(previous) = read_text(blobs, bucket, &report_key).await? {
        let previous = SummaryReport::parse(&previous);
        for key in COST_KEYS {
            if let Some(value) = previous.get(key) {
                report.set(key, value);
            }
        }
    }

    let mut artifacts = Vec::new();
    let table_key = artifact_key(job_id, METRICS_TABLE);
    write_text(blobs, bucket, &table_key, &table).await?;
    artifacts.push(table_key);
    write_text(blobs, bucket, &report_key, &report.render()).await?;
    artifacts.push(report_key);

    if let Some(top_log) = read_text(blobs, bucket, &top_log_key(job_id)).await? {
        let series = TopSeries::parse(&top_log).collapse(MAX_TOP_COMMANDS);
        for (metric, name) in [(Metric::Cpu, TOP_CPU_TABLE), (Metric::Mem, TOP_MEM_TABLE)] {
            let mut ranked = series.clone();
            ranked.sort_commands(metric);
            let options = TableOptions {
                metric,
                delimiter: '\t',
                timestamp_column: "interval".to_string(),
                start: Some(request.start),
                end: Some(end),
                base: 1,
            };
            let key = artifact_key(job_id, name);
            write_text(blobs, bucket, &key, &write_table(&ranked, &options)).await?;
            artifacts.push(key);
        }
    }

    let html_key = artifact_key(job_id, HTML_REPORT);
    write_text(blobs, bucket, &html_key, &render_html(job_id, &report, &table)).await?;
    artifacts.push(html_key);

    if request.job_complete {
        let lock_key = artifact_key(job_id, LOCK);
        write_text(blobs, bucket, &lock_key, "").await?;
        artifacts.push(lock_key);
    }

    tracing::info!(
        "Published {} metrics artifacts for job {}",
        artifacts.len(),
        job_id
    );
    Ok(PublishOutcome::Published {
        artifacts,
        locked: request.job_complete,
    })
}

/// Regenerate the HTML report from the stored summary and table.
pub async fn update_html_only(
    blobs: &dyn BlobStore,
    bucket: &str,
    job_id: &str,
) -> Result<(), MetricsError> {
    let report_key = artifact_key(job_id, SUMMARY_REPORT);
    let report = read_text(blobs, bucket, &report_key)
        .await?
        .ok_or_else(|| MetricsError::MissingArtifact(report_key.clone()))?;
    let table = read_text(blobs, bucket, &artifact_key(job_id, METRICS_TABLE))
        .await?
        .unwrap_or_default();
    let html = render_html(job_id, &SummaryReport::parse(&report), &table);
    write_text(blobs, bucket, &artifact_key(job_id, HTML_REPORT), &html).await
}
