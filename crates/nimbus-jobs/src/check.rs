//! Completion check for a running job (`CheckTask`).
//!
//! The worker reports progress through marker objects in the log bucket:
//! `<job_id>.job_started`, `<job_id>.success` and `<job_id>.error`.

use crate::failure::{CustomPattern, FailureClassifier, check_log_hint, general_error_message};
use chrono::{DateTime, Duration, Utc};
use nimbus_core::{ClientError, Context};
use nimbus_metrics::{
    InstanceTarget, PublishOutcome, PublishRequest, ResourceMetricsCollector, publish_report,
};
use nimbus_parsers::parse_job_timestamp;
use nimbus_sfn::{HandlerError, JobFailureKind, RetrySignal};
use serde::Deserialize;
use serde_json::Value;

/// Filesystem of the data volume when the input does not name one.
pub const DEFAULT_FILESYSTEM: &str = "/dev/nvme1n1";

/// Window of recent activity inspected by the idle check.
const IDLE_WINDOW_HOURS: i64 = 1;

#[derive(Debug, Deserialize)]
struct CheckConfig {
    log_bucket: String,
    #[serde(default)]
    instance_id: Option<String>,
    start_time: String,
    #[serde(default)]
    instance_type: Option<String>,
    #[serde(default)]
    filesystem: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckArgs {
    #[serde(default)]
    custom_errors: Vec<CustomPattern>,
}

#[derive(Debug, Deserialize)]
struct CheckInput {
    jobid: String,
    config: CheckConfig,
    #[serde(default)]
    args: Option<CheckArgs>,
}

/// The pieces of a run input the check needs.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub job_id: String,
    pub log_bucket: String,
    pub instance_id: Option<String>,
    pub instance_type: Option<String>,
    pub filesystem: String,
    pub start_time: DateTime<Utc>,
    pub custom_errors: Vec<CustomPattern>,
}

impl CheckRequest {
    pub fn from_input(input: &Value) -> Result<Self, HandlerError> {
        let parsed = CheckInput::deserialize(input)
            .map_err(|e| HandlerError::fatal(JobFailureKind::MalformedInput, e.to_string()))?;
        let start_time = parse_job_timestamp(&parsed.config.start_time).ok_or_else(|| {
            HandlerError::fatal(
                JobFailureKind::MalformedInput,
                format!("invalid config.start_time: {}", parsed.config.start_time),
            )
        })?;
        Ok(Self {
            job_id: parsed.jobid,
            log_bucket: parsed.config.log_bucket,
            instance_id: parsed.config.instance_id.filter(|id| !id.is_empty()),
            instance_type: parsed.config.instance_type,
            filesystem: parsed
                .config
                .filesystem
                .unwrap_or_else(|| DEFAULT_FILESYSTEM.to_string()),
            start_time,
            custom_errors: parsed.args.unwrap_or_default().custom_errors,
        })
    }

    fn marker(&self, suffix: &str) -> String {
        format!("{}.{}", self.job_id, suffix)
    }
}

fn transient(e: ClientError) -> HandlerError {
    HandlerError::retry(RetrySignal::GenericTransientInfra, e.to_string())
}

async fn terminate(ctx: &Context, instance_id: Option<&str>) {
    if let Some(id) = instance_id {
        if let Err(e) = ctx.compute.terminate_instances(&[id.to_string()]).await {
            tracing::warn!("Failed to terminate instance {}: {}", id, e);
        }
    }
}

/// Publish the metrics report of a finished job; failures are only logged.
async fn publish_final_metrics(ctx: &Context, request: &CheckRequest, now: DateTime<Utc>) {
    let Some(instance_id) = request.instance_id.as_deref() else {
        return;
    };
    let publish = PublishRequest {
        job_id: request.job_id.clone(),
        log_bucket: request.log_bucket.clone(),
        target: InstanceTarget::new(instance_id, request.filesystem.clone()),
        instance_type: request.instance_type.clone().unwrap_or_default(),
        start: request.start_time,
        end: Some(now),
        job_complete: true,
        force: false,
    };
    let collector = ResourceMetricsCollector::new(ctx.telemetry.clone());
    match publish_report(ctx.blobs.as_ref(), &collector, &publish, now).await {
        Ok(PublishOutcome::Published { artifacts, .. }) => {
            tracing::debug!("Published {} artifacts for {}", artifacts.len(), request.job_id)
        }
        Ok(PublishOutcome::AlreadyPublished) => {}
        Err(e) => tracing::warn!("Failed to publish metrics for {}: {}", request.job_id, e),
    }
}

/// Error raised for a job whose worker wrote the error marker.
async fn job_error(ctx: &Context, request: &CheckRequest) -> HandlerError {
    let log = match ctx
        .blobs
        .get_string(&request.log_bucket, &request.marker("log"))
        .await
    {
        Ok(log) => log.unwrap_or_default(),
        Err(e) => {
            tracing::warn!("Failed to read log of job {}: {}", request.job_id, e);
            String::new()
        }
    };
    let classifier = FailureClassifier::new().with_custom(&request.custom_errors);
    let message = match classifier.parse_log(&log) {
        Some(analysis) => format!(
            "{}. For more info - {}",
            analysis.explanation,
            check_log_hint(&request.job_id)
        ),
        None => general_error_message(&request.job_id),
    };
    HandlerError::fatal(JobFailureKind::JobError, message)
}

/// Check a running job.
///
/// Returns the input unchanged once the job succeeded; every other outcome
/// is a retry signal or a fatal failure for the state machine.
pub async fn check_task(
    ctx: &Context,
    input: Value,
    now: DateTime<Utc>,
) -> Result<Value, HandlerError> {
    let request = CheckRequest::from_input(&input)?;
    let bucket = request.log_bucket.as_str();
    let job_id = request.job_id.as_str();

    let Some(started) = ctx
        .blobs
        .head(bucket, &request.marker("job_started"))
        .await
        .map_err(transient)?
    else {
        if request.start_time + Duration::minutes(ctx.settings.start_grace_minutes) < now {
            terminate(ctx, request.instance_id.as_deref()).await;
            return Err(HandlerError::fatal(
                JobFailureKind::InstanceIdle,
                format!(
                    "Failed to find jobid {}, instance is not initializing for too long. \
                     Terminating the instance.",
                    job_id
                ),
            ));
        }
        return Err(HandlerError::retry(
            RetrySignal::InstanceStillStarting,
            format!("Failed to find jobid {}, instance is probably still booting", job_id),
        ));
    };

    if ctx
        .blobs
        .exists(bucket, &request.marker("error"))
        .await
        .map_err(transient)?
    {
        publish_final_metrics(ctx, &request, now).await;
        return Err(job_error(ctx, &request).await);
    }

    if ctx
        .blobs
        .exists(bucket, &request.marker("success"))
        .await
        .map_err(transient)?
    {
        publish_final_metrics(ctx, &request, now).await;
        tracing::info!("Job {} completed successfully", job_id);
        return Ok(input);
    }

    if let Some(instance_id) = request.instance_id.as_deref() {
        let instance = ctx
            .compute
            .describe_instance(instance_id)
            .await
            .map_err(transient)?;
        match instance {
            None => {
                return Err(HandlerError::fatal(
                    JobFailureKind::UnintendedTermination,
                    format!("Instance is no longer found for job {} - please rerun.", job_id),
                ));
            }
            Some(instance) if instance.state.is_gone() => {
                tracing::error!(
                    "Instance {} of job {} is {:?}",
                    instance_id,
                    job_id,
                    instance.state
                );
                return Err(HandlerError::fatal(
                    JobFailureKind::UnintendedTermination,
                    format!(
                        "Instance is terminated unintendedly for job {} - please rerun.",
                        job_id
                    ),
                ));
            }
            Some(_) => {}
        }

        let window = Duration::hours(IDLE_WINDOW_HOURS);
        if started.last_modified + window < now {
            let collector = ResourceMetricsCollector::new(ctx.telemetry.clone());
            let target = InstanceTarget::new(instance_id, request.filesystem.clone());
            let metrics = collector
                .collect(&target, now - window, now)
                .await
                .map_err(|e| {
                    HandlerError::retry(RetrySignal::GenericTransientInfra, e.to_string())
                })?;
            if metrics.is_idle(ctx.settings.idle_cpu_threshold) {
                terminate(ctx, Some(instance_id)).await;
                return Err(HandlerError::fatal(
                    JobFailureKind::InstanceIdle,
                    format!(
                        "Nothing has been running for the past hour for job {} \
                         (CPU utilization {:?} and storage read {:?} bytes).",
                        job_id, metrics.max_cpu_utilization_percent, metrics.max_storage_read_bytes
                    ),
                ));
            }
        }
    }

    Err(HandlerError::retry(
        RetrySignal::StillRunning,
        format!("job {} still running", job_id),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use nimbus_core::{InstanceInfo, InstanceState, MemoryCloud, Settings};
    use serde_json::json;

    fn launched() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn input(instance_id: &str) -> Value {
        json!({
            "jobid": "job1",
            "config": {
                "log_bucket": "logs",
                "instance_id": instance_id,
                "start_time": "20240501-12:00:00-UTC",
            },
            "args": {"custom_errors": []},
        })
    }

    fn setup() -> (MemoryCloud, Context) {
        let cloud = MemoryCloud::default();
        cloud.compute.add_instance(
            InstanceInfo {
                instance_id: "i-1".to_string(),
                state: InstanceState::Running,
                instance_type: Some("t3.medium".to_string()),
                availability_zone: None,
            },
            &[("Name", "awsem-job1")],
        );
        let ctx = cloud.context(Settings::default());
        (cloud, ctx)
    }

    fn kind(err: &HandlerError) -> &'static str {
        err.error_name()
    }

    #[tokio::test]
    async fn test_not_started_within_grace_retries() {
        let (cloud, ctx) = setup();
        let err = check_task(&ctx, input("i-1"), launched() + Duration::minutes(5))
            .await
            .unwrap_err();
        assert_eq!(kind(&err), "InstanceStillStarting");
        assert!(cloud.compute.terminated().is_empty());
    }

    #[tokio::test]
    async fn test_not_started_after_grace_terminates() {
        let (cloud, ctx) = setup();
        let err = check_task(&ctx, input("i-1"), launched() + Duration::minutes(11))
            .await
            .unwrap_err();
        assert_eq!(kind(&err), "InstanceIdle");
        assert_eq!(cloud.compute.terminated(), vec!["i-1".to_string()]);
    }

    #[tokio::test]
    async fn test_error_marker_classifies_log() {
        let (cloud, ctx) = setup();
        let now = launched() + Duration::minutes(30);
        cloud.blobs.put_at("logs", "job1.job_started", b"", launched());
        cloud.blobs.put_at("logs", "job1.error", b"", now);
        cloud.blobs.put_at(
            "logs",
            "job1.log",
            b"[fputs] No space left on device\nmore",
            now,
        );
        let err = check_task(&ctx, input("i-1"), now).await.unwrap_err();
        assert_eq!(kind(&err), "JobError");
        let message = err.to_string();
        assert!(message.contains("Not enough space: [fputs] No space left on device"));
        assert!(message.contains(". For more info - check log using nimbus log --job-id=job1"));
        assert!(cloud.blobs.keys("logs").contains(&"job1.metrics/lock".to_string()));
    }

    #[tokio::test]
    async fn test_error_marker_without_match() {
        let (cloud, ctx) = setup();
        let now = launched() + Duration::minutes(30);
        cloud.blobs.put_at("logs", "job1.job_started", b"", launched());
        cloud.blobs.put_at("logs", "job1.error", b"", now);
        let err = check_task(&ctx, input(""), now).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "JobError: Job encountered an error check log using nimbus log --job-id=job1"
        );
    }

    #[tokio::test]
    async fn test_custom_error_from_input() {
        let (cloud, ctx) = setup();
        let now = launched() + Duration::minutes(30);
        cloud.blobs.put_at("logs", "job1.job_started", b"", launched());
        cloud.blobs.put_at("logs", "job1.error", b"", now);
        cloud.blobs.put_at("logs", "job1.log", b"Exception: File is empty (x.regionPeak.gz)", now);
        let mut run = input("");
        run["args"]["custom_errors"] = json!([
            {"error_type": "No peak called", "pattern": "File is empty (.+.regionPeak.gz)"}
        ]);
        let err = check_task(&ctx, run, now).await.unwrap_err();
        assert!(err.to_string().contains("No peak called: File is empty (x.regionPeak.gz)"));
    }

    #[tokio::test]
    async fn test_success_returns_input() {
        let (cloud, ctx) = setup();
        let now = launched() + Duration::minutes(30);
        cloud.blobs.put_at("logs", "job1.job_started", b"", launched());
        cloud.blobs.put_at("logs", "job1.success", b"", now);
        let output = check_task(&ctx, input("i-1"), now).await.unwrap();
        assert_eq!(output, input("i-1"));
    }

    #[tokio::test]
    async fn test_gone_instance_is_unintended_termination() {
        let (cloud, ctx) = setup();
        let now = launched() + Duration::minutes(30);
        cloud.blobs.put_at("logs", "job1.job_started", b"", launched());

        cloud.compute.set_instance_state("i-1", InstanceState::Stopped);
        let err = check_task(&ctx, input("i-1"), now).await.unwrap_err();
        assert_eq!(kind(&err), "UnintendedTermination");

        let err = check_task(&ctx, input("i-missing"), now).await.unwrap_err();
        assert_eq!(kind(&err), "UnintendedTermination");
    }

    #[tokio::test]
    async fn test_idle_instance_after_an_hour() {
        let (cloud, ctx) = setup();
        let now = launched() + Duration::hours(3);
        cloud.blobs.put_at("logs", "job1.job_started", b"", launched());
        cloud
            .telemetry
            .add_point("CPUUtilization", now - Duration::minutes(30), 0.5);
        let err = check_task(&ctx, input("i-1"), now).await.unwrap_err();
        assert_eq!(kind(&err), "InstanceIdle");
        assert_eq!(cloud.compute.terminated(), vec!["i-1".to_string()]);
    }

    #[tokio::test]
    async fn test_telemetry_outage_is_not_idle() {
        let (cloud, ctx) = setup();
        let now = launched() + Duration::hours(3);
        cloud.blobs.put_at("logs", "job1.job_started", b"", launched());
        cloud.telemetry.fail_metric("CPUUtilization");
        let err = check_task(&ctx, input("i-1"), now).await.unwrap_err();
        assert_eq!(kind(&err), "StillRunning");
        assert!(cloud.compute.terminated().is_empty());
    }

    #[tokio::test]
    async fn test_busy_instance_keeps_running() {
        let (cloud, ctx) = setup();
        let now = launched() + Duration::hours(3);
        cloud.blobs.put_at("logs", "job1.job_started", b"", launched());
        cloud
            .telemetry
            .add_point("EBSReadBytes", now - Duration::minutes(10), 50_000.0);
        let err = check_task(&ctx, input("i-1"), now).await.unwrap_err();
        assert_eq!(kind(&err), "StillRunning");
        assert!(cloud.compute.terminated().is_empty());

        // Started less than an hour ago: no idle check at all
        let recent = launched() + Duration::minutes(40);
        let err = check_task(&ctx, input("i-1"), recent).await.unwrap_err();
        assert_eq!(kind(&err), "StillRunning");
        assert!(cloud.compute.terminated().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_input() {
        let (_cloud, ctx) = setup();
        let err = check_task(&ctx, json!({"jobid": "job1"}), launched())
            .await
            .unwrap_err();
        assert_eq!(kind(&err), "MalformedInput");

        let mut bad_time = input("i-1");
        bad_time["config"]["start_time"] = json!("yesterday");
        let err = check_task(&ctx, bad_time, launched()).await.unwrap_err();
        assert_eq!(kind(&err), "MalformedInput");
    }
}
