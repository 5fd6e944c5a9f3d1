//! Job tracking against the workflow control plane.
//!
//! Jobs are addressed by job id. The keyed index is the fast path; when it
//! misses or fails the tracker scans the state machine's executions and
//! matches the `jobid` embedded in each input.

use crate::index::{IndexBackoff, IndexError, JobIndex};
use chrono::{DateTime, Utc};
use nimbus_core::{
    BlobStore, ClientError, ComputeApi, Context, ControlPlane, ExecutionHandle, ExecutionState,
    JobDescriptor, Settings, ValidationError,
};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Length of generated job ids.
pub const JOB_ID_LENGTH: usize = 12;

/// Longest execution name the control plane accepts.
const MAX_EXECUTION_NAME: usize = 80;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("No execution found for job {0}")]
    NotFound(String),
    #[error("Service request failed: {0}")]
    Client(#[from] ClientError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("Invalid job input: {0}")]
    InvalidInput(String),
    #[error("Invalid output of {handle}: {source}")]
    InvalidOutput {
        handle: ExecutionHandle,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// What a kill request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    /// The execution had already finished.
    AlreadyTerminal(ExecutionState),
    /// An abort marker was written for the worker to pick up.
    SoftRequested { bucket: String, key: String },
    /// Instances were terminated and the execution stopped.
    Stopped { terminated_instances: Vec<String> },
}

/// A started run.
#[derive(Debug, Clone)]
pub struct LaunchedJob {
    pub job_id: String,
    pub handle: ExecutionHandle,
    pub descriptor: JobDescriptor,
}

/// Jobs grouped by execution state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub running: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Jobs whose execution could not be found or described.
    pub other: Vec<String>,
}

/// Log bucket named in a run input (`config.log_bucket`).
pub fn input_log_bucket(input: &Value) -> Option<&str> {
    input
        .get("config")
        .and_then(|config| config.get("log_bucket"))
        .and_then(Value::as_str)
        .filter(|bucket| !bucket.is_empty())
}

/// Random alphanumeric job id.
pub fn generate_job_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(JOB_ID_LENGTH)
        .map(char::from)
        .collect()
}

/// Execution name made unique with a uuid suffix.
pub fn randomized_execution_name(run_name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().to_string();
    let keep = MAX_EXECUTION_NAME - suffix.len() - 1;
    let prefix: String = run_name.chars().take(keep).collect();
    format!("{}_{}", prefix, suffix)
}

#[derive(Clone)]
pub struct JobTracker {
    settings: Settings,
    control_plane: Arc<dyn ControlPlane>,
    compute: Arc<dyn ComputeApi>,
    blobs: Arc<dyn BlobStore>,
    index: JobIndex,
    state_machine: String,
}

impl JobTracker {
    /// Tracker for the primary state machine.
    pub fn new(ctx: &Context) -> Self {
        Self {
            settings: ctx.settings.clone(),
            control_plane: ctx.control_plane.clone(),
            compute: ctx.compute.clone(),
            blobs: ctx.blobs.clone(),
            index: JobIndex::new(ctx.index.clone()),
            state_machine: ctx.settings.primary_state_machine_name(),
        }
    }

    pub fn with_state_machine(mut self, state_machine: impl Into<String>) -> Self {
        self.state_machine = state_machine.into();
        self
    }

    pub fn with_backoff(mut self, backoff: IndexBackoff) -> Self {
        self.index = self.index.with_backoff(backoff);
        self
    }

    pub fn state_machine(&self) -> &str {
        &self.state_machine
    }

    pub fn index(&self) -> &JobIndex {
        &self.index
    }

    /// Execution running a job.
    pub async fn resolve(&self, job_id: &str) -> Result<ExecutionHandle, TrackerError> {
        match self.index.lookup(job_id).await {
            Ok(Some(descriptor)) => {
                return Ok(self.settings.execution_handle(
                    descriptor.state_machine_name(),
                    descriptor.execution_name(),
                ));
            }
            Ok(None) => tracing::debug!("Job {} not in index, scanning executions", job_id),
            Err(e) => tracing::warn!(
                "Failed to look up job {} in index, scanning executions: {}",
                job_id,
                e
            ),
        }
        self.scan(job_id).await
    }

    async fn scan(&self, job_id: &str) -> Result<ExecutionHandle, TrackerError> {
        let mut token: Option<String> = None;
        loop {
            let page = self
                .control_plane
                .list_executions(&self.state_machine, None, token.as_deref())
                .await?;
            for handle in page.executions {
                match self.control_plane.describe_execution(&handle).await {
                    Ok(description) if description.input_job_id().as_deref() == Some(job_id) => {
                        return Ok(handle);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Failed to describe {}: {}", handle, e),
                }
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Err(TrackerError::NotFound(job_id.to_string())),
            }
        }
    }

    pub async fn check_status(
        &self,
        handle: &ExecutionHandle,
    ) -> Result<ExecutionState, TrackerError> {
        Ok(self.control_plane.describe_execution(handle).await?.state)
    }

    /// Parsed output of a succeeded execution.
    pub async fn check_output(
        &self,
        handle: &ExecutionHandle,
    ) -> Result<Option<Value>, TrackerError> {
        let description = self.control_plane.describe_execution(handle).await?;
        if description.state != ExecutionState::Succeeded {
            return Ok(None);
        }
        match description.output {
            Some(output) => serde_json::from_str(&output)
                .map(Some)
                .map_err(|source| TrackerError::InvalidOutput {
                    handle: handle.clone(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Abort a running execution.
    ///
    /// A soft kill leaves a `<job_id>.kill` marker in the log bucket for the
    /// worker; a hard kill terminates the job's instances and stops the
    /// execution.
    pub async fn kill(
        &self,
        handle: &ExecutionHandle,
        soft: bool,
    ) -> Result<KillOutcome, TrackerError> {
        let description = self.control_plane.describe_execution(handle).await?;
        if description.state.is_terminal() {
            return Ok(KillOutcome::AlreadyTerminal(description.state));
        }
        let job_id = description
            .input_job_id()
            .ok_or_else(|| TrackerError::InvalidInput(format!("{} has no jobid", handle)))?;

        if soft {
            let input: Value = serde_json::from_str(&description.input)
                .map_err(|e| TrackerError::InvalidInput(e.to_string()))?;
            let bucket = match input_log_bucket(&input) {
                Some(bucket) => bucket.to_string(),
                None => self
                    .index
                    .lookup(&job_id)
                    .await?
                    .map(|d| d.log_location().to_string())
                    .filter(|location| !location.is_empty())
                    .ok_or_else(|| {
                        TrackerError::InvalidInput(format!("no log bucket for job {}", job_id))
                    })?,
            };
            let key = format!("{}.kill", job_id);
            self.blobs.put(&bucket, &key, Vec::new()).await?;
            tracing::info!("Requested soft kill of job {}", job_id);
            return Ok(KillOutcome::SoftRequested { bucket, key });
        }

        let instances = self
            .compute
            .find_tagged_instances("Name", &self.settings.instance_tag(&job_id))
            .await?;
        let terminated_instances: Vec<String> = instances
            .into_iter()
            .filter(|instance| !instance.state.is_gone())
            .map(|instance| instance.instance_id)
            .collect();
        if !terminated_instances.is_empty() {
            self.compute.terminate_instances(&terminated_instances).await?;
        }
        self.control_plane
            .stop_execution(handle, "Aborted", "Killed by user")
            .await?;
        tracing::info!(
            "Killed job {} ({} instances terminated)",
            job_id,
            terminated_instances.len()
        );
        Ok(KillOutcome::Stopped {
            terminated_instances,
        })
    }

    pub async fn kill_job(&self, job_id: &str, soft: bool) -> Result<KillOutcome, TrackerError> {
        let handle = self.resolve(job_id).await?;
        self.kill(&handle, soft).await
    }

    /// Kill every running execution of the state machine.
    ///
    /// Executions that fail to stop are logged and skipped.
    pub async fn kill_all(
        &self,
        soft: bool,
    ) -> Result<Vec<(ExecutionHandle, KillOutcome)>, TrackerError> {
        let mut running = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .control_plane
                .list_executions(
                    &self.state_machine,
                    Some(ExecutionState::Running),
                    token.as_deref(),
                )
                .await?;
            running.extend(page.executions);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let mut killed = Vec::new();
        for handle in running {
            match self.kill(&handle, soft).await {
                Ok(outcome) => killed.push((handle, outcome)),
                Err(e) => tracing::warn!("Failed to kill {}: {}", handle, e),
            }
        }
        Ok(killed)
    }

    /// Start a run.
    ///
    /// The job id is taken from the argument, then from the input's `jobid`,
    /// and generated otherwise. A failed index write is logged; the run still
    /// resolves through the execution scan.
    pub async fn launch(
        &self,
        mut input: Value,
        run_name: Option<&str>,
        job_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LaunchedJob, TrackerError> {
        let Some(fields) = input.as_object_mut() else {
            return Err(TrackerError::InvalidInput("run input must be an object".to_string()));
        };
        let job_id = job_id
            .map(str::to_string)
            .or_else(|| fields.get("jobid").and_then(Value::as_str).map(str::to_string))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_job_id);
        fields.insert("jobid".to_string(), Value::String(job_id.clone()));

        let run_name = run_name
            .map(str::to_string)
            .or_else(|| {
                input
                    .pointer("/config/run_name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| job_id.clone());
        let execution_name = randomized_execution_name(&run_name);
        let log_location = input_log_bucket(&input).unwrap_or_default().to_string();

        let handle = self
            .control_plane
            .start_execution(&self.state_machine, &execution_name, &input.to_string())
            .await?;
        let descriptor = JobDescriptor::new(
            job_id.clone(),
            execution_name,
            self.state_machine.clone(),
            log_location,
            now,
        )?;
        if let Err(e) = self.index.record(&descriptor).await {
            tracing::warn!("Failed to record job {} in index: {}", job_id, e);
        }
        tracing::info!("Launched job {} as {}", job_id, handle);

        Ok(LaunchedJob {
            job_id,
            handle,
            descriptor,
        })
    }

    pub async fn status_summary(&self, job_ids: &[String]) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for job_id in job_ids {
            let state = match self.resolve(job_id).await {
                Ok(handle) => self.check_status(&handle).await,
                Err(e) => Err(e),
            };
            match state {
                Ok(ExecutionState::Running) => summary.running.push(job_id.clone()),
                Ok(ExecutionState::Succeeded) => summary.succeeded.push(job_id.clone()),
                Ok(_) => summary.failed.push(job_id.clone()),
                Err(e) => {
                    tracing::warn!("Failed to check status of job {}: {}", job_id, e);
                    summary.other.push(job_id.clone());
                }
            }
        }
        summary
    }
}
