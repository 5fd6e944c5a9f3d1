//! Job and execution types shared by every nimbus crate.

use chrono::{DateTime, Utc};
use nimbus_parsers::{format_job_timestamp, parse_job_timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Validation failures for entity constructors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("Invalid timestamp in {field}: {value}")]
    Timestamp { field: &'static str, value: String },
    #[error("Metric value for {0} is not finite")]
    NotFinite(String),
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
}

/// Control-plane execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

impl ExecutionState {
    /// Status string reported by the control plane.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Aborted => "ABORTED",
        }
    }

    /// Whether the execution can no longer change state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Terminal states other than success.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::Aborted)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown execution status: {0}")]
pub struct UnknownState(pub String);

impl FromStr for ExecutionState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "TIMED_OUT" => Ok(Self::TimedOut),
            "ABORTED" => Ok(Self::Aborted),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// Control-plane identifier of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionHandle(String);

impl ExecutionHandle {
    /// Build the execution ARN for a named execution of a state machine.
    pub fn new(region: &str, account: &str, state_machine: &str, execution_name: &str) -> Self {
        Self(format!(
            "arn:aws:states:{}:{}:execution:{}:{}",
            region, account, state_machine, execution_name
        ))
    }

    /// Wrap an ARN received from the control plane.
    pub fn from_arn(arn: impl Into<String>) -> Self {
        Self(arn.into())
    }

    pub fn arn(&self) -> &str {
        &self.0
    }

    /// State machine name embedded in the ARN.
    pub fn state_machine_name(&self) -> Option<&str> {
        self.0.split(':').nth(6)
    }

    /// Execution name embedded in the ARN.
    pub fn execution_name(&self) -> Option<&str> {
        self.0.split(':').nth(7)
    }
}

impl fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the control plane reports about one execution.
#[derive(Debug, Clone)]
pub struct ExecutionDescription {
    pub handle: ExecutionHandle,
    pub state: ExecutionState,
    /// Execution input (JSON text)
    pub input: String,
    /// Execution output (JSON text), only present once succeeded
    pub output: Option<String>,
    pub start_date: DateTime<Utc>,
    pub stop_date: Option<DateTime<Utc>>,
}

impl ExecutionDescription {
    /// Job id embedded in the execution input under `jobid`.
    ///
    /// Accepts both string and numeric ids; malformed input yields None.
    pub fn input_job_id(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(&self.input).ok()?;
        match value.get("jobid")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// One page of a paginated execution listing.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPage {
    pub executions: Vec<ExecutionHandle>,
    pub next_token: Option<String>,
}

/// Caller-visible identity of one job.
///
/// Written once to the job index when the run is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    job_id: String,
    execution_name: String,
    state_machine_name: String,
    log_location: String,
    created_at: DateTime<Utc>,
}

impl JobDescriptor {
    pub fn new(
        job_id: impl Into<String>,
        execution_name: impl Into<String>,
        state_machine_name: impl Into<String>,
        log_location: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let job_id = job_id.into();
        let execution_name = execution_name.into();
        let state_machine_name = state_machine_name.into();
        if job_id.trim().is_empty() {
            return Err(ValidationError::Empty("job_id"));
        }
        if execution_name.trim().is_empty() {
            return Err(ValidationError::Empty("execution_name"));
        }
        if state_machine_name.trim().is_empty() {
            return Err(ValidationError::Empty("state_machine_name"));
        }
        Ok(Self {
            job_id,
            execution_name,
            state_machine_name,
            log_location: log_location.into(),
            created_at,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn execution_name(&self) -> &str {
        &self.execution_name
    }

    pub fn state_machine_name(&self) -> &str {
        &self.state_machine_name
    }

    pub fn log_location(&self) -> &str {
        &self.log_location
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Snapshot written to the job index.
    pub fn to_record(&self) -> IndexRecord {
        IndexRecord {
            job_id: self.job_id.clone(),
            execution_name: self.execution_name.clone(),
            state_machine: self.state_machine_name.clone(),
            log_location: self.log_location.clone(),
            time_stamp: format_job_timestamp(&self.created_at),
        }
    }
}

impl TryFrom<IndexRecord> for JobDescriptor {
    type Error = ValidationError;

    fn try_from(record: IndexRecord) -> Result<Self, Self::Error> {
        let created_at =
            parse_job_timestamp(&record.time_stamp).ok_or_else(|| ValidationError::Timestamp {
                field: "Time Stamp",
                value: record.time_stamp.clone(),
            })?;
        Self::new(
            record.job_id,
            record.execution_name,
            record.state_machine,
            record.log_location,
            created_at,
        )
    }
}

/// Job index record as stored in the keyed index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    #[serde(rename = "Job Id")]
    pub job_id: String,
    #[serde(rename = "Execution Name")]
    pub execution_name: String,
    #[serde(rename = "Step Function")]
    pub state_machine: String,
    #[serde(rename = "Log Location")]
    pub log_location: String,
    #[serde(rename = "Time Stamp")]
    pub time_stamp: String,
}

/// One telemetry or sampler observation.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    timestamp: DateTime<Utc>,
    metric_name: String,
    value: f64,
}

impl MetricSample {
    pub fn new(
        timestamp: DateTime<Utc>,
        metric_name: impl Into<String>,
        value: f64,
    ) -> Result<Self, ValidationError> {
        let metric_name = metric_name.into();
        if metric_name.is_empty() {
            return Err(ValidationError::Empty("metric_name"));
        }
        if !value.is_finite() {
            return Err(ValidationError::NotFinite(metric_name));
        }
        Ok(Self {
            timestamp,
            metric_name,
            value,
        })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Compute instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    /// The instance is no longer able to run the job.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated | Self::Stopped)
    }
}

/// Compute instance as reported by the compute API.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub state: InstanceState,
    pub instance_type: Option<String>,
    pub availability_zone: Option<String>,
}

/// Blob metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}
