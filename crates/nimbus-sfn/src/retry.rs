//! Retry taxonomy for state-machine transitions.
//!
//! Handlers never sleep. They return a [`HandlerError`] and the state machine
//! applies the retry rules attached to the failing state.

use nimbus_core::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Closed set of conditions a handler may ask the state machine to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetrySignal {
    /// The instance has not reported that the job started yet.
    InstanceStillStarting,
    /// The job is still running.
    StillRunning,
    /// A job this one depends on is still running.
    DependencyStillRunning,
    /// The account is at its instance capacity limit.
    CapacityLimitWait,
    /// Transient control-plane failure while starting a run.
    StartControlPlaneTransient,
    /// Transient failure of the handler runtime itself.
    GenericTransientInfra,
}

impl RetrySignal {
    pub const ALL: [RetrySignal; 6] = [
        Self::InstanceStillStarting,
        Self::StillRunning,
        Self::DependencyStillRunning,
        Self::CapacityLimitWait,
        Self::StartControlPlaneTransient,
        Self::GenericTransientInfra,
    ];

    /// Error names this signal is reported under.
    pub fn error_names(&self) -> &'static [&'static str] {
        match self {
            Self::InstanceStillStarting => &["InstanceStillStarting"],
            Self::StillRunning => &["StillRunning"],
            Self::DependencyStillRunning => &["DependencyStillRunning"],
            Self::CapacityLimitWait => &["CapacityLimitWait"],
            Self::StartControlPlaneTransient => &["StartControlPlaneTransient"],
            Self::GenericTransientInfra => &[
                "Lambda.ServiceException",
                "Lambda.AWSLambdaException",
                "Lambda.SdkClientException",
                "Lambda.TooManyRequestsException",
            ],
        }
    }

    /// Name used when a handler raises this signal.
    pub fn error_name(&self) -> &'static str {
        self.error_names()[0]
    }

    pub fn from_error_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|signal| signal.error_names().contains(&name))
    }

    /// Retry rule for this signal.
    pub fn rule(&self) -> RetryRule {
        let (interval_seconds, max_attempts, backoff_rate) = match self {
            Self::InstanceStillStarting => (300, 25, 1.0),
            Self::StillRunning => (300, 100_000, 1.0),
            Self::DependencyStillRunning => (600, 10_000, 1.0),
            Self::CapacityLimitWait => (600, 1008, 1.0),
            Self::StartControlPlaneTransient => (30, 5, 1.0),
            Self::GenericTransientInfra => (60, 6, 2.0),
        };
        RetryRule {
            error_equals: self.error_names().iter().map(|s| s.to_string()).collect(),
            interval_seconds,
            max_attempts,
            backoff_rate,
        }
    }
}

impl fmt::Display for RetrySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.error_name())
    }
}

/// Kinds of fatal job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobFailureKind {
    JobError,
    DependencyFailed,
    InstanceIdle,
    UnintendedTermination,
    LaunchFailed,
    MalformedInput,
    Aborted,
}

impl JobFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobError => "JobError",
            Self::DependencyFailed => "DependencyFailed",
            Self::InstanceIdle => "InstanceIdle",
            Self::UnintendedTermination => "UnintendedTermination",
            Self::LaunchFailed => "LaunchFailed",
            Self::MalformedInput => "MalformedInput",
            Self::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for JobFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure that ends the job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct JobFailure {
    pub kind: JobFailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: JobFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of a failed handler call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}: {1}")]
    Retry(RetrySignal, String),
    #[error(transparent)]
    Fatal(#[from] JobFailure),
}

impl HandlerError {
    pub fn retry(signal: RetrySignal, message: impl Into<String>) -> Self {
        Self::Retry(signal, message.into())
    }

    pub fn fatal(kind: JobFailureKind, message: impl Into<String>) -> Self {
        Self::Fatal(JobFailure::new(kind, message))
    }

    /// Name the retry rules of a state are matched against.
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::Retry(signal, _) => signal.error_name(),
            Self::Fatal(failure) => failure.kind.as_str(),
        }
    }
}

/// One retry rule of a state.
///
/// Always holds a positive interval and attempt budget and a finite backoff
/// rate of at least 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRetryRule")]
pub struct RetryRule {
    #[serde(rename = "ErrorEquals")]
    error_equals: Vec<String>,
    #[serde(rename = "IntervalSeconds")]
    interval_seconds: u64,
    #[serde(rename = "MaxAttempts")]
    max_attempts: u32,
    #[serde(rename = "BackoffRate")]
    backoff_rate: f64,
}

#[derive(Deserialize)]
struct RawRetryRule {
    #[serde(rename = "ErrorEquals")]
    error_equals: Vec<String>,
    #[serde(rename = "IntervalSeconds")]
    interval_seconds: u64,
    #[serde(rename = "MaxAttempts")]
    max_attempts: u32,
    #[serde(rename = "BackoffRate")]
    backoff_rate: f64,
}

impl TryFrom<RawRetryRule> for RetryRule {
    type Error = ValidationError;

    fn try_from(raw: RawRetryRule) -> Result<Self, Self::Error> {
        Self::try_new(
            raw.error_equals,
            raw.interval_seconds,
            raw.max_attempts,
            raw.backoff_rate,
        )
    }
}

impl RetryRule {
    pub fn try_new(
        error_equals: Vec<String>,
        interval_seconds: u64,
        max_attempts: u32,
        backoff_rate: f64,
    ) -> Result<Self, ValidationError> {
        if error_equals.iter().all(|e| e.trim().is_empty()) {
            return Err(ValidationError::Empty("ErrorEquals"));
        }
        if interval_seconds == 0 {
            return Err(out_of_range("IntervalSeconds", interval_seconds));
        }
        if max_attempts == 0 {
            return Err(out_of_range("MaxAttempts", max_attempts));
        }
        if !backoff_rate.is_finite() || backoff_rate < 1.0 {
            return Err(out_of_range("BackoffRate", backoff_rate));
        }
        Ok(Self {
            error_equals,
            interval_seconds,
            max_attempts,
            backoff_rate,
        })
    }

    pub fn error_equals(&self) -> &[String] {
        &self.error_equals
    }

    pub fn interval_seconds(&self) -> u64 {
        self.interval_seconds
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_rate(&self) -> f64 {
        self.backoff_rate
    }

    pub fn matches(&self, error_name: &str) -> bool {
        self.error_equals.iter().any(|e| e == error_name)
    }

    /// Delay before the given 1-based retry attempt.
    ///
    /// Returns None once the attempt budget is spent.
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = self.backoff_rate.powi(attempt as i32 - 1);
        Some(Duration::from_secs_f64(self.interval_seconds as f64 * factor))
    }

    /// Total worst-case wait across every attempt.
    pub fn horizon(&self) -> Duration {
        let interval = self.interval_seconds as f64;
        let n = self.max_attempts as f64;
        let seconds = if (self.backoff_rate - 1.0).abs() < f64::EPSILON {
            interval * n
        } else {
            interval * (self.backoff_rate.powf(n) - 1.0) / (self.backoff_rate - 1.0)
        };
        Duration::from_secs_f64(seconds)
    }
}

fn out_of_range(field: &'static str, value: impl fmt::Display) -> ValidationError {
    ValidationError::OutOfRange {
        field,
        value: value.to_string(),
    }
}

/// Decision for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Fail,
}

/// Task states that carry retry rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    StartRun,
    RunTask,
    CheckTask,
    UpdateMetadata,
    UpdateCost,
}

impl TaskState {
    /// State name in the graph.
    pub fn state_name(&self) -> &'static str {
        match self {
            Self::StartRun => "StartRun",
            Self::RunTask => "RunTask",
            Self::CheckTask => "CheckTask",
            Self::UpdateMetadata => "UpdateMetadata",
            Self::UpdateCost => "UpdateCost",
        }
    }

    /// Handler function invoked by the state.
    pub fn function_name(&self) -> &'static str {
        match self {
            Self::StartRun => "start_run",
            Self::RunTask => "run_task",
            Self::CheckTask => "check_task",
            Self::UpdateMetadata => "update_metadata",
            Self::UpdateCost => "update_cost",
        }
    }

    fn signals(&self) -> &'static [RetrySignal] {
        use RetrySignal::*;
        match self {
            Self::StartRun => &[StartControlPlaneTransient, GenericTransientInfra],
            Self::RunTask => &[
                DependencyStillRunning,
                CapacityLimitWait,
                GenericTransientInfra,
            ],
            Self::CheckTask => &[InstanceStillStarting, StillRunning, GenericTransientInfra],
            Self::UpdateMetadata | Self::UpdateCost => &[GenericTransientInfra],
        }
    }
}

/// Ordered retry rules attached to one state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<RetryRule>", into = "Vec<RetryRule>")]
pub struct RetryPolicy {
    rules: Vec<RetryRule>,
}

impl TryFrom<Vec<RetryRule>> for RetryPolicy {
    type Error = ValidationError;

    fn try_from(rules: Vec<RetryRule>) -> Result<Self, Self::Error> {
        Self::try_new(rules)
    }
}

impl From<RetryPolicy> for Vec<RetryRule> {
    fn from(policy: RetryPolicy) -> Self {
        policy.rules
    }
}

impl RetryPolicy {
    /// Rules are matched in order, so a rule whose error names all appear in
    /// an earlier rule could never fire.
    pub fn try_new(rules: Vec<RetryRule>) -> Result<Self, ValidationError> {
        for (i, rule) in rules.iter().enumerate() {
            let shadowed = rule
                .error_equals
                .iter()
                .all(|name| rules[..i].iter().any(|earlier| earlier.matches(name)));
            if shadowed {
                return Err(ValidationError::OutOfRange {
                    field: "Retry",
                    value: format!("rule {} is shadowed by an earlier rule", i),
                });
            }
        }
        Ok(Self { rules })
    }

    pub fn for_state(state: TaskState) -> Self {
        Self::from_signals(state.signals())
    }

    pub fn from_signals(signals: &[RetrySignal]) -> Self {
        Self {
            rules: signals.iter().map(RetrySignal::rule).collect(),
        }
    }

    pub fn rules(&self) -> &[RetryRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule matching the error name.
    pub fn rule_for(&self, error_name: &str) -> Option<&RetryRule> {
        self.rules.iter().find(|rule| rule.matches(error_name))
    }

    /// Position of the first rule matching the error name.
    pub fn rule_index(&self, error_name: &str) -> Option<usize> {
        self.rules.iter().position(|rule| rule.matches(error_name))
    }

    /// Decide what to do after the given 1-based retry attempt of an error.
    ///
    /// Unlisted errors fail immediately.
    pub fn decide(&self, error_name: &str, attempt: u32) -> RetryDecision {
        match self.rule_for(error_name).and_then(|r| r.delay_before(attempt)) {
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => RetryDecision::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_table() {
        let rule = RetrySignal::InstanceStillStarting.rule();
        assert_eq!(rule.interval_seconds(), 300);
        assert_eq!(rule.max_attempts(), 25);

        let rule = RetrySignal::StillRunning.rule();
        assert_eq!(rule.max_attempts(), 100_000);

        let rule = RetrySignal::CapacityLimitWait.rule();
        assert_eq!((rule.interval_seconds(), rule.max_attempts()), (600, 1008));

        let rule = RetrySignal::GenericTransientInfra.rule();
        assert_eq!(rule.backoff_rate(), 2.0);
        assert_eq!(rule.error_equals().len(), 4);
    }

    #[test]
    fn test_every_budget_is_finite() {
        for signal in RetrySignal::ALL {
            let rule = signal.rule();
            assert!(rule.max_attempts() > 0);
            assert!(rule.delay_before(rule.max_attempts() + 1).is_none());
            assert!(rule.horizon() < Duration::from_secs(100 * 365 * 24 * 3600));
        }
    }

    #[test]
    fn test_delay_with_backoff() {
        let rule = RetrySignal::GenericTransientInfra.rule();
        assert_eq!(rule.delay_before(1), Some(Duration::from_secs(60)));
        assert_eq!(rule.delay_before(3), Some(Duration::from_secs(240)));
        assert_eq!(rule.delay_before(7), None);
        // 60 * (2^6 - 1)
        assert_eq!(rule.horizon(), Duration::from_secs(3780));

        let still_starting = RetrySignal::InstanceStillStarting.rule();
        assert_eq!(still_starting.horizon(), Duration::from_secs(300 * 25));
    }

    #[test]
    fn test_policy_for_check_task() {
        let policy = RetryPolicy::for_state(TaskState::CheckTask);
        assert_eq!(policy.rules().len(), 3);
        assert_eq!(
            policy.decide("StillRunning", 1),
            RetryDecision::RetryAfter(Duration::from_secs(300))
        );
        assert_eq!(
            policy.decide("Lambda.SdkClientException", 2),
            RetryDecision::RetryAfter(Duration::from_secs(120))
        );
        // Not listed on this state
        assert_eq!(policy.decide("DependencyStillRunning", 1), RetryDecision::Fail);
        assert_eq!(policy.decide("JobError", 1), RetryDecision::Fail);
    }

    #[test]
    fn test_handler_error_names() {
        let err = HandlerError::retry(RetrySignal::StillRunning, "job still running");
        assert_eq!(err.error_name(), "StillRunning");
        assert_eq!(err.to_string(), "StillRunning: job still running");

        let err = HandlerError::fatal(JobFailureKind::InstanceIdle, "no activity");
        assert_eq!(err.error_name(), "InstanceIdle");
        assert_eq!(err.to_string(), "InstanceIdle: no activity");

        assert_eq!(
            RetrySignal::from_error_name("Lambda.TooManyRequestsException"),
            Some(RetrySignal::GenericTransientInfra)
        );
        assert_eq!(RetrySignal::from_error_name("JobError"), None);
    }

    #[test]
    fn test_rule_serializes_with_document_names() {
        let json = serde_json::to_value(RetrySignal::StillRunning.rule()).unwrap();
        assert_eq!(json["ErrorEquals"][0], "StillRunning");
        assert_eq!(json["IntervalSeconds"], 300);
        assert_eq!(json["MaxAttempts"], 100000);
        assert_eq!(json["BackoffRate"], 1.0);
    }

    #[test]
    fn test_rule_rejects_degenerate_values() {
        let names = || vec!["StillRunning".to_string()];
        assert!(RetryRule::try_new(names(), 300, 5, 1.0).is_ok());
        assert_eq!(
            RetryRule::try_new(Vec::new(), 300, 5, 1.0),
            Err(ValidationError::Empty("ErrorEquals"))
        );
        assert!(RetryRule::try_new(names(), 0, 5, 1.0).is_err());
        assert!(RetryRule::try_new(names(), 300, 0, 1.0).is_err());
        assert!(RetryRule::try_new(names(), 300, 5, f64::NAN).is_err());
        assert!(RetryRule::try_new(names(), 300, 5, f64::INFINITY).is_err());
        assert!(RetryRule::try_new(names(), 300, 5, 0.5).is_err());
        assert!(RetryRule::try_new(names(), 300, 5, -2.0).is_err());
        assert!(RetryRule::try_new(names(), 300, 5, 0.0).is_err());
    }

    #[test]
    fn test_rule_deserialization_validates() {
        let rule: RetryRule = serde_json::from_value(serde_json::json!({
            "ErrorEquals": ["StillRunning"],
            "IntervalSeconds": 300,
            "MaxAttempts": 3,
            "BackoffRate": 1.5,
        }))
        .unwrap();
        assert_eq!(rule.backoff_rate(), 1.5);

        let zero_attempts = serde_json::from_value::<RetryRule>(serde_json::json!({
            "ErrorEquals": ["StillRunning"],
            "IntervalSeconds": 300,
            "MaxAttempts": 0,
            "BackoffRate": 1.0,
        }));
        assert!(zero_attempts.is_err());
    }

    #[test]
    fn test_policy_rejects_shadowed_rules() {
        let still_running = RetrySignal::StillRunning.rule();
        let infra = RetrySignal::GenericTransientInfra.rule();
        assert!(RetryPolicy::try_new(vec![still_running.clone(), infra]).is_ok());
        assert!(RetryPolicy::try_new(Vec::new()).unwrap().is_empty());

        let again = RetryRule::try_new(vec!["StillRunning".to_string()], 60, 2, 1.0).unwrap();
        assert!(RetryPolicy::try_new(vec![still_running, again]).is_err());
    }
}
