//! State machine definitions.
//!
//! A [`Graph`] serializes directly to the JSON definition document the
//! control plane accepts.

use crate::retry::{RetryPolicy, TaskState};
use nimbus_core::Settings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Start state not defined: {0}")]
    MissingStart(String),
    #[error("State {from} points at unknown state {to}")]
    UnknownState { from: String, to: String },
    #[error("State {0} has neither a next state nor an end")]
    MissingTransition(String),
    #[error("Invalid definition document: {0}")]
    Document(#[from] serde_json::Error),
}

/// Which state machine to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    PrimaryRun,
    CostUpdater,
}

/// Boolean comparison rule of a choice state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceRule {
    #[serde(rename = "Variable")]
    pub variable: String,
    #[serde(rename = "BooleanEquals")]
    pub boolean_equals: bool,
    #[serde(rename = "Next")]
    pub next: String,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One state of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum State {
    Task {
        #[serde(rename = "Resource")]
        resource: String,
        #[serde(rename = "ResultPath", default, skip_serializing_if = "Option::is_none")]
        result_path: Option<String>,
        #[serde(rename = "Retry", default, skip_serializing_if = "RetryPolicy::is_empty")]
        retry: RetryPolicy,
        #[serde(rename = "Next", default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
        #[serde(rename = "End", default, skip_serializing_if = "is_false")]
        end: bool,
    },
    Wait {
        #[serde(rename = "Seconds")]
        seconds: u64,
        #[serde(rename = "Next")]
        next: String,
    },
    Choice {
        #[serde(rename = "Choices")]
        choices: Vec<ChoiceRule>,
        #[serde(rename = "Default")]
        default: String,
    },
    Pass {
        #[serde(rename = "Next", default, skip_serializing_if = "Option::is_none")]
        next: Option<String>,
        #[serde(rename = "End", default, skip_serializing_if = "is_false")]
        end: bool,
    },
}

impl State {
    fn task(state: TaskState, settings: &Settings, next: Option<&str>) -> Self {
        Self::Task {
            resource: settings.lambda_arn(state.function_name()),
            result_path: None,
            retry: RetryPolicy::for_state(state),
            next: next.map(str::to_string),
            end: next.is_none(),
        }
    }

    /// Names of every state this one can move to.
    pub fn successors(&self) -> Vec<&str> {
        match self {
            Self::Task { next, .. } | Self::Pass { next, .. } => {
                next.as_deref().into_iter().collect()
            }
            Self::Wait { next, .. } => vec![next.as_str()],
            Self::Choice { choices, default } => choices
                .iter()
                .map(|c| c.next.as_str())
                .chain(std::iter::once(default.as_str()))
                .collect(),
        }
    }

    fn is_end(&self) -> bool {
        match self {
            Self::Task { end, .. } | Self::Pass { end, .. } => *end,
            _ => false,
        }
    }
}

/// A state machine definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(rename = "Comment")]
    pub comment: String,
    #[serde(rename = "StartAt")]
    pub start_state: String,
    #[serde(rename = "States")]
    pub states: BTreeMap<String, State>,
}

impl Graph {
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }

    /// Check that every transition points at a defined state.
    pub fn validate(&self) -> Result<(), GraphError> {
        if !self.states.contains_key(&self.start_state) {
            return Err(GraphError::MissingStart(self.start_state.clone()));
        }
        for (name, state) in &self.states {
            let successors = state.successors();
            if successors.is_empty() && !state.is_end() {
                return Err(GraphError::MissingTransition(name.clone()));
            }
            if let Some(missing) = successors.iter().find(|s| !self.states.contains_key(**s)) {
                return Err(GraphError::UnknownState {
                    from: name.clone(),
                    to: missing.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Serialize to the JSON definition document.
    pub fn to_document(&self) -> Result<String, GraphError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a JSON definition document.
    pub fn from_document(document: &str) -> Result<Self, GraphError> {
        let graph: Self = serde_json::from_str(document)?;
        graph.validate()?;
        Ok(graph)
    }
}

/// Build the state machine for a job kind.
pub fn build(kind: JobKind, settings: &Settings) -> Graph {
    match kind {
        JobKind::PrimaryRun => primary_run(settings),
        JobKind::CostUpdater => cost_updater(settings),
    }
}

fn primary_run(settings: &Settings) -> Graph {
    let chain = [
        (TaskState::StartRun, Some(TaskState::RunTask)),
        (TaskState::RunTask, Some(TaskState::CheckTask)),
        (TaskState::CheckTask, Some(TaskState::UpdateMetadata)),
        (TaskState::UpdateMetadata, None),
    ];
    let states = chain
        .iter()
        .map(|(state, next)| {
            (
                state.state_name().to_string(),
                State::task(*state, settings, next.map(|n| n.state_name())),
            )
        })
        .collect();
    Graph {
        comment: "Start a run on a compute instance and track it to completion".to_string(),
        start_state: TaskState::StartRun.state_name().to_string(),
        states,
    }
}

fn cost_updater(settings: &Settings) -> Graph {
    let update = TaskState::UpdateCost;
    let mut states = BTreeMap::new();
    states.insert(
        "Wait".to_string(),
        State::Wait {
            seconds: settings.cost_wait_seconds,
            next: update.state_name().to_string(),
        },
    );
    states.insert(
        update.state_name().to_string(),
        State::Task {
            resource: settings.lambda_arn(update.function_name()),
            result_path: Some("$.done".to_string()),
            retry: RetryPolicy::for_state(update),
            next: Some("UpdateCostDone".to_string()),
            end: false,
        },
    );
    states.insert(
        "UpdateCostDone".to_string(),
        State::Choice {
            choices: vec![ChoiceRule {
                variable: "$.done.done".to_string(),
                boolean_equals: true,
                next: "Done".to_string(),
            }],
            default: "Wait".to_string(),
        },
    );
    states.insert(
        "Done".to_string(),
        State::Pass {
            next: None,
            end: true,
        },
    );
    Graph {
        comment: "Update the cost of a finished run until billing reports it".to_string(),
        start_state: "Wait".to_string(),
        states,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            account: "123456789012".to_string(),
            dev_suffix: Some("dev".to_string()),
            ..Settings::default()
        }
    }

    #[test]
    fn test_primary_run_chain() {
        let graph = build(JobKind::PrimaryRun, &settings());
        graph.validate().unwrap();
        assert_eq!(graph.start_state, "StartRun");
        assert_eq!(graph.states.len(), 4);

        match graph.state("CheckTask").unwrap() {
            State::Task {
                resource,
                retry,
                next,
                end,
                ..
            } => {
                assert_eq!(
                    resource,
                    "arn:aws:lambda:us-east-1:123456789012:function:check_task_dev"
                );
                assert_eq!(retry.rules().len(), 3);
                assert!(retry.rule_for("InstanceStillStarting").is_some());
                assert_eq!(next.as_deref(), Some("UpdateMetadata"));
                assert!(!end);
            }
            other => panic!("Expected task state, got {:?}", other),
        }

        match graph.state("UpdateMetadata").unwrap() {
            State::Task { next, end, .. } => {
                assert!(next.is_none());
                assert!(end);
            }
            other => panic!("Expected task state, got {:?}", other),
        }
    }

    #[test]
    fn test_cost_updater_document() {
        let graph = build(JobKind::CostUpdater, &settings());
        let document = graph.to_document().unwrap();
        let json: serde_json::Value = serde_json::from_str(&document).unwrap();

        assert_eq!(json["StartAt"], "Wait");
        assert_eq!(json["States"]["Wait"]["Type"], "Wait");
        assert_eq!(json["States"]["Wait"]["Seconds"], 43200);
        assert_eq!(json["States"]["UpdateCost"]["ResultPath"], "$.done");
        assert_eq!(
            json["States"]["UpdateCost"]["Retry"][0]["ErrorEquals"][0],
            "Lambda.ServiceException"
        );
        assert_eq!(
            json["States"]["UpdateCostDone"]["Choices"][0]["Variable"],
            "$.done.done"
        );
        assert_eq!(json["States"]["UpdateCostDone"]["Default"], "Wait");
        assert_eq!(json["States"]["Done"]["Type"], "Pass");
        assert_eq!(json["States"]["Done"]["End"], true);
    }

    #[test]
    fn test_document_roundtrip() {
        for kind in [JobKind::PrimaryRun, JobKind::CostUpdater] {
            let graph = build(kind, &settings());
            let parsed = Graph::from_document(&graph.to_document().unwrap()).unwrap();
            assert_eq!(parsed, graph);
        }
    }

    #[test]
    fn test_document_with_invalid_retry_is_rejected() {
        let graph = build(JobKind::CostUpdater, &settings());
        let mut json: serde_json::Value =
            serde_json::from_str(&graph.to_document().unwrap()).unwrap();
        json["States"]["UpdateCost"]["Retry"][0]["BackoffRate"] = serde_json::json!(0.0);
        assert!(Graph::from_document(&json.to_string()).is_err());
    }

    #[test]
    fn test_validate_rejects_dangling_transition() {
        let mut graph = build(JobKind::CostUpdater, &settings());
        graph.states.remove("Done");
        assert!(matches!(
            graph.validate(),
            Err(GraphError::UnknownState { .. })
        ));
    }
}
