//! Deterministic local replay of a graph.
//!
//! Steps a [`Graph`] with virtual time. Task states call a handler closure,
//! apply the state's retry rules on failure and never sleep.

use crate::graph::{Graph, State};
use crate::retry::{HandlerError, RetryDecision};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Something that happened during a replay.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayEvent {
    Entered(String),
    Retried {
        state: String,
        error: String,
        attempt: u32,
        delay: Duration,
    },
    Waited {
        state: String,
        seconds: u64,
    },
}

/// How a replay ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayStatus {
    Succeeded,
    /// The graph failed with the terminating error of a state.
    Failed {
        state: String,
        error: String,
        cause: String,
    },
    /// The transition limit was reached first.
    TransitionLimit,
}

/// Result of replaying a graph.
#[derive(Debug, Clone)]
pub struct Replay {
    pub status: ReplayStatus,
    /// Virtual time spent in waits and retries.
    pub elapsed: Duration,
    pub transitions: usize,
    pub events: Vec<ReplayEvent>,
    pub output: Value,
}

impl Replay {
    /// Number of retries recorded for a state.
    pub fn retries(&self, state: &str) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, ReplayEvent::Retried { state: s, .. } if s == state))
            .count()
    }
}

/// Replay `graph` from its start state with `input`.
///
/// `handler` receives the state name and the current data for every task
/// attempt.
pub fn replay<F>(graph: &Graph, input: Value, max_transitions: usize, mut handler: F) -> Replay
where
    F: FnMut(&str, &Value) -> Result<Value, HandlerError>,
{
    let mut data = input;
    let mut elapsed = Duration::ZERO;
    let mut events = Vec::new();
    let mut transitions = 0;
    let mut current = graph.start_state.clone();

    let status = loop {
        if transitions >= max_transitions {
            break ReplayStatus::TransitionLimit;
        }
        transitions += 1;
        events.push(ReplayEvent::Entered(current.clone()));

        let Some(state) = graph.state(&current) else {
            break ReplayStatus::Failed {
                state: current.clone(),
                error: "States.Runtime".to_string(),
                cause: format!("Unknown state {}", current),
            };
        };

        let next = match state {
            State::Task {
                result_path,
                retry,
                next,
                ..
            } => {
                let mut attempts: HashMap<usize, u32> = HashMap::new();
                let result = loop {
                    match handler(&current, &data) {
                        Ok(output) => break Ok(output),
                        Err(err) => {
                            let name = err.error_name();
                            let Some(rule) = retry.rule_index(name) else {
                                break Err(err);
                            };
                            let attempt = attempts.entry(rule).or_insert(0);
                            *attempt += 1;
                            match retry.decide(name, *attempt) {
                                RetryDecision::RetryAfter(delay) => {
                                    elapsed += delay;
                                    events.push(ReplayEvent::Retried {
                                        state: current.clone(),
                                        error: name.to_string(),
                                        attempt: *attempt,
                                        delay,
                                    });
                                }
                                RetryDecision::Fail => break Err(err),
                            }
                        }
                    }
                };
                match result {
                    Ok(output) => {
                        data = apply_result_path(data, result_path.as_deref(), output);
                        next.clone()
                    }
                    Err(err) => {
                        tracing::debug!("Replay of {} failed: {}", current, err);
                        break ReplayStatus::Failed {
                            state: current.clone(),
                            error: err.error_name().to_string(),
                            cause: err.to_string(),
                        };
                    }
                }
            }
            State::Wait { seconds, next } => {
                elapsed += Duration::from_secs(*seconds);
                events.push(ReplayEvent::Waited {
                    state: current.clone(),
                    seconds: *seconds,
                });
                Some(next.clone())
            }
            State::Choice { choices, default } => {
                let chosen = choices.iter().find(|rule| {
                    lookup(&data, &rule.variable).and_then(Value::as_bool)
                        == Some(rule.boolean_equals)
                });
                Some(chosen.map_or_else(|| default.clone(), |rule| rule.next.clone()))
            }
            State::Pass { next, .. } => next.clone(),
        };

        match next {
            Some(name) => current = name,
            None => break ReplayStatus::Succeeded,
        }
    };

    Replay {
        status,
        elapsed,
        transitions,
        events,
        output: data,
    }
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.trim_start_matches('$')
        .split('.')
        .filter(|segment| !segment.is_empty())
}

/// Value at a `$.a.b` reference path.
fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path_segments(path).try_fold(data, |value, segment| value.get(segment))
}

/// Place a task result into the data at `path` (or replace the data).
fn apply_result_path(mut data: Value, path: Option<&str>, output: Value) -> Value {
    let Some(path) = path else {
        return output;
    };
    let segments: Vec<&str> = path_segments(path).collect();
    let Some((last, parents)) = segments.split_last() else {
        return output;
    };
    let mut target = &mut data;
    for segment in parents {
        if !target.is_object() {
            *target = Value::Object(Default::default());
        }
        target = match target {
            Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
            _ => return output,
        };
    }
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(map) = target {
        map.insert(last.to_string(), output);
    }
    data
}
