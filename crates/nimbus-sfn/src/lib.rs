//! Job lifecycle state machines and their retry taxonomy.

pub mod graph;
pub mod replay;
pub mod retry;

pub use graph::{ChoiceRule, Graph, GraphError, JobKind, State, build};
pub use replay::{Replay, ReplayEvent, ReplayStatus, replay};
pub use retry::{
    HandlerError, JobFailure, JobFailureKind, RetryDecision, RetryPolicy, RetryRule, RetrySignal,
    TaskState,
};
