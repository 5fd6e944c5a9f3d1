//! Job tracking and the handlers that watch a running job.
//!
//! [`JobTracker`] maps job ids to control-plane executions (index first, scan
//! as fallback) and launches, inspects and kills them. [`check_task`] and
//! [`check_dependencies`] are the handlers behind the `CheckTask` and
//! `RunTask` states.

pub mod check;
pub mod deps;
pub mod failure;
pub mod index;
pub mod tracker;

pub use check::{CheckRequest, DEFAULT_FILESYSTEM, check_task};
pub use deps::check_dependencies;
pub use failure::{
    CustomPattern, FailureAnalysis, FailureClassifier, FailureError, FailureMode, check_log_hint,
    general_error_message,
};
pub use index::{IndexBackoff, IndexError, JobIndex};
pub use tracker::{
    JOB_ID_LENGTH, JobTracker, KillOutcome, LaunchedJob, StatusSummary, TrackerError,
    generate_job_id, input_log_bucket, randomized_execution_name,
};
