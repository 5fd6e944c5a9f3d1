//! Dependency gate for `RunTask`.

use crate::tracker::{JobTracker, TrackerError};
use nimbus_core::ExecutionState;
use nimbus_sfn::{HandlerError, JobFailureKind, RetrySignal};

/// Check that every dependency finished successfully.
///
/// A failed (or unresolvable) dependency fails the job even while others are
/// still running; otherwise any running dependency asks for a retry.
pub async fn check_dependencies(
    tracker: &JobTracker,
    job_ids: &[String],
) -> Result<(), HandlerError> {
    let mut running = Vec::new();
    for job_id in job_ids {
        let state = match tracker.resolve(job_id).await {
            Ok(handle) => tracker.check_status(&handle).await,
            Err(e) => Err(e),
        };
        match state {
            Ok(ExecutionState::Succeeded) => {}
            Ok(ExecutionState::Running) => running.push(job_id.as_str()),
            Ok(state) => {
                return Err(HandlerError::fatal(
                    JobFailureKind::DependencyFailed,
                    format!("dependency {} ended as {}", job_id, state),
                ));
            }
            Err(TrackerError::NotFound(_)) => {
                return Err(HandlerError::fatal(
                    JobFailureKind::DependencyFailed,
                    format!("dependency {} not found", job_id),
                ));
            }
            Err(e) => {
                return Err(HandlerError::retry(
                    RetrySignal::GenericTransientInfra,
                    format!("failed to check dependency {}: {}", job_id, e),
                ));
            }
        }
    }
    if running.is_empty() {
        Ok(())
    } else {
        Err(HandlerError::retry(
            RetrySignal::DependencyStillRunning,
            format!("dependency is still running: {}", running.join(", ")),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::tests::{cloud, insert_execution};

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_all_succeeded() {
        let (cloud, ctx) = cloud(100);
        insert_execution(&cloud, &ctx, "a", "ja", ExecutionState::Succeeded);
        insert_execution(&cloud, &ctx, "b", "jb", ExecutionState::Succeeded);
        let tracker = JobTracker::new(&ctx);
        assert!(check_dependencies(&tracker, &ids(&["ja", "jb"])).await.is_ok());
        assert!(check_dependencies(&tracker, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_running_dependency_retries() {
        let (cloud, ctx) = cloud(100);
        insert_execution(&cloud, &ctx, "a", "ja", ExecutionState::Succeeded);
        insert_execution(&cloud, &ctx, "b", "jb", ExecutionState::Running);
        let tracker = JobTracker::new(&ctx);
        let err = check_dependencies(&tracker, &ids(&["ja", "jb"])).await.unwrap_err();
        assert_eq!(err.error_name(), "DependencyStillRunning");
        assert!(err.to_string().contains("jb"));
    }

    #[tokio::test]
    async fn test_failed_dependency_wins_over_running() {
        let (cloud, ctx) = cloud(100);
        insert_execution(&cloud, &ctx, "a", "ja", ExecutionState::Running);
        insert_execution(&cloud, &ctx, "b", "jb", ExecutionState::Aborted);
        let tracker = JobTracker::new(&ctx);
        let err = check_dependencies(&tracker, &ids(&["ja", "jb"])).await.unwrap_err();
        assert_eq!(err.error_name(), "DependencyFailed");

        let err = check_dependencies(&tracker, &ids(&["nope"])).await.unwrap_err();
        assert_eq!(err.error_name(), "DependencyFailed");
    }
}
