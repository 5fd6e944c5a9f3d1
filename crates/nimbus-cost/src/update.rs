//! Cost updater transition.
//!
//! Runs periodically after a primary execution stops, until the billed cost
//! shows up or the updater gives up.

use crate::CostPrecision;
use crate::actual::actual_cost;
use crate::record::{ReportCostUpdate, update_report_cost};
use chrono::{DateTime, Duration, Utc};
use nimbus_core::{Context, ExecutionHandle, ExecutionState};
use nimbus_metrics::update_html_only;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCostInput {
    pub log_bucket: String,
    /// Execution ARN of the primary run
    pub sfn_arn: String,
    #[serde(default)]
    pub aws_region: Option<String>,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCostOutcome {
    pub done: bool,
    pub message: String,
}

impl UpdateCostOutcome {
    fn done(message: impl Into<String>) -> Self {
        Self {
            done: true,
            message: message.into(),
        }
    }

    fn waiting(message: impl Into<String>) -> Self {
        Self {
            done: false,
            message: message.into(),
        }
    }
}

/// One pass of the cost updater.
///
/// `done` tells the updater graph to stop looping.
pub async fn update_cost(
    ctx: &Context,
    input: &UpdateCostInput,
    now: DateTime<Utc>,
) -> UpdateCostOutcome {
    let handle = ExecutionHandle::from_arn(input.sfn_arn.clone());
    let execution = match ctx.control_plane.describe_execution(&handle).await {
        Ok(execution) => execution,
        Err(e) => {
            tracing::warn!("Failed to describe {}: {}", handle, e);
            return UpdateCostOutcome::done(
                "Could not get information about the primary execution",
            );
        }
    };
    if execution.state == ExecutionState::Running {
        return UpdateCostOutcome::waiting("Job is still running");
    }

    let stopped = execution.stop_date.unwrap_or(now);
    let give_up_days = ctx.settings.cost_give_up_days;
    if stopped + Duration::days(give_up_days) < now {
        tracing::info!("Giving up on the cost of {}", input.job_id);
        return UpdateCostOutcome::done(format!(
            "Cost could not be retrieved after {} days",
            give_up_days
        ));
    }

    let tag = ctx.settings.instance_tag(&input.job_id);
    let (cost, _) = actual_cost(
        ctx.billing.as_ref(),
        &tag,
        execution.start_date,
        Some(stopped),
        now,
    )
    .await;
    if cost <= 0.0 {
        return UpdateCostOutcome::waiting("Cost not yet available");
    }

    // Anything short of a persisted cost keeps the loop going until it gives up.
    let blobs = ctx.blobs.as_ref();
    let bucket = &input.log_bucket;
    match update_report_cost(blobs, bucket, &input.job_id, cost, CostPrecision::ActualCost).await
    {
        Ok(ReportCostUpdate::Written | ReportCostUpdate::Unchanged) => {}
        Ok(ReportCostUpdate::Missing) => {
            return UpdateCostOutcome::waiting("Metrics report not yet available");
        }
        Err(e) => {
            tracing::warn!("Failed to record cost of {}: {}", input.job_id, e);
            return UpdateCostOutcome::waiting(format!("Failed to record cost: {}", e));
        }
    }
    if let Err(e) = update_html_only(blobs, bucket, &input.job_id).await {
        tracing::warn!("Failed to regenerate HTML report for {}: {}", input.job_id, e);
        return UpdateCostOutcome::waiting(format!("Failed to regenerate HTML report: {}", e));
    }
    UpdateCostOutcome::done(format!("Cost of {} recorded", input.job_id))
}
