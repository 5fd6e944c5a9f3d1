//! Billed cost of a job.

use crate::CostPrecision;
use chrono::{DateTime, Duration, Utc};
use nimbus_core::{BillingApi, BillingQuery};
use nimbus_parsers::billing_date;

/// Tag key carried by every resource of a job.
pub const NAME_TAG: &str = "Name";

/// Billing query covering a job, padded by one day on each side.
///
/// Without an end time the range runs to a day past `now`.
pub fn billing_query(
    tag_value: &str,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> BillingQuery {
    let end_date = match end {
        Some(end) => billing_date(&end, 1),
        None => billing_date(&(now + Duration::days(1)), 0),
    };
    BillingQuery {
        tag_key: NAME_TAG.to_string(),
        tag_value: tag_value.to_string(),
        start_date: billing_date(&start, -1),
        end_date,
    }
}

/// Sum of the daily blended cost of resources tagged `Name=<tag_value>`.
///
/// Provider errors and empty bills yield `(0.0, Unavailable)`.
pub async fn actual_cost(
    billing: &dyn BillingApi,
    tag_value: &str,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (f64, CostPrecision) {
    let query = billing_query(tag_value, start, end, now);
    match billing.daily_blended_costs(&query).await {
        Ok(days) => {
            let total: f64 = days.iter().sum();
            if total > 0.0 {
                (total, CostPrecision::ActualCost)
            } else {
                (0.0, CostPrecision::Unavailable)
            }
        }
        Err(e) => {
            tracing::warn!("Failed to retrieve billed cost for {}: {}", tag_value, e);
            (0.0, CostPrecision::Unavailable)
        }
    }
}
