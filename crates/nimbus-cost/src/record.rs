//! Cost lines of the summary report.

use crate::{CostError, CostPrecision};
use nimbus_core::BlobStore;
use nimbus_metrics::{COST_KEYS, SUMMARY_REPORT, SummaryReport, artifact_key};
use nimbus_top::render_value;

/// Cost figure with its precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostRecord {
    pub value: f64,
    pub precision: CostPrecision,
}

impl CostRecord {
    pub fn new(value: f64, precision: CostPrecision) -> Self {
        Self { value, precision }
    }

    /// Merge a new figure into this record. Returns whether anything changed.
    ///
    /// A figure at least as precise as the stored one replaces it, except that
    /// an actual cost is never replaced.
    pub fn merge(&mut self, value: f64, precision: CostPrecision) -> bool {
        if self.precision == CostPrecision::ActualCost || precision < self.precision {
            return false;
        }
        let changed = self.value != value || self.precision != precision;
        self.value = value;
        self.precision = precision;
        changed
    }
}

/// Cost stored in a report, if any.
///
/// An actual `Cost` line takes precedence over the estimate lines.
pub fn read_cost_record(report: &SummaryReport) -> Option<CostRecord> {
    if let Some(value) = report.get("Cost").and_then(|v| v.trim().parse::<f64>().ok()) {
        return Some(CostRecord::new(value, CostPrecision::ActualCost));
    }
    let value = report.get("Estimated_Cost")?.trim().parse::<f64>().ok()?;
    let precision = report
        .get("Estimated_Cost_Type")
        .and_then(|t| t.parse::<CostPrecision>().ok())
        .unwrap_or(CostPrecision::Unavailable);
    Some(CostRecord::new(value, precision))
}

/// Replace the cost lines of a report with `record`.
pub fn apply_cost_record(report: &mut SummaryReport, record: &CostRecord) {
    for key in COST_KEYS {
        report.remove(key);
    }
    let value = render_value(record.value);
    if record.precision == CostPrecision::ActualCost {
        report.set("Cost", value.clone());
    }
    report.set("Estimated_Cost", value);
    report.set("Estimated_Cost_Type", record.precision.label());
}

/// What [`update_report_cost`] did to the stored report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportCostUpdate {
    /// No summary report exists yet.
    Missing,
    /// The stored figure already wins the merge.
    Unchanged,
    Written,
}

/// Merge a cost figure into the stored summary report of a job.
///
/// Only writes when the merge changed the stored figure.
pub async fn update_report_cost(
    blobs: &dyn BlobStore,
    bucket: &str,
    job_id: &str,
    value: f64,
    precision: CostPrecision,
) -> Result<ReportCostUpdate, CostError> {
    let key = artifact_key(job_id, SUMMARY_REPORT);
    let Some(text) = blobs
        .get_string(bucket, &key)
        .await
        .map_err(CostError::Storage)?
    else {
        tracing::debug!("No summary report for {}, skipping cost update", job_id);
        return Ok(ReportCostUpdate::Missing);
    };
    let mut report = SummaryReport::parse(&text);
    let record = match read_cost_record(&report) {
        Some(mut record) => {
            if !record.merge(value, precision) {
                return Ok(ReportCostUpdate::Unchanged);
            }
            record
        }
        None => CostRecord::new(value, precision),
    };
    apply_cost_record(&mut report, &record);
    blobs
        .put_string(bucket, &key, &report.render())
        .await
        .map_err(CostError::Storage)?;
    tracing::info!(
        "Updated cost of {} to {} ({})",
        job_id,
        render_value(record.value),
        record.precision
    );
    Ok(ReportCostUpdate::Written)
}
