//! Job cost: billed cost, catalog estimates and the cost updater.
//!
//! Every cost figure carries a [`CostPrecision`]. Pricing problems never
//! surface as errors from [`actual_cost`] or [`estimate`]; they yield an
//! `Unavailable` figure instead.

pub mod actual;
pub mod estimate;
pub mod precision;
pub mod record;
pub mod update;

pub use actual::{NAME_TAG, actual_cost, billing_query};
pub use estimate::{
    CostComponents, CostEstimate, OverridesOnly, PriceOverrides, RunSummary, catalog_price,
    estimate, io2_iops_monthly,
};
pub use precision::CostPrecision;
pub use record::{
    CostRecord, ReportCostUpdate, apply_cost_record, read_cost_record, update_report_cost,
};
pub use update::{UpdateCostInput, UpdateCostOutcome, update_cost};

use nimbus_core::{ClientError, ValidationError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CostError {
    #[error("Pricing query failed: {0}")]
    Pricing(ClientError),
    #[error("Report storage failed: {0}")]
    Storage(ClientError),
    #[error("No price found for {0}")]
    MissingPrice(String),
    #[error("More than one price found for {0}")]
    AmbiguousPrice(String),
    #[error("Unexpected number of prices for {0}")]
    IncompletePrices(String),
    #[error("Malformed price list entry: {0}")]
    MalformedCatalog(String),
    #[error("Run summary has no {0}")]
    MissingField(&'static str),
    #[error("No pricing location for region {0}")]
    UnknownRegion(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Unknown price override: {0}")]
    UnknownOverride(String),
    #[error("Invalid value for price override {key}: {value}")]
    InvalidOverride { key: String, value: String },
    #[error("Invalid cost: {0}")]
    InvalidCost(#[from] ValidationError),
}
