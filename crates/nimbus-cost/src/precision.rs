//! How much a cost figure can be trusted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordered from least to most trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostPrecision {
    Unavailable,
    RetrospectiveEstimate,
    ImmediateEstimate,
    ActualCost,
}

impl CostPrecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::RetrospectiveEstimate => "retrospective estimate",
            Self::ImmediateEstimate => "immediate estimate",
            Self::ActualCost => "actual cost",
        }
    }
}

impl fmt::Display for CostPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CostPrecision {
    type Err = String;

    /// Accepts the labels plus `NA`, which older reports use for unavailable.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "unavailable" | "NA" => Ok(Self::Unavailable),
            "retrospective estimate" => Ok(Self::RetrospectiveEstimate),
            "immediate estimate" => Ok(Self::ImmediateEstimate),
            "actual cost" => Ok(Self::ActualCost),
            other => Err(format!("Unknown cost precision: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(CostPrecision::Unavailable < CostPrecision::RetrospectiveEstimate);
        assert!(CostPrecision::RetrospectiveEstimate < CostPrecision::ImmediateEstimate);
        assert!(CostPrecision::ImmediateEstimate < CostPrecision::ActualCost);
    }

    #[test]
    fn test_labels_parse_back() {
        for precision in [
            CostPrecision::Unavailable,
            CostPrecision::RetrospectiveEstimate,
            CostPrecision::ImmediateEstimate,
            CostPrecision::ActualCost,
        ] {
            assert_eq!(precision.label().parse::<CostPrecision>(), Ok(precision));
        }
        assert_eq!("NA".parse::<CostPrecision>(), Ok(CostPrecision::Unavailable));
        assert!("guess".parse::<CostPrecision>().is_err());
    }
}
