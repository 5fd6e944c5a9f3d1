//! Cost estimates from the pricing catalog.
//!
//! Instance cost is the hourly price times the run time. Volume costs are
//! monthly prices prorated over a 720-hour month.

use crate::{CostError, CostPrecision};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_core::{
    ClientError, PriceFilter, PricingApi, SpotPrice, ValidationError, region_display_name,
};
use nimbus_parsers::{format_job_timestamp, parse_job_timestamp};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

const SERVICE_CODE: &str = "AmazonEC2";
const HOURS_PER_MONTH: f64 = 720.0;
const GP3_FREE_THROUGHPUT: f64 = 125.0;
const GP3_FREE_IOPS: f64 = 3000.0;
/// io2 IOPS tier boundaries. The catalog does not expose them.
const IO2_TIERS: [f64; 2] = [32000.0, 64000.0];
/// Jobs that ended longer ago than this get a retrospective estimate.
const RETROSPECTIVE_AFTER_DAYS: f64 = 10.0;

mod job_time {
    use super::*;

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_job_timestamp(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(d)?;
        parse_job_timestamp(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid job timestamp: {}", s)))
    }
}

mod opt_job_time {
    use super::*;

    pub fn serialize<S: Serializer>(dt: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match dt {
            Some(dt) => s.serialize_some(&format_job_timestamp(dt)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(s) => parse_job_timestamp(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid job timestamp: {}", s))),
            None => Ok(None),
        }
    }
}

fn gp3() -> String {
    "gp3".to_string()
}

fn default_root_ebs_size() -> f64 {
    8.0
}

/// What ran: instance, volumes and run time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(with = "job_time")]
    pub start_time: DateTime<Utc>,
    #[serde(default, with = "opt_job_time")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub spot_instance: bool,
    /// Reserved spot block length in minutes.
    #[serde(default)]
    pub spot_duration: Option<u32>,
    /// Root volume size (GB)
    #[serde(default = "default_root_ebs_size")]
    pub root_ebs_size: f64,
    #[serde(default = "gp3")]
    pub ebs_root_type: String,
    /// Data volume size (GB)
    #[serde(default)]
    pub ebs_size: f64,
    #[serde(default = "gp3")]
    pub ebs_type: String,
    #[serde(default)]
    pub ebs_iops: Option<f64>,
    /// Provisioned throughput (MB/s)
    #[serde(default)]
    pub ebs_throughput: Option<f64>,
}

/// Prices that replace catalog lookups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceOverrides {
    pub ec2_spot_price: Option<f64>,
    pub ec2_ondemand_price: Option<f64>,
    pub ebs_root_storage_price: Option<f64>,
    pub ebs_storage_price: Option<f64>,
    pub ebs_iops_price: Option<f64>,
    /// Highest tier first.
    pub ebs_io2_iops_prices: Option<[f64; 3]>,
    /// Per MB/s-month.
    pub ebs_throughput_price: Option<f64>,
}

impl PriceOverrides {
    /// Set one override from `key` and its text value.
    ///
    /// `ebs_io2_iops_prices` takes three comma-separated prices.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), CostError> {
        let invalid = || CostError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        };
        let price = |text: &str| {
            text.trim()
                .parse::<f64>()
                .ok()
                .filter(|p| p.is_finite() && *p >= 0.0)
                .ok_or_else(invalid)
        };
        let number = || price(value);
        match key {
            "ec2_spot_price" => self.ec2_spot_price = Some(number()?),
            "ec2_ondemand_price" => self.ec2_ondemand_price = Some(number()?),
            "ebs_root_storage_price" => self.ebs_root_storage_price = Some(number()?),
            "ebs_storage_price" => self.ebs_storage_price = Some(number()?),
            "ebs_iops_price" => self.ebs_iops_price = Some(number()?),
            "ebs_throughput_price" => self.ebs_throughput_price = Some(number()?),
            "ebs_io2_iops_prices" => {
                let prices = value.split(',').map(price).collect::<Result<Vec<f64>, _>>()?;
                let prices: [f64; 3] = prices.try_into().map_err(|_| invalid())?;
                self.ebs_io2_iops_prices = Some(prices);
            }
            other => return Err(CostError::UnknownOverride(other.to_string())),
        }
        Ok(())
    }

    /// Parse a `key=value` pair.
    pub fn set_pair(&mut self, pair: &str) -> Result<(), CostError> {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| CostError::UnknownOverride(pair.to_string()))?;
        self.set(key.trim(), value)
    }
}

/// Cost broken down by resource. The root volume counts as storage.
///
/// Every component is finite and non-negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCostComponents")]
pub struct CostComponents {
    ec2_cost: f64,
    ebs_storage_cost: f64,
    ebs_iops_cost: f64,
    ebs_throughput_cost: f64,
}

#[derive(Deserialize)]
struct RawCostComponents {
    ec2_cost: f64,
    ebs_storage_cost: f64,
    ebs_iops_cost: f64,
    ebs_throughput_cost: f64,
}

impl TryFrom<RawCostComponents> for CostComponents {
    type Error = ValidationError;

    fn try_from(raw: RawCostComponents) -> Result<Self, Self::Error> {
        Self::try_new(
            raw.ec2_cost,
            raw.ebs_storage_cost,
            raw.ebs_iops_cost,
            raw.ebs_throughput_cost,
        )
    }
}

impl CostComponents {
    pub fn try_new(
        ec2_cost: f64,
        ebs_storage_cost: f64,
        ebs_iops_cost: f64,
        ebs_throughput_cost: f64,
    ) -> Result<Self, ValidationError> {
        for (field, value) in [
            ("ec2_cost", ec2_cost),
            ("ebs_storage_cost", ebs_storage_cost),
            ("ebs_iops_cost", ebs_iops_cost),
            ("ebs_throughput_cost", ebs_throughput_cost),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ValidationError::OutOfRange {
                    field,
                    value: value.to_string(),
                });
            }
        }
        Ok(Self {
            ec2_cost,
            ebs_storage_cost,
            ebs_iops_cost,
            ebs_throughput_cost,
        })
    }

    pub fn ec2_cost(&self) -> f64 {
        self.ec2_cost
    }

    pub fn ebs_storage_cost(&self) -> f64 {
        self.ebs_storage_cost
    }

    pub fn ebs_iops_cost(&self) -> f64 {
        self.ebs_iops_cost
    }

    pub fn ebs_throughput_cost(&self) -> f64 {
        self.ebs_throughput_cost
    }

    pub fn total(&self) -> f64 {
        self.ec2_cost + self.ebs_storage_cost + self.ebs_iops_cost + self.ebs_throughput_cost
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub components: CostComponents,
    pub precision: CostPrecision,
}

impl CostEstimate {
    pub fn unavailable() -> Self {
        Self {
            components: CostComponents::default(),
            precision: CostPrecision::Unavailable,
        }
    }

    pub fn total(&self) -> f64 {
        self.components.total()
    }
}

/// USD price of a catalog entry (first on-demand term, first dimension).
pub fn catalog_price(document: &str) -> Result<f64, CostError> {
    let malformed = || CostError::MalformedCatalog(document.chars().take(200).collect());
    let value: Value = serde_json::from_str(document).map_err(|_| malformed())?;
    let term = value
        .pointer("/terms/OnDemand")
        .and_then(Value::as_object)
        .and_then(|terms| terms.values().next())
        .ok_or_else(malformed)?;
    let dimension = term
        .get("priceDimensions")
        .and_then(Value::as_object)
        .and_then(|dimensions| dimensions.values().next())
        .ok_or_else(malformed)?;
    dimension
        .pointer("/pricePerUnit/USD")
        .and_then(Value::as_str)
        .and_then(|usd| usd.parse::<f64>().ok())
        .ok_or_else(malformed)
}

/// Pricing backend for offline use. Every lookup fails, so only prices
/// given as [`PriceOverrides`] produce an estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverridesOnly;

#[async_trait]
impl PricingApi for OverridesOnly {
    async fn get_products(
        &self,
        _service_code: &str,
        _filters: &[PriceFilter],
    ) -> Result<Vec<String>, ClientError> {
        Err(no_catalog())
    }

    async fn spot_price_history(
        &self,
        _instance_type: &str,
        _availability_zone: &str,
    ) -> Result<Vec<SpotPrice>, ClientError> {
        Err(no_catalog())
    }
}

fn no_catalog() -> ClientError {
    ClientError::Unavailable {
        service: "pricing",
        message: "no price catalog configured, pass price overrides".to_string(),
    }
}

struct Catalog<'a> {
    pricing: &'a dyn PricingApi,
    location: &'static str,
}

impl Catalog<'_> {
    async fn prices(&self, what: &str, filters: Vec<PriceFilter>) -> Result<Vec<f64>, CostError> {
        let mut filters = filters;
        filters.push(PriceFilter::term("location", self.location));
        let documents = self
            .pricing
            .get_products(SERVICE_CODE, &filters)
            .await
            .map_err(CostError::Pricing)?;
        if documents.is_empty() {
            return Err(CostError::MissingPrice(what.to_string()));
        }
        documents.iter().map(|d| catalog_price(d)).collect()
    }

    async fn single_price(&self, what: &str, filters: Vec<PriceFilter>) -> Result<f64, CostError> {
        let prices = self.prices(what, filters).await?;
        match prices.as_slice() {
            [price] => Ok(*price),
            _ => Err(CostError::AmbiguousPrice(what.to_string())),
        }
    }

    async fn volume_price(&self, volume_type: &str, family: &str) -> Result<f64, CostError> {
        self.single_price(
            &format!("{} {}", volume_type, family),
            vec![
                PriceFilter::term("volumeApiName", volume_type),
                PriceFilter::term("productFamily", family),
            ],
        )
        .await
    }
}

/// Monthly price prorated over `hours`.
fn prorate(monthly: f64, hours: f64) -> f64 {
    monthly * hours / HOURS_PER_MONTH
}

async fn instance_cost(
    catalog: &Catalog<'_>,
    run: &RunSummary,
    instance_type: &str,
    overrides: &PriceOverrides,
    hours: f64,
) -> Result<f64, CostError> {
    let hourly = if run.spot_instance {
        if run.spot_duration.is_some() {
            return Err(CostError::Unsupported(
                "pricing of spot instances with a reserved duration".to_string(),
            ));
        }
        match overrides.ec2_spot_price {
            Some(price) => price,
            None => {
                let zone = run
                    .availability_zone
                    .as_deref()
                    .ok_or(CostError::MissingField("availability_zone"))?;
                catalog
                    .pricing
                    .spot_price_history(instance_type, zone)
                    .await
                    .map_err(CostError::Pricing)?
                    .into_iter()
                    .max_by_key(|p| p.timestamp)
                    .map(|p| p.price)
                    .ok_or_else(|| CostError::MissingPrice(format!("{} spot", instance_type)))?
            }
        }
    } else {
        match overrides.ec2_ondemand_price {
            Some(price) => price,
            None => {
                catalog
                    .single_price(
                        &format!("{} on-demand", instance_type),
                        vec![
                            PriceFilter::term("instanceType", instance_type),
                            PriceFilter::term("operatingSystem", "Linux"),
                            PriceFilter::term("preInstalledSw", "NA"),
                            PriceFilter::term("capacitystatus", "Used"),
                            PriceFilter::term("tenancy", "Shared"),
                        ],
                    )
                    .await?
            }
        }
    };
    Ok(hourly * hours)
}

/// Running totals of the volume components.
#[derive(Debug, Default)]
struct VolumeCosts {
    storage: f64,
    iops: f64,
    throughput: f64,
}

async fn volume_costs(
    catalog: &Catalog<'_>,
    run: &RunSummary,
    overrides: &PriceOverrides,
    hours: f64,
) -> Result<VolumeCosts, CostError> {
    let mut costs = VolumeCosts::default();
    let root_price = match overrides.ebs_root_storage_price {
        Some(price) => price,
        None => catalog.volume_price(&run.ebs_root_type, "Storage").await?,
    };
    costs.storage += prorate(root_price * run.root_ebs_size, hours);

    if run.ebs_type == "gp3" {
        costs.storage += prorate(root_price * run.ebs_size, hours);
        if let Some(throughput) = run.ebs_throughput.filter(|t| *t > 0.0) {
            let price = match overrides.ebs_throughput_price {
                Some(price) => price,
                None => {
                    catalog
                        .volume_price(&run.ebs_type, "Provisioned Throughput")
                        .await?
                        / 1000.0
                }
            };
            costs.throughput +=
                prorate(price * (throughput - GP3_FREE_THROUGHPUT).max(0.0), hours);
        }
    } else {
        let price = match overrides.ebs_storage_price {
            Some(price) => price,
            None => catalog.volume_price(&run.ebs_type, "Storage").await?,
        };
        costs.storage += prorate(price * run.ebs_size, hours);
    }

    let Some(iops) = run.ebs_iops.filter(|i| *i > 0.0) else {
        return Ok(costs);
    };
    match run.ebs_type.as_str() {
        "gp3" | "io1" => {
            let price = match overrides.ebs_iops_price {
                Some(price) => price,
                None => catalog.volume_price(&run.ebs_type, "System Operation").await?,
            };
            let billed = if run.ebs_type == "gp3" {
                (iops - GP3_FREE_IOPS).max(0.0)
            } else {
                iops
            };
            costs.iops += prorate(price * billed, hours);
        }
        "io2" => {
            let prices = match overrides.ebs_io2_iops_prices {
                Some(prices) => prices,
                None => {
                    let mut prices = catalog
                        .prices(
                            "io2 System Operation",
                            vec![
                                PriceFilter::term("volumeApiName", "io2"),
                                PriceFilter::term("productFamily", "System Operation"),
                            ],
                        )
                        .await?;
                    prices.sort_by(|a, b| b.total_cmp(a));
                    <[f64; 3]>::try_from(prices).map_err(|prices| {
                        CostError::IncompletePrices(format!(
                            "io2 IOPS (expected 3 tiers, got {})",
                            prices.len()
                        ))
                    })?
                }
            };
            costs.iops += prorate(io2_iops_monthly(iops, &prices), hours);
        }
        _ => {}
    }
    Ok(costs)
}

/// Monthly cost of `iops` provisioned IOPS on the io2 tier ladder.
pub fn io2_iops_monthly(iops: f64, prices: &[f64; 3]) -> f64 {
    let [tier0, tier1] = IO2_TIERS;
    prices[0] * iops.min(tier0)
        + prices[1] * (iops - tier0).clamp(0.0, tier1 - tier0)
        + prices[2] * (iops - tier1).max(0.0)
}

async fn try_estimate(
    pricing: &dyn PricingApi,
    region: &str,
    run: &RunSummary,
    overrides: &PriceOverrides,
) -> Result<CostComponents, CostError> {
    let end = run.end_time.ok_or(CostError::MissingField("end_time"))?;
    let instance_type = run
        .instance_type
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(CostError::MissingField("instance_type"))?;
    let location =
        region_display_name(region).ok_or_else(|| CostError::UnknownRegion(region.to_string()))?;
    let hours = (end - run.start_time).num_seconds() as f64 / 3600.0;

    let catalog = Catalog { pricing, location };
    let ec2_cost = instance_cost(&catalog, run, instance_type, overrides, hours).await?;
    let volumes = volume_costs(&catalog, run, overrides, hours).await?;
    Ok(CostComponents::try_new(
        ec2_cost,
        volumes.storage,
        volumes.iops,
        volumes.throughput,
    )?)
}

/// Estimate the cost of a finished run.
///
/// Never fails: any missing input or price yields an unavailable estimate.
pub async fn estimate(
    pricing: &dyn PricingApi,
    region: &str,
    run: &RunSummary,
    overrides: &PriceOverrides,
    now: DateTime<Utc>,
) -> CostEstimate {
    match try_estimate(pricing, region, run, overrides).await {
        Ok(components) => {
            let precision = match run.end_time {
                Some(end)
                    if (now - end).num_seconds() as f64 / 86400.0 > RETROSPECTIVE_AFTER_DAYS =>
                {
                    CostPrecision::RetrospectiveEstimate
                }
                _ => CostPrecision::ImmediateEstimate,
            };
            CostEstimate {
                components,
                precision,
            }
        }
        Err(e) => {
            tracing::warn!("Cost estimation error: {}", e);
            CostEstimate::unavailable()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use nimbus_core::memory::MemoryPricing;

    const REGION: &str = "us-east-1";
    const LOCATION: &str = "US East (N. Virginia)";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    fn run(hours: i64) -> RunSummary {
        serde_json::from_value(serde_json::json!({
            "start_time": "20240601-10:00:00-UTC",
            "end_time": format_job_timestamp(&(start() + Duration::hours(hours))),
            "instance_type": "t3.medium",
            "ebs_size": 0,
        }))
        .unwrap()
    }

    fn now() -> DateTime<Utc> {
        start() + Duration::days(1)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn add_volume(pricing: &MemoryPricing, volume: &str, family: &str, usd: f64) {
        pricing.add_product(
            SERVICE_CODE,
            &[
                ("location", LOCATION),
                ("volumeApiName", volume),
                ("productFamily", family),
            ],
            usd,
        );
    }

    fn add_on_demand(pricing: &MemoryPricing, usd: f64) {
        pricing.add_product(
            SERVICE_CODE,
            &[
                ("location", LOCATION),
                ("instanceType", "t3.medium"),
                ("operatingSystem", "Linux"),
                ("preInstalledSw", "NA"),
                ("capacitystatus", "Used"),
                ("tenancy", "Shared"),
            ],
            usd,
        );
    }

    #[test]
    fn test_run_summary_defaults() {
        let run = run(2);
        assert_eq!(run.root_ebs_size, 8.0);
        assert_eq!(run.ebs_root_type, "gp3");
        assert!(!run.spot_instance);
        assert_eq!(run.end_time, Some(start() + Duration::hours(2)));
    }

    #[test]
    fn test_overrides_from_pairs() {
        let mut overrides = PriceOverrides::default();
        overrides.set_pair("ec2_ondemand_price=1.5").unwrap();
        overrides.set_pair("ebs_io2_iops_prices=0.065, 0.0455,0.0319").unwrap();
        assert_eq!(overrides.ec2_ondemand_price, Some(1.5));
        assert_eq!(overrides.ebs_io2_iops_prices, Some([0.065, 0.0455, 0.0319]));

        assert!(matches!(
            overrides.set_pair("gpu_price=3"),
            Err(CostError::UnknownOverride(_))
        ));
        assert!(matches!(
            overrides.set_pair("ebs_io2_iops_prices=1,2"),
            Err(CostError::InvalidOverride { .. })
        ));
        assert!(overrides.set_pair("ec2_spot_price").is_err());
        assert!(overrides.set_pair("ec2_spot_price=-0.2").is_err());
        assert!(overrides.set_pair("ebs_storage_price=NaN").is_err());
        assert!(overrides.set_pair("ebs_io2_iops_prices=0.06,-1,0.03").is_err());
        assert_eq!(overrides.ec2_spot_price, None);
    }

    #[test]
    fn test_io2_ladder() {
        let prices = [0.065, 0.0455, 0.0319];
        assert!(close(io2_iops_monthly(1000.0, &prices), 65.0));
        assert!(close(
            io2_iops_monthly(70000.0, &prices),
            0.065 * 32000.0 + 0.0455 * 32000.0 + 0.0319 * 6000.0
        ));
    }

    #[test]
    fn test_components_reject_invalid_costs() {
        let components = CostComponents::try_new(1.0, 0.5, 0.0, 0.25).unwrap();
        assert!(close(components.total(), 1.75));
        assert!(CostComponents::try_new(0.0, 0.0, 0.0, 0.0).is_ok());

        assert!(CostComponents::try_new(f64::NAN, 0.0, 0.0, 0.0).is_err());
        assert!(CostComponents::try_new(0.0, f64::INFINITY, 0.0, 0.0).is_err());
        assert_eq!(
            CostComponents::try_new(1.0, 0.0, -0.1, 0.0),
            Err(ValidationError::OutOfRange {
                field: "ebs_iops_cost",
                value: "-0.1".to_string(),
            })
        );

        let json = serde_json::json!({
            "ec2_cost": -1.0,
            "ebs_storage_cost": 0.0,
            "ebs_iops_cost": 0.0,
            "ebs_throughput_cost": 0.0,
        });
        assert!(serde_json::from_value::<CostComponents>(json).is_err());
    }

    #[tokio::test]
    async fn test_run_ending_before_start_is_unavailable() {
        let pricing = MemoryPricing::default();
        let overrides = PriceOverrides {
            ec2_ondemand_price: Some(1.0),
            ebs_root_storage_price: Some(0.1),
            ..PriceOverrides::default()
        };
        let result = estimate(&pricing, REGION, &run(-2), &overrides, now()).await;
        assert_eq!(result, CostEstimate::unavailable());
    }

    #[tokio::test]
    async fn test_overrides_only_backend() {
        let overrides = PriceOverrides {
            ec2_ondemand_price: Some(0.5),
            ebs_root_storage_price: Some(0.1),
            ..PriceOverrides::default()
        };
        let result = estimate(&OverridesOnly, REGION, &run(4), &overrides, now()).await;
        assert_eq!(result.precision, CostPrecision::ImmediateEstimate);
        assert!(close(result.components.ec2_cost(), 2.0));

        // A missing override needs the catalog
        let partial = PriceOverrides {
            ec2_ondemand_price: Some(0.5),
            ..PriceOverrides::default()
        };
        let result = estimate(&OverridesOnly, REGION, &run(4), &partial, now()).await;
        assert_eq!(result, CostEstimate::unavailable());
    }

    #[tokio::test]
    async fn test_on_demand_with_root_volume() {
        let pricing = MemoryPricing::default();
        add_on_demand(&pricing, 1.0);
        add_volume(&pricing, "gp3", "Storage", 0.10);

        let result = estimate(&pricing, REGION, &run(2), &PriceOverrides::default(), now()).await;
        assert_eq!(result.precision, CostPrecision::ImmediateEstimate);
        assert!(close(result.components.ec2_cost(), 2.0));
        assert!(close(result.total(), 2.0 + 0.10 * 8.0 * (2.0 / 720.0)));
    }

    #[tokio::test]
    async fn test_overrides_skip_catalog() {
        let pricing = MemoryPricing::default();
        let overrides = PriceOverrides {
            ec2_ondemand_price: Some(0.5),
            ebs_root_storage_price: Some(0.08),
            ..PriceOverrides::default()
        };
        let result = estimate(&pricing, REGION, &run(4), &overrides, now()).await;
        assert_eq!(pricing.product_calls(), 0);
        assert!(close(result.total(), 2.0 + 0.08 * 8.0 * 4.0 / 720.0));
    }

    #[tokio::test]
    async fn test_gp3_throughput_and_iops() {
        let pricing = MemoryPricing::default();
        add_on_demand(&pricing, 0.0);
        add_volume(&pricing, "gp3", "Storage", 0.08);
        add_volume(&pricing, "gp3", "Provisioned Throughput", 40.0);
        add_volume(&pricing, "gp3", "System Operation", 0.005);

        let mut run = run(720);
        run.root_ebs_size = 0.0;
        run.ebs_size = 100.0;
        run.ebs_throughput = Some(250.0);
        run.ebs_iops = Some(5000.0);

        let result = estimate(&pricing, REGION, &run, &PriceOverrides::default(), now()).await;
        assert!(close(result.components.ebs_storage_cost(), 8.0));
        assert!(close(result.components.ebs_throughput_cost(), 0.04 * 125.0));
        assert!(close(result.components.ebs_iops_cost(), 0.005 * 2000.0));
    }

    #[tokio::test]
    async fn test_io2_prices_sorted_descending() {
        let pricing = MemoryPricing::default();
        add_on_demand(&pricing, 0.0);
        add_volume(&pricing, "gp3", "Storage", 0.0);
        add_volume(&pricing, "io2", "Storage", 0.125);
        add_volume(&pricing, "io2", "System Operation", 0.0319);
        add_volume(&pricing, "io2", "System Operation", 0.065);
        add_volume(&pricing, "io2", "System Operation", 0.0455);

        let mut run = run(720);
        run.ebs_type = "io2".to_string();
        run.ebs_size = 10.0;
        run.ebs_iops = Some(40000.0);

        let result = estimate(&pricing, REGION, &run, &PriceOverrides::default(), now()).await;
        assert!(close(result.components.ebs_storage_cost(), 1.25));
        assert!(close(
            result.components.ebs_iops_cost(),
            0.065 * 32000.0 + 0.0455 * 8000.0
        ));
    }

    #[tokio::test]
    async fn test_incomplete_io2_prices_are_unavailable() {
        let pricing = MemoryPricing::default();
        add_on_demand(&pricing, 1.0);
        add_volume(&pricing, "gp3", "Storage", 0.1);
        add_volume(&pricing, "io2", "Storage", 0.125);
        add_volume(&pricing, "io2", "System Operation", 0.065);

        let mut run = run(2);
        run.ebs_type = "io2".to_string();
        run.ebs_iops = Some(1000.0);
        let result = estimate(&pricing, REGION, &run, &PriceOverrides::default(), now()).await;
        assert_eq!(result, CostEstimate::unavailable());
    }

    #[tokio::test]
    async fn test_spot_uses_latest_price() {
        let pricing = MemoryPricing::default();
        add_volume(&pricing, "gp3", "Storage", 0.0);
        pricing.add_spot_price("t3.medium", "us-east-1a", start() - Duration::days(2), 0.5);
        pricing.add_spot_price("t3.medium", "us-east-1a", start() - Duration::days(1), 0.3);

        let mut run = run(10);
        run.spot_instance = true;
        run.availability_zone = Some("us-east-1a".to_string());
        let result = estimate(&pricing, REGION, &run, &PriceOverrides::default(), now()).await;
        assert!(close(result.components.ec2_cost(), 3.0));

        run.spot_duration = Some(60);
        let result = estimate(&pricing, REGION, &run, &PriceOverrides::default(), now()).await;
        assert_eq!(result.precision, CostPrecision::Unavailable);

        run.spot_duration = None;
        run.availability_zone = None;
        let result = estimate(&pricing, REGION, &run, &PriceOverrides::default(), now()).await;
        assert_eq!(result.precision, CostPrecision::Unavailable);
    }

    #[tokio::test]
    async fn test_unavailable_inputs_and_catalog() {
        let pricing = MemoryPricing::default();
        add_on_demand(&pricing, 1.0);
        add_on_demand(&pricing, 1.2);
        add_volume(&pricing, "gp3", "Storage", 0.1);
        let defaults = PriceOverrides::default();

        // Two matching instance prices are ambiguous
        let result = estimate(&pricing, REGION, &run(2), &defaults, now()).await;
        assert_eq!(result.precision, CostPrecision::Unavailable);

        let mut open = run(2);
        open.end_time = None;
        let result = estimate(&pricing, REGION, &open, &defaults, now()).await;
        assert_eq!(result.total(), 0.0);

        let mut untyped = run(2);
        untyped.instance_type = None;
        let result = estimate(&pricing, REGION, &untyped, &defaults, now()).await;
        assert_eq!(result.precision, CostPrecision::Unavailable);

        pricing.set_available(false);
        let overrides = PriceOverrides {
            ec2_ondemand_price: Some(1.0),
            ..PriceOverrides::default()
        };
        let result = estimate(&pricing, REGION, &run(2), &overrides, now()).await;
        assert_eq!(result, CostEstimate::unavailable());
    }

    #[tokio::test]
    async fn test_retrospective_after_ten_days() {
        let pricing = MemoryPricing::default();
        let overrides = PriceOverrides {
            ec2_ondemand_price: Some(1.0),
            ebs_root_storage_price: Some(0.1),
            ..PriceOverrides::default()
        };
        let ended = start() + Duration::hours(2);
        let recent = ended + Duration::days(10);
        let recent = estimate(&pricing, REGION, &run(2), &overrides, recent).await;
        assert_eq!(recent.precision, CostPrecision::ImmediateEstimate);
        let late = ended + Duration::days(11);
        let late = estimate(&pricing, REGION, &run(2), &overrides, late).await;
        assert_eq!(late.precision, CostPrecision::RetrospectiveEstimate);
    }
}
