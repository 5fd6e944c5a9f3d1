//! In-memory collaborators.
//!
//! Test doubles for every crate in the workspace, behind the `test-util`
//! feature. Each one keeps call counters and can be switched into an
//! unavailable state.

use crate::clients::{
    BillingApi, BillingQuery, BlobStore, ClientError, ComputeApi, ControlPlane, Datapoint,
    IndexStore, MetricQuery, PriceFilter, PricingApi, SpotPrice, Statistic, TelemetryApi,
};
use crate::context::Context;
use crate::settings::Settings;
use crate::types::{
    ExecutionDescription, ExecutionHandle, ExecutionPage, ExecutionState, IndexRecord,
    InstanceInfo, InstanceState, ObjectMeta,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Per-call telemetry point limit enforced by [`MemoryTelemetry`].
pub const TELEMETRY_POINT_LIMIT: i64 = 1440;

fn unavailable(service: &'static str) -> ClientError {
    ClientError::Unavailable {
        service,
        message: "service switched off".to_string(),
    }
}

/// A full set of in-memory collaborators.
#[derive(Clone, Default)]
pub struct MemoryCloud {
    pub control_plane: Arc<MemoryControlPlane>,
    pub compute: Arc<MemoryCompute>,
    pub blobs: Arc<MemoryBlobStore>,
    pub index: Arc<MemoryIndex>,
    pub telemetry: Arc<MemoryTelemetry>,
    pub pricing: Arc<MemoryPricing>,
    pub billing: Arc<MemoryBilling>,
}

impl MemoryCloud {
    /// Collaborators whose generated handles match `settings`.
    pub fn new(settings: &Settings) -> Self {
        Self {
            control_plane: Arc::new(MemoryControlPlane::new(&settings.region, &settings.account)),
            ..Self::default()
        }
    }

    pub fn context(&self, settings: Settings) -> Context {
        Context {
            settings,
            control_plane: self.control_plane.clone(),
            compute: self.compute.clone(),
            blobs: self.blobs.clone(),
            index: self.index.clone(),
            telemetry: self.telemetry.clone(),
            pricing: self.pricing.clone(),
            billing: self.billing.clone(),
        }
    }
}

/// Control plane holding executions newest first.
pub struct MemoryControlPlane {
    region: String,
    account: String,
    executions: Mutex<Vec<ExecutionDescription>>,
    stopped: Mutex<Vec<(ExecutionHandle, String)>>,
    page_size: usize,
    describe_calls: AtomicUsize,
    list_calls: AtomicUsize,
    available: AtomicBool,
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        let settings = Settings::default();
        Self::new(&settings.region, &settings.account)
    }
}

impl MemoryControlPlane {
    pub fn new(region: &str, account: &str) -> Self {
        Self {
            region: region.to_string(),
            account: account.to_string(),
            executions: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            page_size: 100,
            describe_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Listing page size (for pagination tests).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Add an execution directly.
    pub fn insert(&self, description: ExecutionDescription) {
        let mut executions = self.executions.lock();
        executions.retain(|e| e.handle != description.handle);
        executions.insert(0, description);
    }

    /// Move an execution to a new state.
    pub fn set_state(
        &self,
        handle: &ExecutionHandle,
        state: ExecutionState,
        stop_date: Option<DateTime<Utc>>,
    ) {
        if let Some(execution) = self
            .executions
            .lock()
            .iter_mut()
            .find(|e| &e.handle == handle)
        {
            execution.state = state;
            execution.stop_date = stop_date;
        }
    }

    pub fn set_output(&self, handle: &ExecutionHandle, output: Option<String>) {
        if let Some(execution) = self
            .executions
            .lock()
            .iter_mut()
            .find(|e| &e.handle == handle)
        {
            execution.output = output;
        }
    }

    pub fn execution(&self, handle: &ExecutionHandle) -> Option<ExecutionDescription> {
        self.executions
            .lock()
            .iter()
            .find(|e| &e.handle == handle)
            .cloned()
    }

    /// Executions stopped so far with the error they were stopped with.
    pub fn stopped(&self) -> Vec<(ExecutionHandle, String)> {
        self.stopped.lock().clone()
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ClientError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(unavailable("control plane"))
        }
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn start_execution(
        &self,
        state_machine: &str,
        execution_name: &str,
        input: &str,
    ) -> Result<ExecutionHandle, ClientError> {
        self.check_available()?;
        let handle =
            ExecutionHandle::new(&self.region, &self.account, state_machine, execution_name);
        if self.execution(&handle).is_some() {
            return Err(ClientError::Rejected {
                service: "control plane",
                message: format!("execution already exists: {}", execution_name),
            });
        }
        if serde_json::from_str::<serde_json::Value>(input).is_err() {
            return Err(ClientError::Rejected {
                service: "control plane",
                message: "input is not valid JSON".to_string(),
            });
        }
        self.insert(ExecutionDescription {
            handle: handle.clone(),
            state: ExecutionState::Running,
            input: input.to_string(),
            output: None,
            start_date: Utc::now(),
            stop_date: None,
        });
        Ok(handle)
    }

    async fn describe_execution(
        &self,
        handle: &ExecutionHandle,
    ) -> Result<ExecutionDescription, ClientError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.execution(handle).ok_or_else(|| ClientError::NotFound {
            service: "control plane",
            what: handle.to_string(),
        })
    }

    async fn list_executions(
        &self,
        state_machine: &str,
        status: Option<ExecutionState>,
        next_token: Option<&str>,
    ) -> Result<ExecutionPage, ClientError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let offset = match next_token {
            Some(token) => token.parse::<usize>().map_err(|_| ClientError::Rejected {
                service: "control plane",
                message: format!("invalid pagination token: {}", token),
            })?,
            None => 0,
        };
        let matching: Vec<ExecutionHandle> = self
            .executions
            .lock()
            .iter()
            .filter(|e| e.handle.state_machine_name() == Some(state_machine))
            .filter(|e| status.is_none_or(|s| e.state == s))
            .map(|e| e.handle.clone())
            .collect();
        let end = (offset + self.page_size).min(matching.len());
        let executions = matching.get(offset..end).unwrap_or_default().to_vec();
        let next_token = (end < matching.len()).then(|| end.to_string());
        Ok(ExecutionPage {
            executions,
            next_token,
        })
    }

    async fn stop_execution(
        &self,
        handle: &ExecutionHandle,
        error: &str,
        _cause: &str,
    ) -> Result<(), ClientError> {
        self.check_available()?;
        let mut executions = self.executions.lock();
        let execution = executions
            .iter_mut()
            .find(|e| &e.handle == handle)
            .ok_or_else(|| ClientError::NotFound {
                service: "control plane",
                what: handle.to_string(),
            })?;
        if execution.state == ExecutionState::Running {
            execution.state = ExecutionState::Aborted;
            execution.stop_date = Some(Utc::now());
            self.stopped.lock().push((handle.clone(), error.to_string()));
        }
        Ok(())
    }
}

/// Compute API over a list of tagged instances.
#[derive(Default)]
pub struct MemoryCompute {
    instances: Mutex<Vec<(InstanceInfo, Vec<(String, String)>)>>,
    terminated: Mutex<Vec<String>>,
}

impl MemoryCompute {
    pub fn add_instance(&self, instance: InstanceInfo, tags: &[(&str, &str)]) {
        let tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.instances.lock().push((instance, tags));
    }

    pub fn set_instance_state(&self, instance_id: &str, state: InstanceState) {
        if let Some((instance, _)) = self
            .instances
            .lock()
            .iter_mut()
            .find(|(i, _)| i.instance_id == instance_id)
        {
            instance.state = state;
        }
    }

    /// Instance ids passed to `terminate_instances` so far.
    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().clone()
    }
}

#[async_trait]
impl ComputeApi for MemoryCompute {
    async fn find_tagged_instances(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<InstanceInfo>, ClientError> {
        Ok(self
            .instances
            .lock()
            .iter()
            .filter(|(_, tags)| tags.iter().any(|(k, v)| k == key && v == value))
            .map(|(instance, _)| instance.clone())
            .collect())
    }

    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceInfo>, ClientError> {
        Ok(self
            .instances
            .lock()
            .iter()
            .find(|(i, _)| i.instance_id == instance_id)
            .map(|(i, _)| i.clone()))
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), ClientError> {
        let mut instances = self.instances.lock();
        for id in instance_ids {
            if let Some((instance, _)) = instances.iter_mut().find(|(i, _)| &i.instance_id == id) {
                instance.state = InstanceState::ShuttingDown;
            }
        }
        self.terminated.lock().extend(instance_ids.iter().cloned());
        Ok(())
    }
}

/// Blob store backed by a map.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), (Vec<u8>, DateTime<Utc>)>>,
    put_calls: AtomicUsize,
    read_only: AtomicBool,
}

impl MemoryBlobStore {
    /// Store an object with an explicit modification time.
    pub fn put_at(&self, bucket: &str, key: &str, body: &[u8], last_modified: DateTime<Utc>) {
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            (body.to_vec(), last_modified),
        );
    }

    /// Keys stored in a bucket, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Reject every write while set. Reads keep working.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        Ok(self
            .objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(body, _)| body.clone()))
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, ClientError> {
        Ok(self
            .objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(body, modified)| ObjectMeta {
                size: body.len() as u64,
                last_modified: *modified,
            }))
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), ClientError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if self.read_only.load(Ordering::SeqCst) {
            return Err(unavailable("blob store"));
        }
        self.put_at(bucket, key, &body, Utc::now());
        Ok(())
    }
}

/// Job index backed by a map.
#[derive(Default)]
pub struct MemoryIndex {
    records: Mutex<HashMap<String, IndexRecord>>,
    unavailable: AtomicBool,
    failures_remaining: AtomicUsize,
    get_calls: AtomicUsize,
    put_calls: AtomicUsize,
}

impl MemoryIndex {
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `count` writes with a throttling error.
    pub fn fail_next_puts(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn remove(&self, job_id: &str) -> Option<IndexRecord> {
        self.records.lock().remove(job_id)
    }

    pub fn record(&self, job_id: &str) -> Option<IndexRecord> {
        self.records.lock().get(job_id).cloned()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IndexStore for MemoryIndex {
    async fn get(&self, job_id: &str) -> Result<Option<IndexRecord>, ClientError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("job index"));
        }
        Ok(self.records.lock().get(job_id).cloned())
    }

    async fn put(&self, record: IndexRecord) -> Result<(), ClientError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("job index"));
        }
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ClientError::Throttled {
                service: "job index",
            });
        }
        self.records.lock().insert(record.job_id.clone(), record);
        Ok(())
    }
}

/// Telemetry service holding raw datapoints per metric name.
///
/// Returns the points of a query's window aggregated per period with the
/// requested statistic, newest first, and rejects queries above the point limit.
#[derive(Default)]
pub struct MemoryTelemetry {
    points: Mutex<HashMap<String, Vec<Datapoint>>>,
    queries: Mutex<Vec<MetricQuery>>,
    failing: Mutex<Vec<String>>,
}

impl MemoryTelemetry {
    pub fn add_point(&self, metric_name: &str, timestamp: DateTime<Utc>, value: f64) {
        self.points
            .lock()
            .entry(metric_name.to_string())
            .or_default()
            .push(Datapoint { timestamp, value });
    }

    /// Queries received so far.
    pub fn queries(&self) -> Vec<MetricQuery> {
        self.queries.lock().clone()
    }

    /// Fail every query for `metric_name`.
    pub fn fail_metric(&self, metric_name: &str) {
        self.failing.lock().push(metric_name.to_string());
    }
}

#[async_trait]
impl TelemetryApi for MemoryTelemetry {
    async fn get_metric_statistics(
        &self,
        query: &MetricQuery,
    ) -> Result<Vec<Datapoint>, ClientError> {
        self.queries.lock().push(query.clone());
        if self.failing.lock().contains(&query.metric_name) {
            return Err(unavailable("telemetry"));
        }
        if query.point_count() > TELEMETRY_POINT_LIMIT {
            return Err(ClientError::Rejected {
                service: "telemetry",
                message: format!(
                    "{} points requested, limit is {}",
                    query.point_count(),
                    TELEMETRY_POINT_LIMIT
                ),
            });
        }
        let period = i64::from(query.period_seconds.max(1));
        let mut buckets: HashMap<i64, Vec<f64>> = HashMap::new();
        if let Some(points) = self.points.lock().get(&query.metric_name) {
            for point in points
                .iter()
                .filter(|p| p.timestamp >= query.start && p.timestamp < query.end)
            {
                let slot = (point.timestamp - query.start).num_seconds() / period;
                buckets.entry(slot).or_default().push(point.value);
            }
        }
        let mut result: Vec<Datapoint> = buckets
            .into_iter()
            .map(|(slot, values)| {
                let value = match query.statistic {
                    Statistic::Maximum => {
                        values.iter().copied().fold(f64::MIN, f64::max)
                    }
                    Statistic::Minimum => {
                        values.iter().copied().fold(f64::MAX, f64::min)
                    }
                    Statistic::Average => {
                        values.iter().sum::<f64>() / values.len() as f64
                    }
                };
                Datapoint {
                    timestamp: query.start + chrono::Duration::seconds(slot * period),
                    value,
                }
            })
            .collect();
        result.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(result)
    }
}

/// One catalog entry.
struct PriceEntry {
    service_code: String,
    attributes: HashMap<String, String>,
    document: String,
}

/// Pricing catalog with exact-match attribute filtering.
#[derive(Default)]
pub struct MemoryPricing {
    products: Mutex<Vec<PriceEntry>>,
    spot: Mutex<HashMap<(String, String), Vec<SpotPrice>>>,
    unavailable: AtomicBool,
    product_calls: AtomicUsize,
}

impl MemoryPricing {
    /// Add a catalog entry with a single on-demand USD price.
    pub fn add_product(&self, service_code: &str, attributes: &[(&str, &str)], usd: f64) {
        let attributes: HashMap<String, String> = attributes
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let document = serde_json::json!({
            "product": { "attributes": attributes },
            "terms": {
                "OnDemand": {
                    "TERM1": {
                        "priceDimensions": {
                            "DIM1": { "pricePerUnit": { "USD": format!("{:.10}", usd) } }
                        }
                    }
                }
            }
        })
        .to_string();
        self.products.lock().push(PriceEntry {
            service_code: service_code.to_string(),
            attributes,
            document,
        });
    }

    pub fn add_spot_price(
        &self,
        instance_type: &str,
        availability_zone: &str,
        timestamp: DateTime<Utc>,
        price: f64,
    ) {
        self.spot
            .lock()
            .entry((instance_type.to_string(), availability_zone.to_string()))
            .or_default()
            .push(SpotPrice { timestamp, price });
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn product_calls(&self) -> usize {
        self.product_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PricingApi for MemoryPricing {
    async fn get_products(
        &self,
        service_code: &str,
        filters: &[PriceFilter],
    ) -> Result<Vec<String>, ClientError> {
        self.product_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("pricing"));
        }
        Ok(self
            .products
            .lock()
            .iter()
            .filter(|entry| entry.service_code == service_code)
            .filter(|entry| {
                filters
                    .iter()
                    .all(|f| entry.attributes.get(&f.field) == Some(&f.value))
            })
            .map(|entry| entry.document.clone())
            .collect())
    }

    async fn spot_price_history(
        &self,
        instance_type: &str,
        availability_zone: &str,
    ) -> Result<Vec<SpotPrice>, ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("pricing"));
        }
        let mut prices = self
            .spot
            .lock()
            .get(&(instance_type.to_string(), availability_zone.to_string()))
            .cloned()
            .unwrap_or_default();
        prices.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(prices)
    }
}

/// Billing service holding daily costs per tag value.
#[derive(Default)]
pub struct MemoryBilling {
    daily: Mutex<HashMap<String, Vec<(String, f64)>>>,
    queries: Mutex<Vec<BillingQuery>>,
    unavailable: AtomicBool,
}

impl MemoryBilling {
    /// Record a daily cost (`date` as YYYY-MM-DD) for a tag value.
    pub fn add_daily_cost(&self, tag_value: &str, date: &str, amount: f64) {
        self.daily
            .lock()
            .entry(tag_value.to_string())
            .or_default()
            .push((date.to_string(), amount));
    }

    pub fn queries(&self) -> Vec<BillingQuery> {
        self.queries.lock().clone()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }
}

#[async_trait]
impl BillingApi for MemoryBilling {
    async fn daily_blended_costs(&self, query: &BillingQuery) -> Result<Vec<f64>, ClientError> {
        self.queries.lock().push(query.clone());
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("billing"));
        }
        Ok(self
            .daily
            .lock()
            .get(&query.tag_value)
            .map(|days| {
                days.iter()
                    .filter(|(date, _)| {
                        date.as_str() >= query.start_date.as_str()
                            && date.as_str() < query.end_date.as_str()
                    })
                    .map(|(_, amount)| *amount)
                    .collect()
            })
            .unwrap_or_default())
    }
}
