//! Collaborator interfaces consumed by the job lifecycle.
//!
//! Each trait models one remote service. Implementations are shared through
//! `Arc<dyn Trait>` inside a [`crate::Context`].

use crate::types::{
    ExecutionDescription, ExecutionHandle, ExecutionPage, ExecutionState, IndexRecord,
    InstanceInfo, ObjectMeta,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },
    #[error("{service} throttled the request")]
    Throttled { service: &'static str },
    #[error("{service}: {what} not found")]
    NotFound { service: &'static str, what: String },
    #[error("{service} rejected the request: {message}")]
    Rejected {
        service: &'static str,
        message: String,
    },
}

impl ClientError {
    /// Errors worth retrying after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Throttled { .. })
    }
}

/// Workflow control plane (state machine executions).
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn start_execution(
        &self,
        state_machine: &str,
        execution_name: &str,
        input: &str,
    ) -> Result<ExecutionHandle, ClientError>;

    async fn describe_execution(
        &self,
        handle: &ExecutionHandle,
    ) -> Result<ExecutionDescription, ClientError>;

    /// One page of executions of a state machine, optionally filtered by status.
    async fn list_executions(
        &self,
        state_machine: &str,
        status: Option<ExecutionState>,
        next_token: Option<&str>,
    ) -> Result<ExecutionPage, ClientError>;

    async fn stop_execution(
        &self,
        handle: &ExecutionHandle,
        error: &str,
        cause: &str,
    ) -> Result<(), ClientError>;
}

/// Compute instances.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Instances carrying tag `key=value`.
    async fn find_tagged_instances(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<InstanceInfo>, ClientError>;

    async fn describe_instance(&self, instance_id: &str)
    -> Result<Option<InstanceInfo>, ClientError>;

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), ClientError>;
}

/// Blob store keyed by bucket and key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ClientError>;

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, ClientError>;

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), ClientError>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, ClientError> {
        Ok(self.head(bucket, key).await?.is_some())
    }

    /// Fetch an object as UTF-8 text (lossy).
    async fn get_string(&self, bucket: &str, key: &str) -> Result<Option<String>, ClientError> {
        Ok(self
            .get(bucket, key)
            .await?
            .map(|body| String::from_utf8_lossy(&body).into_owned()))
    }

    async fn put_string(&self, bucket: &str, key: &str, body: &str) -> Result<(), ClientError> {
        self.put(bucket, key, body.as_bytes().to_vec()).await
    }
}

/// Keyed job index.
#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn get(&self, job_id: &str) -> Result<Option<IndexRecord>, ClientError>;

    /// Full-snapshot upsert keyed by job id.
    async fn put(&self, record: IndexRecord) -> Result<(), ClientError>;
}

/// Statistic requested from the telemetry service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Statistic {
    Maximum,
    Minimum,
    Average,
}

/// One bounded telemetry query.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricQuery {
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: Vec<(String, String)>,
    pub period_seconds: u32,
    pub statistic: Statistic,
    pub unit: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl MetricQuery {
    /// Number of periods the query covers.
    pub fn point_count(&self) -> i64 {
        let seconds = (self.end - self.start).num_seconds().max(0);
        let period = i64::from(self.period_seconds.max(1));
        (seconds + period - 1) / period
    }
}

/// Telemetry datapoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Datapoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Metric statistics service.
#[async_trait]
pub trait TelemetryApi: Send + Sync {
    async fn get_metric_statistics(&self, query: &MetricQuery)
    -> Result<Vec<Datapoint>, ClientError>;
}

/// Exact-match product filter for the pricing catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceFilter {
    pub field: String,
    pub value: String,
}

impl PriceFilter {
    pub fn term(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Historical spot price.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotPrice {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

/// Pricing catalog.
#[async_trait]
pub trait PricingApi: Send + Sync {
    /// Price-list entries (JSON documents) matching every filter.
    async fn get_products(
        &self,
        service_code: &str,
        filters: &[PriceFilter],
    ) -> Result<Vec<String>, ClientError>;

    async fn spot_price_history(
        &self,
        instance_type: &str,
        availability_zone: &str,
    ) -> Result<Vec<SpotPrice>, ClientError>;
}

/// Billing query for costs grouped by day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingQuery {
    pub tag_key: String,
    pub tag_value: String,
    /// Inclusive start date (YYYY-MM-DD)
    pub start_date: String,
    /// Exclusive end date (YYYY-MM-DD)
    pub end_date: String,
}

/// Billing service.
#[async_trait]
pub trait BillingApi: Send + Sync {
    /// Daily blended cost amounts for resources carrying the tag.
    async fn daily_blended_costs(&self, query: &BillingQuery) -> Result<Vec<f64>, ClientError>;
}
