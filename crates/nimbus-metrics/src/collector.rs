//! Resource metrics of one instance over a job's lifetime.

use crate::MetricsError;
use crate::chunk::chunk_window;
use chrono::{DateTime, Utc};
use nimbus_core::{MetricQuery, MetricSample, Statistic, TelemetryApi};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Mount path of the job's data volume.
pub const DATA_MOUNT_PATH: &str = "/data1";

/// Storage read volume (bytes) below which an instance counts as idle.
pub const IDLE_READ_BYTES: f64 = 1000.0;

/// How values are combined within and across chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    Max,
    Min,
}

impl Reducer {
    /// Combine values, ignoring an empty input.
    pub fn reduce(&self, values: impl IntoIterator<Item = f64>) -> Option<f64> {
        values.into_iter().fold(None, |acc, v| {
            Some(match (acc, self) {
                (None, _) => v,
                (Some(a), Self::Max) => a.max(v),
                (Some(a), Self::Min) => a.min(v),
            })
        })
    }
}

/// Telemetry dimensions collected for every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dimension {
    MemoryUsed,
    MemoryAvailable,
    CpuUtilization,
    DiskSpaceUsed,
    DiskSpaceUtilization,
    StorageReadBytes,
}

impl Dimension {
    pub const ALL: [Dimension; 6] = [
        Self::MemoryUsed,
        Self::MemoryAvailable,
        Self::CpuUtilization,
        Self::DiskSpaceUsed,
        Self::DiskSpaceUtilization,
        Self::StorageReadBytes,
    ];

    pub fn namespace(&self) -> &'static str {
        match self {
            Self::CpuUtilization | Self::StorageReadBytes => "AWS/EC2",
            _ => "System/Linux",
        }
    }

    pub fn metric_name(&self) -> &'static str {
        match self {
            Self::MemoryUsed => "MemoryUsed",
            Self::MemoryAvailable => "MemoryAvailable",
            Self::CpuUtilization => "CPUUtilization",
            Self::DiskSpaceUsed => "DiskSpaceUsed",
            Self::DiskSpaceUtilization => "DiskSpaceUtilization",
            Self::StorageReadBytes => "EBSReadBytes",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::MemoryUsed | Self::MemoryAvailable => "Megabytes",
            Self::CpuUtilization | Self::DiskSpaceUtilization => "Percent",
            Self::DiskSpaceUsed => "Gigabytes",
            Self::StorageReadBytes => "Bytes",
        }
    }

    pub fn statistic(&self) -> Statistic {
        match self {
            Self::MemoryAvailable => Statistic::Minimum,
            Self::StorageReadBytes => Statistic::Average,
            _ => Statistic::Maximum,
        }
    }

    pub fn period_seconds(&self) -> u32 {
        match self {
            Self::CpuUtilization => 300,
            _ => 60,
        }
    }

    pub fn reducer(&self) -> Reducer {
        match self {
            Self::MemoryAvailable => Reducer::Min,
            _ => Reducer::Max,
        }
    }

    fn is_disk(&self) -> bool {
        matches!(self, Self::DiskSpaceUsed | Self::DiskSpaceUtilization)
    }

    /// Query for one chunk of the window.
    pub fn query(
        &self,
        target: &InstanceTarget,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricQuery {
        let mut dimensions = vec![("InstanceId".to_string(), target.instance_id.clone())];
        if self.is_disk() {
            dimensions.push(("MountPath".to_string(), DATA_MOUNT_PATH.to_string()));
            dimensions.push(("Filesystem".to_string(), target.filesystem.clone()));
        }
        MetricQuery {
            namespace: self.namespace().to_string(),
            metric_name: self.metric_name().to_string(),
            dimensions,
            period_seconds: self.period_seconds(),
            statistic: self.statistic(),
            unit: self.unit().to_string(),
            start,
            end,
        }
    }
}

/// Instance whose metrics are collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTarget {
    pub instance_id: String,
    /// Device backing the data volume (e.g. `/dev/nvme1n1`).
    pub filesystem: String,
}

impl InstanceTarget {
    pub fn new(instance_id: impl Into<String>, filesystem: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            filesystem: filesystem.into(),
        }
    }
}

/// Collected series and their reductions.
#[derive(Debug, Clone)]
pub struct ResourceMetrics {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Time-sorted samples per dimension.
    pub series: BTreeMap<Dimension, Vec<MetricSample>>,
    pub max_mem_used_mb: Option<f64>,
    pub min_mem_available_mb: Option<f64>,
    pub total_mem_mb: Option<f64>,
    pub max_mem_utilization_percent: Option<f64>,
    pub max_cpu_utilization_percent: Option<f64>,
    pub max_disk_space_used_gb: Option<f64>,
    pub max_disk_space_utilization_percent: Option<f64>,
    pub max_storage_read_bytes: Option<f64>,
    /// Dimensions with at least one failed chunk query.
    pub failed: Vec<Dimension>,
}

impl ResourceMetrics {
    /// Derive the summary values from per-dimension reductions.
    fn from_reduced(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        series: BTreeMap<Dimension, Vec<MetricSample>>,
        reduced: &BTreeMap<Dimension, Option<f64>>,
        failed: Vec<Dimension>,
    ) -> Self {
        let get = |d: Dimension| reduced.get(&d).copied().flatten();
        let used = get(Dimension::MemoryUsed);
        let available = get(Dimension::MemoryAvailable);
        let total_mem_mb = used.zip(available).map(|(u, a)| u + a);
        let max_mem_utilization_percent = used
            .zip(total_mem_mb)
            .filter(|(_, total)| *total > 0.0)
            .map(|(u, total)| u / total * 100.0);
        Self {
            start,
            end,
            series,
            max_mem_used_mb: used,
            min_mem_available_mb: available,
            total_mem_mb,
            max_mem_utilization_percent,
            max_cpu_utilization_percent: get(Dimension::CpuUtilization),
            max_disk_space_used_gb: get(Dimension::DiskSpaceUsed),
            max_disk_space_utilization_percent: get(Dimension::DiskSpaceUtilization),
            max_storage_read_bytes: get(Dimension::StorageReadBytes),
            failed,
        }
    }

    pub fn samples(&self, dimension: Dimension) -> &[MetricSample] {
        self.series
            .get(&dimension)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Memory utilization per minute where both used and available were sampled.
    pub fn memory_utilization_series(&self) -> Vec<(DateTime<Utc>, f64)> {
        let available: BTreeMap<DateTime<Utc>, f64> = self
            .samples(Dimension::MemoryAvailable)
            .iter()
            .map(|s| (s.timestamp(), s.value()))
            .collect();
        self.samples(Dimension::MemoryUsed)
            .iter()
            .filter_map(|used| {
                let avail = available.get(&used.timestamp())?;
                let total = used.value() + avail;
                (total > 0.0).then(|| (used.timestamp(), used.value() / total * 100.0))
            })
            .collect()
    }

    /// No CPU activity above `cpu_threshold` and almost no storage reads.
    ///
    /// Missing data counts as idle, a failed CPU or read query does not.
    pub fn is_idle(&self, cpu_threshold: f64) -> bool {
        if self
            .failed
            .iter()
            .any(|d| matches!(d, Dimension::CpuUtilization | Dimension::StorageReadBytes))
        {
            return false;
        }
        let cpu_idle = self
            .max_cpu_utilization_percent
            .is_none_or(|cpu| cpu < cpu_threshold);
        let read_idle = self
            .max_storage_read_bytes
            .is_none_or(|bytes| bytes < IDLE_READ_BYTES);
        cpu_idle && read_idle
    }
}

/// Collects resource metrics through bounded telemetry queries.
pub struct ResourceMetricsCollector {
    telemetry: Arc<dyn TelemetryApi>,
}

impl ResourceMetricsCollector {
    pub fn new(telemetry: Arc<dyn TelemetryApi>) -> Self {
        Self { telemetry }
    }

    /// Query every dimension for `[start, end)`, one query per one-day chunk.
    ///
    /// A failed chunk query counts as an empty chunk and marks its dimension
    /// in [`ResourceMetrics::failed`]. Only fails when every query failed.
    pub async fn collect(
        &self,
        target: &InstanceTarget,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ResourceMetrics, MetricsError> {
        let chunks = chunk_window(start, end);
        tracing::debug!(
            "Collecting metrics for {} in {} chunks",
            target.instance_id,
            chunks.len()
        );

        let mut series = BTreeMap::new();
        let mut reduced = BTreeMap::new();
        let mut failed = Vec::new();
        let mut last_error = None;
        let mut succeeded = 0usize;
        for dimension in Dimension::ALL {
            let reducer = dimension.reducer();
            let mut chunk_values = Vec::with_capacity(chunks.len());
            let mut samples = Vec::new();
            for chunk in &chunks {
                let query = dimension.query(target, chunk.start, chunk.end);
                let mut points = match self.telemetry.get_metric_statistics(&query).await {
                    Ok(points) => points,
                    Err(e) => {
                        tracing::warn!(
                            "Failed to query {} for {}: {}",
                            dimension.metric_name(),
                            target.instance_id,
                            e
                        );
                        if !failed.contains(&dimension) {
                            failed.push(dimension);
                        }
                        last_error = Some(e);
                        chunk_values.push(None);
                        continue;
                    }
                };
                succeeded += 1;
                points.sort_by_key(|p| p.timestamp);
                chunk_values.push(reducer.reduce(points.iter().map(|p| p.value)));
                for point in points {
                    match MetricSample::new(point.timestamp, dimension.metric_name(), point.value) {
                        Ok(sample) => samples.push(sample),
                        Err(e) => tracing::warn!("Skipping datapoint: {}", e),
                    }
                }
            }
            reduced.insert(dimension, reducer.reduce(chunk_values.into_iter().flatten()));
            series.insert(dimension, samples);
        }

        if succeeded == 0 {
            if let Some(e) = last_error {
                return Err(MetricsError::Telemetry(e));
            }
        }
        Ok(ResourceMetrics::from_reduced(start, end, series, &reduced, failed))
    }
}
