//! Core types, collaborator interfaces and settings for nimbus.

pub mod clients;
pub mod context;
pub mod fs;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod settings;
pub mod types;

pub use clients::{
    BillingApi, BillingQuery, BlobStore, ClientError, ComputeApi, ControlPlane, Datapoint,
    IndexStore, MetricQuery, PriceFilter, PricingApi, SpotPrice, Statistic, TelemetryApi,
};
pub use context::Context;
pub use fs::FsBlobStore;
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryCloud;
pub use settings::{Settings, region_display_name};
pub use types::{
    ExecutionDescription, ExecutionHandle, ExecutionPage, ExecutionState, IndexRecord,
    InstanceInfo, InstanceState, JobDescriptor, MetricSample, ObjectMeta, UnknownState,
    ValidationError,
};
