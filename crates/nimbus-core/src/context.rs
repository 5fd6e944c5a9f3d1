//! Explicit handler context.

use crate::clients::{
    BillingApi, BlobStore, ComputeApi, ControlPlane, IndexStore, PricingApi, TelemetryApi,
};
use crate::settings::Settings;
use std::sync::Arc;

/// Settings plus every collaborator a handler may call.
///
/// Built once by the caller and passed to each transition handler.
#[derive(Clone)]
pub struct Context {
    pub settings: Settings,
    pub control_plane: Arc<dyn ControlPlane>,
    pub compute: Arc<dyn ComputeApi>,
    pub blobs: Arc<dyn BlobStore>,
    pub index: Arc<dyn IndexStore>,
    pub telemetry: Arc<dyn TelemetryApi>,
    pub pricing: Arc<dyn PricingApi>,
    pub billing: Arc<dyn BillingApi>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
