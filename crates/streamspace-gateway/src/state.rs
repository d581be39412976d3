//! Gateway application state.

use std::sync::Arc;

use streamspace_control::{BroadcastNotifier, ControlPlaneService};
use streamspace_store::Store;

use crate::config::GatewayConfig;

/// Shared application state for the gateway.
pub struct GatewayState<S: Store> {
    /// The control plane core.
    pub control: Arc<ControlPlaneService<S>>,
    /// Session event fan-out, shared with the control plane.
    pub events: Arc<BroadcastNotifier>,
    /// Gateway configuration.
    pub config: GatewayConfig,
}

impl<S: Store> GatewayState<S> {
    /// Create a new gateway state.
    ///
    /// `events` should be the notifier the control plane was built with,
    /// otherwise UI clients see nothing.
    #[must_use]
    pub fn new(
        control: Arc<ControlPlaneService<S>>,
        events: Arc<BroadcastNotifier>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            control,
            events,
            config,
        }
    }
}

impl<S: Store> Clone for GatewayState<S> {
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
            events: Arc::clone(&self.events),
            config: self.config.clone(),
        }
    }
}
