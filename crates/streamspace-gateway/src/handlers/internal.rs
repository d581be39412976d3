//! Internal diagnostics endpoints.
//!
//! Not meant to be exposed outside the cluster; protect them with network
//! policy.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use streamspace_control::{ConnectedAgent, ReconcileStats};
use streamspace_store::Store;

use crate::error::ApiError;
use crate::state::GatewayState;

/// Response for listing connected agents.
#[derive(Debug, Serialize)]
pub struct ConnectedAgentsResponse {
    /// Live connections, ordered by agent id.
    pub agents: Vec<ConnectedAgent>,
}

/// Stuck-session counts, computed with the reconciler's own predicates.
///
/// # Errors
///
/// Returns an error if sessions cannot be listed.
pub async fn reconciler_stats<S>(
    State(state): State<Arc<GatewayState<S>>>,
) -> Result<Json<ReconcileStats>, ApiError>
where
    S: Store + 'static,
{
    Ok(Json(state.control.reconciler_stats()?))
}

/// Agents with a live channel right now.
pub async fn connected_agents<S>(
    State(state): State<Arc<GatewayState<S>>>,
) -> Json<ConnectedAgentsResponse>
where
    S: Store + 'static,
{
    Json(ConnectedAgentsResponse {
        agents: state.control.hub().connected_agents(),
    })
}
