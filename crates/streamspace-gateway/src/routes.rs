//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use streamspace_store::Store;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{agents, health, internal, sessions};
use crate::state::GatewayState;

/// Create the gateway router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Agents
/// - `GET /v1/agents/connect?agent_id=..&platform=..&region=..` - Agent
///   WebSocket
///
/// ## UI
/// - `GET /v1/sessions/events` - Session event WebSocket
///
/// ## Internal
/// - `GET /internal/reconciler/stats` - Stuck session counts
/// - `GET /internal/agents` - Connected agents
pub fn create_router<S>(state: GatewayState<S>) -> Router
where
    S: Store + 'static,
{
    let cors = build_cors_layer(&state.config.cors_origins);
    let request_timeout = state.config.request_timeout();
    let state = Arc::new(state);

    Router::new()
        // Health (public)
        .route("/health", get(health::health))
        // Agent channel
        .route("/v1/agents/connect", get(agents::connect_agent::<S>))
        // UI fan-out
        .route("/v1/sessions/events", get(sessions::session_events::<S>))
        // Internal diagnostics
        .route(
            "/internal/reconciler/stats",
            get(internal::reconciler_stats::<S>),
        )
        .route("/internal/agents", get(internal::connected_agents::<S>))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
