//! HTTP and agent WebSocket gateway for the `StreamSpace` control plane.
//!
//! This crate hosts the control plane core in a network process. It handles:
//!
//! - Agent WebSocket connections: registration, outbound commands and pings,
//!   inbound reports routed into the control plane
//! - Session event fan-out to UI clients
//! - Internal diagnostics (reconciler stats, connected agents)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │   Agents (k8s, docker)   │      │       UI clients         │
//! └──────────────────────────┘      └──────────────────────────┘
//!              │ /v1/agents/connect              │ /v1/sessions/events
//!              ▼                                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   streamspace-gateway                        │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐   │
//! │  │ Agent       │ │   Router    │ │  Session event      │   │
//! │  │ socket      │ │ + Handlers  │ │  stream             │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                 ┌─────────────────────────┐
//!                 │   ControlPlaneService   │
//!                 └─────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamspace_control::{BroadcastNotifier, ControlConfig, ControlPlaneService, SessionNotifier};
//! use streamspace_gateway::{create_router, GatewayConfig, GatewayState};
//! use streamspace_store::RocksStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RocksStore::open("/tmp/streamspace")?);
//! let notifier = Arc::new(BroadcastNotifier::default());
//! let control = Arc::new(ControlPlaneService::new(
//!     store,
//!     ControlConfig::default(),
//!     Arc::clone(&notifier) as Arc<dyn SessionNotifier>,
//! ));
//!
//! let state = GatewayState::new(control, notifier, GatewayConfig::default());
//! let app = create_router(state);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::GatewayConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::GatewayState;
