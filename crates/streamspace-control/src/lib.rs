//! Control plane core for `StreamSpace` agents.
//!
//! This crate keeps the control plane's view of sessions converging with
//! what remote agents actually do. Commands are persisted before they are
//! sent, agents hold exactly one live channel each, and a background
//! reconciler retries or force-resolves sessions that get stuck.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Gateway (HTTP / agent WS)                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ControlPlaneService                       │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌──────────┐  │
//! │  │ Connection │ │  Command   │ │  Message   │ │ Session  │  │
//! │  │    Hub     │ │ Dispatcher │ │   Router   │ │Reconciler│  │
//! │  └────────────┘ └────────────┘ └────────────┘ └──────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┼──────────────┐
//!               ▼              ▼              ▼
//!        ┌──────────┐   ┌──────────┐   ┌──────────┐
//!        │  Store   │   │ Notifier │   │   Spec   │
//!        │ (RocksDB)│   │  (UI)    │   │  Source  │
//!        └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamspace_control::{ControlPlane, ControlPlaneService};
//! use streamspace_core::{AgentId, SessionId, SessionSpec};
//! use streamspace_store::RocksStore;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RocksStore::open("/tmp/streamspace")?);
//! let control = Arc::new(ControlPlaneService::with_defaults(store));
//!
//! // Background reconciliation
//! let cancel = CancellationToken::new();
//! let reconciler = Arc::clone(control.reconciler());
//! tokio::spawn({
//!     let cancel = cancel.clone();
//!     async move { reconciler.run(cancel).await }
//! });
//!
//! // Persisted first, dispatched if the agent is connected
//! let issued = control
//!     .start_session(
//!         &SessionId::new("sess-1")?,
//!         &AgentId::new("k8s-1")?,
//!         SessionSpec::for_template("firefox"),
//!     )
//!     .await?;
//! println!("start command {} dispatched: {}", issued.command.command_id, issued.dispatched);
//!
//! cancel.cancel();
//! # Ok(())
//! # }
//! ```
//!
//! # State Machine
//!
//! Sessions follow a strict state machine:
//!
//! - `Pending` → `Running` (start completes), `Failed` or `Terminating`
//! - `Running` → `Hibernated`, `Terminating` or `Failed`
//! - `Hibernated` → `Running` (wake) or `Terminating`
//! - `Terminating` → `Terminated`
//!
//! See the [`lifecycle`] module for transition validation helpers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod notifier;
pub mod reconciler;
pub mod router;
pub mod service;
pub mod spec_source;

#[cfg(test)]
mod faulty_store;

pub use config::ControlConfig;
pub use dispatcher::CommandDispatcher;
pub use error::{ControlError, Result};
pub use hub::{AgentRegistration, ConnectedAgent, ConnectionHub};
pub use notifier::{BroadcastNotifier, EventSource, NoopNotifier, SessionEvent, SessionNotifier};
pub use reconciler::{
    ReconcileAction, ReconcileReport, ReconcileStats, SessionReconciler, AGENT_UNAVAILABLE_REASON,
};
pub use router::MessageRouter;
pub use service::{ControlPlane, ControlPlaneService, IssuedCommand};
pub use spec_source::{InMemorySpecSource, NoSpecSource, SessionSpecSource};

// Re-export commonly used types from dependencies for convenience
pub use streamspace_core::{AgentId, SessionId, SessionSpec, SessionState};
pub use streamspace_store::{Command, Session};
