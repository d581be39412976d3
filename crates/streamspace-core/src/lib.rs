//! Core types for the StreamSpace control plane.
//!
//! This crate provides the vocabulary shared by the store, the control plane
//! and the gateway:
//!
//! - **Identifiers**: validated agent and session names, UUID-based command
//!   and connection IDs
//! - **Model**: session states, command actions and command statuses
//! - **Protocol**: the JSON envelope exchanged with agents
//!
//! # Example
//!
//! ```
//! use streamspace_core::{AgentId, CommandStatus, SessionId};
//!
//! let agent_id = AgentId::new("k8s-1").unwrap();
//! let session_id = SessionId::new("sess-1").unwrap();
//! assert!(CommandStatus::Completed.is_terminal());
//! # let _ = (agent_id, session_id);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ids;
pub mod model;
pub mod protocol;

pub use ids::{AgentId, CommandId, ConnectionId, IdError, SessionId};
pub use model::{AgentPlatform, AgentStatus, CommandAction, CommandStatus, SessionState};
pub use protocol::{
    AgentMessage, CommandMessage, CommandPayload, CommandResult, ControlMessage, Envelope,
    HeartbeatPayload, ProtocolError, SessionSpec, ShutdownMessage, StopOptions,
};
