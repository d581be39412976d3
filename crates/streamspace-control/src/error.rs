//! Error types for the control plane.
//!
//! Forced resolutions by the reconciler are not errors; they are reported as
//! [`crate::reconciler::ReconcileAction::ForcedResolution`].

use streamspace_core::{AgentId, CommandId, SessionId, SessionState};
use streamspace_store::StoreError;
use thiserror::Error;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in control plane operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The command or session store failed. Never swallowed.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// The target agent has no live channel.
    #[error("agent {0} is not connected")]
    AgentUnavailable(AgentId),

    /// The agent channel stayed full for the whole dispatch timeout.
    #[error("channel to agent {0} is saturated")]
    ChannelSaturated(AgentId),

    /// An agent message could not be applied: unknown command, wrong agent,
    /// bad payload or unknown type. The message is dropped; the connection
    /// is kept.
    #[error("protocol anomaly from agent {agent_id}: {reason}")]
    ProtocolAnomaly {
        /// The sending agent.
        agent_id: AgentId,
        /// What was wrong with the message.
        reason: String,
    },

    /// The requested command was not found.
    #[error("command not found: {0}")]
    CommandNotFound(CommandId),

    /// The requested session was not found.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The requested session state transition is not valid.
    #[error(
        "invalid state transition for session {session_id}: cannot transition from {from} to {to}"
    )]
    InvalidSessionState {
        /// The session being transitioned.
        session_id: SessionId,
        /// The current state.
        from: SessionState,
        /// The requested target state.
        to: SessionState,
    },

    /// The session already reached a terminal state, so commands that would
    /// bring it back up are refused.
    #[error("session {session_id} is already {state}")]
    SessionClosed {
        /// The resolved session.
        session_id: SessionId,
        /// Its terminal state.
        state: SessionState,
    },

    /// The configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::CommandNotFound(_) | Self::SessionNotFound(_) => 404,
            Self::InvalidSessionState { .. } | Self::SessionClosed { .. } => 409,
            Self::ProtocolAnomaly { .. } => 400,
            Self::AgentUnavailable(_) | Self::ChannelSaturated(_) => 503,
            Self::Persistence(_) | Self::Config(_) | Self::Internal(_) => 500,
        }
    }

    /// Returns true if this error might be resolved by retrying on a later
    /// tick.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_)
                | Self::AgentUnavailable(_)
                | Self::ChannelSaturated(_)
                | Self::Internal(_)
        )
    }
}
