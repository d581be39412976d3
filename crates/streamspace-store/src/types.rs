//! Domain types stored in the database.
//!
//! These types represent the persisted state of agents, commands, and the
//! subset of session fields the control plane reads and writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use streamspace_core::{
    AgentId, AgentPlatform, AgentStatus, CommandAction, CommandId, CommandPayload, CommandResult,
    CommandStatus, ConnectionId, SessionId, SessionState,
};

/// An agent record stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Stable, operator-assigned identifier.
    pub agent_id: AgentId,
    /// Platform the agent manages sessions on.
    pub platform: AgentPlatform,
    /// Free-form locality hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Connection-level status.
    pub status: AgentStatus,
    /// The currently active channel, `None` while disconnected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    /// Last heartbeat received from the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Sessions the agent reported running in its last heartbeat.
    #[serde(default)]
    pub active_sessions: u32,
    /// Resource limits, opaque to the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<serde_json::Value>,
    /// Platform-specific metadata, opaque to the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// First registration timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// A command record: one instruction addressed to one agent.
///
/// Commands are never overwritten by a retry. A retry is a new record with a
/// fresh `command_id` for the same session and action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Generated at persistence time.
    pub command_id: CommandId,
    /// Target agent.
    pub agent_id: AgentId,
    /// Affected session; `None` for agent-wide commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// The instruction, always equal to `payload.action()`.
    pub action: CommandAction,
    /// Action-specific body.
    pub payload: CommandPayload,
    /// Delivery status.
    pub status: CommandStatus,
    /// Agent-reported error, set only when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Agent-reported result, set only when `status` is `Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    /// When the command was persisted.
    pub created_at: DateTime<Utc>,
    /// When the command was written to the agent channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    /// When the agent acknowledged the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// When the command completed or failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Command {
    /// Build a new `Pending` command with a fresh id.
    #[must_use]
    pub fn new(
        agent_id: AgentId,
        session_id: Option<SessionId>,
        payload: CommandPayload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            command_id: CommandId::generate(),
            agent_id,
            session_id,
            action: payload.action(),
            payload,
            status: CommandStatus::Pending,
            error_message: None,
            result: None,
            created_at: now,
            sent_at: None,
            acknowledged_at: None,
            completed_at: None,
        }
    }

    /// When the command entered its current status.
    ///
    /// Falls back to the latest earlier timestamp when a status was reached
    /// out of order.
    #[must_use]
    pub fn status_changed_at(&self) -> DateTime<Utc> {
        let stamp = match self.status {
            CommandStatus::Pending => None,
            CommandStatus::Sent => self.sent_at,
            CommandStatus::Ack => self.acknowledged_at,
            CommandStatus::Completed | CommandStatus::Failed => self.completed_at,
        };
        stamp
            .or(self.acknowledged_at)
            .or(self.sent_at)
            .unwrap_or(self.created_at)
    }
}

/// The session fields the control plane owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub session_id: SessionId,
    /// Agent hosting the session.
    pub agent_id: AgentId,
    /// Lifecycle state.
    pub state: SessionState,
    /// Why the session ended, e.g. `agent_unavailable`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last state change. Starts the stuck clock for `pending` and
    /// `terminating`.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a session record in `state`, stamped at `now`.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        agent_id: AgentId,
        state: SessionState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            agent_id,
            state,
            termination_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}
