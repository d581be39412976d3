//! Shared state enumerations.
//!
//! These enums appear both in persisted records and on the agent wire, so they
//! live here rather than in the store crate. All of them serialize as short
//! `snake_case` strings and carry a stable `u8` code used by store indexes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform an agent manages sessions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPlatform {
    /// Kubernetes cluster agent.
    Kubernetes,
    /// Docker host agent.
    Docker,
    /// Virtual machine agent.
    Vm,
    /// Managed cloud agent.
    Cloud,
}

impl AgentPlatform {
    /// Parse a platform name, accepting common aliases.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "kubernetes" | "k8s" => Some(Self::Kubernetes),
            "docker" => Some(Self::Docker),
            "vm" => Some(Self::Vm),
            "cloud" => Some(Self::Cloud),
            _ => None,
        }
    }
}

/// Connection-level status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AgentStatus {
    /// Connected and accepting commands.
    Online = 1,
    /// No live channel.
    Offline = 2,
    /// Finishing existing work, not accepting new sessions.
    Draining = 3,
}

impl AgentStatus {
    /// Convert the status to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to an `AgentStatus`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Online),
            2 => Some(Self::Offline),
            3 => Some(Self::Draining),
            _ => None,
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    /// Waiting for the agent to start the session.
    Pending = 1,
    /// Session is running on the agent.
    Running = 2,
    /// Session is suspended; wakes on request.
    Hibernated = 3,
    /// Stop has been requested, waiting for the agent.
    Terminating = 4,
    /// Session is gone.
    Terminated = 5,
    /// Session could not be started.
    Failed = 6,
}

impl SessionState {
    /// Convert the state to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to a `SessionState`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pending),
            2 => Some(Self::Running),
            3 => Some(Self::Hibernated),
            4 => Some(Self::Terminating),
            5 => Some(Self::Terminated),
            6 => Some(Self::Failed),
            _ => None,
        }
    }

    /// The wire/database spelling of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Hibernated => "hibernated",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The instruction a command carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    /// Create and start a session.
    StartSession,
    /// Stop a session and release its resources.
    StopSession,
    /// Suspend a session.
    HibernateSession,
    /// Resume a hibernated session.
    WakeSession,
}

impl CommandAction {
    /// The wire/database spelling of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartSession => "start_session",
            Self::StopSession => "stop_session",
            Self::HibernateSession => "hibernate_session",
            Self::WakeSession => "wake_session",
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of a command.
///
/// Statuses only move forward: `Pending → Sent → Ack → {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CommandStatus {
    /// Persisted, not yet handed to a channel.
    Pending = 1,
    /// Written to the agent channel.
    Sent = 2,
    /// Agent acknowledged receipt and is executing.
    Ack = 3,
    /// Agent reported success.
    Completed = 4,
    /// Agent reported failure.
    Failed = 5,
}

impl CommandStatus {
    /// Convert the status to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to a `CommandStatus`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pending),
            2 => Some(Self::Sent),
            3 => Some(Self::Ack),
            4 => Some(Self::Completed),
            5 => Some(Self::Failed),
            _ => None,
        }
    }

    /// Position in the forward-only ordering. Both terminal statuses share
    /// the highest rank.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Ack => 2,
            Self::Completed | Self::Failed => 3,
        }
    }

    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The wire/database spelling of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Ack => "ack",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
