//! Agent wire protocol.
//!
//! Every frame on an agent channel is an [`Envelope`]:
//!
//! ```text
//! { "type": "<message type>", "timestamp": "<RFC 3339>", "payload": { ... } }
//! ```
//!
//! The `type` selects how `payload` is decoded. Control plane → agent
//! messages are [`ControlMessage`]s (`command`, `ping`, `shutdown`); agent →
//! control plane messages are [`AgentMessage`]s (`heartbeat`, `ack`,
//! `complete`, `failed`, `status`). Unknown types decode to `None` rather
//! than an error so that either side can add message types without breaking
//! older peers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{CommandId, SessionId};
use crate::model::{AgentStatus, CommandAction, SessionState};

/// Message type names.
pub mod message_type {
    /// Control plane → agent: execute a command.
    pub const COMMAND: &str = "command";
    /// Control plane → agent: liveness check.
    pub const PING: &str = "ping";
    /// Control plane → agent: graceful drain request.
    pub const SHUTDOWN: &str = "shutdown";
    /// Agent → control plane: periodic liveness and status.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Agent → control plane: command received, executing.
    pub const ACK: &str = "ack";
    /// Agent → control plane: command succeeded.
    pub const COMPLETE: &str = "complete";
    /// Agent → control plane: command failed.
    pub const FAILED: &str = "failed";
    /// Agent → control plane: session state report.
    pub const STATUS: &str = "status";
}

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not a valid envelope.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The payload does not match the schema of its message type.
    #[error("invalid {message_type} payload: {reason}")]
    InvalidPayload {
        /// The envelope `type`.
        message_type: String,
        /// Decoder error text.
        reason: String,
    },
}

/// The outer frame shared by both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type; determines how `payload` is interpreted.
    #[serde(rename = "type")]
    pub message_type: String,
    /// When the sender created the message.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Type-specific body.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build an envelope from a serializable payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn new<T: Serialize>(
        message_type: &str,
        timestamp: DateTime<Utc>,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| ProtocolError::InvalidPayload {
                message_type: message_type.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            message_type: message_type.to_string(),
            timestamp,
            payload,
        })
    }

    /// Decode an envelope from a text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if the text is not an envelope.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encode the envelope as a text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        // A missing payload decodes like an empty object so that payload
        // structs made entirely of defaults accept bare envelopes.
        let value = if self.payload.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.payload.clone()
        };
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            message_type: self.message_type.clone(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Command payloads
// =============================================================================

/// Resource request for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// CPU quantity, platform notation (e.g. `"1000m"`).
    pub cpu: String,
    /// Memory quantity, platform notation (e.g. `"2Gi"`).
    pub memory: String,
}

/// Everything an agent needs to start a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSpec {
    /// Template name the session was created from.
    pub template: String,
    /// Container or VM image; agents fall back to the template's image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Resource request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequest>,
    /// Extra environment for the session.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Whether the session mounts the user's persistent home volume.
    #[serde(default)]
    pub persistent_home: bool,
}

impl SessionSpec {
    /// Create a spec for a template with no overrides.
    #[must_use]
    pub fn for_template(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            image: None,
            resources: None,
            env: BTreeMap::new(),
            persistent_home: false,
        }
    }
}

/// Options for stopping a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StopOptions {
    /// Remove persistent volumes and data. Only ever set on the original
    /// user request, never on a reconciliation retry.
    #[serde(default)]
    pub delete_persistent_data: bool,
}

/// Action-specific command body, tagged by action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum CommandPayload {
    /// Start a session from a spec.
    StartSession(SessionSpec),
    /// Stop a session.
    StopSession(StopOptions),
    /// Hibernate a session.
    HibernateSession,
    /// Wake a hibernated session.
    WakeSession,
}

impl CommandPayload {
    /// The action this payload belongs to.
    #[must_use]
    pub const fn action(&self) -> CommandAction {
        match self {
            Self::StartSession(_) => CommandAction::StartSession,
            Self::StopSession(_) => CommandAction::StopSession,
            Self::HibernateSession => CommandAction::HibernateSession,
            Self::WakeSession => CommandAction::WakeSession,
        }
    }
}

// =============================================================================
// Control plane → agent
// =============================================================================

/// Body of a `command` message.
///
/// On the wire the action and its payload sit next to the identifiers:
/// `{ "command_id", "session_id", "action", "payload" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CommandMessageWire", into = "CommandMessageWire")]
pub struct CommandMessage {
    /// The persisted command this message transmits.
    pub command_id: CommandId,
    /// Session the command acts on.
    pub session_id: Option<SessionId>,
    /// Action and action-specific payload.
    pub payload: CommandPayload,
}

#[derive(Serialize, Deserialize)]
struct CommandMessageWire {
    command_id: CommandId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<SessionId>,
    action: CommandAction,
    #[serde(default)]
    payload: serde_json::Value,
}

impl TryFrom<CommandMessageWire> for CommandMessage {
    type Error = String;

    fn try_from(wire: CommandMessageWire) -> Result<Self, Self::Error> {
        let payload = match wire.action {
            CommandAction::StartSession => CommandPayload::StartSession(
                serde_json::from_value(wire.payload).map_err(|e| e.to_string())?,
            ),
            CommandAction::StopSession => {
                let options = if wire.payload.is_null() {
                    StopOptions::default()
                } else {
                    serde_json::from_value(wire.payload).map_err(|e| e.to_string())?
                };
                CommandPayload::StopSession(options)
            }
            CommandAction::HibernateSession => CommandPayload::HibernateSession,
            CommandAction::WakeSession => CommandPayload::WakeSession,
        };
        Ok(Self {
            command_id: wire.command_id,
            session_id: wire.session_id,
            payload,
        })
    }
}

impl From<CommandMessage> for CommandMessageWire {
    fn from(msg: CommandMessage) -> Self {
        let action = msg.payload.action();
        let payload = match msg.payload {
            CommandPayload::StartSession(spec) => {
                serde_json::to_value(spec).unwrap_or(serde_json::Value::Null)
            }
            CommandPayload::StopSession(options) => {
                serde_json::to_value(options).unwrap_or(serde_json::Value::Null)
            }
            CommandPayload::HibernateSession | CommandPayload::WakeSession => {
                serde_json::Value::Object(serde_json::Map::new())
            }
        };
        Self {
            command_id: msg.command_id,
            session_id: msg.session_id,
            action,
            payload,
        }
    }
}

/// Body of a `shutdown` message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShutdownMessage {
    /// Operator-supplied reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Messages the control plane sends to agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Execute a command.
    Command(CommandMessage),
    /// Liveness check.
    Ping,
    /// Graceful drain request.
    Shutdown(ShutdownMessage),
}

impl ControlMessage {
    /// The envelope type for this message.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Command(_) => message_type::COMMAND,
            Self::Ping => message_type::PING,
            Self::Shutdown(_) => message_type::SHUTDOWN,
        }
    }

    /// Wrap the message in an envelope stamped with `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_envelope(&self, timestamp: DateTime<Utc>) -> Result<Envelope, ProtocolError> {
        match self {
            Self::Command(cmd) => Envelope::new(message_type::COMMAND, timestamp, cmd),
            Self::Ping => Envelope::new(
                message_type::PING,
                timestamp,
                &serde_json::Value::Object(serde_json::Map::new()),
            ),
            Self::Shutdown(msg) => Envelope::new(message_type::SHUTDOWN, timestamp, msg),
        }
    }

    /// Decode a control message, returning `None` for unknown types.
    ///
    /// # Errors
    ///
    /// Returns an error if a known type carries an invalid payload.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, ProtocolError> {
        let message = match envelope.message_type.as_str() {
            message_type::COMMAND => Self::Command(envelope.payload_as()?),
            message_type::PING => Self::Ping,
            message_type::SHUTDOWN => Self::Shutdown(envelope.payload_as()?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

// =============================================================================
// Agent → control plane
// =============================================================================

/// Body of a `heartbeat` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Agent-reported status.
    #[serde(default = "HeartbeatPayload::default_status")]
    pub status: AgentStatus,
    /// Number of sessions the agent is currently running.
    #[serde(default)]
    pub active_sessions: u32,
    /// Current resource limits, platform-specific.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<serde_json::Value>,
}

impl HeartbeatPayload {
    const fn default_status() -> AgentStatus {
        AgentStatus::Online
    }
}

/// Body of an `ack` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// The acknowledged command.
    pub command_id: CommandId,
}

/// Result data attached to a completed command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandResult {
    /// Streaming endpoint of the session, when the action produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Human-readable outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Platform-specific extras (pod name, container id, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

/// Body of a `complete` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePayload {
    /// The completed command.
    pub command_id: CommandId,
    /// Result data.
    #[serde(default)]
    pub result: CommandResult,
}

/// Body of a `failed` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPayload {
    /// The failed command.
    pub command_id: CommandId,
    /// Agent-side error text.
    pub error: String,
}

/// Body of a `status` message: a session state change the agent observed
/// independently of any command (e.g. the session became VNC-ready).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    /// The session whose state changed.
    pub session_id: SessionId,
    /// The new state.
    pub state: SessionState,
    /// Optional detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Messages agents send to the control plane.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    /// Periodic liveness and status.
    Heartbeat(HeartbeatPayload),
    /// Command received, executing.
    Ack(AckPayload),
    /// Command succeeded.
    Complete(CompletePayload),
    /// Command failed.
    Failed(FailedPayload),
    /// Session state report.
    Status(StatusPayload),
}

impl AgentMessage {
    /// The envelope type for this message.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Heartbeat(_) => message_type::HEARTBEAT,
            Self::Ack(_) => message_type::ACK,
            Self::Complete(_) => message_type::COMPLETE,
            Self::Failed(_) => message_type::FAILED,
            Self::Status(_) => message_type::STATUS,
        }
    }

    /// Wrap the message in an envelope stamped with `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_envelope(&self, timestamp: DateTime<Utc>) -> Result<Envelope, ProtocolError> {
        let ty = self.message_type();
        match self {
            Self::Heartbeat(p) => Envelope::new(ty, timestamp, p),
            Self::Ack(p) => Envelope::new(ty, timestamp, p),
            Self::Complete(p) => Envelope::new(ty, timestamp, p),
            Self::Failed(p) => Envelope::new(ty, timestamp, p),
            Self::Status(p) => Envelope::new(ty, timestamp, p),
        }
    }

    /// Decode an agent message, returning `None` for unknown types.
    ///
    /// # Errors
    ///
    /// Returns an error if a known type carries an invalid payload.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, ProtocolError> {
        let message = match envelope.message_type.as_str() {
            message_type::HEARTBEAT => Self::Heartbeat(envelope.payload_as()?),
            message_type::ACK => Self::Ack(envelope.payload_as()?),
            message_type::COMPLETE => Self::Complete(envelope.payload_as()?),
            message_type::FAILED => Self::Failed(envelope.payload_as()?),
            message_type::STATUS => Self::Status(envelope.payload_as()?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    /// The command this message refers to, if any.
    #[must_use]
    pub const fn command_id(&self) -> Option<&CommandId> {
        match self {
            Self::Ack(p) => Some(&p.command_id),
            Self::Complete(p) => Some(&p.command_id),
            Self::Failed(p) => Some(&p.command_id),
            Self::Heartbeat(_) | Self::Status(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_envelope_shape() {
        let command_id = CommandId::generate();
        let msg = ControlMessage::Command(CommandMessage {
            command_id,
            session_id: Some(SessionId::new("sess-1").unwrap()),
            payload: CommandPayload::StopSession(StopOptions::default()),
        });

        let envelope = msg.to_envelope(Utc::now()).unwrap();
        assert_eq!(envelope.message_type, "command");
        assert_eq!(envelope.payload["action"], "stop_session");
        assert_eq!(envelope.payload["command_id"], command_id.to_string());
        assert_eq!(envelope.payload["session_id"], "sess-1");
        assert_eq!(envelope.payload["payload"]["delete_persistent_data"], false);
    }

    #[test]
    fn command_envelope_decodes_back() {
        let msg = ControlMessage::Command(CommandMessage {
            command_id: CommandId::generate(),
            session_id: Some(SessionId::new("sess-9").unwrap()),
            payload: CommandPayload::StartSession(SessionSpec::for_template("firefox")),
        });
        let text = msg.to_envelope(Utc::now()).unwrap().encode().unwrap();

        let envelope = Envelope::decode(&text).unwrap();
        let decoded = ControlMessage::from_envelope(&envelope).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn agent_messages_decode_from_agent_json() {
        let command_id = CommandId::generate();
        let text = json!({
            "type": "complete",
            "timestamp": "2025-01-01T00:00:00Z",
            "payload": {
                "command_id": command_id.to_string(),
                "result": { "endpoint": "10.0.0.4:5900" }
            }
        })
        .to_string();

        let envelope = Envelope::decode(&text).unwrap();
        match AgentMessage::from_envelope(&envelope).unwrap() {
            Some(AgentMessage::Complete(p)) => {
                assert_eq!(p.command_id, command_id);
                assert_eq!(p.result.endpoint.as_deref(), Some("10.0.0.4:5900"));
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_defaults_apply() {
        let envelope = Envelope::decode(r#"{"type":"heartbeat"}"#).unwrap();
        let Some(AgentMessage::Heartbeat(hb)) = AgentMessage::from_envelope(&envelope).unwrap()
        else {
            panic!("expected heartbeat");
        };
        assert_eq!(hb.status, AgentStatus::Online);
        assert_eq!(hb.active_sessions, 0);
        assert!(hb.capacity.is_none());
    }

    #[test]
    fn unknown_type_is_ignored() {
        let envelope = Envelope::decode(r#"{"type":"telemetry","payload":{"x":1}}"#).unwrap();
        assert!(AgentMessage::from_envelope(&envelope).unwrap().is_none());
        assert!(ControlMessage::from_envelope(&envelope).unwrap().is_none());
    }

    #[test]
    fn bad_payload_is_an_error() {
        let envelope = Envelope::decode(r#"{"type":"ack","payload":{"command_id":"nope"}}"#)
            .unwrap();
        assert!(matches!(
            AgentMessage::from_envelope(&envelope),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn malformed_frame_is_an_error() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn status_message_carries_session_state() {
        let msg = AgentMessage::Status(StatusPayload {
            session_id: SessionId::new("sess-3").unwrap(),
            state: SessionState::Running,
            message: Some("vnc ready".into()),
        });
        let envelope = msg.to_envelope(Utc::now()).unwrap();
        assert_eq!(envelope.payload["state"], "running");
        assert_eq!(AgentMessage::from_envelope(&envelope).unwrap(), Some(msg));
    }
}
