//! Session change notifications.
//!
//! Every session state change the control plane applies (agent reports,
//! user requests, reconciler forced resolutions) is published through a
//! [`SessionNotifier`], so UI fan-out never shows stale state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use streamspace_core::{AgentId, SessionId, SessionState};
use tokio::sync::broadcast;
use tracing::trace;

/// Who caused a session change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// An agent report (`complete`, `failed`, `status`).
    Agent,
    /// A user-facing request through the control plane service.
    ControlPlane,
    /// A reconciler forced resolution.
    Reconciler,
}

/// A session state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEvent {
    /// The session that changed.
    pub session_id: SessionId,
    /// Agent hosting the session.
    pub agent_id: AgentId,
    /// The new state.
    pub state: SessionState,
    /// Termination reason, when one was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Who caused the change.
    pub source: EventSource,
    /// When the change was applied.
    pub at: DateTime<Utc>,
}

/// Sink for session change events.
pub trait SessionNotifier: Send + Sync {
    /// Publish an event. Must not block.
    fn notify(&self, event: SessionEvent);
}

/// Fan-out notifier backed by a tokio broadcast channel.
///
/// Slow subscribers lag and lose old events rather than holding back
/// publishers.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<SessionEvent>,
}

impl BroadcastNotifier {
    /// Create a notifier buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SessionNotifier for BroadcastNotifier {
    fn notify(&self, event: SessionEvent) {
        if self.sender.send(event).is_err() {
            trace!("No session event subscribers");
        }
    }
}

/// Notifier that discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl SessionNotifier for NoopNotifier {
    fn notify(&self, _event: SessionEvent) {}
}
