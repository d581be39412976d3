//! Inbound agent message routing.
//!
//! Every frame an agent sends lands here. Command reports advance the
//! command ledger and, once applied, the session they target; `status`
//! reports move sessions directly. Anything the router cannot apply is a
//! protocol anomaly: logged, dropped, and the connection is kept.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use streamspace_core::protocol::{AckPayload, CompletePayload, FailedPayload, StatusPayload};
use streamspace_core::{AgentId, AgentMessage, CommandAction, Envelope, SessionId, SessionState};
use streamspace_store::{Command, CommandTransition, Store};
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};
use crate::hub::ConnectionHub;
use crate::lifecycle;
use crate::notifier::{EventSource, SessionEvent, SessionNotifier};
use crate::spec_source::SessionSpecSource;

/// Reason recorded when an agent confirms a stop nobody else explained.
pub const USER_REQUEST_REASON: &str = "user_request";

/// Applies agent messages to the store.
pub struct MessageRouter<S: Store> {
    store: Arc<S>,
    hub: Arc<ConnectionHub<S>>,
    notifier: Arc<dyn SessionNotifier>,
    specs: Arc<dyn SessionSpecSource>,
}

impl<S: Store> MessageRouter<S> {
    /// Create a router.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        hub: Arc<ConnectionHub<S>>,
        notifier: Arc<dyn SessionNotifier>,
        specs: Arc<dyn SessionSpecSource>,
    ) -> Self {
        Self {
            store,
            hub,
            notifier,
            specs,
        }
    }

    /// Decode a raw text frame and route it.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::ProtocolAnomaly` for undecodable frames, plus
    /// anything [`Self::handle`] returns.
    pub fn handle_text(&self, agent_id: &AgentId, text: &str) -> Result<()> {
        match Envelope::decode(text) {
            Ok(envelope) => self.handle(agent_id, &envelope),
            Err(e) => Err(self.anomaly(agent_id, e.to_string())),
        }
    }

    /// Route one decoded envelope from `agent_id`.
    ///
    /// # Errors
    ///
    /// - `ControlError::ProtocolAnomaly` for unknown types, bad payloads,
    ///   unknown commands and commands owned by another agent.
    /// - `ControlError::InvalidSessionState` for `status` reports the state
    ///   machine forbids.
    /// - `ControlError::Persistence` on store failures.
    pub fn handle(&self, agent_id: &AgentId, envelope: &Envelope) -> Result<()> {
        let message = match AgentMessage::from_envelope(envelope) {
            Ok(Some(message)) => message,
            Ok(None) => {
                return Err(self.anomaly(
                    agent_id,
                    format!("unknown message type '{}'", envelope.message_type),
                ));
            }
            Err(e) => return Err(self.anomaly(agent_id, e.to_string())),
        };

        let now = Utc::now();
        match message {
            AgentMessage::Heartbeat(heartbeat) => {
                self.hub.record_heartbeat(agent_id, &heartbeat, now)
            }
            AgentMessage::Ack(ack) => self.handle_ack(agent_id, &ack),
            AgentMessage::Complete(complete) => self.handle_complete(agent_id, &complete, now),
            AgentMessage::Failed(failed) => self.handle_failed(agent_id, &failed, now),
            AgentMessage::Status(status) => self.handle_status(agent_id, &status, now),
        }
    }

    // =========================================================================
    // Command reports
    // =========================================================================

    fn handle_ack(&self, agent_id: &AgentId, ack: &AckPayload) -> Result<()> {
        self.owned_command(agent_id, &ack.command_id)?;
        let transition = self.store.mark_acknowledged(&ack.command_id)?;
        debug!(
            agent_id = %agent_id,
            command_id = %ack.command_id,
            ?transition,
            "Command acknowledged"
        );
        Ok(())
    }

    fn handle_complete(
        &self,
        agent_id: &AgentId,
        complete: &CompletePayload,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let command = self.owned_command(agent_id, &complete.command_id)?;
        let transition = self
            .store
            .mark_completed(&complete.command_id, &complete.result)?;
        if transition == CommandTransition::AppliedOutOfOrder {
            warn!(
                agent_id = %agent_id,
                command_id = %complete.command_id,
                "Completion received without prior ack"
            );
        }
        if !transition.is_applied() {
            return Ok(());
        }

        info!(
            agent_id = %agent_id,
            command_id = %command.command_id,
            action = %command.action,
            "Command completed"
        );

        let Some(session_id) = command.session_id.as_ref() else {
            return Ok(());
        };
        let target = match command.action {
            CommandAction::StartSession | CommandAction::WakeSession => SessionState::Running,
            CommandAction::HibernateSession => SessionState::Hibernated,
            CommandAction::StopSession => SessionState::Terminated,
        };
        self.apply_command_effect(&command, session_id, target, now)
    }

    fn handle_failed(
        &self,
        agent_id: &AgentId,
        failed: &FailedPayload,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let command = self.owned_command(agent_id, &failed.command_id)?;
        let transition = self.store.mark_failed(&failed.command_id, &failed.error)?;
        if !transition.is_applied() {
            return Ok(());
        }

        warn!(
            agent_id = %agent_id,
            command_id = %command.command_id,
            action = %command.action,
            error = %failed.error,
            "Agent reported command failure"
        );

        // Only a failed start has a definite session outcome. Everything else
        // is left for the reconciler.
        match (command.action, command.session_id.as_ref()) {
            (CommandAction::StartSession, Some(session_id)) => {
                self.apply_command_effect(&command, session_id, SessionState::Failed, now)
            }
            _ => Ok(()),
        }
    }

    fn apply_command_effect(
        &self,
        command: &Command,
        session_id: &SessionId,
        target: SessionState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(session) = self.store.get_session(session_id)? else {
            warn!(
                session_id = %session_id,
                command_id = %command.command_id,
                "Command finished for unknown session"
            );
            return Ok(());
        };

        let reason = match target {
            SessionState::Terminated if session.termination_reason.is_none() => {
                Some(USER_REQUEST_REASON)
            }
            _ => None,
        };

        let applied = self.store.transition_session(
            session_id,
            &lifecycle::sources_for(target),
            target,
            reason,
            now,
        )?;
        if !applied {
            debug!(
                session_id = %session_id,
                current = %session.state,
                target = %target,
                "Session already moved on, command effect skipped"
            );
            return Ok(());
        }

        info!(
            session_id = %session_id,
            from = %session.state,
            to = %target,
            "Session state updated from command result"
        );
        if lifecycle::is_terminal(target) {
            self.specs.forget(session_id);
        }
        self.notifier.notify(SessionEvent {
            session_id: session_id.clone(),
            agent_id: session.agent_id,
            state: target,
            reason: reason
                .map(str::to_string)
                .or(session.termination_reason),
            source: EventSource::Agent,
            at: now,
        });
        Ok(())
    }

    // =========================================================================
    // Session reports
    // =========================================================================

    fn handle_status(
        &self,
        agent_id: &AgentId,
        status: &StatusPayload,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(session) = self.store.get_session(&status.session_id)? else {
            warn!(
                agent_id = %agent_id,
                session_id = %status.session_id,
                "Status report for unknown session"
            );
            return Ok(());
        };
        if session.agent_id != *agent_id {
            return Err(self.anomaly(
                agent_id,
                format!(
                    "status for session {} owned by agent {}",
                    status.session_id, session.agent_id
                ),
            ));
        }
        if session.state == status.state {
            debug!(
                session_id = %status.session_id,
                state = %status.state,
                "Status report matches current state"
            );
            return Ok(());
        }

        lifecycle::validate_transition(&status.session_id, session.state, status.state)?;
        let applied = self.store.transition_session(
            &status.session_id,
            &[session.state],
            status.state,
            None,
            now,
        )?;
        if !applied {
            debug!(session_id = %status.session_id, "Session changed concurrently, status dropped");
            return Ok(());
        }

        info!(
            agent_id = %agent_id,
            session_id = %status.session_id,
            from = %session.state,
            to = %status.state,
            message = status.message.as_deref().unwrap_or(""),
            "Session state reported by agent"
        );
        if lifecycle::is_terminal(status.state) {
            self.specs.forget(&status.session_id);
        }
        self.notifier.notify(SessionEvent {
            session_id: status.session_id.clone(),
            agent_id: agent_id.clone(),
            state: status.state,
            reason: None,
            source: EventSource::Agent,
            at: now,
        });
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn owned_command(
        &self,
        agent_id: &AgentId,
        command_id: &streamspace_core::CommandId,
    ) -> Result<Command> {
        let Some(command) = self.store.get_command(command_id)? else {
            return Err(self.anomaly(agent_id, format!("unknown command {command_id}")));
        };
        if command.agent_id != *agent_id {
            return Err(self.anomaly(
                agent_id,
                format!("command {command_id} belongs to agent {}", command.agent_id),
            ));
        }
        Ok(command)
    }

    #[allow(clippy::unused_self)]
    fn anomaly(&self, agent_id: &AgentId, reason: String) -> ControlError {
        warn!(agent_id = %agent_id, reason = %reason, "Protocol anomaly, message dropped");
        ControlError::ProtocolAnomaly {
            agent_id: agent_id.clone(),
            reason,
        }
    }
}
