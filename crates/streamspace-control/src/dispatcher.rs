//! Command dispatcher.
//!
//! Bridges persisted commands to agent channels. The dispatcher never
//! creates commands: a command must already be `Pending` in the store, so a
//! crash between persistence and transmission leaves a record the
//! reconciler (or the agent's next registration) picks up.
//!
//! Delivery is at-most-once per dispatch attempt and at-least-once overall.
//! A dispatched command whose ack is lost is indistinguishable from one that
//! never landed.

use std::sync::Arc;

use streamspace_core::{AgentId, CommandAction, CommandMessage, CommandStatus, ControlMessage};
use streamspace_store::{Command, Store};
use tracing::{debug, warn};

use crate::error::{ControlError, Result};
use crate::hub::ConnectionHub;
use crate::lifecycle;

/// Pushes persisted commands onto agent channels.
pub struct CommandDispatcher<S: Store> {
    store: Arc<S>,
    hub: Arc<ConnectionHub<S>>,
}

impl<S: Store> CommandDispatcher<S> {
    /// Create a dispatcher over a store and hub.
    #[must_use]
    pub const fn new(store: Arc<S>, hub: Arc<ConnectionHub<S>>) -> Self {
        Self { store, hub }
    }

    /// Transmit a persisted command to its agent and mark it `Sent`.
    ///
    /// Returns promptly: the send is bounded by the hub's dispatch timeout and
    /// acks arrive later as separate agent messages. Commands no longer
    /// `Pending` are not re-sent; that is a successful no-op.
    ///
    /// # Errors
    ///
    /// - `ControlError::AgentUnavailable` if the agent has no live channel.
    ///   The command stays `Pending`; it is never marked failed here.
    /// - `ControlError::ChannelSaturated` if the send timed out.
    /// - `ControlError::SessionClosed` if the command would revive a session
    ///   that is already terminal. The command is failed in the store.
    /// - `ControlError::CommandNotFound` if the command was never persisted.
    /// - `ControlError::Persistence` on store failures.
    pub async fn dispatch_command(&self, command: &Command) -> Result<()> {
        let current = self
            .store
            .get_command(&command.command_id)?
            .ok_or(ControlError::CommandNotFound(command.command_id))?;

        if current.status != CommandStatus::Pending {
            debug!(
                command_id = %current.command_id,
                status = %current.status,
                "Command already past pending, not re-sending"
            );
            return Ok(());
        }

        self.refuse_for_closed_session(&current)?;

        if !self.hub.is_agent_connected(&current.agent_id) {
            return Err(ControlError::AgentUnavailable(current.agent_id));
        }

        let message = ControlMessage::Command(CommandMessage {
            command_id: current.command_id,
            session_id: current.session_id.clone(),
            payload: current.payload.clone(),
        });
        self.hub.send(&current.agent_id, message).await?;
        self.store.mark_sent(&current.command_id)?;

        debug!(
            command_id = %current.command_id,
            agent_id = %current.agent_id,
            action = %current.action,
            "Command dispatched"
        );
        Ok(())
    }

    /// Fail and refuse a command that would revive a session already
    /// `terminated` or `failed`. Stops still go out, since remote resources
    /// of a force-resolved session may linger.
    fn refuse_for_closed_session(&self, command: &Command) -> Result<()> {
        if command.action == CommandAction::StopSession {
            return Ok(());
        }
        let Some(session_id) = command.session_id.as_ref() else {
            return Ok(());
        };
        let Some(session) = self.store.get_session(session_id)? else {
            return Ok(());
        };
        if !lifecycle::is_terminal(session.state) {
            return Ok(());
        }

        let reason = format!("session already {}", session.state);
        self.store
            .cancel_pending_command(&command.command_id, &reason)?;
        warn!(
            command_id = %command.command_id,
            session_id = %session_id,
            action = %command.action,
            state = %session.state,
            "Refusing command for closed session"
        );
        Err(ControlError::SessionClosed {
            session_id: session_id.clone(),
            state: session.state,
        })
    }

    /// Re-dispatch every `Pending` command for an agent, oldest first.
    ///
    /// Called when an agent (re)registers. Stops at the first transport
    /// failure, since later commands would hit the same channel. Returns the
    /// number of commands sent.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Persistence` if the pending commands cannot be
    /// listed.
    pub async fn dispatch_pending_for_agent(&self, agent_id: &AgentId) -> Result<usize> {
        let pending = self.store.list_pending_commands_for_agent(agent_id)?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut sent = 0;
        for command in &pending {
            match self.dispatch_command(command).await {
                Ok(()) => sent += 1,
                Err(e @ (ControlError::AgentUnavailable(_) | ControlError::ChannelSaturated(_))) => {
                    warn!(
                        agent_id = %agent_id,
                        command_id = %command.command_id,
                        error = %e,
                        "Stopped re-dispatching pending commands"
                    );
                    break;
                }
                Err(e) => warn!(
                    agent_id = %agent_id,
                    command_id = %command.command_id,
                    error = %e,
                    "Failed to re-dispatch pending command"
                ),
            }
        }

        debug!(
            agent_id = %agent_id,
            sent,
            pending = pending.len(),
            "Re-dispatched pending commands"
        );
        Ok(sent)
    }
}
