//! Session reconciler.
//!
//! A single background loop that keeps recorded session state converging
//! with what agents actually do. Each tick runs two independent scans:
//!
//! - **Terminating-stuck**: sessions in `terminating` past the stuck
//!   threshold. A connected agent gets a fresh `stop_session` (never
//!   deleting persistent data on this path). A disconnected agent past the
//!   force-cleanup threshold gets its session force-terminated.
//! - **Pending-stuck**: sessions in `pending` past the stuck threshold. A
//!   connected agent gets the original `start_session` again when the spec
//!   source can supply it. A disconnected agent past the force-cleanup
//!   threshold gets its session force-failed.
//!
//! Anything else waits for the next tick. The reconciler only ever moves
//! sessions toward `terminated` or `failed`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use streamspace_core::{
    AgentId, CommandAction, CommandId, CommandPayload, CommandStatus, SessionId, SessionState,
    StopOptions,
};
use streamspace_store::{Command, Session, Store};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControlConfig;
use crate::dispatcher::CommandDispatcher;
use crate::error::Result;
use crate::hub::ConnectionHub;
use crate::notifier::{EventSource, SessionEvent, SessionNotifier};
use crate::spec_source::SessionSpecSource;

/// Reason recorded on sessions resolved without agent confirmation.
pub const AGENT_UNAVAILABLE_REASON: &str = "agent_unavailable";

/// What the reconciler did with one stuck session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// A fresh command was persisted and a dispatch attempted.
    RetryDispatched {
        /// The stuck session.
        session_id: SessionId,
        /// The new command.
        command_id: CommandId,
        /// `stop_session` or `start_session`.
        action: CommandAction,
        /// Whether the command reached the agent channel. When false it
        /// stays pending for the next attempt.
        dispatched: bool,
    },
    /// A pending session's agent is connected but its spec is unavailable,
    /// so the start could not be retried.
    RetrySkipped {
        /// The stuck session.
        session_id: SessionId,
    },
    /// The session was resolved in the store without agent confirmation.
    ForcedResolution {
        /// The resolved session.
        session_id: SessionId,
        /// The unreachable agent.
        agent_id: AgentId,
        /// `terminated` or `failed`.
        state: SessionState,
    },
    /// Agent disconnected, still within the force-cleanup threshold.
    Waiting {
        /// The stuck session.
        session_id: SessionId,
        /// The disconnected agent.
        agent_id: AgentId,
    },
    /// The session left its stuck state before it could be forced.
    Superseded {
        /// The session.
        session_id: SessionId,
    },
}

/// Summary of one reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Per-session outcomes, terminating scan first.
    pub actions: Vec<ReconcileAction>,
    /// Sessions whose handling failed and will be retried next tick.
    pub errors: usize,
}

impl ReconcileReport {
    /// Number of sessions that got a retry command.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, ReconcileAction::RetryDispatched { .. }))
            .count()
    }

    /// Number of forced resolutions.
    #[must_use]
    pub fn forced(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, ReconcileAction::ForcedResolution { .. }))
            .count()
    }

    /// Returns true if nothing was stuck.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.errors == 0
    }
}

/// Counts of stuck sessions, using the same predicates as the scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    /// Sessions in `terminating` past the stuck threshold.
    pub stuck_terminating: usize,
    /// Sessions in `pending` past the stuck threshold.
    pub stuck_pending: usize,
}

/// The reconciliation loop.
pub struct SessionReconciler<S: Store> {
    store: Arc<S>,
    hub: Arc<ConnectionHub<S>>,
    dispatcher: Arc<CommandDispatcher<S>>,
    notifier: Arc<dyn SessionNotifier>,
    specs: Arc<dyn SessionSpecSource>,
    interval: Duration,
    stuck_threshold: chrono::Duration,
    force_cleanup_threshold: chrono::Duration,
}

impl<S: Store> SessionReconciler<S> {
    /// Create a reconciler with intervals and thresholds from `config`.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        hub: Arc<ConnectionHub<S>>,
        dispatcher: Arc<CommandDispatcher<S>>,
        notifier: Arc<dyn SessionNotifier>,
        specs: Arc<dyn SessionSpecSource>,
        config: &ControlConfig,
    ) -> Self {
        Self {
            store,
            hub,
            dispatcher,
            notifier,
            specs,
            interval: config.reconcile_interval(),
            stuck_threshold: config.stuck_threshold(),
            force_cleanup_threshold: config.force_cleanup_threshold(),
        }
    }

    /// Run until `cancel` fires.
    ///
    /// The first tick runs immediately. Cancellation is checked before each
    /// tick; an in-flight tick is allowed to finish. A failed tick is logged
    /// and the loop keeps going.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            stuck_threshold_secs = self.stuck_threshold.num_seconds(),
            force_cleanup_threshold_secs = self.force_cleanup_threshold.num_seconds(),
            "Session reconciler started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.reconcile_once(Utc::now()).await {
                Ok(report) if report.is_empty() => debug!("Reconciliation tick found nothing stuck"),
                Ok(report) => info!(
                    sessions = report.actions.len(),
                    retried = report.retried(),
                    forced = report.forced(),
                    errors = report.errors,
                    "Reconciliation tick finished"
                ),
                Err(e) => error!(error = %e, "Reconciliation tick aborted"),
            }
        }

        info!("Session reconciler stopped");
    }

    /// Run both scans once, as of `now`.
    ///
    /// Per-session failures are logged, counted in the report and do not
    /// stop the scan.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Persistence` if the stuck sessions cannot be
    /// listed at all; the tick is aborted.
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let cutoff = now - self.stuck_threshold;
        let terminating = self
            .store
            .list_sessions_by_state(SessionState::Terminating, cutoff)?;
        let pending = self
            .store
            .list_sessions_by_state(SessionState::Pending, cutoff)?;

        let mut report = ReconcileReport::default();

        for session in &terminating {
            match self.reconcile_terminating(session, now).await {
                Ok(action) => report.actions.push(action),
                Err(e) => {
                    warn!(session_id = %session.session_id, error = %e, "Failed to reconcile terminating session");
                    report.errors += 1;
                }
            }
        }

        for session in &pending {
            match self.reconcile_pending(session, now).await {
                Ok(action) => report.actions.push(action),
                Err(e) => {
                    warn!(session_id = %session.session_id, error = %e, "Failed to reconcile pending session");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Count stuck sessions as of `now`.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Persistence` if the sessions cannot be listed.
    pub fn get_stats(&self, now: DateTime<Utc>) -> Result<ReconcileStats> {
        let cutoff = now - self.stuck_threshold;
        Ok(ReconcileStats {
            stuck_terminating: self
                .store
                .list_sessions_by_state(SessionState::Terminating, cutoff)?
                .len(),
            stuck_pending: self
                .store
                .list_sessions_by_state(SessionState::Pending, cutoff)?
                .len(),
        })
    }

    // =========================================================================
    // Scans
    // =========================================================================

    async fn reconcile_terminating(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> Result<ReconcileAction> {
        if self.hub.is_agent_connected(&session.agent_id) {
            // Retries never delete persistent data.
            let command = self.store.create_command(
                &session.agent_id,
                Some(&session.session_id),
                CommandPayload::StopSession(StopOptions {
                    delete_persistent_data: false,
                }),
            )?;
            info!(
                session_id = %session.session_id,
                agent_id = %session.agent_id,
                command_id = %command.command_id,
                "Retrying stop for stuck terminating session"
            );
            let dispatched = self.dispatch_retry(&command).await;
            return Ok(ReconcileAction::RetryDispatched {
                session_id: session.session_id.clone(),
                command_id: command.command_id,
                action: command.action,
                dispatched,
            });
        }

        if now - session.updated_at > self.force_cleanup_threshold {
            return self.force_resolve(session, SessionState::Terminated, now);
        }

        Ok(self.wait(session))
    }

    async fn reconcile_pending(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> Result<ReconcileAction> {
        if self.hub.is_agent_connected(&session.agent_id) {
            let Some(spec) = self.specs.session_spec(&session.session_id).await? else {
                info!(
                    session_id = %session.session_id,
                    agent_id = %session.agent_id,
                    "Pending session is stuck but its spec is unavailable, start not retried"
                );
                return Ok(ReconcileAction::RetrySkipped {
                    session_id: session.session_id.clone(),
                });
            };

            let command = self.store.create_command(
                &session.agent_id,
                Some(&session.session_id),
                CommandPayload::StartSession(spec),
            )?;
            info!(
                session_id = %session.session_id,
                agent_id = %session.agent_id,
                command_id = %command.command_id,
                "Retrying start for stuck pending session"
            );
            let dispatched = self.dispatch_retry(&command).await;
            return Ok(ReconcileAction::RetryDispatched {
                session_id: session.session_id.clone(),
                command_id: command.command_id,
                action: command.action,
                dispatched,
            });
        }

        if now - session.updated_at > self.force_cleanup_threshold {
            return self.force_resolve(session, SessionState::Failed, now);
        }

        Ok(self.wait(session))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn dispatch_retry(&self, command: &Command) -> bool {
        match self.dispatcher.dispatch_command(command).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    command_id = %command.command_id,
                    agent_id = %command.agent_id,
                    error = %e,
                    "Retry dispatch failed, command left pending"
                );
                false
            }
        }
    }

    fn force_resolve(
        &self,
        session: &Session,
        state: SessionState,
        now: DateTime<Utc>,
    ) -> Result<ReconcileAction> {
        let applied = self.store.transition_session(
            &session.session_id,
            &[session.state],
            state,
            Some(AGENT_UNAVAILABLE_REASON),
            now,
        )?;
        if !applied {
            debug!(session_id = %session.session_id, "Session moved on before forced resolution");
            return Ok(ReconcileAction::Superseded {
                session_id: session.session_id.clone(),
            });
        }

        self.specs.forget(&session.session_id);
        let cancelled = self.cancel_outstanding(&session.session_id)?;

        warn!(
            session_id = %session.session_id,
            agent_id = %session.agent_id,
            from = %session.state,
            to = %state,
            cancelled_commands = cancelled,
            stuck_secs = (now - session.updated_at).num_seconds(),
            "Session force-resolved without agent confirmation; remote resources may still exist \
             and must be cleaned up manually on the agent's platform"
        );

        self.notifier.notify(SessionEvent {
            session_id: session.session_id.clone(),
            agent_id: session.agent_id.clone(),
            state,
            reason: Some(AGENT_UNAVAILABLE_REASON.to_string()),
            source: EventSource::Reconciler,
            at: now,
        });

        Ok(ReconcileAction::ForcedResolution {
            session_id: session.session_id.clone(),
            agent_id: session.agent_id.clone(),
            state,
        })
    }

    /// Fail the session's still-pending commands so a reconnecting agent
    /// never receives them.
    fn cancel_outstanding(&self, session_id: &SessionId) -> Result<usize> {
        let mut cancelled = 0;
        for command in self.store.list_commands_by_session(session_id)? {
            if command.status == CommandStatus::Pending
                && self
                    .store
                    .cancel_pending_command(&command.command_id, AGENT_UNAVAILABLE_REASON)?
            {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    fn wait(&self, session: &Session) -> ReconcileAction {
        info!(
            session_id = %session.session_id,
            agent_id = %session.agent_id,
            state = %session.state,
            "Agent disconnected, waiting before forcing stuck session"
        );
        debug!(
            force_cleanup_threshold_secs = self.force_cleanup_threshold.num_seconds(),
            "Force-cleanup threshold not reached"
        );
        ReconcileAction::Waiting {
            session_id: session.session_id.clone(),
            agent_id: session.agent_id.clone(),
        }
    }
}
