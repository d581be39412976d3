//! Control plane service implementation.
//!
//! This module provides the `ControlPlane` trait and `ControlPlaneService`
//! implementation that wires the connection hub, dispatcher, router and
//! reconciler together and exposes session-facing operations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use streamspace_core::{
    AgentId, CommandPayload, ConnectionId, ControlMessage, SessionId, SessionSpec, SessionState,
    StopOptions,
};
use streamspace_store::{Command, Session, Store};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControlConfig;
use crate::dispatcher::CommandDispatcher;
use crate::error::{ControlError, Result};
use crate::hub::{AgentRegistration, ConnectionHub};
use crate::lifecycle;
use crate::notifier::{EventSource, NoopNotifier, SessionEvent, SessionNotifier};
use crate::reconciler::{ReconcileStats, SessionReconciler};
use crate::router::MessageRouter;
use crate::spec_source::{InMemorySpecSource, SessionSpecSource};

/// A command persisted on behalf of a session request.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCommand {
    /// The persisted command.
    pub command: Command,
    /// Whether it reached the agent channel. When false it stays pending
    /// and is re-sent on reconnect or by the reconciler.
    pub dispatched: bool,
}

/// Trait defining the session-facing control plane operations.
///
/// Every operation persists first, then dispatches. An unreachable agent is
/// not an error for the caller.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    // =========================================================================
    // Session Operations
    // =========================================================================

    /// Create a session in `pending` on `agent_id` and issue `start_session`.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvalidSessionState` if a live session with the
    /// same id exists.
    async fn start_session(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        spec: SessionSpec,
    ) -> Result<IssuedCommand>;

    /// Move a session to `terminating` and issue `stop_session`, deleting
    /// persistent data.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::SessionNotFound` or
    /// `ControlError::InvalidSessionState`.
    async fn stop_session(&self, session_id: &SessionId) -> Result<IssuedCommand>;

    /// Issue `hibernate_session` for a running session.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvalidSessionState` unless the session is
    /// running.
    async fn hibernate_session(&self, session_id: &SessionId) -> Result<IssuedCommand>;

    /// Issue `wake_session` for a hibernated session.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvalidSessionState` unless the session is
    /// hibernated.
    async fn wake_session(&self, session_id: &SessionId) -> Result<IssuedCommand>;

    /// Get a session by ID.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::SessionNotFound` if the session doesn't exist.
    async fn get_session(&self, session_id: &SessionId) -> Result<Session>;

    /// List every command issued for a session, oldest first.
    async fn list_session_commands(&self, session_id: &SessionId) -> Result<Vec<Command>>;

    // =========================================================================
    // Agent Connections
    // =========================================================================

    /// Register an agent connection and flush its pending commands.
    async fn connect_agent(
        &self,
        registration: AgentRegistration,
        sender: mpsc::Sender<ControlMessage>,
    ) -> Result<ConnectionId>;

    /// Release an agent connection if it is still the current one.
    async fn disconnect_agent(
        &self,
        agent_id: &AgentId,
        connection_id: &ConnectionId,
    ) -> Result<bool>;
}

/// The main control plane service implementation.
pub struct ControlPlaneService<S: Store> {
    store: Arc<S>,
    config: ControlConfig,
    hub: Arc<ConnectionHub<S>>,
    dispatcher: Arc<CommandDispatcher<S>>,
    router: Arc<MessageRouter<S>>,
    reconciler: Arc<SessionReconciler<S>>,
    specs: Arc<InMemorySpecSource>,
    notifier: Arc<dyn SessionNotifier>,
}

impl<S: Store> ControlPlaneService<S> {
    /// Create a new control plane service.
    #[must_use]
    pub fn new(store: Arc<S>, config: ControlConfig, notifier: Arc<dyn SessionNotifier>) -> Self {
        let hub = Arc::new(ConnectionHub::new(
            Arc::clone(&store),
            config.dispatch_timeout(),
            config.agent_channel_capacity,
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(Arc::clone(&store), Arc::clone(&hub)));
        let specs = Arc::new(InMemorySpecSource::new());
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&store),
            Arc::clone(&hub),
            Arc::clone(&notifier),
            Arc::clone(&specs) as Arc<dyn SessionSpecSource>,
        ));
        let reconciler = Arc::new(SessionReconciler::new(
            Arc::clone(&store),
            Arc::clone(&hub),
            Arc::clone(&dispatcher),
            Arc::clone(&notifier),
            Arc::clone(&specs) as Arc<dyn SessionSpecSource>,
            &config,
        ));

        Self {
            store,
            config,
            hub,
            dispatcher,
            router,
            reconciler,
            specs,
            notifier,
        }
    }

    /// Create with default configuration and no notifications.
    #[must_use]
    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::new(store, ControlConfig::default(), Arc::new(NoopNotifier))
    }

    /// Get a reference to the configuration.
    #[must_use]
    pub const fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Get a reference to the store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The connection hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<ConnectionHub<S>> {
        &self.hub
    }

    /// The command dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<CommandDispatcher<S>> {
        &self.dispatcher
    }

    /// The inbound message router.
    #[must_use]
    pub fn router(&self) -> &Arc<MessageRouter<S>> {
        &self.router
    }

    /// The session reconciler.
    #[must_use]
    pub fn reconciler(&self) -> &Arc<SessionReconciler<S>> {
        &self.reconciler
    }

    /// Specs remembered for sessions still able to need a start retry.
    #[must_use]
    pub fn specs(&self) -> &Arc<InMemorySpecSource> {
        &self.specs
    }

    /// Stuck-session counts as of now.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Persistence` if sessions cannot be listed.
    pub fn reconciler_stats(&self) -> Result<ReconcileStats> {
        self.reconciler.get_stats(Utc::now())
    }

    /// Release agent connections whose heartbeats stopped, until `cancel`
    /// fires. Checks every ping interval against the heartbeat timeout.
    pub async fn run_heartbeat_sweeper(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.ping_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let released = self
                .hub
                .sweep_stale(Utc::now(), self.config.heartbeat_timeout());
            if !released.is_empty() {
                info!(count = released.len(), "Released silent agent connections");
            }
        }

        debug!("Heartbeat sweeper stopped");
    }

    fn require_session(&self, session_id: &SessionId) -> Result<Session> {
        self.store
            .get_session(session_id)?
            .ok_or_else(|| ControlError::SessionNotFound(session_id.clone()))
    }

    /// Persist a command for the session's agent and try to send it.
    async fn issue(&self, session: &Session, payload: CommandPayload) -> Result<IssuedCommand> {
        let command =
            self.store
                .create_command(&session.agent_id, Some(&session.session_id), payload)?;

        let dispatched = match self.dispatcher.dispatch_command(&command).await {
            Ok(()) => true,
            Err(e) if e.is_retriable() => {
                warn!(
                    session_id = %session.session_id,
                    command_id = %command.command_id,
                    error = %e,
                    "Command persisted but not dispatched, left pending"
                );
                false
            }
            Err(e) => return Err(e),
        };

        info!(
            session_id = %session.session_id,
            agent_id = %session.agent_id,
            command_id = %command.command_id,
            action = %command.action,
            dispatched,
            "Command issued"
        );
        Ok(IssuedCommand {
            command,
            dispatched,
        })
    }

    fn publish(&self, session: &Session, state: SessionState) {
        self.notifier.notify(SessionEvent {
            session_id: session.session_id.clone(),
            agent_id: session.agent_id.clone(),
            state,
            reason: session.termination_reason.clone(),
            source: EventSource::ControlPlane,
            at: Utc::now(),
        });
    }
}

#[async_trait]
impl<S: Store + 'static> ControlPlane for ControlPlaneService<S> {
    async fn start_session(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        spec: SessionSpec,
    ) -> Result<IssuedCommand> {
        if let Some(existing) = self.store.get_session(session_id)? {
            if !lifecycle::is_terminal(existing.state) {
                return Err(ControlError::InvalidSessionState {
                    session_id: session_id.clone(),
                    from: existing.state,
                    to: SessionState::Pending,
                });
            }
        }

        let session = Session::new(
            session_id.clone(),
            agent_id.clone(),
            SessionState::Pending,
            Utc::now(),
        );
        self.store.put_session(&session)?;
        self.specs.insert(session_id.clone(), spec.clone());
        self.publish(&session, SessionState::Pending);

        self.issue(&session, CommandPayload::StartSession(spec)).await
    }

    async fn stop_session(&self, session_id: &SessionId) -> Result<IssuedCommand> {
        let session = self.require_session(session_id)?;
        lifecycle::validate_transition(session_id, session.state, SessionState::Terminating)?;

        let applied = self.store.transition_session(
            session_id,
            &[session.state],
            SessionState::Terminating,
            None,
            Utc::now(),
        )?;
        if !applied {
            let current = self.require_session(session_id)?;
            return Err(ControlError::InvalidSessionState {
                session_id: session_id.clone(),
                from: current.state,
                to: SessionState::Terminating,
            });
        }
        self.specs.remove(session_id);
        self.publish(&session, SessionState::Terminating);

        // Only the original request deletes persistent data.
        self.issue(
            &session,
            CommandPayload::StopSession(StopOptions {
                delete_persistent_data: true,
            }),
        )
        .await
    }

    async fn hibernate_session(&self, session_id: &SessionId) -> Result<IssuedCommand> {
        let session = self.require_session(session_id)?;
        lifecycle::validate_transition(session_id, session.state, SessionState::Hibernated)?;
        self.issue(&session, CommandPayload::HibernateSession).await
    }

    async fn wake_session(&self, session_id: &SessionId) -> Result<IssuedCommand> {
        let session = self.require_session(session_id)?;
        if session.state != SessionState::Hibernated {
            return Err(ControlError::InvalidSessionState {
                session_id: session_id.clone(),
                from: session.state,
                to: SessionState::Running,
            });
        }
        self.issue(&session, CommandPayload::WakeSession).await
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Session> {
        self.require_session(session_id)
    }

    async fn list_session_commands(&self, session_id: &SessionId) -> Result<Vec<Command>> {
        Ok(self.store.list_commands_by_session(session_id)?)
    }

    async fn connect_agent(
        &self,
        registration: AgentRegistration,
        sender: mpsc::Sender<ControlMessage>,
    ) -> Result<ConnectionId> {
        let agent_id = registration.agent_id.clone();
        let connection_id = self.hub.register(registration, sender)?;

        if let Err(e) = self.dispatcher.dispatch_pending_for_agent(&agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to flush pending commands on connect");
        }
        Ok(connection_id)
    }

    async fn disconnect_agent(
        &self,
        agent_id: &AgentId,
        connection_id: &ConnectionId,
    ) -> Result<bool> {
        self.hub.release(agent_id, connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamspace_core::{AgentPlatform, CommandAction, CommandStatus};
    use streamspace_store::RocksStore;
    use tempfile::TempDir;

    use crate::notifier::BroadcastNotifier;

    fn create_service() -> (ControlPlaneService<RocksStore>, Arc<BroadcastNotifier>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let notifier = Arc::new(BroadcastNotifier::new(16));
        let service = ControlPlaneService::new(
            store,
            ControlConfig::default(),
            Arc::clone(&notifier) as Arc<dyn SessionNotifier>,
        );
        (service, notifier, dir)
    }

    fn ids() -> (SessionId, AgentId) {
        (
            SessionId::new("sess-1").unwrap(),
            AgentId::new("k8s-1").unwrap(),
        )
    }

    #[tokio::test]
    async fn start_without_agent_leaves_command_pending() {
        let (service, _notifier, _dir) = create_service();
        let (session_id, agent_id) = ids();

        let issued = service
            .start_session(&session_id, &agent_id, SessionSpec::for_template("firefox"))
            .await
            .unwrap();
        assert!(!issued.dispatched);
        assert_eq!(issued.command.status, CommandStatus::Pending);

        let session = service.get_session(&session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Pending);
    }

    #[tokio::test]
    async fn connect_flushes_pending_start() {
        let (service, _notifier, _dir) = create_service();
        let (session_id, agent_id) = ids();
        service
            .start_session(&session_id, &agent_id, SessionSpec::for_template("firefox"))
            .await
            .unwrap();

        let (tx, mut rx) = service.hub().open_channel();
        service
            .connect_agent(
                AgentRegistration::new(agent_id.clone(), AgentPlatform::Kubernetes),
                tx,
            )
            .await
            .unwrap();

        let Some(ControlMessage::Command(msg)) = rx.recv().await else {
            panic!("expected the pending start");
        };
        assert_eq!(msg.payload.action(), CommandAction::StartSession);
        let commands = service.list_session_commands(&session_id).await.unwrap();
        assert_eq!(commands[0].status, CommandStatus::Sent);
    }

    #[tokio::test]
    async fn duplicate_live_session_rejected() {
        let (service, _notifier, _dir) = create_service();
        let (session_id, agent_id) = ids();
        service
            .start_session(&session_id, &agent_id, SessionSpec::for_template("firefox"))
            .await
            .unwrap();

        let err = service
            .start_session(&session_id, &agent_id, SessionSpec::for_template("firefox"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidSessionState { .. }));
    }

    #[tokio::test]
    async fn stop_moves_to_terminating_and_deletes_data() {
        let (service, notifier, _dir) = create_service();
        let (session_id, agent_id) = ids();
        service
            .start_session(&session_id, &agent_id, SessionSpec::for_template("firefox"))
            .await
            .unwrap();
        let mut events = notifier.subscribe();

        let issued = service.stop_session(&session_id).await.unwrap();
        assert_eq!(
            issued.command.payload,
            CommandPayload::StopSession(StopOptions {
                delete_persistent_data: true
            })
        );
        assert_eq!(
            service.get_session(&session_id).await.unwrap().state,
            SessionState::Terminating
        );
        assert_eq!(events.recv().await.unwrap().state, SessionState::Terminating);

        // Already terminating.
        let err = service.stop_session(&session_id).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidSessionState { .. }));
    }

    #[tokio::test]
    async fn hibernate_and_wake_require_states() {
        let (service, _notifier, _dir) = create_service();
        let (session_id, agent_id) = ids();
        service
            .start_session(&session_id, &agent_id, SessionSpec::for_template("firefox"))
            .await
            .unwrap();

        let err = service.hibernate_session(&session_id).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidSessionState { .. }));
        let err = service.wake_session(&session_id).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidSessionState { .. }));

        let missing = SessionId::new("nope").unwrap();
        let err = service.stop_session(&missing).await.unwrap_err();
        assert!(matches!(err, ControlError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn stats_start_empty() {
        let (service, _notifier, _dir) = create_service();
        assert_eq!(service.reconciler_stats().unwrap(), ReconcileStats::default());
    }
}
