//! A `RocksStore` wrapper that fails on demand.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use streamspace_core::{
    AgentId, AgentStatus, CommandId, CommandPayload, CommandResult, CommandStatus, ConnectionId,
    HeartbeatPayload, SessionId, SessionState,
};
use streamspace_store::{
    Agent, Command, CommandTransition, Result, RocksStore, Session, Store, StoreError,
};
use tempfile::TempDir;

type AgentWriteHook = Box<dyn Fn(&AgentId) + Send + Sync>;

/// Delegates to a temporary `RocksStore`, with injectable failures.
pub struct FaultyStore {
    inner: RocksStore,
    failing_session: Mutex<Option<SessionId>>,
    failing_listings: AtomicUsize,
    agent_write_hook: Mutex<Option<AgentWriteHook>>,
    _dir: TempDir,
}

impl FaultyStore {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            inner: RocksStore::open(dir.path()).unwrap(),
            failing_session: Mutex::new(None),
            failing_listings: AtomicUsize::new(0),
            agent_write_hook: Mutex::new(None),
            _dir: dir,
        }
    }

    /// Every `transition_session` on `session_id` fails from now on.
    pub fn fail_transitions_for(&self, session_id: &SessionId) {
        *self.failing_session.lock() = Some(session_id.clone());
    }

    /// The next `count` calls to `list_sessions_by_state` fail.
    pub fn fail_next_listings(&self, count: usize) {
        self.failing_listings.store(count, Ordering::SeqCst);
    }

    /// Run `hook` right before every agent row write.
    pub fn on_agent_write(&self, hook: impl Fn(&AgentId) + Send + Sync + 'static) {
        *self.agent_write_hook.lock() = Some(Box::new(hook));
    }

    fn agent_written(&self, agent_id: &AgentId) {
        if let Some(hook) = self.agent_write_hook.lock().as_ref() {
            hook(agent_id);
        }
    }

    fn injected() -> StoreError {
        StoreError::Database("injected failure".to_string())
    }
}

impl Store for FaultyStore {
    fn put_agent(&self, agent: &Agent) -> Result<()> {
        self.agent_written(&agent.agent_id);
        self.inner.put_agent(agent)
    }

    fn get_agent(&self, agent_id: &AgentId) -> Result<Option<Agent>> {
        self.inner.get_agent(agent_id)
    }

    fn list_agents_by_status(&self, status: AgentStatus) -> Result<Vec<Agent>> {
        self.inner.list_agents_by_status(status)
    }

    fn list_all_agents(&self) -> Result<Vec<Agent>> {
        self.inner.list_all_agents()
    }

    fn update_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<()> {
        self.agent_written(agent_id);
        self.inner.update_agent_status(agent_id, status)
    }

    fn mark_agent_disconnected(
        &self,
        agent_id: &AgentId,
        connection_id: &ConnectionId,
    ) -> Result<bool> {
        self.agent_written(agent_id);
        self.inner.mark_agent_disconnected(agent_id, connection_id)
    }

    fn record_agent_heartbeat(
        &self,
        agent_id: &AgentId,
        heartbeat: &HeartbeatPayload,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.record_agent_heartbeat(agent_id, heartbeat, at)
    }

    fn create_command(
        &self,
        agent_id: &AgentId,
        session_id: Option<&SessionId>,
        payload: CommandPayload,
    ) -> Result<Command> {
        self.inner.create_command(agent_id, session_id, payload)
    }

    fn get_command(&self, command_id: &CommandId) -> Result<Option<Command>> {
        self.inner.get_command(command_id)
    }

    fn mark_sent(&self, command_id: &CommandId) -> Result<CommandTransition> {
        self.inner.mark_sent(command_id)
    }

    fn mark_acknowledged(&self, command_id: &CommandId) -> Result<CommandTransition> {
        self.inner.mark_acknowledged(command_id)
    }

    fn mark_completed(
        &self,
        command_id: &CommandId,
        result: &CommandResult,
    ) -> Result<CommandTransition> {
        self.inner.mark_completed(command_id, result)
    }

    fn mark_failed(&self, command_id: &CommandId, error: &str) -> Result<CommandTransition> {
        self.inner.mark_failed(command_id, error)
    }

    fn cancel_pending_command(&self, command_id: &CommandId, reason: &str) -> Result<bool> {
        self.inner.cancel_pending_command(command_id, reason)
    }

    fn list_stuck_commands(
        &self,
        status: CommandStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Command>> {
        self.inner.list_stuck_commands(status, older_than)
    }

    fn list_commands_by_session(&self, session_id: &SessionId) -> Result<Vec<Command>> {
        self.inner.list_commands_by_session(session_id)
    }

    fn list_pending_commands_for_agent(&self, agent_id: &AgentId) -> Result<Vec<Command>> {
        self.inner.list_pending_commands_for_agent(agent_id)
    }

    fn put_session(&self, session: &Session) -> Result<()> {
        self.inner.put_session(session)
    }

    fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>> {
        self.inner.get_session(session_id)
    }

    fn list_sessions_by_state(
        &self,
        state: SessionState,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let failing = self
            .failing_listings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Self::injected());
        }
        self.inner.list_sessions_by_state(state, older_than)
    }

    fn transition_session(
        &self,
        session_id: &SessionId,
        expected: &[SessionState],
        new_state: SessionState,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if self.failing_session.lock().as_ref() == Some(session_id) {
            return Err(Self::injected());
        }
        self.inner
            .transition_session(session_id, expected, new_state, reason, at)
    }
}
