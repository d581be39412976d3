//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};
use streamspace_core::{
    AgentId, AgentStatus, CommandId, CommandPayload, CommandResult, CommandStatus, ConnectionId,
    HeartbeatPayload, SessionId, SessionState,
};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::transition::CommandTransition;
use crate::types::{Agent, Command, Session};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    /// Serializes read-modify-write operations so that a status check and
    /// the write it guards are atomic.
    write_lock: Mutex<()>,
}

fn db_err(e: rocksdb::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(db_err)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_record<T: serde::de::DeserializeOwned>(
        &self,
        cf_name: &str,
        key: &[u8],
    ) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(db_err)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Collect every index key starting with `prefix`.
    fn index_keys(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, rocksdb::Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(db_err)?;

            // Stop if we're past the prefix
            if !key.starts_with(prefix) {
                break;
            }
            out.push(key);
        }
        Ok(out)
    }

    // =========================================================================
    // Unlocked writers. Callers hold `write_lock`.
    // =========================================================================

    fn write_agent(&self, agent: &Agent, old_status: Option<AgentStatus>) -> Result<()> {
        let cf_agents = self.cf(cf::AGENTS)?;
        let cf_by_status = self.cf(cf::AGENTS_BY_STATUS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_agents, keys::agent_key(&agent.agent_id), Self::serialize(agent)?);

        if let Some(old) = old_status.filter(|old| *old != agent.status) {
            batch.delete_cf(
                &cf_by_status,
                keys::coded_key(old.as_u8(), agent.agent_id.as_bytes()),
            );
        }
        batch.put_cf(
            &cf_by_status,
            keys::coded_key(agent.status.as_u8(), agent.agent_id.as_bytes()),
            [],
        );

        self.db.write(batch).map_err(db_err)
    }

    fn write_session(&self, session: &Session, old_state: Option<SessionState>) -> Result<()> {
        let cf_sessions = self.cf(cf::SESSIONS)?;
        let cf_by_state = self.cf(cf::SESSIONS_BY_STATE)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_sessions,
            keys::session_key(&session.session_id),
            Self::serialize(session)?,
        );

        if let Some(old) = old_state.filter(|old| *old != session.state) {
            batch.delete_cf(
                &cf_by_state,
                keys::coded_key(old.as_u8(), session.session_id.as_bytes()),
            );
        }
        batch.put_cf(
            &cf_by_state,
            keys::coded_key(session.state.as_u8(), session.session_id.as_bytes()),
            [],
        );

        self.db.write(batch).map_err(db_err)
    }

    fn write_command(&self, command: &Command, old_status: Option<CommandStatus>) -> Result<()> {
        let cf_commands = self.cf(cf::COMMANDS)?;
        let cf_by_status = self.cf(cf::COMMANDS_BY_STATUS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_commands,
            keys::command_key(&command.command_id),
            Self::serialize(command)?,
        );

        match old_status {
            Some(old) if old != command.status => batch.delete_cf(
                &cf_by_status,
                keys::coded_key(old.as_u8(), command.command_id.as_bytes()),
            ),
            Some(_) => {}
            None => {
                if let Some(session_id) = &command.session_id {
                    let cf_by_session = self.cf(cf::COMMANDS_BY_SESSION)?;
                    batch.put_cf(
                        &cf_by_session,
                        keys::session_command_key(session_id, &command.command_id),
                        [],
                    );
                }
            }
        }
        batch.put_cf(
            &cf_by_status,
            keys::coded_key(command.status.as_u8(), command.command_id.as_bytes()),
            [],
        );

        self.db.write(batch).map_err(db_err)
    }

    /// Load, classify and (if forward) write a command status advance.
    fn advance_command(
        &self,
        command_id: &CommandId,
        target: CommandStatus,
        apply: impl FnOnce(&mut Command, DateTime<Utc>),
    ) -> Result<CommandTransition> {
        let _guard = self.write_lock.lock();

        let mut command = self.get_command(command_id)?.ok_or(StoreError::NotFound)?;
        let current = command.status;
        let transition = CommandTransition::classify(current, target);

        match transition {
            CommandTransition::Applied => {}
            CommandTransition::AppliedOutOfOrder => warn!(
                command_id = %command_id,
                from = %current,
                to = %target,
                "Command status advanced out of order"
            ),
            CommandTransition::Unchanged => debug!(
                command_id = %command_id,
                status = %current,
                "Duplicate command status report"
            ),
            CommandTransition::Ignored => warn!(
                command_id = %command_id,
                from = %current,
                to = %target,
                "Ignoring command status regression"
            ),
        }

        if transition.is_applied() {
            command.status = target;
            apply(&mut command, Utc::now());
            self.write_command(&command, Some(current))?;
        }

        Ok(transition)
    }

    fn load_commands(&self, ids: Vec<CommandId>) -> Result<Vec<Command>> {
        let mut commands = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(command) = self.get_command(&id)? {
                commands.push(command);
            }
        }
        commands.sort_by_key(|c| c.created_at);
        Ok(commands)
    }

    fn commands_with_status(&self, status: CommandStatus) -> Result<Vec<Command>> {
        let ids = self
            .index_keys(cf::COMMANDS_BY_STATUS, &keys::code_prefix(status.as_u8()))?
            .iter()
            .map(|key| keys::command_id_from_coded_key(key))
            .collect::<Result<Vec<_>>>()?;
        self.load_commands(ids)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Agent Operations
    // =========================================================================

    fn put_agent(&self, agent: &Agent) -> Result<()> {
        let _guard = self.write_lock.lock();
        let old_status = self.get_agent(&agent.agent_id)?.map(|a| a.status);
        self.write_agent(agent, old_status)
    }

    fn get_agent(&self, agent_id: &AgentId) -> Result<Option<Agent>> {
        self.get_record(cf::AGENTS, &keys::agent_key(agent_id))
    }

    fn list_agents_by_status(&self, status: AgentStatus) -> Result<Vec<Agent>> {
        let mut agents = Vec::new();
        for key in self.index_keys(cf::AGENTS_BY_STATUS, &keys::code_prefix(status.as_u8()))? {
            let agent_id = keys::agent_id_from_coded_key(&key)?;
            if let Some(agent) = self.get_agent(&agent_id)? {
                agents.push(agent);
            }
        }
        Ok(agents)
    }

    fn list_all_agents(&self) -> Result<Vec<Agent>> {
        let cf = self.cf(cf::AGENTS)?;

        let mut agents = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(db_err)?;
            agents.push(Self::deserialize(&value)?);
        }
        Ok(agents)
    }

    fn update_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut agent = self.get_agent(agent_id)?.ok_or(StoreError::NotFound)?;
        let old = agent.status;
        agent.status = status;
        agent.updated_at = Utc::now();
        self.write_agent(&agent, Some(old))
    }

    fn mark_agent_disconnected(
        &self,
        agent_id: &AgentId,
        connection_id: &ConnectionId,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let mut agent = self.get_agent(agent_id)?.ok_or(StoreError::NotFound)?;
        if agent.connection_id.as_ref() != Some(connection_id) {
            return Ok(false);
        }

        let old = agent.status;
        agent.status = AgentStatus::Offline;
        agent.connection_id = None;
        agent.updated_at = Utc::now();
        self.write_agent(&agent, Some(old))?;
        Ok(true)
    }

    fn record_agent_heartbeat(
        &self,
        agent_id: &AgentId,
        heartbeat: &HeartbeatPayload,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut agent = self.get_agent(agent_id)?.ok_or(StoreError::NotFound)?;
        let old = agent.status;

        agent.status = heartbeat.status;
        agent.last_heartbeat = Some(at);
        agent.active_sessions = heartbeat.active_sessions;
        if let Some(capacity) = &heartbeat.capacity {
            agent.capacity = Some(capacity.clone());
        }
        agent.updated_at = at;
        self.write_agent(&agent, Some(old))
    }

    // =========================================================================
    // Command Operations
    // =========================================================================

    fn create_command(
        &self,
        agent_id: &AgentId,
        session_id: Option<&SessionId>,
        payload: CommandPayload,
    ) -> Result<Command> {
        let command = Command::new(agent_id.clone(), session_id.cloned(), payload, Utc::now());

        let _guard = self.write_lock.lock();
        self.write_command(&command, None)?;

        debug!(
            command_id = %command.command_id,
            agent_id = %command.agent_id,
            action = %command.action,
            "Command persisted"
        );
        Ok(command)
    }

    fn get_command(&self, command_id: &CommandId) -> Result<Option<Command>> {
        self.get_record(cf::COMMANDS, &keys::command_key(command_id))
    }

    fn mark_sent(&self, command_id: &CommandId) -> Result<CommandTransition> {
        self.advance_command(command_id, CommandStatus::Sent, |c, now| {
            c.sent_at = Some(now);
        })
    }

    fn mark_acknowledged(&self, command_id: &CommandId) -> Result<CommandTransition> {
        self.advance_command(command_id, CommandStatus::Ack, |c, now| {
            c.acknowledged_at = Some(now);
        })
    }

    fn mark_completed(
        &self,
        command_id: &CommandId,
        result: &CommandResult,
    ) -> Result<CommandTransition> {
        self.advance_command(command_id, CommandStatus::Completed, |c, now| {
            c.result = Some(result.clone());
            c.completed_at = Some(now);
        })
    }

    fn mark_failed(&self, command_id: &CommandId, error: &str) -> Result<CommandTransition> {
        self.advance_command(command_id, CommandStatus::Failed, |c, now| {
            c.error_message = Some(error.to_string());
            c.completed_at = Some(now);
        })
    }

    fn cancel_pending_command(&self, command_id: &CommandId, reason: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();

        let mut command = self.get_command(command_id)?.ok_or(StoreError::NotFound)?;
        if command.status != CommandStatus::Pending {
            return Ok(false);
        }
        command.status = CommandStatus::Failed;
        command.error_message = Some(reason.to_string());
        command.completed_at = Some(Utc::now());
        self.write_command(&command, Some(CommandStatus::Pending))?;

        debug!(command_id = %command_id, reason, "Pending command cancelled");
        Ok(true)
    }

    fn list_stuck_commands(
        &self,
        status: CommandStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Command>> {
        let mut commands = self.commands_with_status(status)?;
        commands.retain(|c| c.status == status && c.status_changed_at() < older_than);
        Ok(commands)
    }

    fn list_commands_by_session(&self, session_id: &SessionId) -> Result<Vec<Command>> {
        let ids = self
            .index_keys(
                cf::COMMANDS_BY_SESSION,
                &keys::session_command_prefix(session_id),
            )?
            .iter()
            .map(|key| keys::command_id_from_session_key(key))
            .collect::<Result<Vec<_>>>()?;
        self.load_commands(ids)
    }

    fn list_pending_commands_for_agent(&self, agent_id: &AgentId) -> Result<Vec<Command>> {
        let mut commands = self.commands_with_status(CommandStatus::Pending)?;
        commands.retain(|c| &c.agent_id == agent_id);
        Ok(commands)
    }

    // =========================================================================
    // Session Operations
    // =========================================================================

    fn put_session(&self, session: &Session) -> Result<()> {
        let _guard = self.write_lock.lock();
        let old_state = self.get_session(&session.session_id)?.map(|s| s.state);
        self.write_session(session, old_state)
    }

    fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>> {
        self.get_record(cf::SESSIONS, &keys::session_key(session_id))
    }

    fn list_sessions_by_state(
        &self,
        state: SessionState,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for key in self.index_keys(cf::SESSIONS_BY_STATE, &keys::code_prefix(state.as_u8()))? {
            let session_id = keys::session_id_from_coded_key(&key)?;
            if let Some(session) = self.get_session(&session_id)? {
                if session.state == state && session.updated_at < older_than {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    fn transition_session(
        &self,
        session_id: &SessionId,
        expected: &[SessionState],
        new_state: SessionState,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let mut session = self.get_session(session_id)?.ok_or(StoreError::NotFound)?;
        if !expected.contains(&session.state) {
            return Ok(false);
        }

        let old = session.state;
        session.state = new_state;
        session.updated_at = at;
        if let Some(reason) = reason {
            session.termination_reason = Some(reason.to_string());
        }
        self.write_session(&session, Some(old))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use streamspace_core::{AgentPlatform, SessionSpec, StopOptions};
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn agent_id(name: &str) -> AgentId {
        AgentId::new(name).unwrap()
    }

    fn session_id(name: &str) -> SessionId {
        SessionId::new(name).unwrap()
    }

    fn create_test_agent(name: &str) -> Agent {
        let now = Utc::now();
        Agent {
            agent_id: agent_id(name),
            platform: AgentPlatform::Kubernetes,
            region: Some("eu-west".to_string()),
            status: AgentStatus::Online,
            connection_id: Some(ConnectionId::generate()),
            last_heartbeat: None,
            active_sessions: 0,
            capacity: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn stop_payload() -> CommandPayload {
        CommandPayload::StopSession(StopOptions::default())
    }

    #[test]
    fn agent_crud() {
        let (store, _dir) = create_test_store();
        let agent = create_test_agent("k8s-1");

        store.put_agent(&agent).unwrap();

        let retrieved = store.get_agent(&agent.agent_id).unwrap().unwrap();
        assert_eq!(retrieved.platform, AgentPlatform::Kubernetes);
        assert_eq!(retrieved.status, AgentStatus::Online);

        store
            .update_agent_status(&agent.agent_id, AgentStatus::Draining)
            .unwrap();
        let updated = store.get_agent(&agent.agent_id).unwrap().unwrap();
        assert_eq!(updated.status, AgentStatus::Draining);

        assert_eq!(store.list_all_agents().unwrap().len(), 1);
    }

    #[test]
    fn status_index_updated_on_change() {
        let (store, _dir) = create_test_store();
        let agent = create_test_agent("docker-1");
        store.put_agent(&agent).unwrap();

        assert_eq!(store.list_agents_by_status(AgentStatus::Online).unwrap().len(), 1);
        assert_eq!(store.list_agents_by_status(AgentStatus::Offline).unwrap().len(), 0);

        let conn = agent.connection_id.unwrap();
        assert!(store.mark_agent_disconnected(&agent.agent_id, &conn).unwrap());

        assert_eq!(store.list_agents_by_status(AgentStatus::Online).unwrap().len(), 0);
        let offline = store.list_agents_by_status(AgentStatus::Offline).unwrap();
        assert_eq!(offline.len(), 1);
        assert!(offline[0].connection_id.is_none());
    }

    #[test]
    fn stale_connection_cannot_disconnect_agent() {
        let (store, _dir) = create_test_store();
        let agent = create_test_agent("vm-1");
        store.put_agent(&agent).unwrap();

        let stale = ConnectionId::generate();
        assert!(!store.mark_agent_disconnected(&agent.agent_id, &stale).unwrap());
        let current = store.get_agent(&agent.agent_id).unwrap().unwrap();
        assert_eq!(current.status, AgentStatus::Online);
    }

    #[test]
    fn heartbeat_updates_agent() {
        let (store, _dir) = create_test_store();
        let agent = create_test_agent("k8s-2");
        store.put_agent(&agent).unwrap();

        let at = Utc::now();
        let heartbeat = HeartbeatPayload {
            status: AgentStatus::Online,
            active_sessions: 3,
            capacity: Some(serde_json::json!({ "max_sessions": 10 })),
        };
        store
            .record_agent_heartbeat(&agent.agent_id, &heartbeat, at)
            .unwrap();

        let updated = store.get_agent(&agent.agent_id).unwrap().unwrap();
        assert_eq!(updated.last_heartbeat, Some(at));
        assert_eq!(updated.active_sessions, 3);
        assert_eq!(updated.capacity.unwrap()["max_sessions"], 10);
    }

    #[test]
    fn command_lifecycle() {
        let (store, _dir) = create_test_store();
        let command = store
            .create_command(&agent_id("k8s-1"), Some(&session_id("sess-1")), stop_payload())
            .unwrap();
        assert_eq!(command.status, CommandStatus::Pending);
        assert_eq!(command.action, streamspace_core::CommandAction::StopSession);

        assert_eq!(
            store.mark_sent(&command.command_id).unwrap(),
            CommandTransition::Applied
        );
        assert_eq!(
            store.mark_acknowledged(&command.command_id).unwrap(),
            CommandTransition::Applied
        );
        let result = CommandResult {
            message: Some("stopped".to_string()),
            ..CommandResult::default()
        };
        assert_eq!(
            store.mark_completed(&command.command_id, &result).unwrap(),
            CommandTransition::Applied
        );

        let stored = store.get_command(&command.command_id).unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
        assert!(stored.sent_at.is_some());
        assert!(stored.acknowledged_at.is_some());
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.result.unwrap().message.as_deref(), Some("stopped"));
    }

    #[test]
    fn completing_twice_keeps_first_result() {
        let (store, _dir) = create_test_store();
        let command = store
            .create_command(&agent_id("k8s-1"), None, CommandPayload::HibernateSession)
            .unwrap();
        store.mark_sent(&command.command_id).unwrap();
        store.mark_acknowledged(&command.command_id).unwrap();

        let first = CommandResult {
            message: Some("first".to_string()),
            ..CommandResult::default()
        };
        let second = CommandResult {
            message: Some("second".to_string()),
            ..CommandResult::default()
        };
        store.mark_completed(&command.command_id, &first).unwrap();
        assert_eq!(
            store.mark_completed(&command.command_id, &second).unwrap(),
            CommandTransition::Unchanged
        );

        let stored = store.get_command(&command.command_id).unwrap().unwrap();
        assert_eq!(stored.result.unwrap().message.as_deref(), Some("first"));
    }

    #[test]
    fn completed_command_never_regresses() {
        let (store, _dir) = create_test_store();
        let command = store
            .create_command(&agent_id("k8s-1"), None, CommandPayload::WakeSession)
            .unwrap();

        // No sent, no ack: accepted but out of order.
        assert_eq!(
            store
                .mark_completed(&command.command_id, &CommandResult::default())
                .unwrap(),
            CommandTransition::AppliedOutOfOrder
        );
        assert_eq!(
            store.mark_acknowledged(&command.command_id).unwrap(),
            CommandTransition::Ignored
        );
        assert_eq!(
            store.mark_failed(&command.command_id, "late failure").unwrap(),
            CommandTransition::Ignored
        );

        let stored = store.get_command(&command.command_id).unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
        assert!(stored.error_message.is_none());
        assert!(stored.acknowledged_at.is_none());
    }

    #[test]
    fn marking_unknown_command_is_not_found() {
        let (store, _dir) = create_test_store();
        assert!(matches!(
            store.mark_acknowledged(&CommandId::generate()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn status_index_follows_command() {
        let (store, _dir) = create_test_store();
        let command = store
            .create_command(&agent_id("k8s-1"), None, CommandPayload::WakeSession)
            .unwrap();
        let later = Utc::now() + Duration::seconds(1);

        assert_eq!(
            store
                .list_stuck_commands(CommandStatus::Pending, later)
                .unwrap()
                .len(),
            1
        );

        store.mark_sent(&command.command_id).unwrap();
        assert!(store
            .list_stuck_commands(CommandStatus::Pending, later)
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .list_stuck_commands(CommandStatus::Sent, later)
                .unwrap()
                .len(),
            1
        );

        let earlier = command.created_at - Duration::seconds(1);
        assert!(store
            .list_stuck_commands(CommandStatus::Sent, earlier)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn pending_commands_for_agent_in_creation_order() {
        let (store, _dir) = create_test_store();
        let k8s = agent_id("k8s-1");

        let first = store
            .create_command(&k8s, Some(&session_id("sess-1")), stop_payload())
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = store
            .create_command(
                &k8s,
                Some(&session_id("sess-2")),
                CommandPayload::StartSession(SessionSpec::for_template("firefox")),
            )
            .unwrap();
        store
            .create_command(&agent_id("docker-1"), None, CommandPayload::WakeSession)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let sent = store.create_command(&k8s, None, stop_payload()).unwrap();
        store.mark_sent(&sent.command_id).unwrap();

        let pending = store.list_pending_commands_for_agent(&k8s).unwrap();
        let ids: Vec<_> = pending.iter().map(|c| c.command_id).collect();
        assert_eq!(ids, vec![first.command_id, second.command_id]);
    }

    #[test]
    fn cancel_only_touches_pending_commands() {
        let (store, _dir) = create_test_store();
        let k8s = agent_id("k8s-1");

        let pending = store.create_command(&k8s, None, stop_payload()).unwrap();
        let sent = store.create_command(&k8s, None, stop_payload()).unwrap();
        store.mark_sent(&sent.command_id).unwrap();

        assert!(store
            .cancel_pending_command(&pending.command_id, "agent_unavailable")
            .unwrap());
        assert!(!store
            .cancel_pending_command(&sent.command_id, "agent_unavailable")
            .unwrap());

        let cancelled = store.get_command(&pending.command_id).unwrap().unwrap();
        assert_eq!(cancelled.status, CommandStatus::Failed);
        assert_eq!(cancelled.error_message.as_deref(), Some("agent_unavailable"));
        assert!(cancelled.completed_at.is_some());
        assert_eq!(
            store.get_command(&sent.command_id).unwrap().unwrap().status,
            CommandStatus::Sent
        );
        assert!(store.list_pending_commands_for_agent(&k8s).unwrap().is_empty());
    }

    #[test]
    fn commands_by_session() {
        let (store, _dir) = create_test_store();
        let k8s = agent_id("k8s-1");
        let sess = session_id("sess-1");

        store.create_command(&k8s, Some(&sess), stop_payload()).unwrap();
        store.create_command(&k8s, Some(&sess), stop_payload()).unwrap();
        store
            .create_command(&k8s, Some(&session_id("sess-10")), stop_payload())
            .unwrap();

        let commands = store.list_commands_by_session(&sess).unwrap();
        assert_eq!(commands.len(), 2);
        assert!(commands.iter().all(|c| c.session_id.as_ref() == Some(&sess)));
    }

    #[test]
    fn sessions_by_state_use_strict_cutoff() {
        let (store, _dir) = create_test_store();
        let now = Utc::now();
        let session = Session::new(
            session_id("sess-1"),
            agent_id("k8s-1"),
            SessionState::Terminating,
            now - Duration::minutes(5),
        );
        store.put_session(&session).unwrap();

        let cutoff = now - Duration::minutes(5);
        assert!(store
            .list_sessions_by_state(SessionState::Terminating, cutoff)
            .unwrap()
            .is_empty());

        let later_cutoff = cutoff + Duration::seconds(1);
        assert_eq!(
            store
                .list_sessions_by_state(SessionState::Terminating, later_cutoff)
                .unwrap()
                .len(),
            1
        );
        assert!(store
            .list_sessions_by_state(SessionState::Pending, later_cutoff)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn transition_session_is_compare_and_set() {
        let (store, _dir) = create_test_store();
        let now = Utc::now();
        let session = Session::new(
            session_id("sess-2"),
            agent_id("k8s-2"),
            SessionState::Pending,
            now - Duration::minutes(12),
        );
        store.put_session(&session).unwrap();

        // Wrong expected state: no write.
        assert!(!store
            .transition_session(
                &session.session_id,
                &[SessionState::Terminating],
                SessionState::Terminated,
                Some("agent_unavailable"),
                now,
            )
            .unwrap());

        assert!(store
            .transition_session(
                &session.session_id,
                &[SessionState::Pending],
                SessionState::Failed,
                Some("agent_unavailable"),
                now,
            )
            .unwrap());

        let stored = store.get_session(&session.session_id).unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Failed);
        assert_eq!(stored.termination_reason.as_deref(), Some("agent_unavailable"));
        assert_eq!(stored.updated_at, now);

        let far_future = now + Duration::days(1);
        assert!(store
            .list_sessions_by_state(SessionState::Pending, far_future)
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .list_sessions_by_state(SessionState::Failed, far_future)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let command_id = {
            let store = RocksStore::open(dir.path()).unwrap();
            store
                .create_command(&agent_id("k8s-1"), None, stop_payload())
                .unwrap()
                .command_id
        };

        let store = RocksStore::open(dir.path()).unwrap();
        let command = store.get_command(&command_id).unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Pending);
        assert_eq!(command.payload, stop_payload());
    }
}
