//! `RocksDB` storage layer for the StreamSpace control plane.
//!
//! This crate is the durable half of the control plane: the command ledger,
//! the agent table, and the session fields the control plane owns. No
//! in-memory state elsewhere is load-bearing; everything needed to recover
//! after a crash lives here.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `agents`: Primary agent records, keyed by `agent_id`
//! - `agents_by_status`: Index for listing agents by status
//! - `sessions`: Session records, keyed by `session_id`
//! - `sessions_by_state`: Index serving the stuck-session scans
//! - `commands`: Command records, keyed by `command_id`
//! - `commands_by_status`: Index serving stuck-command listing
//! - `commands_by_session`: Index for a session's command history
//!
//! # Example
//!
//! ```no_run
//! use streamspace_core::{AgentId, CommandPayload, SessionId, StopOptions};
//! use streamspace_store::{RocksStore, Store};
//!
//! let store = RocksStore::open("/tmp/streamspace-db").unwrap();
//!
//! let agent_id = AgentId::new("k8s-1").unwrap();
//! let session_id = SessionId::new("sess-1").unwrap();
//! let command = store
//!     .create_command(
//!         &agent_id,
//!         Some(&session_id),
//!         CommandPayload::StopSession(StopOptions::default()),
//!     )
//!     .unwrap();
//! store.mark_sent(&command.command_id).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod transition;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use transition::CommandTransition;
pub use types::{Agent, Command, Session};

use chrono::{DateTime, Utc};
use streamspace_core::{
    AgentId, AgentStatus, CommandId, CommandPayload, CommandResult, CommandStatus, ConnectionId,
    HeartbeatPayload, SessionId, SessionState,
};

/// The storage trait defining all database operations.
///
/// Every read-modify-write operation is atomic with respect to other callers
/// of the same store: status checks and the resulting write cannot be
/// interleaved with another writer.
pub trait Store: Send + Sync {
    // =========================================================================
    // Agent Operations
    // =========================================================================

    /// Insert or update an agent record.
    ///
    /// This also maintains the status index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_agent(&self, agent: &Agent) -> Result<()>;

    /// Get an agent by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_agent(&self, agent_id: &AgentId) -> Result<Option<Agent>>;

    /// List all agents with a given status.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_agents_by_status(&self, status: AgentStatus) -> Result<Vec<Agent>>;

    /// List all agents in the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_all_agents(&self) -> Result<Vec<Agent>>;

    /// Update an agent's status.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the agent doesn't exist.
    fn update_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<()>;

    /// Mark an agent offline, but only if `connection_id` is still its
    /// active connection.
    ///
    /// Returns `false` when a newer connection has taken over.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the agent doesn't exist.
    fn mark_agent_disconnected(
        &self,
        agent_id: &AgentId,
        connection_id: &ConnectionId,
    ) -> Result<bool>;

    /// Record a heartbeat: last-seen time, reported status, session count and
    /// capacity.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the agent doesn't exist.
    fn record_agent_heartbeat(
        &self,
        agent_id: &AgentId,
        heartbeat: &HeartbeatPayload,
        at: DateTime<Utc>,
    ) -> Result<()>;

    // =========================================================================
    // Command Operations
    // =========================================================================

    /// Persist a new command with a fresh id in `Pending` status.
    ///
    /// The caller must not assume the command reached the agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn create_command(
        &self,
        agent_id: &AgentId,
        session_id: Option<&SessionId>,
        payload: CommandPayload,
    ) -> Result<Command>;

    /// Get a command by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_command(&self, command_id: &CommandId) -> Result<Option<Command>>;

    /// Advance a command to `Sent`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the command doesn't exist.
    fn mark_sent(&self, command_id: &CommandId) -> Result<CommandTransition>;

    /// Advance a command to `Ack`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the command doesn't exist.
    fn mark_acknowledged(&self, command_id: &CommandId) -> Result<CommandTransition>;

    /// Advance a command to `Completed`, storing its result.
    ///
    /// A repeated completion keeps the first stored result.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the command doesn't exist.
    fn mark_completed(
        &self,
        command_id: &CommandId,
        result: &CommandResult,
    ) -> Result<CommandTransition>;

    /// Advance a command to `Failed`, storing the agent's error.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the command doesn't exist.
    fn mark_failed(&self, command_id: &CommandId, error: &str) -> Result<CommandTransition>;

    /// Fail a command that never left `Pending`, recording `reason`.
    ///
    /// Used when the session it targets was resolved without the agent, so
    /// the command must never be sent. Returns `false` if the command had
    /// already moved past `Pending`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the command doesn't exist.
    fn cancel_pending_command(&self, command_id: &CommandId, reason: &str) -> Result<bool>;

    /// List commands in `status` that entered it strictly before
    /// `older_than`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_stuck_commands(
        &self,
        status: CommandStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Command>>;

    /// List all commands for a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_commands_by_session(&self, session_id: &SessionId) -> Result<Vec<Command>>;

    /// List an agent's `Pending` commands in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_pending_commands_for_agent(&self, agent_id: &AgentId) -> Result<Vec<Command>>;

    // =========================================================================
    // Session Operations
    // =========================================================================

    /// Insert or update a session record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_session(&self, session: &Session) -> Result<()>;

    /// Get a session by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>>;

    /// List sessions in `state` whose `updated_at` is strictly before
    /// `older_than`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_sessions_by_state(
        &self,
        state: SessionState,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Session>>;

    /// Compare-and-set a session's state.
    ///
    /// The write only happens when the current state is one of `expected`.
    /// On success `updated_at` becomes `at` and, when given, the termination
    /// reason is recorded. Returns whether the write happened.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the session doesn't exist.
    fn transition_session(
        &self,
        session_id: &SessionId,
        expected: &[SessionState],
        new_state: SessionState,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;
}
