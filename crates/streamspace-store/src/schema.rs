//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Primary agent records, keyed by `agent_id`.
    pub const AGENTS: &str = "agents";

    /// Index: agents by status, keyed by `status || agent_id`.
    pub const AGENTS_BY_STATUS: &str = "agents_by_status";

    /// Primary session records, keyed by `session_id`.
    pub const SESSIONS: &str = "sessions";

    /// Index: sessions by state, keyed by `state || session_id`.
    pub const SESSIONS_BY_STATE: &str = "sessions_by_state";

    /// Primary command records, keyed by the 16-byte command UUID.
    pub const COMMANDS: &str = "commands";

    /// Index: commands by status, keyed by `status || command_id`.
    pub const COMMANDS_BY_STATUS: &str = "commands_by_status";

    /// Index: commands by session, keyed by `session_id || 0x00 || command_id`.
    pub const COMMANDS_BY_SESSION: &str = "commands_by_session";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::AGENTS,
        cf::AGENTS_BY_STATUS,
        cf::SESSIONS,
        cf::SESSIONS_BY_STATE,
        cf::COMMANDS,
        cf::COMMANDS_BY_STATUS,
        cf::COMMANDS_BY_SESSION,
    ]
}
