//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions to encode and decode keys for the primary
//! records and their indexes. All index keys are designed for prefix scans:
//! a one-byte status or state code, or a session id terminated by `0x00`,
//! followed by the record id.

use streamspace_core::{AgentId, CommandId, SessionId};

use crate::error::{Result, StoreError};
use crate::schema::cf;

/// Separator between a session id and a command id in the session index.
///
/// Session ids never contain `0x00`, so `session_id || 0x00` is a prefix of
/// exactly that session's entries.
const SESSION_SEPARATOR: u8 = 0x00;

/// Encode an agent key (just the agent ID bytes).
#[must_use]
pub fn agent_key(agent_id: &AgentId) -> Vec<u8> {
    agent_id.as_bytes().to_vec()
}

/// Encode a session key (just the session ID bytes).
#[must_use]
pub fn session_key(session_id: &SessionId) -> Vec<u8> {
    session_id.as_bytes().to_vec()
}

/// Encode a command key (the 16 UUID bytes).
#[must_use]
pub fn command_key(command_id: &CommandId) -> Vec<u8> {
    command_id.as_bytes().to_vec()
}

/// Encode a one-byte code prefix for status/state scans.
#[must_use]
pub fn code_prefix(code: u8) -> Vec<u8> {
    vec![code]
}

/// Encode an index key: `code || id`.
#[must_use]
pub fn coded_key(code: u8, id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + id.len());
    key.push(code);
    key.extend_from_slice(id);
    key
}

/// Encode a session-command index key: `session_id || 0x00 || command_id`.
#[must_use]
pub fn session_command_key(session_id: &SessionId, command_id: &CommandId) -> Vec<u8> {
    let mut key = session_command_prefix(session_id);
    key.extend_from_slice(command_id.as_bytes());
    key
}

/// Encode the prefix for scanning all commands of a session.
#[must_use]
pub fn session_command_prefix(session_id: &SessionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(session_id.as_bytes().len() + 17);
    key.extend_from_slice(session_id.as_bytes());
    key.push(SESSION_SEPARATOR);
    key
}

/// Extract the agent ID from a `status || agent_id` key.
///
/// # Errors
///
/// Returns `StoreError::CorruptKey` if the suffix is not a valid agent id.
pub fn agent_id_from_coded_key(key: &[u8]) -> Result<AgentId> {
    let raw = utf8_suffix(key, cf::AGENTS_BY_STATUS)?;
    AgentId::new(raw).map_err(|e| corrupt(cf::AGENTS_BY_STATUS, e.to_string()))
}

/// Extract the session ID from a `state || session_id` key.
///
/// # Errors
///
/// Returns `StoreError::CorruptKey` if the suffix is not a valid session id.
pub fn session_id_from_coded_key(key: &[u8]) -> Result<SessionId> {
    let raw = utf8_suffix(key, cf::SESSIONS_BY_STATE)?;
    SessionId::new(raw).map_err(|e| corrupt(cf::SESSIONS_BY_STATE, e.to_string()))
}

/// Extract the command ID from a `status || command_id` key.
///
/// # Errors
///
/// Returns `StoreError::CorruptKey` if the key is not 17 bytes.
pub fn command_id_from_coded_key(key: &[u8]) -> Result<CommandId> {
    command_id_from_tail(key, cf::COMMANDS_BY_STATUS)
}

/// Extract the command ID from a `session_id || 0x00 || command_id` key.
///
/// # Errors
///
/// Returns `StoreError::CorruptKey` if the key is shorter than a UUID.
pub fn command_id_from_session_key(key: &[u8]) -> Result<CommandId> {
    command_id_from_tail(key, cf::COMMANDS_BY_SESSION)
}

fn utf8_suffix<'a>(key: &'a [u8], cf_name: &'static str) -> Result<&'a str> {
    let suffix = key
        .get(1..)
        .ok_or_else(|| corrupt(cf_name, "empty key".to_string()))?;
    std::str::from_utf8(suffix).map_err(|e| corrupt(cf_name, e.to_string()))
}

fn command_id_from_tail(key: &[u8], cf_name: &'static str) -> Result<CommandId> {
    let start = key
        .len()
        .checked_sub(16)
        .ok_or_else(|| corrupt(cf_name, format!("key too short: {} bytes", key.len())))?;
    let bytes: [u8; 16] = key[start..]
        .try_into()
        .map_err(|_| corrupt(cf_name, "bad uuid length".to_string()))?;
    Ok(CommandId::from_uuid(uuid::Uuid::from_bytes(bytes)))
}

fn corrupt(cf: &'static str, reason: String) -> StoreError {
    StoreError::CorruptKey { cf, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coded_agent_key_roundtrip() {
        let agent_id = AgentId::new("k8s-1").unwrap();
        let key = coded_key(2, agent_id.as_bytes());
        assert_eq!(key[0], 2);
        assert_eq!(agent_id_from_coded_key(&key).unwrap(), agent_id);
    }

    #[test]
    fn session_command_key_roundtrip() {
        let session_id = SessionId::new("sess-1").unwrap();
        let command_id = CommandId::generate();

        let key = session_command_key(&session_id, &command_id);
        assert!(key.starts_with(&session_command_prefix(&session_id)));
        assert_eq!(command_id_from_session_key(&key).unwrap(), command_id);
    }

    #[test]
    fn session_prefix_does_not_match_longer_ids() {
        let short = SessionId::new("sess-1").unwrap();
        let long = SessionId::new("sess-10").unwrap();
        let key = session_command_key(&long, &CommandId::generate());

        assert!(!key.starts_with(&session_command_prefix(&short)));
    }

    #[test]
    fn short_command_key_is_corrupt() {
        assert!(matches!(
            command_id_from_coded_key(&[1, 2, 3]),
            Err(StoreError::CorruptKey { .. })
        ));
    }
}
