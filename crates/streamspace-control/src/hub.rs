//! Agent registry and connection hub.
//!
//! The hub maps each `AgentId` to exactly one live outbound channel. A new
//! registration for the same agent atomically replaces the previous channel;
//! dropping the old sender closes it, so the superseded connection's writer
//! observes the close and shuts down.
//!
//! Membership changes (register, deregister, release) are serialized by one
//! mutex per hub, so the persisted agent row and the in-memory map always
//! agree on the current connection. The map itself sits behind a `RwLock`
//! that is only write-locked for the swap, never across store I/O, so
//! liveness checks do not wait on disk. Liveness reflects the current
//! registration, not heartbeat age.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use streamspace_core::{
    AgentId, AgentPlatform, AgentStatus, ConnectionId, ControlMessage, HeartbeatPayload,
    ShutdownMessage,
};
use streamspace_store::{Agent, Store};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};

/// What an agent announces when it connects.
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    /// Stable, operator-assigned identifier.
    pub agent_id: AgentId,
    /// Platform the agent manages.
    pub platform: AgentPlatform,
    /// Free-form locality hint.
    pub region: Option<String>,
    /// Resource limits, opaque.
    pub capacity: Option<serde_json::Value>,
    /// Platform-specific metadata, opaque.
    pub metadata: Option<serde_json::Value>,
}

impl AgentRegistration {
    /// A registration with no region, capacity or metadata.
    #[must_use]
    pub const fn new(agent_id: AgentId, platform: AgentPlatform) -> Self {
        Self {
            agent_id,
            platform,
            region: None,
            capacity: None,
            metadata: None,
        }
    }
}

/// Diagnostic view of a live connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectedAgent {
    /// The agent.
    pub agent_id: AgentId,
    /// Its current connection.
    pub connection_id: ConnectionId,
    /// When the connection registered.
    pub connected_at: DateTime<Utc>,
    /// Last heartbeat, or the registration time if none yet.
    pub last_heartbeat: DateTime<Utc>,
}

struct AgentConnection {
    connection_id: ConnectionId,
    sender: mpsc::Sender<ControlMessage>,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

/// Registry of live agent channels.
pub struct ConnectionHub<S: Store> {
    store: Arc<S>,
    connections: RwLock<HashMap<AgentId, AgentConnection>>,
    membership: Mutex<()>,
    dispatch_timeout: Duration,
    channel_capacity: usize,
}

impl<S: Store> ConnectionHub<S> {
    /// Create an empty hub.
    #[must_use]
    pub fn new(store: Arc<S>, dispatch_timeout: Duration, channel_capacity: usize) -> Self {
        Self {
            store,
            connections: RwLock::new(HashMap::new()),
            membership: Mutex::new(()),
            dispatch_timeout,
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Create a bounded outbound channel sized for this hub.
    #[must_use]
    pub fn open_channel(&self) -> (mpsc::Sender<ControlMessage>, mpsc::Receiver<ControlMessage>) {
        mpsc::channel(self.channel_capacity)
    }

    /// Register `sender` as the agent's only channel.
    ///
    /// Any previous channel for the agent is dropped (and therefore closed).
    /// The agent row is upserted online with the new connection id.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Persistence` if the agent row cannot be
    /// written; the channel is not registered in that case.
    pub fn register(
        &self,
        registration: AgentRegistration,
        sender: mpsc::Sender<ControlMessage>,
    ) -> Result<ConnectionId> {
        let connection_id = ConnectionId::generate();
        let now = Utc::now();

        let _membership = self.membership.lock();

        let existing = self.store.get_agent(&registration.agent_id)?;
        let created_at = existing.as_ref().map_or(now, |a| a.created_at);
        let agent = Agent {
            agent_id: registration.agent_id.clone(),
            platform: registration.platform,
            region: registration.region,
            status: AgentStatus::Online,
            connection_id: Some(connection_id),
            last_heartbeat: Some(now),
            active_sessions: existing.as_ref().map_or(0, |a| a.active_sessions),
            capacity: registration
                .capacity
                .or_else(|| existing.as_ref().and_then(|a| a.capacity.clone())),
            metadata: registration
                .metadata
                .or_else(|| existing.and_then(|a| a.metadata)),
            created_at,
            updated_at: now,
        };
        self.store.put_agent(&agent)?;

        let previous = self.connections.write().insert(
            registration.agent_id.clone(),
            AgentConnection {
                connection_id,
                sender,
                connected_at: now,
                last_heartbeat: now,
            },
        );

        if let Some(previous) = previous {
            info!(
                agent_id = %registration.agent_id,
                old_connection = %previous.connection_id,
                new_connection = %connection_id,
                "Agent reconnected, superseding previous channel"
            );
        } else {
            info!(
                agent_id = %registration.agent_id,
                connection_id = %connection_id,
                "Agent registered"
            );
        }

        Ok(connection_id)
    }

    /// Remove the agent's channel, whatever connection it belongs to, and
    /// mark the agent offline.
    ///
    /// Returns whether a channel was registered.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Persistence` if the agent row cannot be
    /// updated. The in-memory entry is removed regardless.
    pub fn deregister(&self, agent_id: &AgentId) -> Result<bool> {
        let _membership = self.membership.lock();
        let Some(removed) = self.connections.write().remove(agent_id) else {
            return Ok(false);
        };
        info!(agent_id = %agent_id, connection_id = %removed.connection_id, "Agent deregistered");
        self.persist_disconnect(agent_id, &removed.connection_id)?;
        Ok(true)
    }

    /// Remove the agent's channel only if it still belongs to
    /// `connection_id`.
    ///
    /// A superseded connection closing never evicts its successor. Returns
    /// whether an entry was removed.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Persistence` if the agent row cannot be
    /// updated.
    pub fn release(&self, agent_id: &AgentId, connection_id: &ConnectionId) -> Result<bool> {
        let _membership = self.membership.lock();
        let removed = {
            let mut connections = self.connections.write();
            let owned = connections
                .get(agent_id)
                .is_some_and(|c| c.connection_id == *connection_id);
            owned && connections.remove(agent_id).is_some()
        };
        if !removed {
            debug!(
                agent_id = %agent_id,
                connection_id = %connection_id,
                "Ignoring release of superseded connection"
            );
            return Ok(false);
        }
        info!(agent_id = %agent_id, connection_id = %connection_id, "Agent connection released");
        self.persist_disconnect(agent_id, connection_id)?;
        Ok(true)
    }

    fn persist_disconnect(&self, agent_id: &AgentId, connection_id: &ConnectionId) -> Result<()> {
        match self.store.mark_agent_disconnected(agent_id, connection_id) {
            Ok(_) | Err(streamspace_store::StoreError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns true if the agent currently has an open registered channel.
    #[must_use]
    pub fn is_agent_connected(&self, agent_id: &AgentId) -> bool {
        self.connections
            .read()
            .get(agent_id)
            .is_some_and(|c| !c.sender.is_closed())
    }

    /// The agent's current connection id, if registered.
    #[must_use]
    pub fn connection_id(&self, agent_id: &AgentId) -> Option<ConnectionId> {
        self.connections.read().get(agent_id).map(|c| c.connection_id)
    }

    /// Send a message on the agent's current channel.
    ///
    /// The send is bounded by the dispatch timeout and never waits for an
    /// agent reply.
    ///
    /// # Errors
    ///
    /// - `ControlError::AgentUnavailable` if the agent has no channel, or the
    ///   channel turned out to be closed (the stale entry is released).
    /// - `ControlError::ChannelSaturated` if the channel stayed full for the
    ///   whole timeout.
    pub async fn send(&self, agent_id: &AgentId, message: ControlMessage) -> Result<()> {
        let (sender, connection_id) = {
            let connections = self.connections.read();
            match connections.get(agent_id) {
                Some(c) => (c.sender.clone(), c.connection_id),
                None => return Err(ControlError::AgentUnavailable(agent_id.clone())),
            }
        };

        match sender.send_timeout(message, self.dispatch_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(message)) => {
                warn!(
                    agent_id = %agent_id,
                    message_type = message.message_type(),
                    timeout_ms = u64::try_from(self.dispatch_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Agent channel saturated, dropping message"
                );
                Err(ControlError::ChannelSaturated(agent_id.clone()))
            }
            Err(SendTimeoutError::Closed(_)) => {
                warn!(agent_id = %agent_id, "Agent channel closed, releasing stale connection");
                self.release(agent_id, &connection_id)?;
                Err(ControlError::AgentUnavailable(agent_id.clone()))
            }
        }
    }

    /// Record a heartbeat in memory and in the agent row.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::AgentUnavailable` if the agent is not
    /// registered, or `ControlError::Persistence` if the row cannot be
    /// written.
    pub fn record_heartbeat(
        &self,
        agent_id: &AgentId,
        heartbeat: &HeartbeatPayload,
        at: DateTime<Utc>,
    ) -> Result<()> {
        {
            let mut connections = self.connections.write();
            let connection = connections
                .get_mut(agent_id)
                .ok_or_else(|| ControlError::AgentUnavailable(agent_id.clone()))?;
            connection.last_heartbeat = at;
        }
        self.store.record_agent_heartbeat(agent_id, heartbeat, at)?;
        debug!(
            agent_id = %agent_id,
            active_sessions = heartbeat.active_sessions,
            "Heartbeat recorded"
        );
        Ok(())
    }

    /// Release every connection whose last heartbeat is older than
    /// `max_age` at `now`. Returns the agents that were released.
    pub fn sweep_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> Vec<AgentId> {
        let cutoff = now - max_age;
        let stale: Vec<(AgentId, ConnectionId)> = self
            .connections
            .read()
            .iter()
            .filter(|(_, c)| c.last_heartbeat < cutoff)
            .map(|(id, c)| (id.clone(), c.connection_id))
            .collect();

        let mut released = Vec::with_capacity(stale.len());
        for (agent_id, connection_id) in stale {
            match self.release(&agent_id, &connection_id) {
                Ok(true) => {
                    warn!(agent_id = %agent_id, "Agent heartbeat timed out, connection released");
                    released.push(agent_id);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Failed to persist stale agent release");
                    released.push(agent_id);
                }
            }
        }
        released
    }

    /// Ask an agent to drain and mark it `draining`.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown message cannot be sent or the agent
    /// row cannot be updated.
    pub async fn shutdown_agent(&self, agent_id: &AgentId, reason: Option<String>) -> Result<()> {
        self.send(agent_id, ControlMessage::Shutdown(ShutdownMessage { reason }))
            .await?;
        self.store
            .update_agent_status(agent_id, AgentStatus::Draining)?;
        info!(agent_id = %agent_id, "Agent asked to drain");
        Ok(())
    }

    /// List live connections, ordered by agent id.
    #[must_use]
    pub fn connected_agents(&self) -> Vec<ConnectedAgent> {
        let mut agents: Vec<_> = self
            .connections
            .read()
            .iter()
            .map(|(agent_id, c)| ConnectedAgent {
                agent_id: agent_id.clone(),
                connection_id: c.connection_id,
                connected_at: c.connected_at,
                last_heartbeat: c.last_heartbeat,
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Check if no agent is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamspace_store::RocksStore;
    use tempfile::TempDir;

    use crate::faulty_store::FaultyStore;

    fn create_hub() -> (ConnectionHub<RocksStore>, Arc<RocksStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let hub = ConnectionHub::new(Arc::clone(&store), Duration::from_millis(50), 4);
        (hub, store, dir)
    }

    fn registration(name: &str) -> AgentRegistration {
        AgentRegistration::new(AgentId::new(name).unwrap(), AgentPlatform::Kubernetes)
    }

    #[tokio::test]
    async fn register_marks_agent_online() {
        let (hub, store, _dir) = create_hub();
        let (tx, _rx) = hub.open_channel();
        let reg = registration("k8s-1");

        let connection_id = hub.register(reg.clone(), tx).unwrap();

        assert!(hub.is_agent_connected(&reg.agent_id));
        let agent = store.get_agent(&reg.agent_id).unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(agent.connection_id, Some(connection_id));
    }

    #[tokio::test]
    async fn deregistered_agent_is_not_connected() {
        let (hub, store, _dir) = create_hub();
        let (tx, _rx) = hub.open_channel();
        let reg = registration("k8s-1");
        hub.register(reg.clone(), tx).unwrap();

        assert!(hub.deregister(&reg.agent_id).unwrap());
        assert!(!hub.is_agent_connected(&reg.agent_id));
        assert!(!hub.deregister(&reg.agent_id).unwrap());

        let agent = store.get_agent(&reg.agent_id).unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
        assert!(agent.connection_id.is_none());
    }

    #[tokio::test]
    async fn superseded_release_keeps_successor() {
        let (hub, _store, _dir) = create_hub();
        let reg = registration("agent-x");
        let (tx_a, _rx_a) = hub.open_channel();
        let (tx_b, _rx_b) = hub.open_channel();

        let conn_a = hub.register(reg.clone(), tx_a).unwrap();
        let conn_b = hub.register(reg.clone(), tx_b).unwrap();

        assert!(!hub.release(&reg.agent_id, &conn_a).unwrap());
        assert!(hub.is_agent_connected(&reg.agent_id));
        assert_eq!(hub.connection_id(&reg.agent_id), Some(conn_b));
    }

    #[tokio::test]
    async fn agent_rows_are_written_outside_the_map_lock() {
        let store = Arc::new(FaultyStore::new());
        let hub = Arc::new(ConnectionHub::new(
            Arc::clone(&store),
            Duration::from_millis(50),
            4,
        ));
        let map_free = Arc::new(Mutex::new(Vec::new()));
        {
            let hub = Arc::downgrade(&hub);
            let map_free = Arc::clone(&map_free);
            store.on_agent_write(move |_| {
                if let Some(hub) = hub.upgrade() {
                    map_free.lock().push(hub.connections.try_read().is_some());
                }
            });
        }

        let reg = registration("k8s-1");
        let (tx_a, _rx_a) = hub.open_channel();
        let (tx_b, _rx_b) = hub.open_channel();
        hub.register(reg.clone(), tx_a).unwrap();
        let conn_b = hub.register(reg.clone(), tx_b).unwrap();
        assert!(hub.release(&reg.agent_id, &conn_b).unwrap());
        let (tx_c, _rx_c) = hub.open_channel();
        hub.register(reg.clone(), tx_c).unwrap();
        assert!(hub.deregister(&reg.agent_id).unwrap());

        let map_free = map_free.lock();
        assert_eq!(map_free.len(), 5);
        assert!(map_free.iter().all(|free| *free));
    }

    #[tokio::test]
    async fn send_to_unknown_agent_is_unavailable() {
        let (hub, _store, _dir) = create_hub();
        let agent_id = AgentId::new("ghost").unwrap();
        let err = hub.send(&agent_id, ControlMessage::Ping).await.unwrap_err();
        assert!(matches!(err, ControlError::AgentUnavailable(_)));
    }

    #[tokio::test]
    async fn closed_channel_is_released() {
        let (hub, _store, _dir) = create_hub();
        let reg = registration("k8s-1");
        let (tx, rx) = hub.open_channel();
        hub.register(reg.clone(), tx).unwrap();

        drop(rx);
        assert!(!hub.is_agent_connected(&reg.agent_id));

        let err = hub.send(&reg.agent_id, ControlMessage::Ping).await.unwrap_err();
        assert!(matches!(err, ControlError::AgentUnavailable(_)));
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn full_channel_times_out() {
        let (hub, _store, _dir) = create_hub();
        let reg = registration("slow-1");
        let (tx, _rx) = mpsc::channel(1);
        hub.register(reg.clone(), tx).unwrap();

        hub.send(&reg.agent_id, ControlMessage::Ping).await.unwrap();
        let err = hub.send(&reg.agent_id, ControlMessage::Ping).await.unwrap_err();
        assert!(matches!(err, ControlError::ChannelSaturated(_)));
        // Saturation is not a disconnect.
        assert!(hub.is_agent_connected(&reg.agent_id));
    }

    #[tokio::test]
    async fn heartbeat_updates_store_and_sweep() {
        let (hub, store, _dir) = create_hub();
        let reg = registration("k8s-1");
        let (tx, _rx) = hub.open_channel();
        hub.register(reg.clone(), tx).unwrap();

        let now = Utc::now();
        let heartbeat = HeartbeatPayload {
            status: AgentStatus::Online,
            active_sessions: 2,
            capacity: None,
        };
        hub.record_heartbeat(&reg.agent_id, &heartbeat, now).unwrap();
        assert_eq!(
            store.get_agent(&reg.agent_id).unwrap().unwrap().active_sessions,
            2
        );

        let max_age = chrono::Duration::seconds(30);
        assert!(hub.sweep_stale(now + chrono::Duration::seconds(10), max_age).is_empty());
        let released = hub.sweep_stale(now + chrono::Duration::seconds(31), max_age);
        assert_eq!(released, vec![reg.agent_id.clone()]);
        assert!(!hub.is_agent_connected(&reg.agent_id));
    }

    #[tokio::test]
    async fn shutdown_marks_draining() {
        let (hub, store, _dir) = create_hub();
        let reg = registration("vm-1");
        let (tx, mut rx) = hub.open_channel();
        hub.register(reg.clone(), tx).unwrap();

        hub.shutdown_agent(&reg.agent_id, Some("maintenance".into()))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ControlMessage::Shutdown(msg) => assert_eq!(msg.reason.as_deref(), Some("maintenance")),
            other => panic!("expected shutdown, got {other:?}"),
        }
        assert_eq!(
            store.get_agent(&reg.agent_id).unwrap().unwrap().status,
            AgentStatus::Draining
        );
    }

    #[tokio::test]
    async fn connected_agents_are_sorted() {
        let (hub, _store, _dir) = create_hub();
        let mut receivers = Vec::new();
        for name in ["k8s-2", "docker-1", "k8s-1"] {
            let (tx, rx) = hub.open_channel();
            hub.register(registration(name), tx).unwrap();
            receivers.push(rx);
        }
        let ids: Vec<_> = hub
            .connected_agents()
            .into_iter()
            .map(|a| a.agent_id.to_string())
            .collect();
        assert_eq!(ids, vec!["docker-1", "k8s-1", "k8s-2"]);
    }
}
