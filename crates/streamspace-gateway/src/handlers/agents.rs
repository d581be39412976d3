//! Agent WebSocket endpoint.
//!
//! Each agent holds one socket. The upgrade registers it with the connection
//! hub, a writer task drains the hub channel into text frames (pinging on
//! idle), and the read loop feeds every frame to the message router. When
//! either side ends, the connection is released unless a newer one has
//! already taken over.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use streamspace_control::{AgentRegistration, ControlError, ControlPlane};
use streamspace_core::{AgentId, AgentPlatform, ControlMessage};
use streamspace_store::Store;

use crate::error::ApiError;
use crate::state::GatewayState;

/// Query parameters of the agent connect request.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Stable agent identifier.
    pub agent_id: String,
    /// `kubernetes`, `docker`, `vm` or `cloud`.
    pub platform: String,
    /// Optional locality hint.
    #[serde(default)]
    pub region: Option<String>,
}

impl ConnectParams {
    fn into_registration(self) -> Result<AgentRegistration, ApiError> {
        let agent_id =
            AgentId::new(self.agent_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let platform = AgentPlatform::parse(&self.platform).ok_or_else(|| {
            ApiError::BadRequest(format!("unknown platform '{}'", self.platform))
        })?;
        Ok(AgentRegistration {
            region: self.region,
            ..AgentRegistration::new(agent_id, platform)
        })
    }
}

/// Upgrade an agent connection.
///
/// # Errors
///
/// Returns `ApiError::BadRequest` for an invalid agent id or platform.
pub async fn connect_agent<S>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState<S>>>,
    Query(params): Query<ConnectParams>,
) -> Result<Response, ApiError>
where
    S: Store + 'static,
{
    let registration = params.into_registration()?;
    tracing::info!(
        agent_id = %registration.agent_id,
        platform = ?registration.platform,
        region = ?registration.region,
        "Agent connection initiated"
    );

    Ok(ws.on_upgrade(move |socket| handle_agent_socket(socket, state, registration)))
}

async fn handle_agent_socket<S>(
    socket: WebSocket,
    state: Arc<GatewayState<S>>,
    registration: AgentRegistration,
) where
    S: Store + 'static,
{
    let agent_id = registration.agent_id.clone();
    let ping_interval = state.control.config().ping_interval();
    let (sink, stream) = socket.split();

    // The writer runs before registration so pending commands flushed on
    // connect never wait on a full channel.
    let (tx, rx) = state.control.hub().open_channel();
    let mut writer = tokio::spawn(write_frames(sink, rx, ping_interval, agent_id.clone()));

    let connection_id = match state.control.connect_agent(registration, tx).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(agent_id = %agent_id, error = %e, "Agent registration failed");
            writer.abort();
            return;
        }
    };

    tokio::select! {
        () = read_frames(stream, &state, &agent_id) => {}
        _ = &mut writer => {
            tracing::debug!(agent_id = %agent_id, "Agent writer ended");
        }
    }
    writer.abort();

    match state
        .control
        .disconnect_agent(&agent_id, &connection_id)
        .await
    {
        Ok(true) => tracing::info!(agent_id = %agent_id, "Agent disconnected"),
        Ok(false) => {
            tracing::debug!(agent_id = %agent_id, "Superseded agent connection closed");
        }
        Err(e) => {
            tracing::warn!(agent_id = %agent_id, error = %e, "Failed to record agent disconnect");
        }
    }
}

/// Forward outbound messages to the agent, pinging every `ping_interval`.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ControlMessage>,
    ping_interval: Duration,
    agent_id: AgentId,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;

    loop {
        let message = tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(message) => message,
                // Channel replaced or released
                None => break,
            },
            _ = ping.tick() => ControlMessage::Ping,
        };

        let text = match message.to_envelope(Utc::now()).and_then(|e| e.encode()) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, error = %e, "Failed to encode message for agent");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            tracing::debug!(agent_id = %agent_id, error = %e, "Agent socket write failed");
            return;
        }
    }

    if let Err(e) = sink.send(Message::Close(None)).await {
        tracing::debug!(agent_id = %agent_id, error = %e, "Failed to close agent socket");
    }
}

/// Route inbound frames until the agent closes the socket.
async fn read_frames<S>(
    mut stream: SplitStream<WebSocket>,
    state: &GatewayState<S>,
    agent_id: &AgentId,
) where
    S: Store + 'static,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match state.control.router().handle_text(agent_id, &text) {
                Ok(()) | Err(ControlError::ProtocolAnomaly { .. }) => {}
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "Failed to apply agent message");
                }
            },
            Ok(Message::Binary(_)) => {
                tracing::warn!(agent_id = %agent_id, "Ignoring binary frame from agent");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                tracing::debug!(agent_id = %agent_id, "Agent closed connection");
                break;
            }
            Err(e) => {
                tracing::debug!(agent_id = %agent_id, error = %e, "Agent socket read failed");
                break;
            }
        }
    }
}
