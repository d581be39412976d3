//! Session event stream for UI clients.
//!
//! Every session change the control plane applies is pushed as a JSON text
//! frame. Slow clients lose the oldest events rather than holding up the
//! control plane.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

use streamspace_control::SessionEvent;
use streamspace_store::Store;

use crate::state::GatewayState;

/// Upgrade to a session event stream.
pub async fn session_events<S>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState<S>>>,
) -> Response
where
    S: Store + 'static,
{
    let events = state.events.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, events))
}

async fn stream_events(mut socket: WebSocket, mut events: Receiver<SessionEvent>) {
    tracing::debug!("Session event subscriber connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to encode session event");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Session event subscriber lagging");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!("Session event subscriber disconnected");
}
