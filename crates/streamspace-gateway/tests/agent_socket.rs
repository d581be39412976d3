//! A fake agent speaking the wire protocol over a real socket.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use streamspace_control::{
    BroadcastNotifier, ControlConfig, ControlPlane, ControlPlaneService, SessionNotifier,
};
use streamspace_core::{AgentId, Envelope, SessionId, SessionSpec, SessionState};
use streamspace_gateway::{create_router, GatewayConfig, GatewayState};
use streamspace_store::{RocksStore, Store};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve() -> (String, Arc<ControlPlaneService<RocksStore>>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(RocksStore::open(dir.path()).unwrap());
    let events = Arc::new(BroadcastNotifier::default());
    let control = Arc::new(ControlPlaneService::new(
        store,
        ControlConfig::default(),
        Arc::clone(&events) as Arc<dyn SessionNotifier>,
    ));
    let app = create_router(GatewayState::new(
        Arc::clone(&control),
        events,
        GatewayConfig::default(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("ws://{addr}"), control, dir)
}

async fn connect(base: &str, agent: &str) -> AgentSocket {
    let url = format!("{base}/v1/agents/connect?agent_id={agent}&platform=kubernetes");
    let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    socket
}

async fn next_envelope(socket: &mut AgentSocket) -> Envelope {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = frame {
            return Envelope::decode(&text).unwrap();
        }
    }
}

async fn wait_for<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

fn frame(message_type: &str, payload: serde_json::Value) -> Message {
    Message::Text(json!({ "type": message_type, "payload": payload }).to_string())
}

#[tokio::test]
async fn agent_runs_session_end_to_end() {
    let (base, control, _dir) = serve().await;
    let agent_id = AgentId::new("k8s-1").unwrap();
    let session_id = SessionId::new("sess-1").unwrap();

    let mut socket = connect(&base, "k8s-1").await;
    wait_for(|| control.hub().is_agent_connected(&agent_id)).await;

    let issued = control
        .start_session(&session_id, &agent_id, SessionSpec::for_template("firefox"))
        .await
        .unwrap();
    assert!(issued.dispatched);

    let envelope = next_envelope(&mut socket).await;
    assert_eq!(envelope.message_type, "command");
    assert_eq!(envelope.payload["action"], "start_session");
    let command_id = envelope.payload["command_id"].clone();

    socket
        .send(frame("ack", json!({ "command_id": command_id })))
        .await
        .unwrap();
    socket
        .send(frame(
            "complete",
            json!({ "command_id": command_id, "result": { "endpoint": "wss://k8s-1/sess-1" } }),
        ))
        .await
        .unwrap();

    let store = Arc::clone(control.store());
    wait_for(|| {
        store
            .get_session(&session_id)
            .unwrap()
            .is_some_and(|s| s.state == SessionState::Running)
    })
    .await;
}

#[tokio::test]
async fn pending_commands_flush_on_connect() {
    let (base, control, _dir) = serve().await;
    let agent_id = AgentId::new("docker-1").unwrap();
    let session_id = SessionId::new("sess-9").unwrap();

    let issued = control
        .start_session(&session_id, &agent_id, SessionSpec::for_template("vscode"))
        .await
        .unwrap();
    assert!(!issued.dispatched);

    let mut socket = connect(&base, "docker-1").await;
    let envelope = next_envelope(&mut socket).await;
    assert_eq!(envelope.message_type, "command");
    assert_eq!(
        envelope.payload["command_id"],
        json!(issued.command.command_id)
    );
}

#[tokio::test]
async fn closing_socket_disconnects_agent() {
    let (base, control, _dir) = serve().await;
    let agent_id = AgentId::new("k8s-2").unwrap();

    let mut socket = connect(&base, "k8s-2").await;
    wait_for(|| control.hub().is_agent_connected(&agent_id)).await;

    // Garbage is dropped without closing the connection.
    socket.send(Message::Text("not json".into())).await.unwrap();
    socket
        .send(frame("heartbeat", json!({ "active_sessions": 2 })))
        .await
        .unwrap();
    let store = Arc::clone(control.store());
    wait_for(|| {
        store
            .get_agent(&agent_id)
            .unwrap()
            .is_some_and(|a| a.active_sessions == 2)
    })
    .await;

    socket.close(None).await.unwrap();
    wait_for(|| !control.hub().is_agent_connected(&agent_id)).await;
}
