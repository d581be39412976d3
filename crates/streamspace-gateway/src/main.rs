//! `StreamSpace` Gateway - control plane process.
//!
//! Opens the store, builds the control plane, starts the session reconciler
//! and the heartbeat sweeper, and serves agent and UI connections until
//! ctrl-c.
//!
//! # Configuration
//!
//! - `LISTEN_ADDR`, `DATA_DIR` for the gateway
//! - `RECONCILE_INTERVAL_SECS`, `STUCK_THRESHOLD_SECS`,
//!   `FORCE_CLEANUP_THRESHOLD_SECS`, `DISPATCH_TIMEOUT_MS`,
//!   `AGENT_CHANNEL_CAPACITY`, `HEARTBEAT_TIMEOUT_SECS`,
//!   `PING_INTERVAL_SECS` for the control plane
//! - `RUST_LOG` for log filtering

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamspace_control::{BroadcastNotifier, ControlConfig, ControlPlaneService, SessionNotifier};
use streamspace_gateway::{create_router, GatewayConfig, GatewayState};
use streamspace_store::RocksStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,streamspace=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting StreamSpace Gateway");

    let gateway_config = GatewayConfig::from_env();
    let control_config = ControlConfig::from_env();
    control_config.validate()?;

    tracing::info!(
        listen_addr = %gateway_config.listen_addr,
        data_dir = %gateway_config.data_dir,
        reconcile_interval_secs = control_config.reconcile_interval_seconds,
        stuck_threshold_secs = control_config.stuck_threshold_seconds,
        force_cleanup_threshold_secs = control_config.force_cleanup_threshold_seconds,
        "Configuration loaded"
    );

    tracing::info!(path = %gateway_config.data_dir, "Opening RocksDB store");
    let store = Arc::new(RocksStore::open(&gateway_config.data_dir)?);

    let events = Arc::new(BroadcastNotifier::default());
    let control = Arc::new(ControlPlaneService::new(
        store,
        control_config,
        Arc::clone(&events) as Arc<dyn SessionNotifier>,
    ));

    // Background loops
    let cancel = CancellationToken::new();
    let reconciler = tokio::spawn({
        let reconciler = Arc::clone(control.reconciler());
        let cancel = cancel.clone();
        async move { reconciler.run(cancel).await }
    });
    let sweeper = tokio::spawn({
        let control = Arc::clone(&control);
        let cancel = cancel.clone();
        async move { control.run_heartbeat_sweeper(cancel).await }
    });

    let listen_addr = gateway_config.listen_addr.clone();
    let app = create_router(GatewayState::new(control, events, gateway_config));

    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    if let Err(e) = reconciler.await {
        tracing::error!(error = %e, "Reconciler task failed");
    }
    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "Heartbeat sweeper task failed");
    }

    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
            tracing::info!("Shutdown requested");
        }
        () = cancel.cancelled() => {}
    }
    cancel.cancel();
}
