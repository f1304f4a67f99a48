//! ducking-daemon: background audio ducking coordinator
//!
//! This daemon provides:
//! - A single protected source, persisted across restarts
//! - An activity monitor that ducks the protected source while others play
//! - IPC server for the UI, the host and per-source agents

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ducking_daemon::channel::SourceRouter;
use ducking_daemon::config::Config;
use ducking_daemon::coordinator::Coordinator;
use ducking_daemon::events::CoordinatorEvent;
use ducking_daemon::ipc::Server;
use ducking_daemon::lifecycle::ShutdownSignal;
use ducking_daemon::store::FileStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "ducking-daemon starting");

    let config = Config::load()?;
    config.ensure_dirs().context("failed to create data directory")?;
    info!(?config.socket_path, ?config.state_path, "configuration loaded");

    let mut shutdown = ShutdownSignal::new().context("failed to register signal handlers")?;

    // Coordinator -> IPC subscribers and the log
    let (event_tx, mut event_rx) = broadcast::channel::<CoordinatorEvent>(64);

    let coordinator = Coordinator::new(
        config.coordinator,
        Arc::new(FileStore::new(&config.state_path)),
        SourceRouter::new(),
        event_tx,
    );

    let server = Server::new(&config.socket_path, coordinator.clone())?;

    // Agents reconnect after a restart; give the protected one time to show up
    let resuming = coordinator.clone();
    tokio::spawn(async move { resuming.resume().await });

    info!("daemon initialized, entering main loop");

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "IPC server error");
            }
        }

        _ = async {
            loop {
                match event_rx.recv().await {
                    Ok(event) => info!(%event, "coordinator event"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "event log receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        } => {
            info!("event stream closed");
        }

        signal = shutdown.wait() => {
            info!(signal, "shutdown signal received");
        }
    }

    info!("shutting down...");

    // Leave the protected source at its original volume, keep the persisted state
    coordinator.shutdown().await;
    server.shutdown().await;

    info!("ducking-daemon stopped");

    Ok(())
}
