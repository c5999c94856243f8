//! Sailboat Simulation Server - authoritative real-time sailing physics
//!
//! Entry point. It wires together:
//! - the fixed-rate simulation task and its snapshot broadcast
//! - TCP sessions for interactive clients
//! - the HTTP monitor endpoint

mod app;
mod config;
mod game;
mod http;
mod net;
mod store;
mod util;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::Config;
use crate::game::{Simulation, SimulationRunner, SnapshotServer};
use crate::http::build_router;
use crate::store::FileStore;
use crate::util::time::init_server_time;

/// Snapshots buffered per subscriber before it is marked lagging
const SNAPSHOT_BACKLOG: usize = 16;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(&config.log_level);
    init_server_time();

    info!("Starting Sailboat Simulation Server");
    info!(data_dir = %config.data_dir.display(), sim = %config.sim_name, "Loading simulation");

    let store = FileStore::new(&config.data_dir);
    let loaded = store
        .load_simulation(&config.sim_name, &config.admin_code)
        .with_context(|| format!("failed to load simulation '{}'", config.sim_name))?;

    let snapshots = Arc::new(SnapshotServer::new(SNAPSHOT_BACKLOG));
    let sim = Simulation::new(loaded, rand::random());
    let (runner, handle) = SimulationRunner::new(sim, store, snapshots);
    let mut runner_task = tokio::spawn(runner.run());

    let state = AppState::new(config.clone(), handle.clone());
    let (stop_tx, stop_rx) = watch::channel(false);

    let tcp_listener = TcpListener::bind(config.server_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server_addr))?;
    let http_listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;

    info!("Simulation server listening on {}", config.server_addr);
    info!("Monitor endpoint: http://{}/data.json", config.http_addr);

    let tcp_task = tokio::spawn(net::serve(
        tcp_listener,
        state.clone(),
        stopped(stop_rx.clone()),
    ));

    let router = build_router(state);
    let http_task = tokio::spawn(async move {
        axum::serve(http_listener, router)
            .with_graceful_shutdown(stopped(stop_rx))
            .await
    });

    let runner_done = tokio::select! {
        _ = shutdown_signal() => false,
        result = &mut runner_task => {
            if let Err(e) = result {
                error!(error = %e, "Simulation task failed");
            }
            warn!("Simulation stopped, shutting down servers");
            true
        }
    };

    let _ = stop_tx.send(true);

    if !runner_done {
        // Final save happens inside the tick task
        handle.shutdown().await;
        if let Err(e) = runner_task.await {
            error!(error = %e, "Simulation task failed during shutdown");
        }
    }

    match tcp_task.await {
        Ok(Err(e)) => error!(error = %e, "TCP server error"),
        Err(e) => error!(error = %e, "TCP server task failed"),
        Ok(Ok(())) => {}
    }
    match http_task.await {
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Resolves once the stop flag is raised or its sender is gone
async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
