//! Application state shared by the TCP and HTTP servers

use std::sync::Arc;

use crate::config::Config;
use crate::game::{SimulationHandle, SnapshotServer};
use crate::net::registry::ConnectionRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sim: SimulationHandle,
    pub connections: Arc<ConnectionRegistry>,
}

impl AppState {
    pub fn new(config: Config, sim: SimulationHandle) -> Self {
        Self {
            config: Arc::new(config),
            sim,
            connections: Arc::new(ConnectionRegistry::new()),
        }
    }

    pub fn snapshots(&self) -> &Arc<SnapshotServer> {
        self.sim.snapshots()
    }
}
