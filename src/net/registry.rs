//! Live TCP connections, keyed by connection id

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// One open socket
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    /// Set once the connection has joined
    pub username: Option<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, ConnectionInfo>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: SocketAddr) -> Uuid {
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            ConnectionInfo {
                peer,
                username: None,
                connected_at: Utc::now(),
            },
        );
        id
    }

    pub fn identify(&self, id: Uuid, username: &str) {
        if let Some(mut info) = self.connections.get_mut(&id) {
            info.username = Some(username.to_string());
        }
    }

    pub fn remove(&self, id: Uuid) -> Option<ConnectionInfo> {
        self.connections.remove(&id).map(|(_, info)| info)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of connections currently attached to `username`
    pub fn count_user(&self, username: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.username.as_deref() == Some(username))
            .count()
    }

    /// Connections that have joined
    pub fn joined(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.username.is_some())
            .count()
    }
}
