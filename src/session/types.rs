//! Session Types and Data Structures

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::ssh::{ConnectionConfig, RemoteConnection};

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// A session entry in the registry
pub(crate) struct SessionEntry {
    pub id: String,
    pub config: ConnectionConfig,
    pub state: ConnectionState,
    /// Present exactly while `state` is `Connected`
    pub connection: Option<Arc<dyn RemoteConnection>>,
    pub created_at: DateTime<Utc>,
    /// Monotonic clock for the inactivity sweep
    pub last_activity: Instant,
    /// Wall clock copy of `last_activity` for display
    pub last_activity_at: DateTime<Utc>,
}

impl SessionEntry {
    pub fn new(id: String, config: ConnectionConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            config,
            state: ConnectionState::Disconnected,
            connection: None,
            created_at: now,
            last_activity: Instant::now(),
            last_activity_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }
}

/// Session snapshot handed out by the registry. Carries no credentials.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub hostname: String,
    pub port: i64,
    pub username: String,
    pub connection_state: ConnectionState,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionInfo {
    /// `hostname:username`, the rate-limit key
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.hostname, self.username)
    }
}

impl From<&SessionEntry> for SessionInfo {
    fn from(entry: &SessionEntry) -> Self {
        Self {
            id: entry.id.clone(),
            hostname: entry.config.hostname.clone(),
            port: entry.config.port,
            username: entry.config.username.clone(),
            connection_state: entry.state,
            connected: entry.state == ConnectionState::Connected,
            created_at: entry.created_at,
            last_activity: entry.last_activity_at,
        }
    }
}
