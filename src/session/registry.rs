//! Session Registry
//!
//! Authoritative map of session id to config, connection state and live
//! connection. DashMap entry guards are only held for field updates, never
//! across a network call.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EventBus, SessionEvent};
use super::types::{ConnectionState, SessionEntry, SessionInfo};
use crate::config::SshSettings;
use crate::error::BridgeError;
use crate::security::SecurityGate;
use crate::ssh::{ConnectionConfig, Connector, RemoteConnection};

pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    gate: Arc<SecurityGate>,
    connector: Arc<dyn Connector>,
    ssh: SshSettings,
    events: EventBus,
}

impl SessionRegistry {
    pub fn new(gate: Arc<SecurityGate>, connector: Arc<dyn Connector>, ssh: SshSettings) -> Self {
        Self {
            sessions: DashMap::new(),
            gate,
            connector,
            ssh,
            events: EventBus::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn gate(&self) -> &Arc<SecurityGate> {
        &self.gate
    }

    /// Validate, rate-limit and register a new session in `disconnected`
    pub fn create_session(&self, config: ConnectionConfig) -> Result<SessionInfo, BridgeError> {
        let config = config.normalized();
        let validation = self.gate.validate_config(&config);
        if !validation.valid {
            debug!(
                "Rejected connection config {}",
                self.gate
                    .sanitize_log_data(&serde_json::to_value(&config).unwrap_or_default())
            );
            return Err(BridgeError::Validation(validation.errors));
        }

        let identifier = config.identifier();
        if !self.gate.check_rate_limit(&identifier) {
            return Err(BridgeError::RateLimitExceeded(identifier));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Creating session {}: {}@{}:{}",
            session_id, config.username, config.hostname, config.port
        );

        let entry = SessionEntry::new(session_id.clone(), config);
        let info = SessionInfo::from(&entry);
        self.sessions.insert(session_id.clone(), entry);
        self.events.publish(SessionEvent::Created { session_id });

        Ok(info)
    }

    /// Open the remote connection for an existing session.
    ///
    /// On failure the session stays registered in `disconnected` so the
    /// caller can retry.
    pub async fn connect(&self, session_id: &str) -> Result<(), BridgeError> {
        let config = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
            match entry.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => {
                    return Err(BridgeError::Connection(format!(
                        "session {} is already connecting",
                        session_id
                    )))
                }
                ConnectionState::Disconnected => {}
            }
            entry.state = ConnectionState::Connecting;
            entry.config.clone()
        };
        self.publish_state(session_id, ConnectionState::Connecting);

        let result = self
            .connector
            .connect(
                session_id,
                &config,
                self.ssh.connect_timeout(),
                &self.ssh.preferred,
            )
            .await;

        match result {
            Ok(connection) => {
                let stored = match self.sessions.get_mut(session_id) {
                    Some(mut entry) => {
                        entry.state = ConnectionState::Connected;
                        entry.connection = Some(connection.clone());
                        entry.touch();
                        true
                    }
                    None => false,
                };

                if !stored {
                    warn!(
                        "Session {} was removed while connecting, dropping connection",
                        session_id
                    );
                    if let Err(e) = connection.close().await {
                        warn!("Error closing orphaned connection for {}: {}", session_id, e);
                    }
                    return Err(BridgeError::SessionNotFound(session_id.to_string()));
                }

                info!("Session {} connected", session_id);
                self.publish_state(session_id, ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                if let Some(mut entry) = self.sessions.get_mut(session_id) {
                    entry.state = ConnectionState::Disconnected;
                }
                warn!("Session {} failed to connect: {}", session_id, e);
                self.publish_state(session_id, ConnectionState::Disconnected);
                Err(e.into())
            }
        }
    }

    /// Close the connection (if any) and remove the session. Unknown ids are
    /// a logged no-op.
    pub async fn disconnect(&self, session_id: &str) {
        let Some((_, entry)) = self.sessions.remove(session_id) else {
            info!("Disconnect for unknown session {}, nothing to do", session_id);
            return;
        };

        if let Some(connection) = entry.connection {
            if let Err(e) = connection.close().await {
                // Local cleanup proceeds regardless
                warn!("Error closing connection for session {}: {}", session_id, e);
            }
        }

        info!("Session {} removed", session_id);
        self.events.publish(SessionEvent::Removed {
            session_id: session_id.to_string(),
        });
    }

    /// Disconnect every session
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        join_all(ids.iter().map(|id| self.disconnect(id))).await;
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions
            .get(session_id)
            .map(|entry| SessionInfo::from(entry.value()))
    }

    pub fn get_all_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| SessionInfo::from(entry.value()))
            .collect()
    }

    /// Stored config, for cloning a session
    pub fn session_config(&self, session_id: &str) -> Option<ConnectionConfig> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.config.clone())
    }

    /// Live connection handle, if the session is connected and the
    /// transport is still up
    pub fn connection(&self, session_id: &str) -> Option<Arc<dyn RemoteConnection>> {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.connection.clone())
            .filter(|connection| connection.is_alive())
    }

    /// Returns false for unknown sessions
    pub fn update_last_activity(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// Disconnect every session idle for longer than `threshold`.
    /// Returns the removed ids.
    pub async fn cleanup_inactive_sessions(&self, threshold: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_activity.elapsed() > threshold)
            .map(|entry| entry.key().clone())
            .collect();

        if stale.is_empty() {
            return stale;
        }

        info!(
            "Disconnecting {} session(s) idle for more than {:?}",
            stale.len(),
            threshold
        );
        join_all(stale.iter().map(|id| self.disconnect(id))).await;
        stale
    }

    /// Run [`cleanup_inactive_sessions`](Self::cleanup_inactive_sessions)
    /// every `every` until `cancel` fires
    pub fn spawn_inactivity_sweep(
        self: &Arc<Self>,
        threshold: Duration,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // Skip the immediate first tick
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        registry.cleanup_inactive_sessions(threshold).await;
                    }
                }
            }
            debug!("Inactivity sweep stopped");
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn publish_state(&self, session_id: &str, state: ConnectionState) {
        self.events.publish(SessionEvent::StateChanged {
            session_id: session_id.to_string(),
            state,
        });
    }
}
