//! Tab multiplexer
//!
//! One tab per session, in display order, with at most one active tab.
//! Output arriving for an inactive tab is kept in a bounded buffer until the
//! tab is activated again.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::buffer::OutputBuffer;
use crate::config::TabSettings;
use crate::error::BridgeError;
use crate::session::{ConnectionState, SessionEvent, SessionInfo, SessionRegistry, SubscriptionToken};
use crate::ssh::ConnectionConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: String,
    pub session_id: String,
    pub title: String,
    pub is_active: bool,
    pub has_unread_activity: bool,
    pub connection_status: ConnectionState,
}

struct TabSlot {
    tab: Tab,
    buffer: OutputBuffer,
}

pub struct TabMultiplexer {
    registry: Arc<SessionRegistry>,
    tabs: RwLock<Vec<TabSlot>>,
    settings: TabSettings,
    subscription: parking_lot::Mutex<Option<SubscriptionToken>>,
}

impl TabMultiplexer {
    pub fn new(registry: Arc<SessionRegistry>, settings: TabSettings) -> Self {
        Self {
            registry,
            tabs: RwLock::new(Vec::new()),
            settings,
            subscription: parking_lot::Mutex::new(None),
        }
    }

    pub fn can_create_new_tab(&self) -> bool {
        self.tabs.read().len() < self.settings.max_tabs
    }

    /// Create a session and its tab. The new tab becomes the active one.
    pub fn create_session(
        &self,
        config: ConnectionConfig,
        name: Option<String>,
    ) -> Result<(SessionInfo, Tab), BridgeError> {
        // Held across registration so two creates cannot both pass the limit
        let mut tabs = self.tabs.write();
        if tabs.len() >= self.settings.max_tabs {
            return Err(BridgeError::TabLimitExceeded {
                max: self.settings.max_tabs,
            });
        }

        let session = self.registry.create_session(config)?;
        let title = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("{}@{}", session.username, session.hostname));

        for slot in tabs.iter_mut() {
            slot.tab.is_active = false;
        }
        let tab = Tab {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            title,
            is_active: true,
            has_unread_activity: false,
            connection_status: session.connection_state,
        };
        tabs.push(TabSlot {
            tab: tab.clone(),
            buffer: OutputBuffer::with_capacity(self.settings.output_buffer_bytes),
        });

        info!("Tab {} created for session {}", tab.id, session.id);
        Ok((session, tab))
    }

    /// Make `tab_id` the only active tab. Returns output buffered while it
    /// was inactive.
    pub fn activate_tab(&self, tab_id: &str) -> Result<Vec<u8>, BridgeError> {
        let mut tabs = self.tabs.write();
        let index = tabs
            .iter()
            .position(|slot| slot.tab.id == tab_id)
            .ok_or_else(|| BridgeError::InvalidInput(format!("unknown tab {}", tab_id)))?;
        Ok(activate_index(&mut tabs, index))
    }

    /// [`activate_tab`](Self::activate_tab) by session id
    pub fn activate_session(&self, session_id: &str) -> Result<Vec<u8>, BridgeError> {
        let mut tabs = self.tabs.write();
        let index = tabs
            .iter()
            .position(|slot| slot.tab.session_id == session_id)
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
        Ok(activate_index(&mut tabs, index))
    }

    /// Close a tab and disconnect its session. Returns the session id.
    pub async fn close_tab(&self, tab_id: &str) -> Result<String, BridgeError> {
        let session_id = {
            let mut tabs = self.tabs.write();
            let index = tabs
                .iter()
                .position(|slot| slot.tab.id == tab_id)
                .ok_or_else(|| BridgeError::InvalidInput(format!("unknown tab {}", tab_id)))?;
            remove_index(&mut tabs, index)
        };

        self.registry.disconnect(&session_id).await;
        Ok(session_id)
    }

    /// Close every tab except `keep_id`, which becomes active. Returns the
    /// closed session ids.
    pub async fn close_other_tabs(&self, keep_id: &str) -> Result<Vec<String>, BridgeError> {
        let closed: Vec<String> = {
            let mut tabs = self.tabs.write();
            if !tabs.iter().any(|slot| slot.tab.id == keep_id) {
                return Err(BridgeError::InvalidInput(format!("unknown tab {}", keep_id)));
            }
            let closed = tabs
                .iter()
                .filter(|slot| slot.tab.id != keep_id)
                .map(|slot| slot.tab.session_id.clone())
                .collect();
            tabs.retain(|slot| slot.tab.id == keep_id);
            activate_index(&mut tabs, 0);
            closed
        };

        for session_id in &closed {
            self.registry.disconnect(session_id).await;
        }
        Ok(closed)
    }

    /// Close every tab. Returns the closed session ids.
    pub async fn close_all_tabs(&self) -> Vec<String> {
        let closed: Vec<String> = self
            .tabs
            .write()
            .drain(..)
            .map(|slot| slot.tab.session_id)
            .collect();

        for session_id in &closed {
            self.registry.disconnect(session_id).await;
        }
        closed
    }

    pub fn rename_tab(&self, tab_id: &str, title: &str) -> Result<(), BridgeError> {
        let mut tabs = self.tabs.write();
        let slot = tabs
            .iter_mut()
            .find(|slot| slot.tab.id == tab_id)
            .ok_or_else(|| BridgeError::InvalidInput(format!("unknown tab {}", tab_id)))?;
        slot.tab.title = title.to_string();
        Ok(())
    }

    /// New session with the same config under a fresh id, plus its tab
    pub fn duplicate_tab(&self, tab_id: &str) -> Result<(SessionInfo, Tab), BridgeError> {
        let (session_id, title) = self
            .tabs
            .read()
            .iter()
            .find(|slot| slot.tab.id == tab_id)
            .map(|slot| (slot.tab.session_id.clone(), slot.tab.title.clone()))
            .ok_or_else(|| BridgeError::InvalidInput(format!("unknown tab {}", tab_id)))?;

        let config = self
            .registry
            .session_config(&session_id)
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.clone()))?;

        self.create_session(config, Some(title))
    }

    /// Mirror the registry's state onto the session's tab
    pub fn update_tab_connection_status(&self, session_id: &str, status: ConnectionState) {
        let mut tabs = self.tabs.write();
        if let Some(slot) = tabs
            .iter_mut()
            .find(|slot| slot.tab.session_id == session_id)
        {
            slot.tab.connection_status = status;
        }
    }

    /// Record activity for a session. When its tab is inactive the tab is
    /// flagged unread and `data` is retained. Returns true in that case.
    pub fn mark_tab_activity(&self, session_id: &str, data: &[u8]) -> bool {
        let mut tabs = self.tabs.write();
        let Some(slot) = tabs
            .iter_mut()
            .find(|slot| slot.tab.session_id == session_id)
        else {
            return false;
        };
        if slot.tab.is_active {
            return false;
        }
        slot.tab.has_unread_activity = true;
        if !data.is_empty() {
            slot.buffer.push(data);
        }
        true
    }

    /// Drop a tab whose session the registry already removed
    pub fn handle_session_removed(&self, session_id: &str) -> Option<String> {
        let mut tabs = self.tabs.write();
        let index = tabs
            .iter()
            .position(|slot| slot.tab.session_id == session_id)?;
        let tab_id = tabs[index].tab.id.clone();
        remove_index(&mut tabs, index);
        debug!("Tab {} dropped with session {}", tab_id, session_id);
        Some(tab_id)
    }

    pub fn get_tabs(&self) -> Vec<Tab> {
        self.tabs.read().iter().map(|slot| slot.tab.clone()).collect()
    }

    pub fn active_tab(&self) -> Option<Tab> {
        self.tabs
            .read()
            .iter()
            .find(|slot| slot.tab.is_active)
            .map(|slot| slot.tab.clone())
    }

    pub fn tab_for_session(&self, session_id: &str) -> Option<Tab> {
        self.tabs
            .read()
            .iter()
            .find(|slot| slot.tab.session_id == session_id)
            .map(|slot| slot.tab.clone())
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.tabs
            .read()
            .iter()
            .map(|slot| slot.tab.session_id.clone())
            .collect()
    }

    /// Follow registry events: removed sessions lose their tab, state
    /// changes update the tab. The task ends after [`detach`](Self::detach)
    /// or once the multiplexer is dropped.
    pub fn watch_registry(self: &Arc<Self>) -> JoinHandle<()> {
        let mut subscription = self.registry.events().subscribe();
        *self.subscription.lock() = Some(subscription.token);
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(event) = subscription.events.recv().await {
                let Some(tabs) = weak.upgrade() else {
                    break;
                };
                match event {
                    SessionEvent::Removed { session_id } => {
                        tabs.handle_session_removed(&session_id);
                    }
                    SessionEvent::StateChanged { session_id, state } => {
                        tabs.update_tab_connection_status(&session_id, state);
                    }
                    SessionEvent::Created { .. } => {}
                }
            }
            debug!("Tab registry watcher stopped");
        })
    }

    /// Stop following registry events
    pub fn detach(&self) {
        if let Some(token) = self.subscription.lock().take() {
            self.registry.events().unsubscribe(token);
        }
    }
}

impl Drop for TabMultiplexer {
    fn drop(&mut self) {
        self.detach();
    }
}

fn activate_index(tabs: &mut [TabSlot], index: usize) -> Vec<u8> {
    for (i, slot) in tabs.iter_mut().enumerate() {
        slot.tab.is_active = i == index;
    }
    match tabs.get_mut(index) {
        Some(slot) => {
            slot.tab.has_unread_activity = false;
            slot.buffer.take()
        }
        None => Vec::new(),
    }
}

/// Remove a tab; if it was active, activate its left neighbour or the new
/// first tab. Returns the removed tab's session id.
fn remove_index(tabs: &mut Vec<TabSlot>, index: usize) -> String {
    let removed = tabs.remove(index);
    if removed.tab.is_active && !tabs.is_empty() {
        // The neighbour's buffer is kept for the next explicit activation
        let next = index.saturating_sub(1);
        for (i, slot) in tabs.iter_mut().enumerate() {
            slot.tab.is_active = i == next;
        }
        tabs[next].tab.has_unread_activity = false;
    }
    removed.tab.session_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_registry, valid_config, MockConnector};
    use std::time::Duration;

    fn mux(max_tabs: usize) -> Arc<TabMultiplexer> {
        let registry = test_registry(MockConnector::new());
        Arc::new(TabMultiplexer::new(
            registry,
            TabSettings {
                max_tabs,
                output_buffer_bytes: 16,
            },
        ))
    }

    fn active_count(mux: &TabMultiplexer) -> usize {
        mux.get_tabs().iter().filter(|t| t.is_active).count()
    }

    #[test]
    fn test_single_active_tab() {
        let mux = mux(10);
        let (_, a) = mux.create_session(valid_config(), Some("A".into())).unwrap();
        let (_, b) = mux.create_session(valid_config(), None).unwrap();
        assert_eq!(b.title, "alice@example.com");
        assert_eq!(active_count(&mux), 1);
        assert_eq!(mux.active_tab().unwrap().id, b.id);

        mux.activate_tab(&a.id).unwrap();
        assert_eq!(active_count(&mux), 1);
        assert_eq!(mux.active_tab().unwrap().id, a.id);
    }

    #[test]
    fn test_tab_limit() {
        let mux = mux(2);
        mux.create_session(valid_config(), None).unwrap();
        mux.create_session(valid_config(), None).unwrap();
        assert!(!mux.can_create_new_tab());

        let err = mux.create_session(valid_config(), None).unwrap_err();
        assert!(matches!(err, BridgeError::TabLimitExceeded { max: 2 }));
        assert_eq!(mux.registry.get_all_sessions().len(), 2);
    }

    #[tokio::test]
    async fn test_close_active_activates_left_neighbour() {
        let mux = mux(10);
        let (_, a) = mux.create_session(valid_config(), None).unwrap();
        let (_, b) = mux.create_session(valid_config(), None).unwrap();
        let (_, c) = mux.create_session(valid_config(), None).unwrap();

        mux.activate_tab(&b.id).unwrap();
        let closed = mux.close_tab(&b.id).await.unwrap();
        assert_eq!(closed, b.session_id);
        assert_eq!(mux.active_tab().unwrap().id, a.id);
        assert!(mux.registry.get_session(&b.session_id).is_none());

        // Leftmost closed: the new first tab takes over
        mux.close_tab(&a.id).await.unwrap();
        assert_eq!(mux.active_tab().unwrap().id, c.id);
        assert_eq!(active_count(&mux), 1);
    }

    #[tokio::test]
    async fn test_close_others_and_all() {
        let mux = mux(10);
        let (_, a) = mux.create_session(valid_config(), None).unwrap();
        let (_, b) = mux.create_session(valid_config(), None).unwrap();
        let (_, c) = mux.create_session(valid_config(), None).unwrap();

        let closed = mux.close_other_tabs(&b.id).await.unwrap();
        assert_eq!(closed.len(), 2);
        assert!(closed.contains(&a.session_id) && closed.contains(&c.session_id));
        assert_eq!(mux.active_tab().unwrap().id, b.id);

        let sessions = mux.registry.get_all_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, b.session_id);

        mux.close_all_tabs().await;
        assert!(mux.get_tabs().is_empty());
        assert!(mux.registry.get_all_sessions().is_empty());
    }

    #[test]
    fn test_inactive_output_buffered() {
        let mux = mux(10);
        let (_, a) = mux.create_session(valid_config(), None).unwrap();
        let (_, _b) = mux.create_session(valid_config(), None).unwrap();

        assert!(mux.mark_tab_activity(&a.session_id, b"0123456789"));
        assert!(mux.mark_tab_activity(&a.session_id, b"abcdefghij"));
        assert!(mux.tab_for_session(&a.session_id).unwrap().has_unread_activity);

        let buffered = mux.activate_tab(&a.id).unwrap();
        assert_eq!(buffered, b"456789abcdefghij");
        assert!(!mux.tab_for_session(&a.session_id).unwrap().has_unread_activity);

        // Active tab output is not buffered
        assert!(!mux.mark_tab_activity(&a.session_id, b"live"));
        assert!(mux.activate_tab(&a.id).unwrap().is_empty());
    }

    #[test]
    fn test_rename_and_duplicate() {
        let mux = mux(10);
        let (session, a) = mux.create_session(valid_config(), None).unwrap();
        mux.rename_tab(&a.id, "prod").unwrap();

        let (copy, tab) = mux.duplicate_tab(&a.id).unwrap();
        assert_ne!(copy.id, session.id);
        assert_eq!(copy.hostname, session.hostname);
        assert_eq!(tab.title, "prod");
        assert_eq!(mux.get_tabs().len(), 2);
    }

    #[tokio::test]
    async fn test_follows_registry_events() {
        let mux = mux(10);
        let watcher = mux.watch_registry();
        let (session, _) = mux.create_session(valid_config(), None).unwrap();

        mux.registry.connect(&session.id).await.unwrap();
        mux.registry.disconnect(&session.id).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while mux.tab_for_session(&session.id).is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        mux.detach();
        watcher.await.unwrap();
    }
}
