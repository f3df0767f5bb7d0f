//! Session lifecycle notifications
//!
//! Subscribers get an unbounded receiver plus a token they can hand back to
//! [`EventBus::unsubscribe`]. Receivers that were dropped without
//! unsubscribing are pruned on the next publish.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::types::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Created {
        session_id: String,
    },
    StateChanged {
        session_id: String,
        state: ConnectionState,
    },
    Removed {
        session_id: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Created { session_id }
            | SessionEvent::StateChanged { session_id, .. }
            | SessionEvent::Removed { session_id } => session_id,
        }
    }
}

/// Capability to revoke a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

pub struct Subscription {
    pub token: SubscriptionToken,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

#[derive(Default)]
pub struct EventBus {
    next_token: AtomicU64,
    subscribers: DashMap<u64, mpsc::UnboundedSender<SessionEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        Subscription {
            token: SubscriptionToken(id),
            events: rx,
        }
    }

    /// Returns false if the token was already revoked
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.subscribers.remove(&token.0).is_some()
    }

    pub fn publish(&self, event: SessionEvent) {
        let mut closed = Vec::new();
        for subscriber in self.subscribers.iter() {
            if subscriber.value().send(event.clone()).is_err() {
                closed.push(*subscriber.key());
            }
        }
        // Removal happens after iteration; DashMap shards are still read-locked inside it
        for id in closed {
            debug!("Pruning closed session event subscriber {}", id);
            self.subscribers.remove(&id);
        }
    }
}
