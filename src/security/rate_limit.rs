//! Sliding-window connection attempt limiter
//!
//! One entry per identifier (`hostname:username`). Entries are mutated under
//! the DashMap shard lock only, so identifiers never contend with each other.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

pub struct RateLimiter {
    attempts: DashMap<String, VecDeque<Instant>>,
    max_attempts: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            attempts: DashMap::new(),
            max_attempts,
            window,
        }
    }

    /// Check with the configured limits
    pub fn check(&self, identifier: &str) -> bool {
        self.check_with(identifier, self.max_attempts, self.window)
    }

    /// Record an attempt for `identifier` and report whether it is allowed.
    ///
    /// Every call is recorded, rejected ones included, so an identifier that
    /// keeps being hammered stays locked until the calls stop.
    pub fn check_with(&self, identifier: &str, max_attempts: usize, window: Duration) -> bool {
        let now = Instant::now();
        let mut entry = self.attempts.entry(identifier.to_string()).or_default();

        evict_expired(&mut entry, now, window);
        let allowed = entry.len() < max_attempts;
        entry.push_back(now);

        if !allowed {
            warn!(
                "Rate limit exceeded for {} ({} attempts in {:?})",
                identifier,
                entry.len(),
                window
            );
        }
        allowed
    }

    /// Drop identifiers whose window has fully elapsed
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let before = self.attempts.len();
        self.attempts.retain(|_, timestamps| {
            evict_expired(timestamps, now, window);
            !timestamps.is_empty()
        });
        let removed = before.saturating_sub(self.attempts.len());
        if removed > 0 {
            debug!("Rate limit sweep removed {} identifiers", removed);
        }
        removed
    }

    /// Number of tracked identifiers
    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }
}

fn evict_expired(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}
