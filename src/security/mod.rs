//! Security gate
//!
//! Everything that runs before a connection attempt: config validation,
//! attempt rate limiting, credential encryption and log redaction.

mod crypto;
mod rate_limit;
mod sanitize;
mod validate;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::BridgeConfig;
use crate::ssh::ConnectionConfig;

pub use crypto::{CredentialCipher, CryptoError};
pub use rate_limit::RateLimiter;
pub use sanitize::{sanitize_log_data, REDACTED};
pub use validate::{validate_config, ValidationResult};

pub struct SecurityGate {
    rate_limiter: RateLimiter,
    cipher: CredentialCipher,
}

impl SecurityGate {
    pub fn new(rate_limiter: RateLimiter, cipher: CredentialCipher) -> Self {
        Self {
            rate_limiter,
            cipher,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            RateLimiter::new(config.rate_limit.max_attempts, config.rate_limit.window()),
            CredentialCipher::from_config(config.encryption_key.as_deref().map(|k| k.as_str())),
        )
    }

    pub fn validate_config(&self, config: &ConnectionConfig) -> ValidationResult {
        validate_config(config)
    }

    /// Record an attempt under the configured limits
    pub fn check_rate_limit(&self, identifier: &str) -> bool {
        self.rate_limiter.check(identifier)
    }

    pub fn check_rate_limit_with(
        &self,
        identifier: &str,
        max_attempts: usize,
        window: Duration,
    ) -> bool {
        self.rate_limiter.check_with(identifier, max_attempts, window)
    }

    pub fn cleanup_rate_limit(&self) -> usize {
        self.rate_limiter.cleanup()
    }

    /// Evict expired rate-limit entries every `every` until `cancel` fires
    pub fn spawn_rate_limit_sweep(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = gate.cleanup_rate_limit();
                        if evicted > 0 {
                            debug!("Evicted {} expired rate-limit entries", evicted);
                        }
                    }
                }
            }
            debug!("Rate-limit sweep stopped");
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        self.cipher.encrypt(plaintext)
    }

    pub fn decrypt(&self, blob: &str) -> Result<Zeroizing<String>, CryptoError> {
        self.cipher.decrypt(blob)
    }

    pub fn sanitize_log_data(&self, value: &Value) -> Value {
        sanitize_log_data(value)
    }
}
