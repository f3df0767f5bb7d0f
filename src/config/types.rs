//! Configuration types
//!
//! Every field has a serde default so a partial `config.json` is valid.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use zeroize::Zeroizing;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    pub server: ServerSettings,
    pub ssh: SshSettings,
    pub rate_limit: RateLimitSettings,
    pub sessions: SessionSettings,
    pub transfer: TransferSettings,
    pub tabs: TabSettings,
    /// Credential key material from `ENCRYPTION_KEY`. Never written to disk.
    #[serde(skip)]
    pub encryption_key: Option<Zeroizing<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub bind_addr: String,
    pub heartbeat_interval_secs: u64,
    /// Required `?token=` on the WebSocket upgrade when set
    pub access_token: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8022".to_string(),
            heartbeat_interval_secs: 30,
            access_token: None,
        }
    }
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SshSettings {
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    /// Algorithm preferences, most preferred first
    pub preferred: AlgorithmPreferences,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            keepalive_interval_secs: 30,
            preferred: AlgorithmPreferences::default(),
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Key exchange and cipher preference lists by their SSH wire names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlgorithmPreferences {
    pub kex: Vec<String>,
    pub cipher: Vec<String>,
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self {
            kex: vec![
                "curve25519-sha256".to_string(),
                "curve25519-sha256@libssh.org".to_string(),
                "diffie-hellman-group14-sha256".to_string(),
            ],
            cipher: vec![
                "chacha20-poly1305@openssh.com".to_string(),
                "aes256-gcm@openssh.com".to_string(),
                "aes256-ctr".to_string(),
                "aes128-ctr".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitSettings {
    pub max_attempts: usize,
    pub window_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSettings {
    /// Sessions idle longer than this are disconnected by the sweep
    pub inactivity_timeout_minutes: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout_minutes: 60,
            sweep_interval_secs: 60,
        }
    }
}

impl SessionSettings {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_minutes * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub progress_interval_ms: u64,
    pub max_concurrent: usize,
    /// Downloads are buffered in memory and sent as one message
    pub max_download_bytes: u64,
    /// How long completed, cancelled and failed transfers stay listed
    pub retention_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024,
            progress_interval_ms: 100,
            max_concurrent: 3,
            max_download_bytes: 64 * 1024 * 1024,
            retention_secs: 600,
        }
    }
}

impl TransferSettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TabSettings {
    pub max_tabs: usize,
    /// Output retained per inactive tab, in bytes
    pub output_buffer_bytes: usize,
}

impl Default for TabSettings {
    fn default() -> Self {
        Self {
            max_tabs: 10,
            output_buffer_bytes: 64 * 1024,
        }
    }
}
