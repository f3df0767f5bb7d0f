//! Configuration Storage
//!
//! Loads `config.json` from the config directory and layers environment
//! overrides on top. Config location: ~/.shellbridge

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::types::BridgeConfig;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Get the configuration directory (~/.shellbridge)
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".shellbridge"))
        .ok_or(StorageError::NoConfigDir)
}

/// Get the config file path
pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

impl BridgeConfig {
    /// Load from the default location, then apply process environment
    pub async fn load() -> Result<Self, StorageError> {
        let mut config = Self::load_from(&config_file()?).await?;
        config.apply_env_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Load from a specific file. A missing file yields the defaults.
    pub async fn load_from(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).await?;
        let config: BridgeConfig = serde_json::from_str(&content)?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), StorageError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("ENCRYPTION_KEY") {
            if key.is_empty() {
                warn!("ENCRYPTION_KEY is set but empty, ignoring");
            } else {
                self.encryption_key = Some(Zeroizing::new(key));
            }
        }

        if let Some(value) = lookup("SESSION_TIMEOUT_MINUTES") {
            self.sessions.inactivity_timeout_minutes = parse_positive(
                "SESSION_TIMEOUT_MINUTES",
                &value,
            )?;
        }

        if let Some(value) = lookup("SHELLBRIDGE_BIND") {
            self.server.bind_addr = value;
        }

        if let Some(value) = lookup("SHELLBRIDGE_MAX_TABS") {
            self.tabs.max_tabs = parse_positive("SHELLBRIDGE_MAX_TABS", &value)? as usize;
        }

        Ok(())
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<u64, StorageError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(StorageError::InvalidEnv {
            var,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = BridgeConfig::load_from(&temp_dir.path().join("nope.json"))
            .await
            .unwrap();

        assert_eq!(config.rate_limit.max_attempts, 5);
        assert_eq!(config.rate_limit.window_secs, 300);
        assert_eq!(config.ssh.connect_timeout_secs, 30);
        assert_eq!(config.sessions.inactivity_timeout_minutes, 60);
        assert!(config.encryption_key.is_none());
    }

    #[tokio::test]
    async fn test_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"tabs": {"maxTabs": 4}, "transfer": {"chunkSize": 1024}}"#,
        )
        .unwrap();

        let config = BridgeConfig::load_from(&path).await.unwrap();
        assert_eq!(config.tabs.max_tabs, 4);
        assert_eq!(config.tabs.output_buffer_bytes, 64 * 1024);
        assert_eq!(config.transfer.chunk_size, 1024);
        assert_eq!(config.transfer.max_concurrent, 3);
    }

    #[tokio::test]
    async fn test_malformed_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = BridgeConfig::load_from(&path).await;
        assert!(matches!(result, Err(StorageError::Json(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BridgeConfig::default();
        config
            .apply_env_overrides(env(&[
                ("ENCRYPTION_KEY", "hunter2"),
                ("SESSION_TIMEOUT_MINUTES", "15"),
                ("SHELLBRIDGE_BIND", "0.0.0.0:9000"),
            ]))
            .unwrap();

        assert_eq!(config.encryption_key.as_deref().map(|s| s.as_str()), Some("hunter2"));
        assert_eq!(config.sessions.inactivity_timeout_minutes, 15);
        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = BridgeConfig::default();
        let result = config.apply_env_overrides(env(&[("SESSION_TIMEOUT_MINUTES", "soon")]));
        assert!(matches!(result, Err(StorageError::InvalidEnv { .. })));

        let result = config.apply_env_overrides(env(&[("SHELLBRIDGE_MAX_TABS", "0")]));
        assert!(matches!(result, Err(StorageError::InvalidEnv { .. })));
    }

    #[test]
    fn test_key_is_not_serialized() {
        let mut config = BridgeConfig::default();
        config.encryption_key = Some(Zeroizing::new("secret-key".to_string()));
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret-key"));
    }
}
