//! Configuration Management Module
//!
//! Runtime settings for the bridge: file defaults plus environment overrides.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, StorageError};
pub use types::{
    AlgorithmPreferences, BridgeConfig, RateLimitSettings, ServerSettings, SessionSettings,
    SshSettings, TabSettings, TransferSettings,
};
