//! Top-level error type
//!
//! Every failure that can reach the wire ends up as a [`BridgeError`]. Its
//! [`code`](BridgeError::code) is the machine-readable `ssh_error.code`.

use serde_json::{json, Value};
use thiserror::Error;

use crate::security::CryptoError;
use crate::sftp::SftpError;
use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid connection configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Too many connection attempts for {0}, try again later")]
    RateLimitExceeded(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    Sftp(#[from] SftpError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid dimensions: {cols}x{rows} (expected 1..=1000)")]
    InvalidDimensions { cols: i64, rows: i64 },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is not connected")]
    NotConnected(String),

    #[error("Tab limit reached ({max} tabs)")]
    TabLimitExceeded { max: usize },
}

impl BridgeError {
    /// Wire error code
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Validation(_) => "VALIDATION_ERROR",
            BridgeError::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            BridgeError::Connection(_) => "CONNECTION_ERROR",
            BridgeError::Authentication(_) => "AUTHENTICATION_ERROR",
            BridgeError::Sftp(SftpError::Connection(_)) => "CONNECTION_ERROR",
            BridgeError::Sftp(SftpError::NotConnected(_)) => "NOT_CONNECTED",
            BridgeError::Sftp(_) => "SFTP_ERROR",
            BridgeError::Protocol(_) => "PROTOCOL_ERROR",
            BridgeError::InvalidInput(_) => "INVALID_INPUT",
            BridgeError::InvalidDimensions { .. } => "INVALID_DIMENSIONS",
            BridgeError::Crypto(_) => "CRYPTO_ERROR",
            BridgeError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            BridgeError::NotConnected(_) => "NOT_CONNECTED",
            BridgeError::TabLimitExceeded { .. } => "TAB_LIMIT_EXCEEDED",
        }
    }

    /// Structured detail attached to `ssh_error`, if any
    pub fn details(&self) -> Option<Value> {
        match self {
            BridgeError::Validation(errors) => Some(json!({ "errors": errors })),
            BridgeError::RateLimitExceeded(identifier) => {
                Some(json!({ "identifier": identifier }))
            }
            BridgeError::Sftp(err) => err.path().map(|path| json!({ "path": path })),
            BridgeError::InvalidDimensions { cols, rows } => {
                Some(json!({ "cols": cols, "rows": rows }))
            }
            BridgeError::TabLimitExceeded { max } => Some(json!({ "maxTabs": max })),
            _ => None,
        }
    }
}

impl From<SshError> for BridgeError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::AuthenticationFailed(msg) | SshError::KeyError(msg) => {
                BridgeError::Authentication(msg)
            }
            other => BridgeError::Connection(other.to_string()),
        }
    }
}
