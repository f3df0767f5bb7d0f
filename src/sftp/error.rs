//! SFTP error types

use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::protocol::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SftpError {
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{message}: {path}")]
    Failure { path: String, message: String },

    /// The channel itself failed; the connection may still be usable
    #[error("SFTP channel error: {0}")]
    Channel(String),

    /// The channel failed again after a reopen
    #[error("SFTP connection lost: {0}")]
    Connection(String),

    #[error("Session {0} is not connected")]
    NotConnected(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    #[error("Transfer {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Transfer error: {0}")]
    Transfer(String),
}

impl SftpError {
    /// Remote path the error refers to, for path-scoped failures
    pub fn path(&self) -> Option<&str> {
        match self {
            SftpError::NotFound(path)
            | SftpError::PermissionDenied(path)
            | SftpError::Failure { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Whether reopening the channel could help
    pub fn is_channel_level(&self) -> bool {
        matches!(self, SftpError::Channel(_))
    }

    /// Classify a russh-sftp error raised while operating on `path`
    pub fn from_remote(err: SftpErrorInner, path: &str) -> Self {
        match err {
            SftpErrorInner::Status(status) => match status.status_code {
                StatusCode::NoSuchFile => SftpError::NotFound(path.to_string()),
                StatusCode::PermissionDenied => SftpError::PermissionDenied(path.to_string()),
                _ => SftpError::Failure {
                    path: path.to_string(),
                    message: status.error_message,
                },
            },
            other => SftpError::Channel(other.to_string()),
        }
    }

    /// Classify an I/O error from a remote file handle.
    ///
    /// Remote file handles report a failed SFTP status as `ErrorKind::Other`
    /// carrying the server's message, which is a path-level failure. Only a
    /// closed pipe, a dead session or an unanswered request means the channel
    /// itself is gone.
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => return SftpError::NotFound(path.to_string()),
            ErrorKind::PermissionDenied => return SftpError::PermissionDenied(path.to_string()),
            ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::TimedOut => return SftpError::Channel(err.to_string()),
            _ => {}
        }

        let message = err.to_string();
        if CHANNEL_FAILURES.iter().any(|marker| message.contains(marker)) {
            SftpError::Channel(message)
        } else if message.contains("No such file") {
            SftpError::NotFound(path.to_string())
        } else if message.contains("Permission denied") {
            SftpError::PermissionDenied(path.to_string())
        } else {
            SftpError::Failure {
                path: path.to_string(),
                message,
            }
        }
    }
}

/// Texts russh-sftp uses when the request never got a status reply
const CHANNEL_FAILURES: &[&str] = &[
    "session closed",
    "channel closed",
    "Timeout",
    "SendError",
    "RecvError",
    "I/O:",
    "unexpected response packet",
];
