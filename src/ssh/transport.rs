//! Transport seams
//!
//! The registry and the bridge only see these traits, never a concrete SSH
//! library type.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::config::ConnectionConfig;
use super::error::SshError;
use super::shell::ShellChannel;
use crate::config::AlgorithmPreferences;
use crate::sftp::{SftpChannel, SftpError};

/// Opens authenticated connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        session_id: &str,
        config: &ConnectionConfig,
        timeout: Duration,
        preferences: &AlgorithmPreferences,
    ) -> Result<Arc<dyn RemoteConnection>, SshError>;
}

/// A live, authenticated connection
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Open an interactive shell sized `cols` x `rows`
    async fn open_shell(&self, cols: u32, rows: u32) -> Result<ShellChannel, SshError>;

    /// Open a file-transfer channel over this connection
    async fn open_sftp(&self) -> Result<Arc<dyn SftpChannel>, SftpError>;

    async fn close(&self) -> Result<(), SshError>;

    fn is_alive(&self) -> bool;
}
