//! SSH Client implementation using russh

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::{client, Preferred};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::{AuthMethod, ConnectionConfig};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::shell::{start_shell, ShellChannel};
use super::transport::{Connector, RemoteConnection};
use crate::config::AlgorithmPreferences;
use crate::sftp::{RusshSftpChannel, SftpChannel, SftpError};

/// Connector backed by russh
pub struct RusshConnector {
    keepalive_interval: Duration,
}

impl RusshConnector {
    pub fn new(keepalive_interval: Duration) -> Self {
        Self { keepalive_interval }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        session_id: &str,
        config: &ConnectionConfig,
        timeout: Duration,
        preferences: &AlgorithmPreferences,
    ) -> Result<Arc<dyn RemoteConnection>, SshError> {
        let port = config
            .port_u16()
            .ok_or_else(|| SshError::ConnectionFailed(format!("invalid port {}", config.port)))?;
        let addr = format!("{}:{}", config.hostname, port);
        let auth = config
            .auth()
            .ok_or_else(|| SshError::AuthenticationFailed("no credential supplied".to_string()))?;

        info!("Connecting to SSH server at {} for session {}", addr, session_id);

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(self.keepalive_interval),
            keepalive_max: 3,
            preferred: build_preferred(preferences),
            ..Default::default()
        };

        let handler = ClientHandler::new(config.hostname.clone(), port);

        // Handshake and authentication share one deadline
        let handle = tokio::time::timeout(timeout, async {
            let mut handle = client::connect(Arc::new(ssh_config), addr.as_str(), handler)
                .await
                .map_err(classify_connect_error)?;

            debug!("SSH handshake completed for session {}", session_id);

            authenticate(&mut handle, &config.username, auth).await?;
            Ok::<_, SshError>(handle)
        })
        .await
        .map_err(|_| SshError::Timeout(format!("no response from {} within {:?}", addr, timeout)))??;

        info!("SSH authentication successful for session {}", session_id);

        let controller =
            spawn_handle_owner_task(handle, session_id.to_string(), self.keepalive_interval);
        Ok(Arc::new(RusshConnection {
            session_id: session_id.to_string(),
            controller,
        }))
    }
}

async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    username: &str,
    auth: AuthMethod,
) -> Result<(), SshError> {
    let result = match auth {
        AuthMethod::Password { password } => handle
            .authenticate_password(username, password.as_str())
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
        AuthMethod::PrivateKey { pem, passphrase } => {
            let key = russh::keys::decode_secret_key(
                pem.as_str(),
                passphrase.as_ref().map(|p| p.as_str()),
            )
            .map_err(|e| SshError::KeyError(e.to_string()))?;

            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

            handle
                .authenticate_publickey(username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
    };

    if !result.success() {
        return Err(SshError::AuthenticationFailed(
            "Authentication rejected by server".to_string(),
        ));
    }
    Ok(())
}

fn classify_connect_error(err: SshError) -> SshError {
    match err {
        SshError::IoError(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            SshError::ConnectionRefused(io.to_string())
        }
        SshError::IoError(io) if io.kind() == std::io::ErrorKind::TimedOut => {
            SshError::Timeout(io.to_string())
        }
        SshError::IoError(io) => SshError::ConnectionFailed(io.to_string()),
        other => other,
    }
}

/// Map preference names onto the algorithms russh supports.
/// Unknown names are skipped; an empty result keeps the library defaults.
pub fn build_preferred(preferences: &AlgorithmPreferences) -> Preferred {
    let defaults = Preferred::default();

    let mut kex: Vec<russh::kex::Name> = Vec::new();
    for name in &preferences.kex {
        match defaults.kex.iter().find(|k| kex_name(k) == name.as_str()) {
            Some(k) => kex.push(*k),
            None => warn!("Unsupported kex algorithm in config, skipping: {}", name),
        }
    }
    // Keep the ext-info and strict-kex markers the server negotiates with
    for marker in defaults.kex.iter() {
        if is_kex_marker(marker) && !kex.contains(marker) {
            kex.push(*marker);
        }
    }

    let mut cipher: Vec<russh::cipher::Name> = Vec::new();
    for name in &preferences.cipher {
        match defaults.cipher.iter().find(|c| cipher_name(c) == name.as_str()) {
            Some(c) => cipher.push(*c),
            None => warn!("Unsupported cipher in config, skipping: {}", name),
        }
    }

    let has_real_kex = kex.iter().any(|k| !is_kex_marker(k));

    Preferred {
        kex: if has_real_kex {
            Cow::Owned(kex)
        } else {
            defaults.kex.clone()
        },
        cipher: if cipher.is_empty() {
            defaults.cipher.clone()
        } else {
            Cow::Owned(cipher)
        },
        ..defaults
    }
}

fn kex_name(name: &russh::kex::Name) -> &str {
    name.as_ref()
}

fn cipher_name(name: &russh::cipher::Name) -> &str {
    name.as_ref()
}

// Pseudo-algorithms that only signal extension support
fn is_kex_marker(name: &russh::kex::Name) -> bool {
    let name = kex_name(name);
    name.starts_with("ext-info-") || name.starts_with("kex-strict-")
}

/// Live russh connection. Dropping the last controller ends the owner task.
pub struct RusshConnection {
    session_id: String,
    controller: HandleController,
}

#[async_trait]
impl RemoteConnection for RusshConnection {
    async fn open_shell(&self, cols: u32, rows: u32) -> Result<ShellChannel, SshError> {
        let channel = self.controller.open_session_channel().await?;
        start_shell(channel, self.session_id.clone(), cols, rows).await
    }

    async fn open_sftp(&self) -> Result<Arc<dyn SftpChannel>, SftpError> {
        let channel = self
            .controller
            .open_session_channel()
            .await
            .map_err(|e| SftpError::Connection(e.to_string()))?;
        let sftp = RusshSftpChannel::open(channel, &self.session_id).await?;
        Ok(Arc::new(sftp))
    }

    async fn close(&self) -> Result<(), SshError> {
        if !self.controller.is_connected() {
            return Err(SshError::Disconnected);
        }
        self.controller.disconnect().await;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.controller.is_connected()
    }
}

/// Client handler for russh callbacks
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

/// SHA256 fingerprint in OpenSSH notation
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.public_key_bytes());
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are pinned by the browser client, not here; record what we saw
        info!(
            "Host key for {}:{} is {}",
            self.host,
            self.port,
            fingerprint(server_public_key)
        );
        Ok(true)
    }
}
