//! In-process doubles for the transport seams, shared by unit tests

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::config::{AlgorithmPreferences, SshSettings};
use crate::security::{CredentialCipher, RateLimiter, SecurityGate};
use crate::session::SessionRegistry;
use crate::sftp::{
    remote_file_name, DirEntry, FileType, RemoteReader, RemoteWriter, SftpChannel, SftpError,
};
use crate::ssh::{ConnectionConfig, Connector, RemoteConnection, ShellChannel, ShellCommand, SshError};

pub fn valid_config() -> ConnectionConfig {
    ConnectionConfig::with_password("example.com", 22, "alice", "secret")
}

pub fn test_registry(connector: Arc<MockConnector>) -> Arc<SessionRegistry> {
    test_registry_with_limit(connector, 1000)
}

pub fn test_registry_with_limit(
    connector: Arc<MockConnector>,
    max_attempts: usize,
) -> Arc<SessionRegistry> {
    let gate = Arc::new(SecurityGate::new(
        RateLimiter::new(max_attempts, Duration::from_secs(300)),
        CredentialCipher::from_key_material("test key"),
    ));
    Arc::new(SessionRegistry::new(gate, connector, SshSettings::default()))
}

/// Registry with one connected session backed by `sftp`
pub async fn connected_registry(sftp: Arc<MemorySftp>) -> (Arc<SessionRegistry>, String) {
    let registry = test_registry(MockConnector::with_sftp(sftp));
    let info = registry.create_session(valid_config()).unwrap();
    registry.connect(&info.id).await.unwrap();
    (registry, info.id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    Accept,
    Refuse,
    Timeout,
    RejectCredentials,
}

pub struct MockConnector {
    outcome: Mutex<MockOutcome>,
    fail_close: AtomicBool,
    connects: AtomicUsize,
    sftp: Arc<MemorySftp>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Self::with_sftp(MemorySftp::new())
    }

    pub fn with_sftp(sftp: Arc<MemorySftp>) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(MockOutcome::Accept),
            fail_close: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            sftp,
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn set_outcome(&self, outcome: MockOutcome) {
        *self.outcome.lock() = outcome;
    }

    /// Make `close()` on later connections report an error
    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _session_id: &str,
        config: &ConnectionConfig,
        timeout: Duration,
        _preferences: &AlgorithmPreferences,
    ) -> Result<Arc<dyn RemoteConnection>, SshError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let outcome = *self.outcome.lock();
        match outcome {
            MockOutcome::Refuse => Err(SshError::ConnectionRefused(format!(
                "{}:{} refused the connection",
                config.hostname, config.port
            ))),
            MockOutcome::Timeout => Err(SshError::Timeout(format!(
                "no response from {} within {:?}",
                config.hostname, timeout
            ))),
            MockOutcome::RejectCredentials => Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            )),
            MockOutcome::Accept => {
                let connection = Arc::new(MockConnection::new(
                    self.sftp.clone(),
                    self.fail_close.load(Ordering::SeqCst),
                ));
                self.connections.lock().push(connection.clone());
                Ok(connection)
            }
        }
    }
}

/// Connection whose shells echo their input back
pub struct MockConnection {
    closed: AtomicBool,
    fail_close: bool,
    sftp: Arc<MemorySftp>,
    shells_opened: AtomicUsize,
    shells_closed: Arc<AtomicUsize>,
    sizes: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl MockConnection {
    fn new(sftp: Arc<MemorySftp>, fail_close: bool) -> Self {
        Self {
            closed: AtomicBool::new(false),
            fail_close,
            sftp,
            shells_opened: AtomicUsize::new(0),
            shells_closed: Arc::new(AtomicUsize::new(0)),
            sizes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn shells_opened(&self) -> usize {
        self.shells_opened.load(Ordering::SeqCst)
    }

    pub fn shells_closed(&self) -> usize {
        self.shells_closed.load(Ordering::SeqCst)
    }

    /// Initial shell size followed by every resize, in order
    pub fn sizes(&self) -> Vec<(u32, u32)> {
        self.sizes.lock().clone()
    }
}

#[async_trait]
impl RemoteConnection for MockConnection {
    async fn open_shell(&self, cols: u32, rows: u32) -> Result<ShellChannel, SshError> {
        if self.is_closed() {
            return Err(SshError::Disconnected);
        }
        self.shells_opened.fetch_add(1, Ordering::SeqCst);
        self.sizes.lock().push((cols, rows));

        let (shell, mut cmd_rx, data_tx) = ShellChannel::pair();
        let sizes = self.sizes.clone();
        let shells_closed = self.shells_closed.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    ShellCommand::Data(data) => {
                        if data_tx.send(Bytes::from(data)).await.is_err() {
                            break;
                        }
                    }
                    ShellCommand::Resize(cols, rows) => sizes.lock().push((cols, rows)),
                    ShellCommand::Close => break,
                }
            }
            shells_closed.fetch_add(1, Ordering::SeqCst);
        });
        Ok(shell)
    }

    async fn open_sftp(&self) -> Result<Arc<dyn SftpChannel>, SftpError> {
        if self.is_closed() {
            return Err(SftpError::Connection("connection closed".to_string()));
        }
        self.sftp.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.sftp.clone())
    }

    async fn close(&self) -> Result<(), SshError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(SshError::ChannelError("close failed".to_string()));
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.is_closed()
    }
}

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Default)]
struct WriteFaults {
    /// Writes starting at or past this offset fail
    after: u64,
    remaining: usize,
    /// Server status text; `None` fails the channel instead
    status: Option<String>,
}

#[derive(Default)]
struct MemFs {
    nodes: Mutex<BTreeMap<String, Node>>,
    faults: Mutex<WriteFaults>,
}

/// In-memory SFTP filesystem
pub struct MemorySftp {
    fs: Arc<MemFs>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

impl MemorySftp {
    pub fn new() -> Arc<Self> {
        let fs = MemFs::default();
        fs.nodes.lock().insert("/".to_string(), Node::Dir);
        Arc::new(Self {
            fs: Arc::new(fs),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    fn ensure_parents(nodes: &mut BTreeMap<String, Node>, path: &str) {
        let mut parent = parent_of(path);
        loop {
            nodes.entry(parent.clone()).or_insert(Node::Dir);
            if parent == "/" {
                break;
            }
            parent = parent_of(&parent);
        }
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        let path = normalize(path);
        let mut nodes = self.fs.nodes.lock();
        Self::ensure_parents(&mut nodes, &path);
        nodes.insert(path, Node::File(data.to_vec()));
    }

    pub fn put_dir(&self, path: &str) {
        let path = normalize(path);
        let mut nodes = self.fs.nodes.lock();
        Self::ensure_parents(&mut nodes, &path);
        nodes.insert(path, Node::Dir);
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        match self.fs.nodes.lock().get(&normalize(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// The next `times` writes that start at or past `after` bytes fail as
    /// if the channel dropped
    pub fn fail_writes_after(&self, after: u64, times: usize) {
        *self.fs.faults.lock() = WriteFaults {
            after,
            remaining: times,
            status: None,
        };
    }

    /// Writes at or past `after` bytes get a failed status reply carrying
    /// `message`, the way a full disk or an exceeded quota is reported
    pub fn fail_writes_with_status(&self, after: u64, message: &str) {
        *self.fs.faults.lock() = WriteFaults {
            after,
            remaining: usize::MAX,
            status: Some(message.to_string()),
        };
    }

    /// Times a connection handed this filesystem out as a channel
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn entry(path: &str, node: &Node) -> DirEntry {
        let (file_type, size) = match node {
            Node::File(data) => (FileType::File, data.len() as u64),
            Node::Dir => (FileType::Directory, 0),
        };
        DirEntry {
            name: remote_file_name(path).to_string(),
            file_type,
            size,
            modified_time: 0,
        }
    }
}

#[async_trait]
impl SftpChannel for MemorySftp {
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SftpError> {
        let dir = normalize(path);
        let nodes = self.fs.nodes.lock();
        match nodes.get(&dir) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => {
                return Err(SftpError::Failure {
                    path: path.to_string(),
                    message: "Not a directory".to_string(),
                })
            }
            None => return Err(SftpError::NotFound(path.to_string())),
        }
        Ok(nodes
            .iter()
            .filter(|(p, _)| p.as_str() != "/" && parent_of(p) == dir)
            .map(|(p, node)| Self::entry(p, node))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<DirEntry, SftpError> {
        let key = normalize(path);
        self.fs
            .nodes
            .lock()
            .get(&key)
            .map(|node| Self::entry(&key, node))
            .ok_or_else(|| SftpError::NotFound(path.to_string()))
    }

    async fn open_write(&self, path: &str, offset: u64) -> Result<RemoteWriter, SftpError> {
        let key = normalize(path);
        {
            let mut nodes = self.fs.nodes.lock();
            if !matches!(nodes.get(&parent_of(&key)), Some(Node::Dir)) {
                return Err(SftpError::NotFound(path.to_string()));
            }
            if offset == 0 {
                nodes.insert(key.clone(), Node::File(Vec::new()));
            } else if !matches!(nodes.get(&key), Some(Node::File(_))) {
                return Err(SftpError::NotFound(path.to_string()));
            }
        }
        Ok(Box::new(MemWriter {
            fs: self.fs.clone(),
            path: key,
            pos: offset,
        }))
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<RemoteReader, SftpError> {
        let key = normalize(path);
        if !matches!(self.fs.nodes.lock().get(&key), Some(Node::File(_))) {
            return Err(SftpError::NotFound(path.to_string()));
        }
        Ok(Box::new(MemReader {
            fs: self.fs.clone(),
            path: key,
            pos: offset,
        }))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        let (from_key, to_key) = (normalize(from), normalize(to));
        let mut nodes = self.fs.nodes.lock();
        if nodes.contains_key(&to_key) {
            // SFTP v3 servers refuse to overwrite
            return Err(SftpError::Failure {
                path: from.to_string(),
                message: "Failure".to_string(),
            });
        }
        let node = nodes
            .remove(&from_key)
            .ok_or_else(|| SftpError::NotFound(from.to_string()))?;
        nodes.insert(to_key, node);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        let key = normalize(path);
        let mut nodes = self.fs.nodes.lock();
        match nodes.get(&key) {
            Some(Node::File(_)) => {
                nodes.remove(&key);
                Ok(())
            }
            _ => Err(SftpError::NotFound(path.to_string())),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        let key = normalize(path);
        let mut nodes = self.fs.nodes.lock();
        if nodes.contains_key(&key) {
            return Err(SftpError::Failure {
                path: path.to_string(),
                message: "Failure".to_string(),
            });
        }
        if !matches!(nodes.get(&parent_of(&key)), Some(Node::Dir)) {
            return Err(SftpError::NotFound(path.to_string()));
        }
        nodes.insert(key, Node::Dir);
        Ok(())
    }

    async fn close(&self) -> Result<(), SftpError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemWriter {
    fs: Arc<MemFs>,
    path: String,
    pos: u64,
}

impl AsyncWrite for MemWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        {
            let mut faults = this.fs.faults.lock();
            if faults.remaining > 0 && this.pos >= faults.after {
                faults.remaining -= 1;
                let err = match &faults.status {
                    Some(message) => io::Error::other(message.clone()),
                    None => io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"),
                };
                return Poll::Ready(Err(err));
            }
        }

        let mut nodes = this.fs.nodes.lock();
        let Some(Node::File(data)) = nodes.get_mut(&this.path) else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotFound,
                "No such file",
            )));
        };
        let start = this.pos as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        this.pos = end as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct MemReader {
    fs: Arc<MemFs>,
    path: String,
    pos: u64,
}

impl AsyncRead for MemReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let nodes = this.fs.nodes.lock();
        let Some(Node::File(data)) = nodes.get(&this.path) else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotFound,
                "No such file",
            )));
        };
        let start = (this.pos as usize).min(data.len());
        let n = (data.len() - start).min(buf.remaining());
        buf.put_slice(&data[start..start + n]);
        this.pos += n as u64;
        Poll::Ready(Ok(()))
    }
}
