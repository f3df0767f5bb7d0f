//! Per-client protocol state machine
//!
//! A [`ProtocolBridge`] is created for each transport connection. It owns the
//! client's tabs and shells, drives the shared services from inbound
//! messages and pushes [`ServerMessage`]s onto the outbound channel. Anything
//! that can wait on the network (connects, SFTP work, shell output) runs in
//! its own task so one slow session never stalls the others.

use std::future::Future;
use std::sync::{Arc, Weak};

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Level};

use super::protocol::{
    check_dimensions, required, ClientMessage, ConnectRequest, DisconnectRequest,
    DownloadRequest, InputRequest, ListRequest, ResizeRequest, ServerMessage, TabActivateRequest,
    TransferAction, TransferControlRequest, UploadRequest, Utf8Decoder, DEFAULT_COLS,
    DEFAULT_ROWS,
};
use crate::error::BridgeError;
use crate::session::{SessionEvent, SubscriptionToken};
use crate::sftp::{SftpError, TransferProgress};
use crate::ssh::ShellChannel;
use crate::tabs::TabMultiplexer;
use crate::Services;

/// Progress events buffered between a transfer and the outbound channel
const PROGRESS_CAPACITY: usize = 16;

pub struct ProtocolBridge {
    client_id: String,
    services: Arc<Services>,
    tabs: Arc<TabMultiplexer>,
    /// Sessions created by this client; the shell is attached once open
    sessions: DashMap<String, Option<Arc<ShellChannel>>>,
    outbound: mpsc::Sender<ServerMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionToken>>,
}

impl ProtocolBridge {
    pub fn new(services: Arc<Services>, outbound: mpsc::Sender<ServerMessage>) -> Arc<Self> {
        let tabs = Arc::new(TabMultiplexer::new(
            services.registry.clone(),
            services.config.tabs.clone(),
        ));
        let watcher = tabs.watch_registry();

        let bridge = Arc::new(Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            services,
            tabs,
            sessions: DashMap::new(),
            outbound,
            tasks: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
        });
        let removals = bridge.watch_removals();
        bridge.tasks.lock().extend([watcher, removals]);
        bridge
    }

    /// End our own sessions when the registry drops them behind our back,
    /// e.g. the inactivity sweep removing a session that never connected
    fn watch_removals(self: &Arc<Self>) -> JoinHandle<()> {
        let mut subscription = self.services.registry.events().subscribe();
        *self.subscription.lock() = Some(subscription.token);
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(event) = subscription.events.recv().await {
                let SessionEvent::Removed { session_id } = event else {
                    continue;
                };
                let Some(bridge) = weak.upgrade() else {
                    break;
                };
                if bridge.sessions.contains_key(&session_id) {
                    debug!(
                        "Session {} removed from the registry, ending it for client {}",
                        session_id, bridge.client_id
                    );
                    bridge.end_session(&session_id).await;
                }
            }
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn tabs(&self) -> &Arc<TabMultiplexer> {
        &self.tabs
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Decode and handle one text frame
    pub async fn handle_text(self: &Arc<Self>, text: &str) {
        let message = match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                if tracing::enabled!(Level::DEBUG) {
                    debug!(
                        "Client {} sent {}",
                        self.client_id,
                        self.services.gate.sanitize_log_data(&value)
                    );
                }
                ClientMessage::from_value(value)
            }
            Err(e) => Err(BridgeError::Protocol(format!("malformed message: {}", e))),
        };

        match message {
            Ok(message) => self.handle(message).await,
            Err(e) => self.send_error(None, &e).await,
        }
    }

    pub async fn handle(self: &Arc<Self>, message: ClientMessage) {
        let session_id = message.session_id().map(str::to_string);

        let result = match message {
            ClientMessage::SshConnect(req) => {
                let bridge = Arc::clone(self);
                self.spawn(async move { bridge.ssh_connect(req).await });
                Ok(())
            }
            ClientMessage::TerminalInput(req) => self.terminal_input(req).await,
            ClientMessage::TerminalResize(req) => self.terminal_resize(req).await,
            ClientMessage::SshDisconnect(req) => {
                self.ssh_disconnect(req).await;
                Ok(())
            }
            ClientMessage::SftpList(req) => self.sftp_list(req),
            ClientMessage::SftpUpload(req) => self.sftp_upload(req),
            ClientMessage::SftpDownload(req) => self.sftp_download(req),
            ClientMessage::SftpTransferControl(req) => self.transfer_control(req),
            ClientMessage::TabActivate(req) => self.tab_activate(req).await,
        };

        if let Err(e) = result {
            self.send_error(session_id, &e).await;
        }
    }

    async fn ssh_connect(self: &Arc<Self>, req: ConnectRequest) {
        let (cols, rows) = match check_dimensions(
            Some(req.cols.unwrap_or(DEFAULT_COLS)),
            Some(req.rows.unwrap_or(DEFAULT_ROWS)),
        ) {
            Ok(size) => size,
            Err(e) => return self.send_error(None, &e).await,
        };

        // Validation, rate-limit and tab-limit failures leave nothing behind
        let (session, _tab) = match self.tabs.create_session(req.config, None) {
            Ok(created) => created,
            Err(e) => return self.send_error(None, &e).await,
        };
        let session_id = session.id;
        self.sessions.insert(session_id.clone(), None);

        let output = match self.open_terminal(&session_id, cols, rows).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Connect failed for session {}: {}", session_id, e);
                return self.send_error(Some(session_id), &e).await;
            }
        };

        info!(
            "Client {} connected session {} ({}x{})",
            self.client_id, session_id, cols, rows
        );
        self.send(ServerMessage::connected(session_id.clone())).await;
        self.spawn_output_relay(session_id, output);
    }

    /// Connect the session and attach a shell. Returns the shell's output
    /// stream.
    async fn open_terminal(
        &self,
        session_id: &str,
        cols: u32,
        rows: u32,
    ) -> Result<mpsc::Receiver<Bytes>, BridgeError> {
        self.services.registry.connect(session_id).await?;

        let connection = self
            .services
            .registry
            .connection(session_id)
            .ok_or_else(|| BridgeError::NotConnected(session_id.to_string()))?;
        let mut shell = connection.open_shell(cols, rows).await?;
        let output = shell
            .take_data_stream()
            .ok_or_else(|| BridgeError::Connection("shell output unavailable".to_string()))?;

        let shell = Arc::new(shell);
        let attached = match self.sessions.get_mut(session_id) {
            Some(mut slot) => {
                *slot = Some(shell.clone());
                true
            }
            None => false,
        };
        if !attached {
            // Disconnected while the shell was opening
            shell.close().await;
            return Err(BridgeError::SessionNotFound(session_id.to_string()));
        }
        Ok(output)
    }

    fn spawn_output_relay(self: &Arc<Self>, session_id: String, mut output: mpsc::Receiver<Bytes>) {
        let weak = Arc::downgrade(self);
        self.spawn(async move {
            let mut decoder = Utf8Decoder::new();
            while let Some(chunk) = output.recv().await {
                let Some(bridge) = weak.upgrade() else {
                    return;
                };
                let text = decoder.decode(&chunk);
                if !text.is_empty() {
                    bridge.relay_output(&session_id, text).await;
                }
            }

            let Some(bridge) = weak.upgrade() else {
                return;
            };
            let tail = decoder.finish();
            if !tail.is_empty() {
                bridge.relay_output(&session_id, tail).await;
            }
            debug!("Shell output ended for session {}", session_id);
            bridge.end_session(&session_id).await;
        });
    }

    async fn relay_output(&self, session_id: &str, text: String) {
        self.services.registry.update_last_activity(session_id);
        self.tabs.mark_tab_activity(session_id, text.as_bytes());
        self.send(ServerMessage::TerminalData {
            session_id: session_id.to_string(),
            data: text,
        })
        .await;
    }

    async fn terminal_input(&self, req: InputRequest) -> Result<(), BridgeError> {
        let session_id = required(req.session_id, "sessionId")?;
        let input = required(req.input, "input")?;

        let shell = self.shell(&session_id)?;
        shell.write(input.as_bytes()).await?;

        self.services.registry.update_last_activity(&session_id);
        self.tabs.mark_tab_activity(&session_id, &[]);
        Ok(())
    }

    async fn terminal_resize(&self, req: ResizeRequest) -> Result<(), BridgeError> {
        let session_id = required(req.session_id, "sessionId")?;
        let (cols, rows) = check_dimensions(req.cols, req.rows)?;

        let shell = self.shell(&session_id)?;
        shell.resize(cols, rows).await?;

        self.services.registry.update_last_activity(&session_id);
        debug!("Resize: {}x{} for session {}", cols, rows, session_id);
        Ok(())
    }

    async fn ssh_disconnect(&self, req: DisconnectRequest) {
        let targets = match req.session_id {
            Some(session_id) => vec![session_id],
            None => self.session_ids(),
        };

        for session_id in targets {
            if !self.end_session(&session_id).await {
                info!(
                    "Client {} asked to disconnect unknown session {}",
                    self.client_id, session_id
                );
            }
        }
    }

    /// Tear down one of this client's sessions. Returns false if the session
    /// was not ours or was already ended. `ssh_disconnected` is emitted once.
    async fn end_session(&self, session_id: &str) -> bool {
        let Some((_, shell)) = self.sessions.remove(session_id) else {
            return false;
        };

        if let Some(shell) = shell {
            shell.close().await;
        }

        self.services.sftp.transfers().cancel_session(session_id);
        self.services.sftp.close_sftp_connection(session_id).await;

        let closed_with_tab = match self.tabs.tab_for_session(session_id) {
            Some(tab) => self.tabs.close_tab(&tab.id).await.is_ok(),
            None => false,
        };
        if !closed_with_tab {
            self.services.registry.disconnect(session_id).await;
        }

        info!("Client {} ended session {}", self.client_id, session_id);
        self.send(ServerMessage::SshDisconnected {
            session_id: session_id.to_string(),
        })
        .await;
        true
    }

    fn sftp_list(self: &Arc<Self>, req: ListRequest) -> Result<(), BridgeError> {
        let session_id = required(req.session_id, "sessionId")?;
        self.ensure_owned(&session_id)?;
        let path = req.path.unwrap_or_else(|| ".".to_string());

        let bridge = Arc::clone(self);
        self.spawn(async move {
            match bridge.services.sftp.list_directory(&session_id, &path).await {
                Ok(entries) => {
                    bridge.services.registry.update_last_activity(&session_id);
                    bridge
                        .send(ServerMessage::SftpListResult {
                            session_id,
                            path,
                            entries,
                        })
                        .await;
                }
                Err(e) => bridge.send_error(Some(session_id), &e.into()).await,
            }
        });
        Ok(())
    }

    fn sftp_upload(self: &Arc<Self>, req: UploadRequest) -> Result<(), BridgeError> {
        let session_id = required(req.session_id, "sessionId")?;
        let remote_dir = required(req.remote_dir, "remoteDir")?;
        let filename = required(req.filename, "filename")?;
        let encoded = required(req.data, "data")?;
        self.ensure_owned(&session_id)?;

        let data = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| BridgeError::InvalidInput(format!("data is not valid base64: {}", e)))?;
        let transfer_id = req
            .transfer_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let bridge = Arc::clone(self);
        self.spawn(async move {
            let (progress_tx, forwarder) = bridge.forward_progress(&session_id);
            let result = bridge
                .services
                .sftp
                .upload_file(
                    &session_id,
                    &data,
                    &remote_dir,
                    &filename,
                    Some(progress_tx),
                    Some(transfer_id.clone()),
                )
                .await;
            // Progress must reach the client before the result
            let _ = forwarder.await;

            match result {
                Ok(remote_path) => {
                    bridge.services.registry.update_last_activity(&session_id);
                    bridge
                        .send(ServerMessage::SftpUploadResult {
                            session_id,
                            transfer_id,
                            remote_path,
                        })
                        .await;
                }
                Err(SftpError::Cancelled) => info!("Upload {} cancelled", transfer_id),
                Err(e) => bridge.send_error(Some(session_id), &e.into()).await,
            }
        });
        Ok(())
    }

    fn sftp_download(self: &Arc<Self>, req: DownloadRequest) -> Result<(), BridgeError> {
        let session_id = required(req.session_id, "sessionId")?;
        let remote_path = required(req.remote_path, "remotePath")?;
        self.ensure_owned(&session_id)?;
        let transfer_id = req
            .transfer_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let bridge = Arc::clone(self);
        self.spawn(async move {
            let (progress_tx, forwarder) = bridge.forward_progress(&session_id);
            let result = bridge
                .services
                .sftp
                .download_file(
                    &session_id,
                    &remote_path,
                    Some(progress_tx),
                    Some(transfer_id.clone()),
                )
                .await;
            let _ = forwarder.await;

            match result {
                Ok(data) => {
                    bridge.services.registry.update_last_activity(&session_id);
                    bridge
                        .send(ServerMessage::SftpDownloadResult {
                            session_id,
                            transfer_id,
                            remote_path,
                            data: STANDARD.encode(data),
                        })
                        .await;
                }
                Err(SftpError::Cancelled) => info!("Download {} cancelled", transfer_id),
                Err(e) => bridge.send_error(Some(session_id), &e.into()).await,
            }
        });
        Ok(())
    }

    /// Channel a transfer reports into, plus the task relaying it as
    /// `sftp_progress`. The task ends once the sender is dropped.
    fn forward_progress(
        &self,
        session_id: &str,
    ) -> (mpsc::Sender<TransferProgress>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<TransferProgress>(PROGRESS_CAPACITY);
        let outbound = self.outbound.clone();
        let session_id = session_id.to_string();

        let forwarder = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                let message = ServerMessage::SftpProgress {
                    session_id: session_id.clone(),
                    progress,
                };
                if outbound.send(message).await.is_err() {
                    break;
                }
            }
        });
        (tx, forwarder)
    }

    fn transfer_control(&self, req: TransferControlRequest) -> Result<(), BridgeError> {
        let transfer_id = required(req.transfer_id, "transferId")?;
        let transfers = self.services.sftp.transfers();

        // Only transfers on this client's sessions are visible
        let owned = transfers
            .get(&transfer_id)
            .is_some_and(|item| self.sessions.contains_key(&item.session_id));
        if !owned {
            return Err(BridgeError::InvalidInput(format!(
                "unknown transfer {}",
                transfer_id
            )));
        }

        let applied = match req.action {
            TransferAction::Pause => transfers.pause(&transfer_id),
            TransferAction::Resume => transfers.resume(&transfer_id),
            TransferAction::Cancel => transfers.cancel(&transfer_id),
        };
        if !applied {
            return Err(BridgeError::InvalidInput(format!(
                "unknown transfer {}",
                transfer_id
            )));
        }
        Ok(())
    }

    async fn tab_activate(&self, req: TabActivateRequest) -> Result<(), BridgeError> {
        let session_id = required(req.session_id, "sessionId")?;
        self.ensure_owned(&session_id)?;

        let buffered = self.tabs.activate_session(&session_id)?;
        self.send(ServerMessage::TabBuffer {
            session_id,
            data: String::from_utf8_lossy(&buffered).into_owned(),
        })
        .await;
        Ok(())
    }

    /// The client went away: end every session it owned and stop its tasks
    pub async fn on_transport_closed(&self) {
        let sessions = self.session_ids();
        info!(
            "Client {} closed, ending {} session(s)",
            self.client_id,
            sessions.len()
        );

        for session_id in &sessions {
            self.end_session(session_id).await;
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.tabs.detach();
        if let Some(token) = self.subscription.lock().take() {
            self.services.registry.events().unsubscribe(token);
        }
    }

    fn shell(&self, session_id: &str) -> Result<Arc<ShellChannel>, BridgeError> {
        match self.sessions.get(session_id) {
            Some(slot) => slot
                .value()
                .clone()
                .ok_or_else(|| BridgeError::NotConnected(session_id.to_string())),
            None => Err(BridgeError::SessionNotFound(session_id.to_string())),
        }
    }

    fn ensure_owned(&self, session_id: &str) -> Result<(), BridgeError> {
        if self.sessions.contains_key(session_id) {
            Ok(())
        } else {
            Err(BridgeError::SessionNotFound(session_id.to_string()))
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    async fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!("Client {} outbound closed, message dropped", self.client_id);
        }
    }

    async fn send_error(&self, session_id: Option<String>, err: &BridgeError) {
        warn!(
            "Client {} error [{}] session {:?}: {}",
            self.client_id,
            err.code(),
            session_id,
            err
        );
        self.send(ServerMessage::error(session_id, err)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::session::ConnectionState;
    use crate::testing::{MemorySftp, MockConnector, MockOutcome};
    use serde_json::json;
    use std::time::Duration;

    fn services(connector: Arc<MockConnector>) -> Arc<Services> {
        let mut config = BridgeConfig::default();
        config.transfer.progress_interval_ms = 0;
        config.transfer.chunk_size = 4;
        config.rate_limit.max_attempts = 1000;
        Services::with_connector(config, connector)
    }

    fn client(services: &Arc<Services>) -> (Arc<ProtocolBridge>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(256);
        (ProtocolBridge::new(services.clone(), tx), rx)
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("outbound closed")
    }

    async fn send(bridge: &Arc<ProtocolBridge>, message: Value) {
        bridge.handle_text(&message.to_string()).await;
    }

    fn connect_message() -> Value {
        json!({
            "type": "ssh_connect",
            "payload": {
                "config": {"hostname": "example.com", "port": 22, "username": "alice", "password": "secret"},
                "cols": 100,
                "rows": 30
            }
        })
    }

    async fn connect(
        bridge: &Arc<ProtocolBridge>,
        rx: &mut mpsc::Receiver<ServerMessage>,
    ) -> String {
        send(bridge, connect_message()).await;
        match next(rx).await {
            ServerMessage::SshConnected { session_id, status } => {
                assert_eq!(status, "connected");
                session_id
            }
            other => panic!("expected ssh_connected, got {:?}", other),
        }
    }

    fn error_code(message: &ServerMessage) -> &'static str {
        match message {
            ServerMessage::SshError { code, .. } => code,
            other => panic!("expected ssh_error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_session() {
        let connector = MockConnector::new();
        let services = services(connector.clone());
        let (bridge, mut rx) = client(&services);

        let session_id = connect(&bridge, &mut rx).await;
        assert_eq!(connector.connections()[0].sizes(), vec![(100, 30)]);

        send(
            &bridge,
            json!({"type": "terminal_input", "payload": {"sessionId": session_id, "input": "ls\n"}}),
        )
        .await;
        let mut echoed = String::new();
        while echoed != "ls\n" {
            match next(&mut rx).await {
                ServerMessage::TerminalData { session_id: sid, data } => {
                    assert_eq!(sid, session_id);
                    echoed.push_str(&data);
                }
                other => panic!("expected terminal_data, got {:?}", other),
            }
        }

        send(&bridge, json!({"type": "ssh_disconnect", "payload": {}})).await;
        match next(&mut rx).await {
            ServerMessage::SshDisconnected { session_id: sid } => assert_eq!(sid, session_id),
            other => panic!("expected ssh_disconnected, got {:?}", other),
        }

        assert!(services.registry.get_session(&session_id).is_none());
        assert!(connector.connections()[0].is_closed());
        assert!(bridge.tabs().get_tabs().is_empty());

        // Exactly one ssh_disconnected even though the shell output also ends
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_input_keeps_session() {
        let services = services(MockConnector::new());
        let (bridge, mut rx) = client(&services);
        let session_id = connect(&bridge, &mut rx).await;

        send(
            &bridge,
            json!({"type": "terminal_input", "payload": {"sessionId": session_id, "input": null}}),
        )
        .await;
        let message = next(&mut rx).await;
        assert_eq!(error_code(&message), "INVALID_INPUT");
        match message {
            ServerMessage::SshError { session_id: sid, .. } => {
                assert_eq!(sid.as_deref(), Some(session_id.as_str()))
            }
            _ => unreachable!(),
        }

        send(&bridge, json!({"type": "terminal_input", "payload": {"input": "x"}})).await;
        assert_eq!(error_code(&next(&mut rx).await), "INVALID_INPUT");

        let info = services.registry.get_session(&session_id).unwrap();
        assert_eq!(info.connection_state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_resize_validation() {
        let connector = MockConnector::new();
        let services = services(connector.clone());
        let (bridge, mut rx) = client(&services);
        let session_id = connect(&bridge, &mut rx).await;

        send(
            &bridge,
            json!({"type": "terminal_resize", "payload": {"sessionId": session_id, "cols": 5000, "rows": 24}}),
        )
        .await;
        assert_eq!(error_code(&next(&mut rx).await), "INVALID_DIMENSIONS");
        let info = services.registry.get_session(&session_id).unwrap();
        assert_eq!(info.connection_state, ConnectionState::Connected);

        send(
            &bridge,
            json!({"type": "terminal_resize", "payload": {"sessionId": session_id, "cols": 132, "rows": 43}}),
        )
        .await;
        let connection = connector.connections()[0].clone();
        tokio::time::timeout(Duration::from_secs(1), async {
            while connection.sizes().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(connection.sizes(), vec![(100, 30), (132, 43)]);
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_no_session() {
        let connector = MockConnector::new();
        let services = services(connector.clone());
        let (bridge, mut rx) = client(&services);

        send(
            &bridge,
            json!({"type": "ssh_connect", "payload": {"config": {"hostname": "", "port": 0, "username": "u"}}}),
        )
        .await;
        match next(&mut rx).await {
            ServerMessage::SshError {
                session_id,
                code,
                details,
                ..
            } => {
                assert_eq!(code, "VALIDATION_ERROR");
                assert!(session_id.is_none());
                assert!(details.unwrap()["errors"].as_array().unwrap().len() >= 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(services.registry.is_empty());
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn test_connection_failure_retains_session() {
        let connector = MockConnector::new();
        connector.set_outcome(MockOutcome::Refuse);
        let services = services(connector.clone());
        let (bridge, mut rx) = client(&services);

        send(&bridge, connect_message()).await;
        let session_id = match next(&mut rx).await {
            ServerMessage::SshError {
                session_id, code, ..
            } => {
                assert_eq!(code, "CONNECTION_ERROR");
                session_id.unwrap()
            }
            other => panic!("unexpected {:?}", other),
        };

        let info = services.registry.get_session(&session_id).unwrap();
        assert_eq!(info.connection_state, ConnectionState::Disconnected);

        send(
            &bridge,
            json!({"type": "terminal_input", "payload": {"sessionId": session_id, "input": "x"}}),
        )
        .await;
        assert_eq!(error_code(&next(&mut rx).await), "NOT_CONNECTED");
    }

    #[tokio::test]
    async fn test_connect_timeout_reports_session() {
        let connector = MockConnector::new();
        connector.set_outcome(MockOutcome::Timeout);
        let services = services(connector.clone());
        let (bridge, mut rx) = client(&services);

        send(&bridge, connect_message()).await;
        let session_id = match next(&mut rx).await {
            ServerMessage::SshError {
                session_id, code, ..
            } => {
                assert_eq!(code, "CONNECTION_ERROR");
                session_id.expect("timeout error carries the session id")
            }
            other => panic!("unexpected {:?}", other),
        };

        let info = services.registry.get_session(&session_id).unwrap();
        assert_eq!(info.connection_state, ConnectionState::Disconnected);
        assert_eq!(bridge.session_ids(), vec![session_id]);
    }

    #[tokio::test]
    async fn test_swept_session_is_ended_for_client() {
        let connector = MockConnector::new();
        connector.set_outcome(MockOutcome::Refuse);
        let services = services(connector.clone());
        let (bridge, mut rx) = client(&services);

        send(&bridge, connect_message()).await;
        let session_id = match next(&mut rx).await {
            ServerMessage::SshError { session_id, .. } => session_id.unwrap(),
            other => panic!("unexpected {:?}", other),
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = services
            .registry
            .cleanup_inactive_sessions(Duration::from_millis(1))
            .await;
        assert_eq!(removed, vec![session_id.clone()]);

        match next(&mut rx).await {
            ServerMessage::SshDisconnected { session_id: sid } => assert_eq!(sid, session_id),
            other => panic!("expected ssh_disconnected, got {:?}", other),
        }
        assert!(bridge.session_ids().is_empty());

        // The next message is the error, not a second ssh_disconnected
        send(
            &bridge,
            json!({"type": "terminal_input", "payload": {"sessionId": session_id, "input": "x"}}),
        )
        .await;
        assert_eq!(error_code(&next(&mut rx).await), "SESSION_NOT_FOUND");
        assert!(bridge.tabs().get_tabs().is_empty());
    }

    #[tokio::test]
    async fn test_transport_close_releases_connections() {
        let connector = MockConnector::new();
        let services = services(connector.clone());
        let (bridge, mut rx) = client(&services);
        connect(&bridge, &mut rx).await;
        connect(&bridge, &mut rx).await;

        bridge.on_transport_closed().await;

        assert!(services.registry.is_empty());
        assert!(connector.connections().iter().all(|c| c.is_closed()));
        assert!(bridge.session_ids().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_scoped_to_client() {
        let services = services(MockConnector::new());
        let (owner, mut owner_rx) = client(&services);
        let (other, mut other_rx) = client(&services);
        let session_id = connect(&owner, &mut owner_rx).await;

        send(
            &other,
            json!({"type": "terminal_input", "payload": {"sessionId": session_id, "input": "x"}}),
        )
        .await;
        assert_eq!(error_code(&next(&mut other_rx).await), "SESSION_NOT_FOUND");

        send(&other, json!({"type": "ssh_disconnect", "payload": {"sessionId": session_id}})).await;
        assert!(services.registry.get_session(&session_id).is_some());
    }

    #[tokio::test]
    async fn test_inactive_tab_output_replayed_on_activate() {
        let services = services(MockConnector::new());
        let (bridge, mut rx) = client(&services);
        let first = connect(&bridge, &mut rx).await;
        let _second = connect(&bridge, &mut rx).await;

        send(
            &bridge,
            json!({"type": "terminal_input", "payload": {"sessionId": first, "input": "hello"}}),
        )
        .await;
        let mut seen = String::new();
        while seen != "hello" {
            if let ServerMessage::TerminalData { data, .. } = next(&mut rx).await {
                seen.push_str(&data);
            }
        }
        assert!(bridge.tabs().tab_for_session(&first).unwrap().has_unread_activity);

        send(&bridge, json!({"type": "tab_activate", "payload": {"sessionId": first}})).await;
        match next(&mut rx).await {
            ServerMessage::TabBuffer { session_id, data } => {
                assert_eq!(session_id, first);
                assert_eq!(data, "hello");
            }
            other => panic!("expected tab_buffer, got {:?}", other),
        }
        assert!(bridge.tabs().active_tab().unwrap().session_id == first);
    }

    #[tokio::test]
    async fn test_sftp_upload_download_and_list() {
        let sftp = MemorySftp::new();
        sftp.put_dir("/data");
        let services = services(MockConnector::with_sftp(sftp.clone()));
        let (bridge, mut rx) = client(&services);
        let session_id = connect(&bridge, &mut rx).await;

        send(
            &bridge,
            json!({"type": "sftp_upload", "payload": {
                "sessionId": session_id,
                "remoteDir": "/data",
                "filename": "a.txt",
                "data": STANDARD.encode(b"hello world"),
                "transferId": "t1"
            }}),
        )
        .await;

        let mut last_progress = 0;
        loop {
            match next(&mut rx).await {
                ServerMessage::SftpProgress { progress, .. } => {
                    assert!(progress.transferred_bytes >= last_progress);
                    last_progress = progress.transferred_bytes;
                }
                ServerMessage::SftpUploadResult {
                    transfer_id,
                    remote_path,
                    ..
                } => {
                    assert_eq!(transfer_id, "t1");
                    assert_eq!(remote_path, "/data/a.txt");
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(last_progress, 11);
        assert_eq!(sftp.read_file("/data/a.txt").unwrap(), b"hello world");

        send(
            &bridge,
            json!({"type": "sftp_download", "payload": {"sessionId": session_id, "remotePath": "/data/a.txt"}}),
        )
        .await;
        loop {
            match next(&mut rx).await {
                ServerMessage::SftpProgress { .. } => {}
                ServerMessage::SftpDownloadResult { data, .. } => {
                    assert_eq!(STANDARD.decode(data).unwrap(), b"hello world");
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        send(
            &bridge,
            json!({"type": "sftp_list", "payload": {"sessionId": session_id, "path": "/data"}}),
        )
        .await;
        match next(&mut rx).await {
            ServerMessage::SftpListResult { entries, .. } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].name, "a.txt");
            }
            other => panic!("unexpected {:?}", other),
        }

        send(
            &bridge,
            json!({"type": "sftp_download", "payload": {"sessionId": session_id, "remotePath": "/data/missing"}}),
        )
        .await;
        match next(&mut rx).await {
            ServerMessage::SshError { code, details, .. } => {
                assert_eq!(code, "SFTP_ERROR");
                assert_eq!(details.unwrap()["path"], "/data/missing");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_messages() {
        let services = services(MockConnector::new());
        let (bridge, mut rx) = client(&services);

        bridge.handle_text("{not json").await;
        assert_eq!(error_code(&next(&mut rx).await), "PROTOCOL_ERROR");

        send(&bridge, json!({"type": "sftp_upload", "payload": {"sessionId": "s", "remoteDir": "/", "filename": "f", "data": "%%%"}})).await;
        assert_eq!(error_code(&next(&mut rx).await), "SESSION_NOT_FOUND");

        send(&bridge, json!({"type": "sftp_transfer_control", "payload": {"transferId": "nope", "action": "pause"}})).await;
        assert_eq!(error_code(&next(&mut rx).await), "INVALID_INPUT");
    }
}
