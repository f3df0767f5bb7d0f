//! SFTP transfer engine
//!
//! One cached SFTP channel per connected session, plus resumable uploads and
//! downloads that report progress and honour pause/cancel between chunks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::channel::SftpChannel;
use super::error::SftpError;
use super::transfer::{TransferControl, TransferGuard, TransferManager, TransferRequest};
use super::types::{
    join_remote_path, remote_file_name, sort_entries, DirEntry, FileType, TransferDirection,
    TransferProgress, TransferStatus,
};
use crate::config::TransferSettings;
use crate::session::SessionRegistry;

/// Suffix of the temporary file an upload writes before the final rename
pub const PART_SUFFIX: &str = ".part";

pub struct SftpTransferEngine {
    registry: Arc<SessionRegistry>,
    channels: DashMap<String, Arc<dyn SftpChannel>>,
    transfers: Arc<TransferManager>,
    settings: TransferSettings,
}

impl SftpTransferEngine {
    pub fn new(registry: Arc<SessionRegistry>, settings: TransferSettings) -> Self {
        Self {
            registry,
            channels: DashMap::new(),
            transfers: Arc::new(TransferManager::new(settings.max_concurrent)),
            settings,
        }
    }

    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    /// Cached channel for `session_id`, opened on first use
    pub async fn create_sftp_connection(
        &self,
        session_id: &str,
    ) -> Result<Arc<dyn SftpChannel>, SftpError> {
        if let Some(channel) = self.channels.get(session_id) {
            return Ok(channel.clone());
        }

        let connection = self
            .registry
            .connection(session_id)
            .ok_or_else(|| SftpError::NotConnected(session_id.to_string()))?;
        let channel = connection.open_sftp().await?;

        // Another caller may have opened one while we were waiting
        let existing = match self.channels.entry(session_id.to_string()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(channel.clone());
                None
            }
        };
        match existing {
            Some(existing) => {
                let _ = channel.close().await;
                Ok(existing)
            }
            None => {
                info!("SFTP channel cached for session {}", session_id);
                Ok(channel)
            }
        }
    }

    /// Evict and close the cached channel. Closing twice is a no-op.
    pub async fn close_sftp_connection(&self, session_id: &str) {
        let Some((_, channel)) = self.channels.remove(session_id) else {
            debug!("No SFTP channel to close for session {}", session_id);
            return;
        };
        if let Err(e) = channel.close().await {
            warn!("Error closing SFTP channel for session {}: {}", session_id, e);
        }
        info!("SFTP channel closed for session {}", session_id);
    }

    /// Close every cached channel
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close_sftp_connection(&id).await;
        }
    }

    pub fn has_channel(&self, session_id: &str) -> bool {
        self.channels.contains_key(session_id)
    }

    async fn reopen(&self, session_id: &str) -> Result<Arc<dyn SftpChannel>, SftpError> {
        self.close_sftp_connection(session_id).await;
        self.create_sftp_connection(session_id).await
    }

    /// Run `op` on the session's channel, reopening once on a channel failure
    async fn run<T, F, Fut>(&self, session_id: &str, op: F) -> Result<T, SftpError>
    where
        F: Fn(Arc<dyn SftpChannel>) -> Fut,
        Fut: Future<Output = Result<T, SftpError>>,
    {
        let channel = self.create_sftp_connection(session_id).await?;
        match op(channel).await {
            Err(e) if e.is_channel_level() => {
                warn!("SFTP channel failed for session {} ({}), reopening", session_id, e);
                let channel = self.reopen(session_id).await.map_err(connection_lost)?;
                op(channel).await.map_err(connection_lost)
            }
            other => other,
        }
    }

    /// Directory listing, directories first then by name
    pub async fn list_directory(
        &self,
        session_id: &str,
        path: &str,
    ) -> Result<Vec<DirEntry>, SftpError> {
        let mut entries = self
            .run(session_id, |channel| async move { channel.read_dir(path).await })
            .await?;
        sort_entries(&mut entries);
        Ok(entries)
    }

    pub async fn stat(&self, session_id: &str, path: &str) -> Result<DirEntry, SftpError> {
        self.run(session_id, |channel| async move { channel.stat(path).await })
            .await
    }

    pub async fn create_directory(&self, session_id: &str, path: &str) -> Result<(), SftpError> {
        self.run(session_id, |channel| async move { channel.create_dir(path).await })
            .await
    }

    pub async fn remove_file(&self, session_id: &str, path: &str) -> Result<(), SftpError> {
        self.run(session_id, |channel| async move { channel.remove_file(path).await })
            .await
    }

    pub async fn rename(&self, session_id: &str, from: &str, to: &str) -> Result<(), SftpError> {
        self.run(session_id, |channel| async move { channel.rename(from, to).await })
            .await
    }

    /// Upload `data` as `remote_dir/filename` and return the remote path.
    ///
    /// Bytes go to `<path>.part` first and are renamed into place once
    /// complete. Re-running a failed transfer id resumes from the partial file.
    pub async fn upload_file(
        &self,
        session_id: &str,
        data: &[u8],
        remote_dir: &str,
        filename: &str,
        progress_tx: Option<mpsc::Sender<TransferProgress>>,
        transfer_id: Option<String>,
    ) -> Result<String, SftpError> {
        validate_file_name(remote_dir, filename)?;

        let transfer_id = transfer_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let remote_path = join_remote_path(remote_dir, filename);
        let part_path = format!("{}{}", remote_path, PART_SUFFIX);
        let total = data.len() as u64;

        let is_retry = self
            .transfers
            .get(&transfer_id)
            .is_some_and(|item| item.status == TransferStatus::Error);

        let control = self.transfers.begin(TransferRequest {
            id: transfer_id.clone(),
            session_id: session_id.to_string(),
            name: filename.to_string(),
            size: total,
            direction: TransferDirection::Upload,
            remote_path: remote_path.clone(),
        })?;
        let _guard = TransferGuard::new(&self.transfers, transfer_id.clone());

        let mut progress = Progress::new(
            &transfer_id,
            TransferDirection::Upload,
            filename,
            total,
            progress_tx,
            self.settings.progress_interval(),
        );

        let result = async {
            let _permit = self.wait_for_slot(&control).await?;

            if is_retry {
                progress.transferred = self.partial_size(session_id, &part_path, total).await;
                if progress.transferred > 0 {
                    info!(
                        "Resuming upload {} from offset {}",
                        transfer_id, progress.transferred
                    );
                }
            }

            self.transfers
                .set_status(&transfer_id, TransferStatus::Transferring)?;
            self.transfers
                .set_transferred(&transfer_id, progress.transferred);
            progress
                .emit(&control, TransferStatus::Transferring, true)
                .await?;

            let mut reopened = false;
            loop {
                let channel = if reopened {
                    self.reopen(session_id).await.map_err(connection_lost)?
                } else {
                    self.create_sftp_connection(session_id).await?
                };
                match self
                    .write_chunks(&channel, data, &part_path, &control, &mut progress)
                    .await
                {
                    Ok(()) => break,
                    Err(e) if e.is_channel_level() && !reopened => {
                        warn!(
                            "Upload {} lost its channel at {} bytes ({}), reopening",
                            transfer_id, progress.transferred, e
                        );
                        reopened = true;
                    }
                    Err(e) => return Err(connection_lost(e)),
                }
            }

            // Last chance to honour a cancel before the file becomes visible
            if control.is_cancelled() {
                return Err(SftpError::Cancelled);
            }

            self.finalize_upload(session_id, &part_path, &remote_path)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                self.transfers
                    .set_status(&transfer_id, TransferStatus::Completed)?;
                // Nothing else can cancel us at this point, the file is in place
                progress.emit_final(TransferStatus::Completed).await;
                info!(
                    "Upload complete: {} ({} bytes) for session {}",
                    remote_path, total, session_id
                );
                Ok(remote_path)
            }
            Err(SftpError::Cancelled) => {
                info!("Upload cancelled, cleaning up {}", part_path);
                if let Err(e) = self.remove_file(session_id, &part_path).await {
                    debug!("Failed to delete partial file {}: {}", part_path, e);
                }
                let _ = self
                    .transfers
                    .set_status(&transfer_id, TransferStatus::Cancelled);
                Err(SftpError::Cancelled)
            }
            Err(e) => {
                // Partial file is kept so a retry can resume
                warn!("Upload {} failed: {}", transfer_id, e);
                let _ = self.transfers.set_status(&transfer_id, TransferStatus::Error);
                Err(e)
            }
        }
    }

    async fn write_chunks(
        &self,
        channel: &Arc<dyn SftpChannel>,
        data: &[u8],
        part_path: &str,
        control: &TransferControl,
        progress: &mut Progress,
    ) -> Result<(), SftpError> {
        let mut writer = channel.open_write(part_path, progress.transferred).await?;
        let chunk_size = self.settings.chunk_size.max(1);

        while progress.transferred < progress.total {
            self.checkpoint(control, progress).await?;

            let start = progress.transferred as usize;
            let end = (start + chunk_size).min(data.len());
            writer
                .write_all(&data[start..end])
                .await
                .map_err(|e| SftpError::from_io(e, part_path))?;

            progress.transferred = end as u64;
            self.transfers
                .set_transferred(&progress.transfer_id, progress.transferred);
            progress
                .emit(control, TransferStatus::Transferring, false)
                .await?;
        }

        writer
            .flush()
            .await
            .map_err(|e| SftpError::from_io(e, part_path))?;
        writer
            .shutdown()
            .await
            .map_err(|e| SftpError::from_io(e, part_path))?;
        Ok(())
    }

    /// Move the finished partial file over the target
    async fn finalize_upload(
        &self,
        session_id: &str,
        part_path: &str,
        remote_path: &str,
    ) -> Result<(), SftpError> {
        match self.rename(session_id, part_path, remote_path).await {
            Ok(()) => Ok(()),
            // Plain SFTP rename refuses to overwrite
            Err(SftpError::Failure { .. }) => {
                self.remove_file(session_id, remote_path).await?;
                self.rename(session_id, part_path, remote_path).await
            }
            Err(e) => Err(e),
        }
    }

    async fn partial_size(&self, session_id: &str, part_path: &str, total: u64) -> u64 {
        match self.stat(session_id, part_path).await {
            Ok(entry) if entry.size <= total => entry.size,
            Ok(entry) => {
                warn!(
                    "Partial file {} is larger than the upload ({} > {}), restarting",
                    part_path, entry.size, total
                );
                0
            }
            Err(_) => 0,
        }
    }

    /// Download `remote_path` into memory
    pub async fn download_file(
        &self,
        session_id: &str,
        remote_path: &str,
        progress_tx: Option<mpsc::Sender<TransferProgress>>,
        transfer_id: Option<String>,
    ) -> Result<Vec<u8>, SftpError> {
        let entry = self.stat(session_id, remote_path).await?;
        if entry.file_type == FileType::Directory {
            return Err(SftpError::Failure {
                path: remote_path.to_string(),
                message: "Is a directory".to_string(),
            });
        }

        let total = entry.size;
        if total > self.settings.max_download_bytes {
            return Err(SftpError::Failure {
                path: remote_path.to_string(),
                message: format!(
                    "File is {} bytes, over the {} byte download limit",
                    total, self.settings.max_download_bytes
                ),
            });
        }

        let transfer_id = transfer_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let file_name = remote_file_name(remote_path).to_string();

        let control = self.transfers.begin(TransferRequest {
            id: transfer_id.clone(),
            session_id: session_id.to_string(),
            name: file_name.clone(),
            size: total,
            direction: TransferDirection::Download,
            remote_path: remote_path.to_string(),
        })?;
        let _guard = TransferGuard::new(&self.transfers, transfer_id.clone());

        let mut progress = Progress::new(
            &transfer_id,
            TransferDirection::Download,
            &file_name,
            total,
            progress_tx,
            self.settings.progress_interval(),
        );

        let result = async {
            let _permit = self.wait_for_slot(&control).await?;

            self.transfers
                .set_status(&transfer_id, TransferStatus::Transferring)?;
            self.transfers.set_transferred(&transfer_id, 0);
            progress
                .emit(&control, TransferStatus::Transferring, true)
                .await?;

            // Grown as bytes arrive rather than sized from the remote stat
            let mut buf = Vec::new();
            let mut reopened = false;
            loop {
                let channel = if reopened {
                    self.reopen(session_id).await.map_err(connection_lost)?
                } else {
                    self.create_sftp_connection(session_id).await?
                };
                match self
                    .read_chunks(&channel, remote_path, &mut buf, &control, &mut progress)
                    .await
                {
                    Ok(()) => break,
                    Err(e) if e.is_channel_level() && !reopened => {
                        warn!(
                            "Download {} lost its channel at {} bytes ({}), reopening",
                            transfer_id, progress.transferred, e
                        );
                        reopened = true;
                    }
                    Err(e) => return Err(connection_lost(e)),
                }
            }
            Ok(buf)
        }
        .await;

        match result {
            Ok(buf) => {
                self.transfers
                    .set_status(&transfer_id, TransferStatus::Completed)?;
                progress.emit_final(TransferStatus::Completed).await;
                info!(
                    "Download complete: {} ({} bytes) for session {}",
                    remote_path, total, session_id
                );
                Ok(buf)
            }
            Err(SftpError::Cancelled) => {
                info!("Download {} cancelled", transfer_id);
                let _ = self
                    .transfers
                    .set_status(&transfer_id, TransferStatus::Cancelled);
                Err(SftpError::Cancelled)
            }
            Err(e) => {
                warn!("Download {} failed: {}", transfer_id, e);
                let _ = self.transfers.set_status(&transfer_id, TransferStatus::Error);
                Err(e)
            }
        }
    }

    async fn read_chunks(
        &self,
        channel: &Arc<dyn SftpChannel>,
        remote_path: &str,
        buf: &mut Vec<u8>,
        control: &TransferControl,
        progress: &mut Progress,
    ) -> Result<(), SftpError> {
        let mut reader = channel.open_read(remote_path, buf.len() as u64).await?;
        let mut chunk = vec![0u8; self.settings.chunk_size.max(1)];

        while (buf.len() as u64) < progress.total {
            self.checkpoint(control, progress).await?;

            let remaining = (progress.total - buf.len() as u64) as usize;
            let want = remaining.min(chunk.len());
            let n = reader
                .read(&mut chunk[..want])
                .await
                .map_err(|e| SftpError::from_io(e, remote_path))?;
            if n == 0 {
                return Err(SftpError::Failure {
                    path: remote_path.to_string(),
                    message: format!(
                        "File ended after {} of {} bytes",
                        buf.len(),
                        progress.total
                    ),
                });
            }
            buf.extend_from_slice(&chunk[..n]);

            progress.transferred = buf.len() as u64;
            self.transfers
                .set_transferred(&progress.transfer_id, progress.transferred);
            progress
                .emit(control, TransferStatus::Transferring, false)
                .await?;
        }
        Ok(())
    }

    /// Chunk boundary: stop on cancel, park while paused
    async fn checkpoint(
        &self,
        control: &TransferControl,
        progress: &mut Progress,
    ) -> Result<(), SftpError> {
        if control.is_cancelled() {
            return Err(SftpError::Cancelled);
        }
        if control.is_paused() {
            self.transfers
                .set_status(&progress.transfer_id, TransferStatus::Paused)?;
            info!(
                "Transfer {} paused at {} bytes",
                progress.transfer_id, progress.transferred
            );
            progress.emit(control, TransferStatus::Paused, true).await?;

            control.wait_resumed().await?;

            self.transfers
                .set_status(&progress.transfer_id, TransferStatus::Transferring)?;
            info!(
                "Transfer {} resumed at {} bytes",
                progress.transfer_id, progress.transferred
            );
            progress
                .emit(control, TransferStatus::Transferring, true)
                .await?;
        }
        Ok(())
    }

    /// Hold the transfer in `queued` until a slot frees up or it is cancelled
    async fn wait_for_slot(
        &self,
        control: &TransferControl,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, SftpError> {
        tokio::select! {
            permit = self.transfers.acquire_permit() => permit,
            _ = control.cancelled() => Err(SftpError::Cancelled),
        }
    }
}

/// A second channel failure means the connection is gone
fn connection_lost(err: SftpError) -> SftpError {
    if err.is_channel_level() {
        SftpError::Connection(err.to_string())
    } else {
        err
    }
}

fn validate_file_name(remote_dir: &str, filename: &str) -> Result<(), SftpError> {
    if filename.is_empty() || filename == "." || filename == ".." || filename.contains('/') {
        return Err(SftpError::Failure {
            path: join_remote_path(remote_dir, filename),
            message: "Invalid file name".to_string(),
        });
    }
    Ok(())
}

/// Throttled progress reporting for one transfer
struct Progress {
    transfer_id: String,
    direction: TransferDirection,
    file_name: String,
    total: u64,
    transferred: u64,
    tx: Option<mpsc::Sender<TransferProgress>>,
    interval: Duration,
    last_emit: Option<Instant>,
}

impl Progress {
    fn new(
        transfer_id: &str,
        direction: TransferDirection,
        file_name: &str,
        total: u64,
        tx: Option<mpsc::Sender<TransferProgress>>,
        interval: Duration,
    ) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            direction,
            file_name: file_name.to_string(),
            total,
            transferred: 0,
            tx,
            interval,
            last_emit: None,
        }
    }

    fn snapshot(&self, status: TransferStatus) -> TransferProgress {
        TransferProgress {
            transfer_id: self.transfer_id.clone(),
            direction: self.direction,
            file_name: self.file_name.clone(),
            transferred_bytes: self.transferred,
            total_bytes: self.total,
            status,
        }
    }

    /// Send a progress event unless throttled. Waiting on a full channel
    /// bounds how far the transfer runs ahead of its consumer; a cancel
    /// during that wait drops the event.
    async fn emit(
        &mut self,
        control: &TransferControl,
        status: TransferStatus,
        force: bool,
    ) -> Result<(), SftpError> {
        let Some(tx) = self.tx.clone() else {
            return Ok(());
        };
        if !force {
            if let Some(last) = self.last_emit {
                if last.elapsed() < self.interval {
                    return Ok(());
                }
            }
        }

        let permit = tokio::select! {
            permit = tx.reserve() => permit,
            _ = control.cancelled() => return Err(SftpError::Cancelled),
        };
        let Ok(permit) = permit else {
            debug!("Progress receiver for {} dropped", self.transfer_id);
            self.tx = None;
            return Ok(());
        };
        if control.is_cancelled() {
            return Err(SftpError::Cancelled);
        }
        permit.send(self.snapshot(status));
        self.last_emit = Some(Instant::now());
        Ok(())
    }

    async fn emit_final(&mut self, status: TransferStatus) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(self.snapshot(status)).await;
        }
    }
}
