//! Transfer Manager for SFTP operations
//!
//! Tracks every transfer by id with its pause/cancel control and bounds how
//! many run at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::SftpError;
use super::types::{TransferDirection, TransferItem, TransferStatus};

/// Transfer control signals
#[derive(Debug)]
pub struct TransferControl {
    cancel_tx: watch::Sender<bool>,
    /// Independent from cancellation
    pause_tx: watch::Sender<bool>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let (pause_tx, _) = watch::channel(false);
        Self {
            cancel_tx,
            pause_tx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn pause(&self) {
        self.pause_tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause_tx.send_replace(false);
    }

    /// Resolves once the transfer is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        // Sender lives in self, so wait_for only fails if we are dropped
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Wait until resumed. Returns `Err(Cancelled)` if cancelled meanwhile.
    pub async fn wait_resumed(&self) -> Result<(), SftpError> {
        let mut pause_rx = self.pause_tx.subscribe();
        tokio::select! {
            _ = self.cancelled() => Err(SftpError::Cancelled),
            _ = pause_rx.wait_for(|paused| !*paused) => {
                if self.is_cancelled() {
                    Err(SftpError::Cancelled)
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

struct TransferEntry {
    item: TransferItem,
    control: Arc<TransferControl>,
    /// When the item last reached a settled state; `None` while a task owns it
    settled_at: Option<Instant>,
}

/// New transfer description handed to [`TransferManager::begin`]
pub struct TransferRequest {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub size: u64,
    pub direction: TransferDirection,
    pub remote_path: String,
}

/// Transfer Manager handles concurrent transfers
pub struct TransferManager {
    /// Limits concurrently running transfers; waiting ones stay queued
    semaphore: Arc<Semaphore>,
    entries: RwLock<HashMap<String, TransferEntry>>,
}

impl TransferManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a transfer, or re-arm one that previously failed.
    ///
    /// A retry keeps the item (and its progress) but gets a fresh control.
    pub fn begin(&self, request: TransferRequest) -> Result<Arc<TransferControl>, SftpError> {
        let mut entries = self.entries.write();

        if let Some(entry) = entries.get_mut(&request.id) {
            if entry.item.status != TransferStatus::Error {
                return Err(SftpError::InvalidTransition {
                    id: request.id,
                    from: entry.item.status.as_str(),
                    to: TransferStatus::Transferring.as_str(),
                });
            }
            entry.item.size = request.size;
            entry.control = Arc::new(TransferControl::new());
            entry.settled_at = None;
            info!("Retrying transfer: {}", request.id);
            return Ok(entry.control.clone());
        }

        let control = Arc::new(TransferControl::new());
        let id = request.id.clone();
        entries.insert(
            request.id.clone(),
            TransferEntry {
                item: TransferItem {
                    id: request.id,
                    session_id: request.session_id,
                    name: request.name,
                    size: request.size,
                    direction: request.direction,
                    status: TransferStatus::Queued,
                    transferred_bytes: 0,
                    remote_path: request.remote_path,
                },
                control: control.clone(),
                settled_at: None,
            },
        );
        info!("Registered transfer: {}", id);
        Ok(control)
    }

    /// Wait for a transfer slot
    pub async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, SftpError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SftpError::Transfer("transfer queue closed".to_string()))?;
        debug!(
            "Acquired transfer permit, {} slots left",
            self.semaphore.available_permits()
        );
        Ok(permit)
    }

    /// Move a transfer to `next`, enforcing the state machine
    pub fn set_status(&self, transfer_id: &str, next: TransferStatus) -> Result<(), SftpError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(transfer_id)
            .ok_or_else(|| SftpError::TransferNotFound(transfer_id.to_string()))?;

        let current = entry.item.status;
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(SftpError::InvalidTransition {
                id: transfer_id.to_string(),
                from: current.as_str(),
                to: next.as_str(),
            });
        }
        entry.item.status = next;
        entry.settled_at = next.is_settled().then(Instant::now);
        debug!(
            "Transfer {}: {} -> {}",
            transfer_id,
            current.as_str(),
            next.as_str()
        );
        Ok(())
    }

    pub fn set_transferred(&self, transfer_id: &str, bytes: u64) {
        if let Some(entry) = self.entries.write().get_mut(transfer_id) {
            entry.item.transferred_bytes = bytes.min(entry.item.size);
        }
    }

    pub fn get(&self, transfer_id: &str) -> Option<TransferItem> {
        self.entries
            .read()
            .get(transfer_id)
            .map(|entry| entry.item.clone())
    }

    pub fn list(&self) -> Vec<TransferItem> {
        self.entries
            .read()
            .values()
            .map(|entry| entry.item.clone())
            .collect()
    }

    /// Drop completed, cancelled and failed records settled for at least
    /// `older_than`. Items a task is still driving are never touched.
    pub fn clear_finished(&self, older_than: Duration) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            !entry
                .settled_at
                .is_some_and(|settled| settled.elapsed() >= older_than)
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Cleared {} settled transfer record(s)", removed);
        }
        removed
    }

    /// Run [`clear_finished`](Self::clear_finished) with `retention` until
    /// `cancel` fires
    pub fn spawn_retention_sweep(
        self: &Arc<Self>,
        retention: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let every = retention.clamp(Duration::from_secs(1), Duration::from_secs(60));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        manager.clear_finished(retention);
                    }
                }
            }
            debug!("Transfer retention sweep stopped");
        })
    }

    /// Cancel a specific transfer
    pub fn cancel(&self, transfer_id: &str) -> bool {
        if let Some(entry) = self.entries.read().get(transfer_id) {
            entry.control.cancel();
            info!("Cancelled transfer: {}", transfer_id);
            true
        } else {
            warn!("Transfer not found for cancel: {}", transfer_id);
            false
        }
    }

    /// Pause a specific transfer (keeps the partial file, can be resumed)
    pub fn pause(&self, transfer_id: &str) -> bool {
        if let Some(entry) = self.entries.read().get(transfer_id) {
            entry.control.pause();
            info!("Paused transfer: {}", transfer_id);
            true
        } else {
            warn!("Transfer not found for pause: {}", transfer_id);
            false
        }
    }

    /// Resume a paused transfer
    pub fn resume(&self, transfer_id: &str) -> bool {
        if let Some(entry) = self.entries.read().get(transfer_id) {
            entry.control.resume();
            info!("Resumed transfer: {}", transfer_id);
            true
        } else {
            warn!("Transfer not found for resume: {}", transfer_id);
            false
        }
    }

    /// Cancel every transfer belonging to `session_id`
    pub fn cancel_session(&self, session_id: &str) {
        for entry in self.entries.read().values() {
            if entry.item.session_id == session_id && !entry.item.status.is_finished() {
                entry.control.cancel();
                info!("Cancelled transfer: {}", entry.item.id);
            }
        }
    }

    /// Cancel all active transfers
    pub fn cancel_all(&self) {
        for (id, entry) in self.entries.read().iter() {
            if !entry.item.status.is_finished() {
                entry.control.cancel();
                info!("Cancelled transfer: {}", id);
            }
        }
    }
}

/// Marks a transfer as failed if its task exits without reaching a final
/// state (early return, panic, dropped future).
pub struct TransferGuard {
    manager: Arc<TransferManager>,
    transfer_id: String,
}

impl TransferGuard {
    pub fn new(manager: &Arc<TransferManager>, transfer_id: String) -> Self {
        Self {
            manager: manager.clone(),
            transfer_id,
        }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        let Some(item) = self.manager.get(&self.transfer_id) else {
            return;
        };
        match item.status {
            TransferStatus::Queued | TransferStatus::Transferring => {
                let _ = self
                    .manager
                    .set_status(&self.transfer_id, TransferStatus::Error);
            }
            TransferStatus::Paused => {
                // Paused -> Error is not a legal edge; cancel instead
                let _ = self
                    .manager
                    .set_status(&self.transfer_id, TransferStatus::Cancelled);
            }
            _ => {}
        }
    }
}
