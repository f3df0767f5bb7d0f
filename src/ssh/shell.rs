//! Interactive shell channel
//!
//! [`ShellChannel`] is the only view of a remote shell the rest of the crate
//! gets: write, resize, a data stream and close. The transport behind it is a
//! task that owns the real channel and is driven through [`ShellCommand`].

use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::error::SshError;

/// Command channel capacity
const SHELL_CMD_CAPACITY: usize = 1024;
/// Output chunks buffered before the shell task waits on the consumer
const SHELL_DATA_CAPACITY: usize = 1024;

/// Commands that can be sent to the shell task
#[derive(Debug)]
pub enum ShellCommand {
    /// Data to send to stdin
    Data(Vec<u8>),
    /// Resize the PTY (cols, rows)
    Resize(u32, u32),
    /// Close the channel
    Close,
}

pub struct ShellChannel {
    cmd_tx: mpsc::Sender<ShellCommand>,
    data_rx: Option<mpsc::Receiver<Bytes>>,
}

impl ShellChannel {
    /// Wrap the two ends of a shell task
    pub fn new(cmd_tx: mpsc::Sender<ShellCommand>, data_rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            cmd_tx,
            data_rx: Some(data_rx),
        }
    }

    /// Create a channel pair for a shell task. Returns the channel plus the
    /// task-side command receiver and data sender.
    pub fn pair() -> (Self, mpsc::Receiver<ShellCommand>, mpsc::Sender<Bytes>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(SHELL_CMD_CAPACITY);
        let (data_tx, data_rx) = mpsc::channel(SHELL_DATA_CAPACITY);
        (Self::new(cmd_tx, data_rx), cmd_rx, data_tx)
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        self.cmd_tx
            .send(ShellCommand::Data(data.to_vec()))
            .await
            .map_err(|_| SshError::Disconnected)
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.cmd_tx
            .send(ShellCommand::Resize(cols, rows))
            .await
            .map_err(|_| SshError::Disconnected)
    }

    /// Output stream, in arrival order. Can be taken once; ends when the
    /// remote side closes.
    pub fn take_data_stream(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.data_rx.take()
    }

    /// Ask the shell task to send EOF and stop. Closing twice is harmless.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(ShellCommand::Close).await;
    }
}

impl Drop for ShellChannel {
    fn drop(&mut self) {
        // Best effort: the task also exits once every sender is gone
        let _ = self.cmd_tx.try_send(ShellCommand::Close);
    }
}

/// Request a PTY and shell on `channel`, then spawn the task that owns it
pub async fn start_shell(
    mut channel: Channel<Msg>,
    session_id: String,
    cols: u32,
    rows: u32,
) -> Result<ShellChannel, SshError> {
    channel
        .request_pty(false, "xterm-256color", cols, rows, 0, 0, &[])
        .await
        .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

    debug!("PTY allocated, requesting shell");

    channel
        .request_shell(false)
        .await
        .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

    info!("Interactive shell started for session {}", session_id);

    let (shell, mut cmd_rx, data_tx) = ShellChannel::pair();

    let sid = session_id;
    tokio::spawn(async move {
        debug!("Shell task started for session {}", sid);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ShellCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to send data to SSH channel: {}", e);
                                break;
                            }
                        }
                        Some(ShellCommand::Resize(cols, rows)) => {
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                // Keep the shell alive on resize failure
                                error!("Failed to resize PTY: {}", e);
                            } else {
                                debug!("PTY resized to {}x{} for session {}", cols, rows, sid);
                            }
                        }
                        Some(ShellCommand::Close) | None => {
                            info!("Closing shell for session {}", sid);
                            let _ = channel.eof().await;
                            break;
                        }
                    }
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if data_tx.send(Bytes::copy_from_slice(&data)).await.is_err() {
                                debug!("Shell output receiver dropped for session {}", sid);
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            // stderr
                            if ext == 1 {
                                let _ = data_tx.send(Bytes::copy_from_slice(&data)).await;
                            }
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            info!("SSH channel closed for session {}", sid);
                            break;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            info!("Shell exit status {} for session {}", exit_status, sid);
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        info!("Shell task terminated for session {}", sid);
    });

    Ok(shell)
}
