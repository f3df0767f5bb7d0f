//! Wire protocol
//!
//! Every frame is a JSON text message `{"type": ..., "payload": {...}}`.
//! Inbound payload fields are optional at the serde level so that missing or
//! null fields surface as `INVALID_INPUT` instead of a parse failure.
//! Binary payloads travel as standard base64.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;
use crate::sftp::{DirEntry, TransferProgress};
use crate::ssh::ConnectionConfig;

pub const DEFAULT_COLS: i64 = 80;
pub const DEFAULT_ROWS: i64 = 24;
/// Inclusive bound for both terminal dimensions
pub const MAX_DIMENSION: i64 = 1000;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub config: ConnectionConfig,
    pub cols: Option<i64>,
    pub rows: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub session_id: Option<String>,
    pub input: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    pub session_id: Option<String>,
    pub cols: Option<i64>,
    pub rows: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    pub session_id: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub session_id: Option<String>,
    pub remote_dir: Option<String>,
    pub filename: Option<String>,
    /// Base64 file content
    pub data: Option<String>,
    pub transfer_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub session_id: Option<String>,
    pub remote_path: Option<String>,
    pub transfer_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferAction {
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferControlRequest {
    pub transfer_id: Option<String>,
    pub action: TransferAction,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabActivateRequest {
    pub session_id: Option<String>,
}

/// Messages a client may send
#[derive(Debug)]
pub enum ClientMessage {
    SshConnect(ConnectRequest),
    TerminalInput(InputRequest),
    TerminalResize(ResizeRequest),
    SshDisconnect(DisconnectRequest),
    SftpList(ListRequest),
    SftpUpload(UploadRequest),
    SftpDownload(DownloadRequest),
    SftpTransferControl(TransferControlRequest),
    TabActivate(TabActivateRequest),
}

impl ClientMessage {
    pub fn from_value(value: Value) -> Result<Self, BridgeError> {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| BridgeError::Protocol(format!("malformed envelope: {}", e)))?;
        let payload = match envelope.payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        let message = match envelope.kind.as_str() {
            "ssh_connect" => ClientMessage::SshConnect(decode(&envelope.kind, payload)?),
            "terminal_input" => ClientMessage::TerminalInput(decode(&envelope.kind, payload)?),
            "terminal_resize" => ClientMessage::TerminalResize(decode(&envelope.kind, payload)?),
            "ssh_disconnect" => ClientMessage::SshDisconnect(decode(&envelope.kind, payload)?),
            "sftp_list" => ClientMessage::SftpList(decode(&envelope.kind, payload)?),
            "sftp_upload" => ClientMessage::SftpUpload(decode(&envelope.kind, payload)?),
            "sftp_download" => ClientMessage::SftpDownload(decode(&envelope.kind, payload)?),
            "sftp_transfer_control" => {
                ClientMessage::SftpTransferControl(decode(&envelope.kind, payload)?)
            }
            "tab_activate" => ClientMessage::TabActivate(decode(&envelope.kind, payload)?),
            other => {
                return Err(BridgeError::Protocol(format!(
                    "unknown message type '{}'",
                    other
                )))
            }
        };
        Ok(message)
    }

    /// Session the message refers to, used to attribute errors
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientMessage::SshConnect(_) | ClientMessage::SftpTransferControl(_) => None,
            ClientMessage::TerminalInput(req) => req.session_id.as_deref(),
            ClientMessage::TerminalResize(req) => req.session_id.as_deref(),
            ClientMessage::SshDisconnect(req) => req.session_id.as_deref(),
            ClientMessage::SftpList(req) => req.session_id.as_deref(),
            ClientMessage::SftpUpload(req) => req.session_id.as_deref(),
            ClientMessage::SftpDownload(req) => req.session_id.as_deref(),
            ClientMessage::TabActivate(req) => req.session_id.as_deref(),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, payload: Value) -> Result<T, BridgeError> {
    serde_json::from_value(payload)
        .map_err(|e| BridgeError::Protocol(format!("invalid {} payload: {}", kind, e)))
}

/// A field that must be present and non-null
pub fn required(field: Option<String>, name: &str) -> Result<String, BridgeError> {
    field.ok_or_else(|| BridgeError::InvalidInput(format!("{} is required", name)))
}

/// Both dimensions within `1..=MAX_DIMENSION`
pub fn check_dimensions(cols: Option<i64>, rows: Option<i64>) -> Result<(u32, u32), BridgeError> {
    let (cols, rows) = match (cols, rows) {
        (Some(cols), Some(rows)) => (cols, rows),
        (cols, rows) => {
            return Err(BridgeError::InvalidDimensions {
                cols: cols.unwrap_or(0),
                rows: rows.unwrap_or(0),
            })
        }
    };
    let in_range = |v: i64| (1..=MAX_DIMENSION).contains(&v);
    if !in_range(cols) || !in_range(rows) {
        return Err(BridgeError::InvalidDimensions { cols, rows });
    }
    Ok((cols as u32, rows as u32))
}

/// Messages the bridge emits
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    SshConnected {
        session_id: String,
        status: &'static str,
    },
    #[serde(rename_all = "camelCase")]
    TerminalData { session_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    SshDisconnected { session_id: String },
    #[serde(rename_all = "camelCase")]
    SshError {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
        code: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    SftpListResult {
        session_id: String,
        path: String,
        entries: Vec<DirEntry>,
    },
    #[serde(rename_all = "camelCase")]
    SftpProgress {
        session_id: String,
        #[serde(flatten)]
        progress: TransferProgress,
    },
    #[serde(rename_all = "camelCase")]
    SftpUploadResult {
        session_id: String,
        transfer_id: String,
        remote_path: String,
    },
    #[serde(rename_all = "camelCase")]
    SftpDownloadResult {
        session_id: String,
        transfer_id: String,
        remote_path: String,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    TabBuffer { session_id: String, data: String },
}

impl ServerMessage {
    pub fn connected(session_id: impl Into<String>) -> Self {
        ServerMessage::SshConnected {
            session_id: session_id.into(),
            status: "connected",
        }
    }

    pub fn error(session_id: Option<String>, err: &BridgeError) -> Self {
        ServerMessage::SshError {
            session_id,
            message: err.to_string(),
            code: err.code(),
            details: err.details(),
        }
    }

    pub fn to_json(&self) -> Result<String, BridgeError> {
        serde_json::to_string(self)
            .map_err(|e| BridgeError::Protocol(format!("failed to encode message: {}", e)))
    }
}

/// Incremental UTF-8 decoding of a byte stream
///
/// A multi-byte sequence split across chunks is held back until the rest
/// arrives. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Incomplete sequence at the end: wait for more
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is held back, lossily
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}
