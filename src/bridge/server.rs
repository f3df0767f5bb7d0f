//! WebSocket server
//!
//! One [`ProtocolBridge`] per accepted client. The connection is split into
//! a sender task (outbound messages plus heartbeat pings) and an input task
//! (inbound frames into the bridge); whichever ends first tears the client
//! down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::handler::ProtocolBridge;
use super::protocol::ServerMessage;
use crate::Services;

/// WebSocket handshake timeout (seconds)
const WS_ACCEPT_TIMEOUT_SECS: u64 = 10;
/// Outbound messages buffered per client before the bridge waits
const FRAME_CHANNEL_CAPACITY: usize = 4096;
/// A single frame write slower than this marks the client unresponsive
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Heartbeat intervals without any inbound frame before the client is dropped
const MISSED_HEARTBEATS: u32 = 3;

/// Why a client connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    HeartbeatTimeout,
    NetworkError(String),
    ServerShutdown,
}

/// Inbound activity clock for one client
struct Liveness {
    started: Instant,
    last_seen_ms: AtomicU64,
}

impl Liveness {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_seen_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn silent_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last_seen)
    }
}

/// Accept clients until the services shut down
pub async fn serve(listener: TcpListener, services: Arc<Services>) {
    let shutdown = services.shutdown_token();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("WebSocket server stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted TCP connection from {}", addr);
                    let services = services.clone();
                    tokio::spawn(async move {
                        match handle_connection(stream, services).await {
                            Ok(reason) => debug!("Client {} finished: {:?}", addr, reason),
                            Err(e) => warn!("Client {} failed: {}", addr, e),
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    services: Arc<Services>,
) -> Result<DisconnectReason, String> {
    let expected_token = services.config.server.access_token.clone();
    let handshake = accept_hdr_async(stream, |req: &Request, resp: Response| {
        authorize(req, resp, expected_token.as_deref())
    });
    let ws_stream = tokio::time::timeout(Duration::from_secs(WS_ACCEPT_TIMEOUT_SECS), handshake)
        .await
        .map_err(|_| "WebSocket handshake timeout".to_string())?
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(FRAME_CHANNEL_CAPACITY);
    let bridge = ProtocolBridge::new(services.clone(), outbound_tx);
    let client_id = bridge.client_id().to_string();
    info!("Client {} connected", client_id);

    let heartbeat = services.config.server.heartbeat_interval();
    let liveness = Arc::new(Liveness::new());
    let liveness_hb = liveness.clone();

    // Task: bridge messages and heartbeat pings -> WebSocket
    let mut sender_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;

        loop {
            let frame = tokio::select! {
                message = outbound_rx.recv() => match message {
                    Some(message) => match message.to_json() {
                        Ok(text) => Message::Text(text),
                        Err(e) => {
                            error!("Dropping outbound message: {}", e);
                            continue;
                        }
                    },
                    None => return DisconnectReason::ClientClosed,
                },
                _ = ticker.tick() => {
                    if liveness_hb.silent_for() > heartbeat * MISSED_HEARTBEATS {
                        warn!("Heartbeat timeout detected");
                        return DisconnectReason::HeartbeatTimeout;
                    }
                    Message::Ping(Vec::new())
                }
            };

            match tokio::time::timeout(SEND_TIMEOUT, ws_sender.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("WebSocket send failed: {:?}", e);
                    return DisconnectReason::NetworkError(e.to_string());
                }
                Err(_) => {
                    warn!("WebSocket send timeout - client unresponsive");
                    return DisconnectReason::NetworkError("send_timeout".to_string());
                }
            }
        }
    });

    // Task: WebSocket -> bridge
    let bridge_in = bridge.clone();
    let mut input_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    liveness.touch();
                    bridge_in.handle_text(&text).await;
                }
                Ok(Message::Binary(data)) => {
                    liveness.touch();
                    bridge_in.handle_text(&String::from_utf8_lossy(&data)).await;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => liveness.touch(),
                Ok(Message::Close(_)) => return DisconnectReason::ClientClosed,
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    warn!("WebSocket receive error: {}", e);
                    return DisconnectReason::NetworkError(e.to_string());
                }
            }
        }
        DisconnectReason::ClientClosed
    });

    let shutdown = services.shutdown_token();
    let reason = tokio::select! {
        result = &mut sender_task => result
            .unwrap_or_else(|e| DisconnectReason::NetworkError(e.to_string())),
        result = &mut input_task => result.unwrap_or(DisconnectReason::ClientClosed),
        _ = shutdown.cancelled() => DisconnectReason::ServerShutdown,
    };
    sender_task.abort();
    input_task.abort();

    bridge.on_transport_closed().await;
    info!("Client {} disconnected: {:?}", client_id, reason);
    Ok(reason)
}

/// Upgrade filter: with an access token configured, `?token=` must match
fn authorize(
    req: &Request,
    resp: Response,
    expected: Option<&str>,
) -> Result<Response, ErrorResponse> {
    let Some(expected) = expected else {
        return Ok(resp);
    };

    let valid = req
        .uri()
        .query()
        .and_then(token_from_query)
        .is_some_and(|token| validate_token(token, expected));
    if valid {
        return Ok(resp);
    }

    warn!("Rejected WebSocket upgrade: missing or invalid token");
    let mut rejection = ErrorResponse::new(Some("Unauthorized".to_string()));
    *rejection.status_mut() = StatusCode::UNAUTHORIZED;
    Err(rejection)
}

fn token_from_query(query: &str) -> Option<&str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}

/// Constant-time comparison; only the length is allowed to short-circuit
fn validate_token(received: &str, expected: &str) -> bool {
    let (received, expected) = (received.as_bytes(), expected.as_bytes());
    received.len() == expected.len() && bool::from(received.ct_eq(expected))
}
