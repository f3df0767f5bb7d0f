//! ShellBridge - session orchestration for browser-based SSH clients
//!
//! Holds real SSH/SFTP connections server-side and relays them to web
//! clients over a JSON WebSocket protocol.

pub mod bridge;
pub mod config;
pub mod error;
pub mod security;
pub mod session;
pub mod sftp;
pub mod ssh;
pub mod tabs;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::BridgeConfig;
use security::SecurityGate;
use session::SessionRegistry;
use sftp::SftpTransferEngine;
use ssh::{Connector, RusshConnector};

/// Process-wide services, built once at startup and handed to every client
/// bridge
pub struct Services {
    pub config: BridgeConfig,
    pub gate: Arc<SecurityGate>,
    pub registry: Arc<SessionRegistry>,
    pub sftp: Arc<SftpTransferEngine>,
    cancel: CancellationToken,
    sweeps: Mutex<Vec<JoinHandle<()>>>,
}

impl Services {
    /// Build the services over the russh transport and start the
    /// background sweeps
    pub fn init(config: BridgeConfig) -> Arc<Self> {
        let connector = Arc::new(RusshConnector::new(Duration::from_secs(
            config.ssh.keepalive_interval_secs,
        )));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: BridgeConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let gate = Arc::new(SecurityGate::from_config(&config));
        let registry = Arc::new(SessionRegistry::new(
            gate.clone(),
            connector,
            config.ssh.clone(),
        ));
        let sftp = Arc::new(SftpTransferEngine::new(
            registry.clone(),
            config.transfer.clone(),
        ));

        let cancel = CancellationToken::new();
        let sweeps = vec![
            gate.spawn_rate_limit_sweep(
                Duration::from_secs(config.rate_limit.sweep_interval_secs.max(1)),
                cancel.child_token(),
            ),
            registry.spawn_inactivity_sweep(
                config.sessions.inactivity_timeout(),
                Duration::from_secs(config.sessions.sweep_interval_secs.max(1)),
                cancel.child_token(),
            ),
            sftp.transfers()
                .spawn_retention_sweep(config.transfer.retention(), cancel.child_token()),
        ];

        info!(
            "Services ready (inactivity timeout {:?}, max {} tabs per client)",
            config.sessions.inactivity_timeout(),
            config.tabs.max_tabs
        );

        Arc::new(Self {
            config,
            gate,
            registry,
            sftp,
            cancel,
            sweeps: Mutex::new(sweeps),
        })
    }

    /// Token that fires once [`shutdown`](Self::shutdown) starts
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the sweeps, cancel transfers and drop every connection
    pub async fn shutdown(&self) {
        info!("Shutting down, cleaning up resources...");
        self.cancel.cancel();

        let sweeps: Vec<JoinHandle<()>> = self.sweeps.lock().drain(..).collect();
        for sweep in sweeps {
            let _ = sweep.await;
        }

        info!("Cancelling transfers...");
        self.sftp.transfers().cancel_all();

        info!("Closing all SFTP channels...");
        self.sftp.close_all().await;

        info!("Disconnecting all SSH sessions...");
        self.registry.disconnect_all().await;

        info!("All resources cleaned up");
    }
}

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Binary entry point: load config, serve until Ctrl-C, then clean up
pub async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging();
    info!("Starting ShellBridge...");

    let config = BridgeConfig::load().await.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let listener = TcpListener::bind(&config.server.bind_addr).await.map_err(|e| {
        error!("Failed to bind {}: {}", config.server.bind_addr, e);
        e
    })?;
    info!("Listening on {}", listener.local_addr()?);

    let services = Services::init(config);
    let server = tokio::spawn(bridge::serve(listener, services.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Exit requested");

    services.shutdown().await;
    if let Err(e) = server.await {
        error!("Server task failed: {}", e);
    }
    Ok(())
}
