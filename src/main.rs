//! `pair-daemon` — minimal CLI entry point over the pairing/connectivity
//! core.
//!
//! Single-instance enforcement, full config-file loading beyond the fields
//! `PairingConfig` already covers, and a platform service manager are
//! explicitly out of scope for this core (see `SPEC_FULL.md` §9.4); this
//! binary is deliberately the thin shell needed to exercise it.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use pairing_daemon::config::PairingConfig;
use pairing_daemon::pairing::{
    ConnectionManager, DeviceRegistry, HeartbeatManager, NtfyReconnectManager, Orchestrator,
    QrPayload, SessionRegistry, SignalingState, Transport, TransportFactory,
};

#[derive(Parser)]
#[command(name = "pair-daemon", about = "Remote terminal pairing daemon", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Signaling HTTP bind port.
    #[arg(long, env = "PAIR_DAEMON_PORT")]
    port: Option<u16>,

    /// Data directory for the paired-device store and config.toml.
    #[arg(long, env = "PAIR_DAEMON_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "PAIR_DAEMON_LOG")]
    log: Option<String>,

    /// Write logs to this file path (daily-rotated) in addition to stdout.
    #[arg(long, env = "PAIR_DAEMON_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the signaling HTTP server, the ntfy reconnect manager, the
    /// connection manager, and the heartbeat loop. Default when no
    /// subcommand is given.
    Serve,
    /// Pairing QR payload operations.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Paired-device operations, for operators without a UI client.
    Device {
        #[command(subcommand)]
        action: DeviceAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Create a fresh pairing session and print its QR payload.
    Qr,
}

#[derive(Subcommand)]
enum DeviceAction {
    /// List paired devices.
    List,
    /// Revoke a paired device by id.
    Revoke { device_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = PairingConfig::new(args.port, args.data_dir, args.log);
    let _log_guard = pairing_daemon::logging::setup_logging(&config.log, args.log_file.as_deref());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Token { action: TokenAction::Qr } => token_qr(config).await,
        Command::Device { action: DeviceAction::List } => device_list(config).await,
        Command::Device { action: DeviceAction::Revoke { device_id } } => {
            device_revoke(config, &device_id).await
        }
    }
}

/// A transport factory placeholder. Real WebRTC/LAN-WebSocket/Tailscale-UDP
/// transports are host-application collaborators outside this core's scope
/// (`SPEC_FULL.md` §1); this stub lets `serve` start the rest of the daemon
/// (signaling HTTP surface, ntfy subscribers, heartbeat loop) without one
/// wired in yet.
struct UnconfiguredTransportFactory;

struct UnconfiguredTransport;

#[async_trait::async_trait]
impl Transport for UnconfiguredTransport {
    async fn accept_offer(
        &self,
        _sdp: &str,
    ) -> Result<String, pairing_daemon::pairing::TransportError> {
        Err(pairing_daemon::pairing::TransportError(anyhow::anyhow!(
            "no transport implementation configured; inject one via TransportFactory"
        )))
    }
    async fn create_offer(&self) -> Result<String, pairing_daemon::pairing::TransportError> {
        Err(pairing_daemon::pairing::TransportError(anyhow::anyhow!(
            "no transport implementation configured"
        )))
    }
    async fn set_remote_description(
        &self,
        _sdp: &str,
    ) -> Result<(), pairing_daemon::pairing::TransportError> {
        Ok(())
    }
    async fn wait_connected(
        &self,
        _timeout: std::time::Duration,
    ) -> Result<(), pairing_daemon::pairing::ConnectionError> {
        Err(pairing_daemon::pairing::ConnectionError::Timeout)
    }
    async fn send(&self, _bytes: &[u8]) -> Result<(), pairing_daemon::pairing::TransportError> {
        Ok(())
    }
    async fn close(&self) {}
    async fn on_close(&self, _handler: pairing_daemon::pairing::peer::CloseHandler) {}
}

#[async_trait::async_trait]
impl TransportFactory for UnconfiguredTransportFactory {
    async fn new_peer(&self) -> Arc<dyn Transport> {
        Arc::new(UnconfiguredTransport)
    }
}

async fn serve(config: PairingConfig) -> Result<()> {
    info!(port = config.port, data_dir = %config.data_dir.display(), "starting pair-daemon");

    let devices = DeviceRegistry::load(&config.data_dir).await?;
    let sessions = SessionRegistry::new(config.policy.clone());
    let connection_manager = ConnectionManager::new();
    let heartbeat = HeartbeatManager::new(config.heartbeat.clone());
    let transport_factory: Arc<dyn TransportFactory> = Arc::new(UnconfiguredTransportFactory);

    let ntfy = NtfyReconnectManager::new(
        config.ntfy_server.clone(),
        transport_factory.clone(),
        connection_manager.clone(),
    );
    let signaling = SignalingState::new(
        sessions.clone(),
        devices.clone(),
        transport_factory,
        connection_manager.clone(),
    );

    let orchestrator = Orchestrator::new(
        devices,
        connection_manager,
        heartbeat.clone(),
        ntfy,
        signaling.clone(),
    );
    orchestrator.wire().await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown_rx));

    let router = pairing_daemon::pairing::build_router(signaling);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(addr = %listener.local_addr()?, "signaling HTTP surface listening");

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await;

    let _ = shutdown_tx.send(());
    let _ = heartbeat_task.await;
    serve_result.map_err(Into::into)
}

async fn token_qr(config: PairingConfig) -> Result<()> {
    let sessions = SessionRegistry::new(config.policy.clone());
    let (session_id, master_secret, topic) = sessions.create().await?;
    let payload = QrPayload::new(master_secret);
    println!("session: {session_id}");
    println!("rendezvous topic: {topic}");
    println!("{}", payload.render_terminal()?);
    Ok(())
}

async fn device_list(config: PairingConfig) -> Result<()> {
    let devices = DeviceRegistry::load(&config.data_dir).await?;
    for device in devices.all().await {
        println!(
            "{}\t{}\tpaired_at={}\tlast_seen={}",
            device.device_id, device.display_name, device.paired_at, device.last_seen
        );
    }
    Ok(())
}

async fn device_revoke(config: PairingConfig, device_id: &str) -> Result<()> {
    let devices = DeviceRegistry::load(&config.data_dir).await?;
    if devices.remove(device_id).await? {
        println!("revoked {device_id}");
    } else {
        warn!(device_id, "device not found");
    }
    Ok(())
}
