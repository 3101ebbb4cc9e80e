//! Orchestrator (C10).
//!
//! No protocol logic lives here. This module only wires the independently
//! testable components together: device registry events feed the ntfy
//! subscriber pool, a connected or reconnected device starts its heartbeat
//! clock, a lost connection stops it, the heartbeat loop's outbound frames
//! are routed through whichever connection the connection manager currently
//! holds for that device, and every decoded message refreshes the
//! heartbeat's liveness bookkeeping before reaching the host application's
//! dispatch table.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::connection_manager::ConnectionManager;
use super::heartbeat::HeartbeatManager;
use super::message::Message;
use super::ntfy::{NtfyReconnectManager, OnDeviceReconnected};
use super::registry::{DeviceEvent, DeviceRegistry};
use super::signaling::{OnDeviceConnected, SignalingState};

/// Invoked for every decoded message whose type isn't the internal
/// `"heartbeat"` frame. Registered by the host application; the core itself
/// has no opinion on what a dispatch table does with these (spec.md §4.10).
pub type DispatchHandler = Arc<dyn Fn(String, Message) + Send + Sync>;

pub struct Orchestrator {
    devices: Arc<DeviceRegistry>,
    connection_manager: Arc<ConnectionManager>,
    heartbeat: Arc<HeartbeatManager>,
    ntfy: Arc<NtfyReconnectManager>,
    signaling: Arc<SignalingState>,
    dispatch: Mutex<Option<DispatchHandler>>,
}

impl Orchestrator {
    pub fn new(
        devices: Arc<DeviceRegistry>,
        connection_manager: Arc<ConnectionManager>,
        heartbeat: Arc<HeartbeatManager>,
        ntfy: Arc<NtfyReconnectManager>,
        signaling: Arc<SignalingState>,
    ) -> Arc<Self> {
        Arc::new(Self {
            devices,
            connection_manager,
            heartbeat,
            ntfy,
            signaling,
            dispatch: Mutex::new(None),
        })
    }

    /// Registers the host application's dispatch table entry point. Must be
    /// called before [`Orchestrator::wire`] to see messages decoded during
    /// this process's lifetime (there is no backlog to replay).
    pub async fn set_dispatch_handler(&self, handler: DispatchHandler) {
        *self.dispatch.lock().await = Some(handler);
    }

    /// Installs every cross-component callback and starts the ntfy
    /// subscriber pool for already-paired devices. Call once during daemon
    /// startup, after every component above has been constructed.
    pub async fn wire(self: &Arc<Self>) {
        self.install_heartbeat_sender().await;
        self.install_connection_lost_handler().await;
        self.install_connected_handlers().await;
        self.install_decoded_handler().await;
        self.spawn_device_event_bridge();
        self.spawn_session_sweeper();

        let devices = self.devices.all().await;
        self.ntfy.start(devices).await;
    }

    /// Periodically sweeps the pairing session registry so a session left in
    /// `qr_displayed`/`signaling` past its `QR_TIMEOUT` budget (spec.md
    /// §4.5) is failed and removed even if nobody ever polls it again.
    fn spawn_session_sweeper(self: &Arc<Self>) {
        let sessions = self.signaling.sessions.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tick.tick().await;
                sessions.sweep_expired().await;
            }
        });
    }

    /// Routes every decoded message (C9's codec output) through the
    /// heartbeat tracker and then into the host application's dispatch
    /// table. A `"heartbeat"` frame refreshes both `last_activity` and
    /// `last_heartbeat_received`; any other message refreshes only
    /// `last_activity` (spec.md §4.11) before being forwarded.
    async fn install_decoded_handler(self: &Arc<Self>) {
        let heartbeat = self.heartbeat.clone();
        let orchestrator = self.clone();
        self.connection_manager
            .set_on_decoded(Arc::new(move |device_id, msg| {
                let heartbeat = heartbeat.clone();
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    if msg.kind == "heartbeat" {
                        heartbeat.on_heartbeat_received(&device_id).await;
                    } else {
                        heartbeat.on_activity(&device_id).await;
                        if let Some(handler) = orchestrator.dispatch.lock().await.as_ref() {
                            handler(device_id, msg);
                        }
                    }
                });
            }))
            .await;
    }

    /// Routes heartbeat frames through whatever connection the connection
    /// manager currently holds, so a reconnect transparently redirects the
    /// next heartbeat without the heartbeat manager knowing a swap happened.
    async fn install_heartbeat_sender(self: &Arc<Self>) {
        let connection_manager = self.connection_manager.clone();
        self.heartbeat
            .set_send_fn(Arc::new(move |device_id, frame| {
                let connection_manager = connection_manager.clone();
                tokio::spawn(async move {
                    if let Some(peer) = connection_manager.get(&device_id).await {
                        let _ = peer.send(&frame).await;
                    }
                });
            }))
            .await;
    }

    /// Stops the heartbeat clock once a device's connection is actually
    /// removed (not merely replaced by a reconnect, which suppresses this
    /// callback per C9's replace-on-reconnect contract).
    async fn install_connection_lost_handler(self: &Arc<Self>) {
        let heartbeat = self.heartbeat.clone();
        self.connection_manager
            .set_on_lost(Arc::new(move |device_id| {
                let heartbeat = heartbeat.clone();
                tokio::spawn(async move {
                    heartbeat.untrack(&device_id).await;
                });
            }))
            .await;
    }

    /// Starts the heartbeat clock for a device the instant C6 or C7 hands
    /// it a live, authenticated connection. Device registration and the
    /// connection-manager handoff have already happened by the time either
    /// callback fires.
    async fn install_connected_handlers(self: &Arc<Self>) {
        let heartbeat = self.heartbeat.clone();
        let on_connected: OnDeviceConnected = Arc::new(move |device_id, device_name, _peer, _auth_key| {
            let heartbeat = heartbeat.clone();
            Box::pin(async move {
                info!(device_id = %device_id, device_name = %device_name, "device paired");
                heartbeat.track(device_id).await;
            })
        });
        self.signaling.on_device_connected.lock().await.replace(on_connected);

        let heartbeat = self.heartbeat.clone();
        let on_reconnected: OnDeviceReconnected =
            Arc::new(move |device_id, device_name, _peer, _auth_key| {
                let heartbeat = heartbeat.clone();
                Box::pin(async move {
                    info!(device_id = %device_id, device_name = %device_name, "device reconnected via ntfy");
                    heartbeat.track(device_id).await;
                })
            });
        self.ntfy.set_on_reconnected(on_reconnected).await;
    }

    /// Keeps the ntfy subscriber pool in sync with the device registry: a
    /// freshly paired device gets a subscriber, a revoked one loses it. Runs
    /// for the lifetime of the daemon.
    fn spawn_device_event_bridge(self: &Arc<Self>) {
        let devices = self.devices.clone();
        let ntfy = self.ntfy.clone();
        let mut events = devices.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::Added(device)) => ntfy.add_device(device).await,
                    Ok(DeviceEvent::Removed(device_id)) => ntfy.remove_device(&device_id).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "device event bridge lagged; some add/remove events were dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::crypto;
    use crate::pairing::error::{ConnectionError, TransportError};
    use crate::pairing::heartbeat::HeartbeatConfig;
    use crate::pairing::peer::{PeerConnection, Transport, TransportFactory};
    use crate::pairing::session::{PairingPolicy, SessionRegistry};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn accept_offer(&self, _sdp: &str) -> Result<String, TransportError> {
            Ok(String::new())
        }
        async fn create_offer(&self) -> Result<String, TransportError> {
            Ok(String::new())
        }
        async fn set_remote_description(&self, _sdp: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn wait_connected(&self, _timeout: Duration) -> Result<(), ConnectionError> {
            Ok(())
        }
        async fn send(&self, _bytes: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&self) {}
        async fn on_close(&self, _handler: crate::pairing::peer::CloseHandler) {}
    }

    struct NullFactory;

    #[async_trait]
    impl TransportFactory for NullFactory {
        async fn new_peer(&self) -> Arc<dyn Transport> {
            Arc::new(NullTransport)
        }
    }

    #[tokio::test]
    async fn wiring_starts_ntfy_subscribers_for_existing_devices() {
        let dir = TempDir::new().unwrap();
        let devices = DeviceRegistry::load(dir.path()).await.unwrap();
        devices
            .add("device-1", "Pixel", crypto::generate_secret())
            .await
            .unwrap();

        let sessions = SessionRegistry::new(PairingPolicy::default());
        let connection_manager = ConnectionManager::new();
        let heartbeat = HeartbeatManager::new(Default::default());
        let ntfy = NtfyReconnectManager::new(
            "https://ntfy.sh",
            Arc::new(NullFactory),
            connection_manager.clone(),
        );
        let signaling = SignalingState::new(
            sessions,
            devices.clone(),
            Arc::new(NullFactory),
            connection_manager.clone(),
        );

        let orchestrator = Orchestrator::new(devices, connection_manager, heartbeat, ntfy.clone(), signaling);
        orchestrator.wire().await;

        assert!(ntfy.is_running().await);
    }

    #[tokio::test]
    async fn connected_callback_starts_heartbeat_tracking() {
        let dir = TempDir::new().unwrap();
        let devices = DeviceRegistry::load(dir.path()).await.unwrap();
        let sessions = SessionRegistry::new(PairingPolicy::default());
        let connection_manager = ConnectionManager::new();
        let heartbeat = HeartbeatManager::new(Default::default());
        let ntfy = NtfyReconnectManager::new(
            "https://ntfy.sh",
            Arc::new(NullFactory),
            connection_manager.clone(),
        );
        let signaling = SignalingState::new(
            sessions,
            devices.clone(),
            Arc::new(NullFactory),
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

        let peer = PeerConnection::new(Arc::new(NullTransport));
        let callback = signaling.on_device_connected.lock().await.clone().unwrap();
        callback("device-1".to_string(), "Pixel".to_string(), peer, crypto::generate_secret()).await;

        assert!(heartbeat.get_stale_connections().await.is_empty());
        heartbeat.untrack("device-1").await;
    }

    #[tokio::test]
    async fn decoded_messages_refresh_activity_and_reach_dispatch_handler() {
        let dir = TempDir::new().unwrap();
        let devices = DeviceRegistry::load(dir.path()).await.unwrap();
        let sessions = SessionRegistry::new(PairingPolicy::default());
        let connection_manager = ConnectionManager::new();
        let heartbeat = HeartbeatManager::new(HeartbeatConfig::new(
            Duration::from_secs(15),
            Duration::from_secs(5),
        ));
        let ntfy = NtfyReconnectManager::new(
            "https://ntfy.sh",
            Arc::new(NullFactory),
            connection_manager.clone(),
        );
        let signaling = SignalingState::new(
            sessions,
            devices.clone(),
            Arc::new(NullFactory),
            connection_manager.clone(),
        );
        let orchestrator = Orchestrator::new(
            devices,
            connection_manager.clone(),
            heartbeat.clone(),
            ntfy,
            signaling,
        );

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let received_clone = received.clone();
        orchestrator
            .set_dispatch_handler(Arc::new(move |device_id, msg| {
                received_clone.lock().unwrap().push((device_id, msg.kind));
            }))
            .await;
        orchestrator.wire().await;

        heartbeat.track("device-1".to_string()).await;
        let key = crypto::generate_secret();
        let mut codec = crate::pairing::MessageCodec::new(key);
        let peer = PeerConnection::new(Arc::new(NullTransport));
        connection_manager
            .add("device-1".to_string(), peer.clone(), crate::pairing::MessageCodec::new(key))
            .await;

        let env = codec
            .encode(crate::pairing::Message::new("terminal.output", serde_json::json!({})))
            .unwrap();
        peer.deliver(env);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(received.lock().unwrap().as_slice(), &[("device-1".to_string(), "terminal.output".to_string())]);

        let heartbeat_env = codec
            .encode(crate::pairing::Message::new("heartbeat", serde_json::json!({})))
            .unwrap();
        peer.deliver(heartbeat_env);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The heartbeat frame refreshes liveness but never reaches the
        // dispatch table.
        assert_eq!(received.lock().unwrap().len(), 1);
        assert!(heartbeat.get_stale_connections().await.is_empty());
    }
}
