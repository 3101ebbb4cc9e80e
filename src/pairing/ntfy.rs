//! Ntfy reconnect manager (C7).
//!
//! For every paired device, subscribes to the device's derived rendezvous
//! topic on an ntfy server and waits for an encrypted reconnection offer.
//! Each subscriber polls its topic's backlog on a short interval, backing
//! off exponentially on transport failure, mirroring this crate's other
//! outbound reconnect loops. A malformed or undecryptable message is
//! dropped silently; it must never kill the subscriber.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::auth::Authenticator;
use super::connection_manager::ConnectionManager;
use super::crypto;
use super::message::MessageCodec;
use super::peer::{CapabilitiesProvider, NoCapabilities, Owner, PeerConnection, TransportFactory};
use super::registry::PairedDevice;

pub const OFFER_RECENCY_SECS: i64 = 300;
pub const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const AUTH_RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);
const SEEN_NONCE_CAPACITY: usize = 256;
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RendezvousMessage {
    Offer {
        session_id: String,
        sdp: String,
        device_id: String,
        device_name: String,
        timestamp: i64,
        nonce: String,
    },
    Answer {
        sdp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        capabilities: Option<serde_json::Value>,
    },
}

/// Invoked once a reconnection's handshake succeeds. Ownership of the peer
/// has already been transferred to the connection manager.
pub type OnDeviceReconnected = Arc<
    dyn Fn(String, String, Arc<PeerConnection>, [u8; 32]) -> futures_fut::Fut + Send + Sync,
>;

mod futures_fut {
    pub type Fut = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;
}

struct Subscriber {
    handle: tokio::task::JoinHandle<()>,
    cancel: tokio::sync::watch::Sender<bool>,
}

/// One long-lived subscriber task per paired device, tracking at most one
/// in-flight reconnection attempt per device at a time.
pub struct NtfyReconnectManager {
    server: String,
    transport_factory: Arc<dyn TransportFactory>,
    connection_manager: Arc<ConnectionManager>,
    capabilities: Arc<dyn CapabilitiesProvider>,
    on_reconnected: Mutex<Option<OnDeviceReconnected>>,
    subscribers: Mutex<std::collections::HashMap<String, Subscriber>>,
    http: Client,
    running: RwLock<bool>,
}

impl NtfyReconnectManager {
    pub fn new(
        server: impl Into<String>,
        transport_factory: Arc<dyn TransportFactory>,
        connection_manager: Arc<ConnectionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server: server.into(),
            transport_factory,
            connection_manager,
            capabilities: Arc::new(NoCapabilities),
            on_reconnected: Mutex::new(None),
            subscribers: Mutex::new(std::collections::HashMap::new()),
            http: Client::new(),
            running: RwLock::new(false),
        })
    }

    pub async fn set_on_reconnected(&self, handler: OnDeviceReconnected) {
        *self.on_reconnected.lock().await = Some(handler);
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Starts a subscriber for every device in `devices`. Idempotent.
    pub async fn start(self: &Arc<Self>, devices: Vec<PairedDevice>) {
        {
            let mut running = self.running.write().await;
            if *running {
                return;
            }
            *running = true;
        }
        info!(count = devices.len(), "starting ntfy reconnect manager");
        for device in devices {
            self.add_device(device).await;
        }
    }

    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }
        let subs: Vec<_> = self.subscribers.lock().await.drain().map(|(_, s)| s).collect();
        for sub in subs {
            let _ = sub.cancel.send(true);
            let _ = sub.handle.await;
        }
    }

    /// Spawns a subscriber task for a freshly paired device. A no-op if the
    /// manager isn't running or a subscriber already exists.
    pub async fn add_device(self: &Arc<Self>, device: PairedDevice) {
        if !*self.running.read().await {
            return;
        }
        let mut guard = self.subscribers.lock().await;
        if guard.contains_key(&device.device_id) {
            return;
        }
        let topic = match crypto::rendezvous_topic(&device.master_secret) {
            Ok(t) => t,
            Err(_) => return,
        };
        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        let manager = self.clone();
        let device_id = device.device_id.clone();
        let handle = tokio::spawn(async move {
            manager.run_subscriber(device, topic, cancel_rx).await;
        });
        guard.insert(device_id, Subscriber { handle, cancel: cancel_tx });
    }

    /// Cancels and awaits the subscriber for a removed device.
    pub async fn remove_device(&self, device_id: &str) {
        let sub = self.subscribers.lock().await.remove(device_id);
        if let Some(sub) = sub {
            let _ = sub.cancel.send(true);
            let _ = sub.handle.await;
        }
    }

    async fn run_subscriber(
        self: Arc<Self>,
        device: PairedDevice,
        topic: String,
        mut cancel: tokio::sync::watch::Receiver<bool>,
    ) {
        let signaling_key = match crypto::derive_key(&device.master_secret, "signaling") {
            Ok(k) => k,
            Err(_) => return,
        };
        let mut seen_nonces: VecDeque<String> = VecDeque::with_capacity(SEEN_NONCE_CAPACITY);
        let in_flight = Arc::new(tokio::sync::Mutex::new(()));
        let mut backoff = MIN_BACKOFF;

        loop {
            if *cancel.borrow() {
                return;
            }
            let poll_result = self.poll_once(&topic, &mut cancel).await;
            let lines = match poll_result {
                Ok(lines) => {
                    backoff = MIN_BACKOFF;
                    lines
                }
                Err(e) => {
                    debug!(device_id = %device.device_id, error = %e, "ntfy poll failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.changed() => { if *cancel.borrow() { return; } }
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            for line in lines {
                let Some(bytes) = extract_message_bytes(&line) else { continue };
                let plaintext = match crypto::decrypt(&signaling_key, &bytes) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let msg: RendezvousMessage = match serde_json::from_slice(&plaintext) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let RendezvousMessage::Offer {
                    sdp,
                    device_id: offer_device_id,
                    device_name,
                    timestamp,
                    nonce,
                    ..
                } = msg
                else {
                    continue;
                };

                let now = chrono::Utc::now().timestamp();
                if (now - timestamp).abs() > OFFER_RECENCY_SECS {
                    continue;
                }
                if seen_nonces.contains(&nonce) {
                    continue;
                }
                if seen_nonces.len() >= SEEN_NONCE_CAPACITY {
                    seen_nonces.pop_front();
                }
                seen_nonces.push_back(nonce);

                // Only one in-flight reconnection attempt per device.
                let lock = match in_flight.clone().try_lock_owned() {
                    Ok(guard) => guard,
                    Err(_) => continue,
                };

                let manager = self.clone();
                let device = device.clone();
                tokio::spawn(async move {
                    let _lock = lock;
                    manager
                        .handle_offer(device, offer_device_id, device_name, sdp)
                        .await;
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.changed() => { if *cancel.borrow() { return; } }
            }
        }
    }

    /// One GET against the ntfy topic's backlog, returning whole JSON lines
    /// (ntfy's newline-delimited `/json` format). Cancellable mid-request.
    async fn poll_once(
        &self,
        topic: &str,
        cancel: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<Vec<String>, reqwest::Error> {
        let url = format!("{}/{}/json?poll=1", self.server.trim_end_matches('/'), topic);
        let response = tokio::select! {
            resp = self.http.get(&url).send() => resp?,
            _ = cancel.changed() => return Ok(Vec::new()),
        };
        let bytes = response.bytes().await?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(text.lines().map(|l| l.to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn handle_offer(
        self: Arc<Self>,
        device: PairedDevice,
        offer_device_id: String,
        device_name: String,
        sdp: String,
    ) {
        let device_id = if offer_device_id.is_empty() {
            device.device_id.clone()
        } else {
            offer_device_id
        };

        let transport = self.transport_factory.new_peer().await;
        let peer = PeerConnection::new(transport);

        let answer_sdp = match peer.accept_offer(&sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(device_id = %device_id, error = ?e, "reconnect offer rejected by transport");
                peer.close().await;
                return;
            }
        };

        let signaling_key = match crypto::derive_key(&device.master_secret, "signaling") {
            Ok(k) => k,
            Err(_) => {
                peer.close().await;
                return;
            }
        };
        let topic = match crypto::rendezvous_topic(&device.master_secret) {
            Ok(t) => t,
            Err(_) => {
                peer.close().await;
                return;
            }
        };
        if let Err(e) = self.publish_answer(&topic, &signaling_key, &answer_sdp).await {
            warn!(device_id = %device_id, error = %e, "failed to publish reconnect answer over ntfy");
            peer.close().await;
            return;
        }

        if let Err(e) = timeout_connect(&peer).await {
            warn!(device_id = %device_id, error = ?e, "reconnect data channel failed to open");
            peer.close().await;
            return;
        }

        let auth_key = match crypto::derive_key(&device.master_secret, "auth") {
            Ok(k) => k,
            Err(_) => {
                peer.close().await;
                return;
            }
        };

        match run_reconnect_handshake(&peer, auth_key, device_id.clone()).await {
            Ok(()) => {}
            Err(e) => {
                warn!(device_id = %device_id, error = ?e, "ntfy reconnection auth failed");
                peer.close().await;
                return;
            }
        }

        let encrypt_key = match crypto::derive_key(&device.master_secret, "encrypt") {
            Ok(k) => k,
            Err(_) => {
                peer.close_by_owner(Owner::SignalingHandler).await;
                return;
            }
        };

        peer.transfer_ownership(Owner::ConnectionManager);
        info!(device_id = %device_id, "ntfy reconnection authenticated");

        self.connection_manager
            .add(device_id.clone(), peer.clone(), MessageCodec::new(encrypt_key))
            .await;

        if let Some(callback) = self.on_reconnected.lock().await.as_ref() {
            callback(device_id, device_name, peer, auth_key).await;
        }
    }

    /// Encrypts an `Answer` (carrying this daemon's capabilities, if any)
    /// under `signaling_key` and publishes it as `text/plain` to the
    /// device's ntfy topic, mirroring this crate's other outbound ntfy
    /// publish path.
    async fn publish_answer(
        &self,
        topic: &str,
        signaling_key: &[u8; 32],
        sdp: &str,
    ) -> Result<(), reqwest::Error> {
        let msg = RendezvousMessage::Answer {
            sdp: sdp.to_string(),
            capabilities: self.capabilities.capabilities(),
        };
        let plaintext = serde_json::to_vec(&msg).unwrap_or_default();
        let envelope = match crypto::encrypt(signaling_key, &plaintext) {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };
        use base64::{engine::general_purpose::STANDARD, Engine};
        let body = STANDARD.encode(envelope);
        let url = format!("{}/{}", self.server.trim_end_matches('/'), topic);
        self.http
            .post(&url)
            .header("Content-Type", "text/plain")
            .body(body)
            .send()
            .await?;
        Ok(())
    }
}

async fn timeout_connect(peer: &Arc<PeerConnection>) -> Result<(), super::error::ConnectionError> {
    peer.wait_connected(PEER_CONNECT_TIMEOUT).await
}

async fn run_reconnect_handshake(
    peer: &Arc<PeerConnection>,
    auth_key: [u8; 32],
    device_id: String,
) -> Result<(), super::error::AuthError> {
    use super::auth::AuthEnvelope;
    use super::error::AuthError;

    let mut authenticator = Authenticator::new(auth_key);
    let mut rx = peer.take_receiver().await.ok_or(AuthError::ProtocolError)?;

    let result = authenticator
        .run(
            device_id,
            |msg| {
                let peer = peer.clone();
                async move {
                    let bytes = serde_json::to_vec(&msg).unwrap_or_default();
                    let _ = peer.send(&bytes).await;
                }
            },
            || {
                let rx = &mut rx;
                async move {
                    let bytes = tokio::time::timeout(AUTH_RECEIVE_TIMEOUT, rx.recv())
                        .await
                        .map_err(|_| AuthError::Timeout)?
                        .ok_or(AuthError::Timeout)?;
                    serde_json::from_slice::<AuthEnvelope>(&bytes).map_err(|_| AuthError::ProtocolError)
                }
            },
        )
        .await;

    peer.put_receiver_back(rx).await;
    result
}

/// ntfy's `/json` stream wraps each event as `{"event":"message","message":"<base64>"}`
/// (or similar); extract the base64 message body and decode it to raw bytes.
fn extract_message_bytes(line: &str) -> Option<Vec<u8>> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    if value.get("event").and_then(|e| e.as_str()) != Some("message") {
        return None;
    }
    let encoded = value.get("message").and_then(|m| m.as_str())?;
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.decode(encoded).ok()
}
