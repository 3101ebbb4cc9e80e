//! Signaling endpoint (C6).
//!
//! Axum HTTP surface for pairing and reconnection, mirroring this crate's
//! existing REST stack (`rest::build_router`) but mounted on its own port
//! so the pairing surface can be exposed to the LAN without also exposing
//! the local JSON-RPC control plane.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tower_http::cors::CorsLayer;
use tracing::warn;
use ulid::Ulid;

use super::auth::Authenticator;
use super::connection_manager::ConnectionManager;
use super::crypto;
use super::error::AuthError;
use super::message::MessageCodec;
use super::peer::{CapabilitiesProvider, NoCapabilities, Owner, PeerConnection, TransportFactory};
use super::registry::DeviceRegistry;
use super::session::{SessionRegistry, SessionState};

pub const DEFAULT_SDP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const HMAC_TIMESTAMP_SKEW: i64 = 30;
pub const MAX_SIGNING_ATTEMPTS_PER_WINDOW: usize = 10;
pub const SIGNING_WINDOW: Duration = Duration::from_secs(60);

/// Invoked after a fresh pairing completes the handshake. Ownership of the
/// peer has already been transferred to the connection manager.
pub type OnDeviceConnected = Arc<
    dyn Fn(String, String, Arc<PeerConnection>, [u8; 32]) -> futures_result::Fut + Send + Sync,
>;

// A boxed future alias kept in its own tiny module so the trait-object type
// above stays readable.
mod futures_result {
    pub type Fut = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;
}

pub struct SignalingState {
    pub sessions: Arc<SessionRegistry>,
    pub devices: Arc<DeviceRegistry>,
    pub transport_factory: Arc<dyn TransportFactory>,
    pub connection_manager: Arc<ConnectionManager>,
    pub capabilities: Arc<dyn CapabilitiesProvider>,
    pub on_device_connected: Mutex<Option<OnDeviceConnected>>,
    signing_attempts: Mutex<HashMap<String, Vec<Instant>>>,
}

impl SignalingState {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        devices: Arc<DeviceRegistry>,
        transport_factory: Arc<dyn TransportFactory>,
        connection_manager: Arc<ConnectionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            devices,
            transport_factory,
            connection_manager,
            capabilities: Arc::new(NoCapabilities),
            on_device_connected: Mutex::new(None),
            signing_attempts: Mutex::new(HashMap::new()),
        })
    }

    async fn check_rate_limit(&self, key: &str) -> bool {
        let mut guard = self.signing_attempts.lock().await;
        let now = Instant::now();
        let attempts = guard.entry(key.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < SIGNING_WINDOW);
        if attempts.len() >= MAX_SIGNING_ATTEMPTS_PER_WINDOW {
            return false;
        }
        attempts.push(now);
        true
    }
}

/// The signaling surface is meant to be reachable from a phone on the same
/// LAN, which is almost always a different origin than whatever served the
/// pairing UI — so unlike the daemon's local JSON-RPC control port, this
/// router allows cross-origin requests.
pub fn build_router(state: Arc<SignalingState>) -> Router {
    Router::new()
        .route("/api/pair", post(start_pairing))
        .route("/api/pair/:session_id", get(poll_pairing).delete(cancel_pairing))
        .route("/signal/:session_id", post(accept_offer))
        .route("/reconnect/:device_id", post(reconnect))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct StartPairingResponse {
    session_id: String,
    qr_data: QrData,
}

#[derive(Serialize)]
struct QrData {
    master_secret: String,
}

async fn start_pairing(
    State(state): State<Arc<SignalingState>>,
) -> Result<Json<StartPairingResponse>, StatusCode> {
    match state.sessions.create().await {
        Ok((session_id, master_secret, _topic)) => Ok(Json(StartPairingResponse {
            session_id,
            qr_data: QrData {
                master_secret: hex::encode(master_secret),
            },
        })),
        Err(_) => Err(StatusCode::TOO_MANY_REQUESTS),
    }
}

#[derive(Serialize)]
struct PollResponse {
    state: &'static str,
    device_name: Option<String>,
}

async fn poll_pairing(
    State(state): State<Arc<SignalingState>>,
    Path(session_id): Path<String>,
) -> Result<Json<PollResponse>, StatusCode> {
    let session = state.sessions.get(&session_id).await.ok_or(StatusCode::NOT_FOUND)?;
    let guard = session.lock().await;
    let state_str = match guard.state {
        SessionState::Idle | SessionState::QrDisplayed => "pending",
        SessionState::Signaling | SessionState::Connecting => "signaling",
        SessionState::Authenticating => "authenticating",
        SessionState::Authenticated => "completed",
        SessionState::Failed => "failed",
    };
    Ok(Json(PollResponse {
        state: state_str,
        device_name: guard.device_name.clone(),
    }))
}

async fn cancel_pairing(
    State(state): State<Arc<SignalingState>>,
    Path(session_id): Path<String>,
) -> StatusCode {
    match state.sessions.cancel(&session_id).await {
        Ok(()) => {
            state.sessions.remove(&session_id).await;
            StatusCode::NO_CONTENT
        }
        Err(_) => StatusCode::NOT_FOUND,
    }
}

/// Verifies `X-RAS-Timestamp`/`X-RAS-Signature` against `signaling_hmac`,
/// the recency window, and the per-key rolling rate limit. Reading the
/// header values is side-effect-free with respect to the comparison: every
/// branch below runs the constant-time HMAC check before returning.
async fn verify_signed_request(
    state: &SignalingState,
    rate_limit_key: &str,
    auth_key: &[u8; 32],
    session_or_device_id: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), StatusCode> {
    let timestamp: i64 = headers
        .get("X-RAS-Timestamp")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let signature_hex = headers
        .get("X-RAS-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let signature = hex::decode(signature_hex).map_err(|_| StatusCode::BAD_REQUEST)?;

    // Every branch below runs the constant-time HMAC check before returning,
    // so reading the header values is side-effect-free with respect to the
    // comparison: a bad timestamp or an over-quota caller can't short-circuit
    // past the signature check.
    let valid = crypto::verify_signaling_hmac(auth_key, session_or_device_id, timestamp, body, &signature);
    let now = chrono::Utc::now().timestamp();
    let within_skew = (now - timestamp).abs() <= HMAC_TIMESTAMP_SKEW;
    let within_rate_limit = state.check_rate_limit(rate_limit_key).await;

    if !within_rate_limit {
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    if !valid || !within_skew {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(())
}

async fn accept_offer(
    State(state): State<Arc<SignalingState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let session = match state.sessions.get(&session_id).await {
        Some(s) => s,
        None => return (StatusCode::NOT_FOUND, String::new()),
    };

    let (auth_key, ok_state) = {
        let guard = session.lock().await;
        let ok = matches!(guard.state, SessionState::QrDisplayed | SessionState::Signaling);
        (guard.auth_key, ok)
    };
    if !ok_state {
        return (StatusCode::CONFLICT, String::new());
    }

    if let Err(status) =
        verify_signed_request(&state, &session_id, &auth_key, &session_id, &headers, &body).await
    {
        return (status, String::new());
    }

    if state.sessions.transition(&session_id, SessionState::Signaling).await.is_err() {
        return (StatusCode::CONFLICT, String::new());
    }

    let transport = state.transport_factory.new_peer().await;
    let peer = PeerConnection::new(transport);

    let offer_sdp = String::from_utf8_lossy(&body).to_string();
    let answer = match timeout(DEFAULT_SDP_TIMEOUT, peer.accept_offer(&offer_sdp)).await {
        Ok(Ok(answer)) => answer,
        _ => {
            peer.close_by_owner(Owner::SignalingHandler).await;
            let _ = state.sessions.transition(&session_id, SessionState::Failed).await;
            return (StatusCode::GATEWAY_TIMEOUT, String::new());
        }
    };

    {
        let mut guard = session.lock().await;
        guard.peer = Some(peer.clone());
    }
    let _ = state.sessions.transition(&session_id, SessionState::Connecting).await;

    let state_cloned = state.clone();
    let session_id_cloned = session_id.clone();
    tokio::spawn(async move {
        run_post_connect_auth(state_cloned, session_id_cloned, peer).await;
    });

    (StatusCode::OK, answer)
}

async fn run_post_connect_auth(
    state: Arc<SignalingState>,
    session_id: String,
    peer: Arc<PeerConnection>,
) {
    let connected = timeout(DEFAULT_PEER_CONNECT_TIMEOUT, peer.wait_connected(DEFAULT_PEER_CONNECT_TIMEOUT)).await;
    if connected.is_err() || connected.unwrap().is_err() {
        peer.close_by_owner(Owner::SignalingHandler).await;
        let _ = state.sessions.transition(&session_id, SessionState::Failed).await;
        return;
    }

    let _ = state.sessions.transition(&session_id, SessionState::Authenticating).await;

    let session = match state.sessions.get(&session_id).await {
        Some(s) => s,
        None => return,
    };
    let (auth_key, master_secret) = {
        let guard = session.lock().await;
        (guard.auth_key, guard.master_secret)
    };

    // A fresh pairing has no device_id until the daemon mints one; it rides
    // along in the handshake's final `Success` envelope so the phone learns
    // it in the same round trip.
    let device_id = Ulid::new().to_string();
    let device_name = format!("device-{}", &device_id[device_id.len() - 6..]);

    if let Err(e) = run_handshake_over_peer(&peer, auth_key, device_id.clone()).await {
        warn!(session_id = %session_id, error = ?e, "pairing handshake failed");
        peer.close_by_owner(Owner::SignalingHandler).await;
        let _ = state.sessions.transition(&session_id, SessionState::Failed).await;
        return;
    }

    let encrypt_key = match crypto::derive_key(&master_secret, "encrypt") {
        Ok(k) => k,
        Err(_) => {
            peer.close_by_owner(Owner::SignalingHandler).await;
            let _ = state.sessions.transition(&session_id, SessionState::Failed).await;
            return;
        }
    };

    if state.devices.add(&device_id, &device_name, master_secret).await.is_err() {
        peer.close_by_owner(Owner::SignalingHandler).await;
        let _ = state.sessions.transition(&session_id, SessionState::Failed).await;
        return;
    }

    let _ = state.sessions.transition(&session_id, SessionState::Authenticated).await;
    peer.transfer_ownership(Owner::ConnectionManager);
    {
        let mut guard = session.lock().await;
        guard.device_id = Some(device_id.clone());
        guard.device_name = Some(device_name.clone());
        guard.peer = None;
    }

    state
        .connection_manager
        .add(device_id.clone(), peer.clone(), MessageCodec::new(encrypt_key))
        .await;

    if let Some(callback) = state.on_device_connected.lock().await.as_ref() {
        callback(device_id, device_name, peer, auth_key).await;
    }
}

async fn run_handshake_over_peer(
    peer: &Arc<PeerConnection>,
    auth_key: [u8; 32],
    device_id: String,
) -> Result<(), AuthError> {
    let mut authenticator = Authenticator::new(auth_key);
    let rx = peer.take_receiver().await;
    let mut rx = match rx {
        Some(rx) => rx,
        None => return Err(AuthError::ProtocolError),
    };

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
                    match rx.recv().await {
                        Some(bytes) => serde_json::from_slice(&bytes).map_err(|_| AuthError::ProtocolError),
                        None => Err(AuthError::Timeout),
                    }
                }
            },
        )
        .await;

    peer.put_receiver_back(rx).await;
    result
}

async fn reconnect(
    State(state): State<Arc<SignalingState>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let device = match state.devices.get(&device_id).await {
        Some(d) => d,
        None => return (StatusCode::NOT_FOUND, String::new()),
    };
    let auth_key = match crypto::derive_key(&device.master_secret, "auth") {
        Ok(k) => k,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, String::new()),
    };

    if let Err(status) =
        verify_signed_request(&state, &device_id, &auth_key, &device_id, &headers, &body).await
    {
        return (status, String::new());
    }

    let transport = state.transport_factory.new_peer().await;
    let peer = PeerConnection::new(transport);
    let offer_sdp = String::from_utf8_lossy(&body).to_string();
    let answer = match timeout(DEFAULT_SDP_TIMEOUT, peer.accept_offer(&offer_sdp)).await {
        Ok(Ok(answer)) => answer,
        _ => {
            peer.close().await;
            return (StatusCode::GATEWAY_TIMEOUT, String::new());
        }
    };

    let encrypt_key = match crypto::derive_key(&device.master_secret, "encrypt") {
        Ok(k) => k,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, String::new()),
    };
    let state_cloned = state.clone();
    let device_id_cloned = device_id.clone();
    let device_name = device.display_name.clone();
    tokio::spawn(async move {
        if run_handshake_over_peer(&peer, auth_key, device_id_cloned.clone()).await.is_ok() {
            peer.transfer_ownership(Owner::ConnectionManager);
            state_cloned
                .connection_manager
                .add(device_id_cloned.clone(), peer.clone(), MessageCodec::new(encrypt_key))
                .await;
            let _ = state_cloned.devices.touch_last_seen(&device_id_cloned).await;
            if let Some(callback) = state_cloned.on_device_connected.lock().await.as_ref() {
                callback(device_id_cloned, device_name, peer, auth_key).await;
            }
        } else {
            peer.close().await;
        }
    });

    (StatusCode::OK, answer)
}
