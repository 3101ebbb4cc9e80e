//! Remote terminal pairing and connectivity.
//!
//! This module tree implements the pairing daemon's core: cryptography
//! (`crypto`), the plaintext wire format and replay protection (`message`),
//! error types (`error`), the mutual challenge-response handshake (`auth`),
//! durable paired-device storage (`registry`), the in-memory pairing flow
//! state machine (`session`), the ownership-typed peer connection (`peer`),
//! the authenticated-connection registry (`connection_manager`), liveness
//! tracking (`heartbeat`), QR payload encoding (`qr`), the HTTP signaling
//! surface (`signaling`), the ntfy reconnection rendezvous (`ntfy`), and the
//! glue that wires them together into a running daemon (`orchestrator`).
//!
//! Transport implementations (WebRTC, LAN WebSocket, Tailscale UDP) are not
//! part of this module: the core only ever talks to the `peer::Transport`
//! and `peer::TransportFactory` trait objects a host application injects.

pub mod auth;
pub mod connection_manager;
pub mod crypto;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod ntfy;
pub mod orchestrator;
pub mod peer;
pub mod qr;
pub mod registry;
pub mod session;
pub mod signaling;

pub use auth::{AuthEnvelope, AuthState, Authenticator};
pub use connection_manager::ConnectionManager;
pub use error::{
    AuthError, ConnectionError, CryptoError, DeviceRegistryError, MessageError, SessionError,
    TransportError,
};
pub use heartbeat::{HeartbeatConfig, HeartbeatManager};
pub use message::{Message, MessageCodec};
pub use ntfy::NtfyReconnectManager;
pub use orchestrator::{DispatchHandler, Orchestrator};
pub use peer::{
    CapabilitiesProvider, CloseHandler, NoCapabilities, Owner, PeerConnection, Transport,
    TransportFactory,
};
pub use qr::QrPayload;
pub use registry::{DeviceEvent, DeviceRegistry, PairedDevice};
pub use session::{PairingPolicy, PairingSession, SessionRegistry, SessionState};
pub use signaling::{build_router, SignalingState};
