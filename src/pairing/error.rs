//! Error kinds shared across the pairing/connectivity subsystems.
//!
//! One `thiserror` enum per subsystem, mirroring the rest of this crate's
//! convention (see `agents::orchestrator::OrchestratorError`). Variants never
//! carry cause-leaking context for the crypto path — see `CryptoError`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CryptoError {
    #[error("key must be 32 bytes")]
    BadKeyLength,
    #[error("nonce must be 12 bytes")]
    BadNonceLength,
    #[error("decryption failed")]
    DecryptionFailed,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum MessageErrorKind {
    #[error("envelope could not be decrypted")]
    Decrypt,
    #[error("plaintext was not a well-formed message")]
    Format,
    #[error("message timestamp outside max_age window")]
    Expired,
    #[error("sequence number below the replay window floor")]
    TooOld,
    #[error("sequence number already seen")]
    Duplicate,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[error("{kind}")]
pub struct MessageError {
    pub kind: MessageErrorKind,
}

impl MessageError {
    pub fn new(kind: MessageErrorKind) -> Self {
        Self { kind }
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum AuthError {
    #[error("HMAC verification failed")]
    InvalidHmac,
    #[error("nonce had the wrong length")]
    InvalidNonce,
    #[error("unexpected message for the current handshake state")]
    ProtocolError,
    #[error("handshake timed out")]
    Timeout,
    #[error("too many failed attempts, rate limited")]
    RateLimited,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum SessionError {
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("session expired")]
    Expired,
    #[error("session not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConnectionError {
    #[error("operation timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub anyhow::Error);

#[derive(Debug, Error)]
pub enum DeviceRegistryError {
    #[error("invalid device id")]
    InvalidDeviceId,
    #[error("master secret must be 32 bytes")]
    BadSecretLength,
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
