//! Mutual challenge-response authenticator (C4).
//!
//! A four-message HMAC handshake run over an unauthenticated transport. The
//! daemon role always issues the first challenge; `Authenticator` here
//! implements that role. The counterpart (phone) role is a handful of
//! stateless HMAC operations, exposed as free functions so tests can drive
//! both sides of Scenario E over an in-memory channel.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::debug;

use super::crypto;
use super::error::AuthError;

pub const MAX_FAILED_ATTEMPTS: u32 = 5;
pub const NONCE_LENGTH: usize = 32;
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Pending,
    Challenged,
    Authenticated,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthEnvelope {
    Challenge { nonce: Vec<u8> },
    Response { hmac: Vec<u8>, nonce: Vec<u8> },
    Verify { hmac: Vec<u8> },
    Success { device_id: String },
    Error { code: String, message: String },
}

impl AuthEnvelope {
    pub fn error(err: &AuthError) -> Self {
        AuthEnvelope::Error {
            code: format!("{err:?}"),
            message: err.to_string(),
        }
    }
}

/// Daemon-side handshake state machine. One instance per in-flight
/// handshake attempt; `failed_attempts`/`used_nonces` persist across
/// attempts when the caller reuses the same instance for a retry.
pub struct Authenticator {
    auth_key: [u8; 32],
    state: AuthState,
    our_nonce: Option<[u8; 32]>,
    failed_attempts: u32,
    used_nonces: HashSet<[u8; 32]>,
}

impl Authenticator {
    pub fn new(auth_key: [u8; 32]) -> Self {
        Self {
            auth_key,
            state: AuthState::Pending,
            our_nonce: None,
            failed_attempts: 0,
            used_nonces: HashSet::new(),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Issues the first challenge. Fails immediately with `RateLimited` if
    /// `MAX_FAILED_ATTEMPTS` prior attempts on this instance have failed,
    /// regardless of how much wall-clock time has passed.
    pub fn create_challenge(&mut self) -> Result<AuthEnvelope, AuthError> {
        if self.failed_attempts >= MAX_FAILED_ATTEMPTS {
            return Err(AuthError::RateLimited);
        }
        let mut nonce = crypto::generate_secret();
        while self.used_nonces.contains(&nonce) {
            nonce = crypto::generate_secret();
        }
        self.our_nonce = Some(nonce);
        self.state = AuthState::Challenged;
        Ok(AuthEnvelope::Challenge { nonce: nonce.to_vec() })
    }

    /// Feeds one incoming message through the state machine. Returns the
    /// next outgoing message(s) to send, or an error that has already
    /// transitioned the state to `Failed`.
    pub fn handle_message(
        &mut self,
        msg: AuthEnvelope,
    ) -> Result<(AuthEnvelope, AuthEnvelope), AuthError> {
        if self.state != AuthState::Challenged {
            self.state = AuthState::Failed;
            return Err(AuthError::ProtocolError);
        }
        let (hmac, their_nonce) = match msg {
            AuthEnvelope::Response { hmac, nonce } => (hmac, nonce),
            _ => {
                self.state = AuthState::Failed;
                return Err(AuthError::ProtocolError);
            }
        };
        if their_nonce.len() != NONCE_LENGTH {
            self.state = AuthState::Failed;
            return Err(AuthError::InvalidNonce);
        }
        // `create_challenge` already guarantees `our_nonce` was fresh
        // against `used_nonces` at the moment it was assigned, and nothing
        // mutates it before this point in a single handshake, so there is
        // no re-check against `used_nonces` here.
        let our_nonce = self.our_nonce.expect("our_nonce set when entering Challenged");
        if !crypto::hmac_verify(&self.auth_key, &our_nonce, &hmac) {
            self.state = AuthState::Failed;
            self.failed_attempts += 1;
            return Err(AuthError::InvalidHmac);
        }

        self.used_nonces.insert(our_nonce);
        let verify_hmac = crypto::hmac_compute(&self.auth_key, &their_nonce);
        self.state = AuthState::Authenticated;
        Ok((
            AuthEnvelope::Verify { hmac: verify_hmac.to_vec() },
            AuthEnvelope::Success { device_id: String::new() },
        ))
    }

    /// Runs the full daemon-side handshake over caller-supplied send/receive
    /// callbacks, bounded by [`HANDSHAKE_TIMEOUT`]. `recv` is expected to
    /// apply its own per-call [`RECEIVE_TIMEOUT`].
    pub async fn run<S, SFut, R, RFut>(
        &mut self,
        device_id: String,
        mut send: S,
        mut recv: R,
    ) -> Result<(), AuthError>
    where
        S: FnMut(AuthEnvelope) -> SFut,
        SFut: std::future::Future<Output = ()>,
        R: FnMut() -> RFut,
        RFut: std::future::Future<Output = Result<AuthEnvelope, AuthError>>,
    {
        let handshake = async {
            let challenge = self.create_challenge()?;
            send(challenge).await;

            let response = timeout(RECEIVE_TIMEOUT, recv())
                .await
                .map_err(|_| AuthError::Timeout)??;

            let (verify, _success) = self.handle_message(response)?;
            send(verify).await;
            send(AuthEnvelope::Success { device_id }).await;
            Ok(())
        };

        match timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(result) => result,
            Err(_) => {
                self.state = AuthState::Failed;
                Err(AuthError::Timeout)
            }
        }
    }
}

/// Phone-side response to a received challenge nonce.
pub fn respond_to_challenge(auth_key: &[u8; 32], challenge_nonce: &[u8]) -> (AuthEnvelope, [u8; 32]) {
    let our_nonce = crypto::generate_secret();
    let hmac = crypto::hmac_compute(auth_key, challenge_nonce);
    (
        AuthEnvelope::Response {
            hmac: hmac.to_vec(),
            nonce: our_nonce.to_vec(),
        },
        our_nonce,
    )
}

/// Phone-side verification of the daemon's `verify` message.
pub fn verify_verify(auth_key: &[u8; 32], our_nonce: &[u8; 32], msg: &AuthEnvelope) -> bool {
    match msg {
        AuthEnvelope::Verify { hmac } => crypto::hmac_verify(auth_key, our_nonce, hmac),
        _ => {
            debug!("expected verify message, got something else");
            false
        }
    }
}
