//! Pairing session registry (C5).
//!
//! One record per QR display, carrying its own state machine from `idle`
//! through to `authenticated` (and destruction) or `failed`. Sessions are
//! in-memory only; nothing here is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::crypto;
use super::error::SessionError;
use super::peer::PeerConnection;

pub const DEFAULT_QR_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SIGNALING_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    QrDisplayed,
    Signaling,
    Connecting,
    Authenticating,
    Authenticated,
    Failed,
}

impl SessionState {
    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, QrDisplayed) => true,
            (QrDisplayed, Signaling) => true,
            (Signaling, Connecting) => true,
            (Connecting, Authenticating) => true,
            (Authenticating, Authenticated) => true,
            (Failed, Idle) => true,
            (_, Failed) => self != Authenticated,
            _ => false,
        }
    }
}

/// Groups optional policy knobs into a single value, per the teacher's
/// "resist accreting named parameters" convention (see `config::DaemonConfig`).
#[derive(Debug, Clone)]
pub struct PairingPolicy {
    pub qr_timeout: Duration,
    pub signaling_timeout: Duration,
    pub max_sessions: usize,
}

impl Default for PairingPolicy {
    fn default() -> Self {
        Self {
            qr_timeout: DEFAULT_QR_TIMEOUT,
            signaling_timeout: DEFAULT_SIGNALING_TIMEOUT,
            max_sessions: 64,
        }
    }
}

pub struct PairingSession {
    pub session_id: String,
    pub master_secret: [u8; 32],
    pub auth_key: [u8; 32],
    pub created_at: std::time::Instant,
    pub state: SessionState,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub peer: Option<Arc<PeerConnection>>,
    /// Set when the session enters `Signaling`; used to enforce
    /// `signaling_timeout` as a nested budget within the overall
    /// `qr_timeout`.
    signaling_entered_at: Option<std::time::Instant>,
}

impl PairingSession {
    fn new(session_id: String, master_secret: [u8; 32]) -> Result<Self, SessionError> {
        let auth_key = crypto::derive_key(&master_secret, "auth")
            .map_err(|_| SessionError::InvalidTransition { from: "idle".into(), to: "qr_displayed".into() })?;
        Ok(Self {
            session_id,
            master_secret,
            auth_key,
            created_at: std::time::Instant::now(),
            state: SessionState::Idle,
            device_id: None,
            device_name: None,
            peer: None,
            signaling_entered_at: None,
        })
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: format!("{:?}", self.state),
                to: format!("{next:?}"),
            });
        }
        if next == SessionState::Signaling {
            self.signaling_entered_at = Some(std::time::Instant::now());
        }
        self.state = next;
        Ok(())
    }

    /// `SIGNALING_TIMEOUT` bounds time spent in `signaling` alone, nested
    /// within the overall `QR_TIMEOUT` budget that covers every
    /// non-terminal state from session creation onward.
    pub fn is_expired(&self, policy: &PairingPolicy) -> bool {
        match self.state {
            SessionState::Authenticated | SessionState::Failed => false,
            SessionState::Signaling => {
                let qr_expired = self.created_at.elapsed() > policy.qr_timeout;
                let signaling_expired = self
                    .signaling_entered_at
                    .is_some_and(|t| t.elapsed() > policy.signaling_timeout);
                qr_expired || signaling_expired
            }
            _ => self.created_at.elapsed() > policy.qr_timeout,
        }
    }
}

/// Registry of in-flight pairing sessions, keyed by `session_id`. Each
/// session's state transitions are serialized through its own mutex; the
/// registry mutex only guards the map shape.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<PairingSession>>>>,
    policy: PairingPolicy,
}

impl SessionRegistry {
    pub fn new(policy: PairingPolicy) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            policy,
        })
    }

    /// `session_id` is 16 random bytes as lowercase hex; a fresh
    /// `master_secret` is generated and its `auth_key` cached.
    pub async fn create(&self) -> Result<(String, [u8; 32], String), SessionError> {
        {
            let guard = self.sessions.read().await;
            if guard.len() >= self.policy.max_sessions {
                return Err(SessionError::InvalidTransition {
                    from: "idle".into(),
                    to: "qr_displayed".into(),
                });
            }
        }
        let session_id = hex::encode(crypto::random_bytes(16));
        let master_secret = crypto::generate_secret();
        let topic = crypto::rendezvous_topic(&master_secret)
            .map_err(|_| SessionError::InvalidTransition { from: "idle".into(), to: "qr_displayed".into() })?;

        let mut session = PairingSession::new(session_id.clone(), master_secret)?;
        session.transition(SessionState::QrDisplayed)?;

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));

        Ok((session_id, master_secret, topic))
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Mutex<PairingSession>>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn transition(&self, session_id: &str, next: SessionState) -> Result<(), SessionError> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.lock().await.transition(next)
    }

    /// Cooperative cancel. Idempotent; must not close a peer whose
    /// ownership has already been transferred away from the signaling
    /// handler (see `peer::PeerConnection::close_by_owner`).
    pub async fn cancel(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let mut guard = session.lock().await;
        if guard.state == SessionState::Authenticated {
            // Ownership already transferred; do not touch the transport.
            guard.peer = None;
            return Ok(());
        }
        guard.state = SessionState::Failed;
        if let Some(peer) = guard.peer.take() {
            drop(guard);
            peer.close_by_owner(super::peer::Owner::SignalingHandler).await;
        }
        Ok(())
    }

    pub async fn remove(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Sweeps expired sessions to `failed` and removes them. Intended to be
    /// called from a periodic background task.
    pub async fn sweep_expired(&self) {
        let expired: Vec<String> = {
            let guard = self.sessions.read().await;
            let mut out = Vec::new();
            for (id, session) in guard.iter() {
                let s = session.lock().await;
                if s.is_expired(&self.policy) {
                    out.push(id.clone());
                }
            }
            out
        };
        for id in expired {
            debug!(session_id = %id, "pairing session expired");
            let _ = self.cancel(&id).await;
            self.remove(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_progress_state_machine() {
        let registry = SessionRegistry::new(PairingPolicy::default());
        let (id, secret, topic) = registry.create().await.unwrap();
        assert_eq!(secret.len(), 32);
        assert!(topic.starts_with("ras-"));

        let session = registry.get(&id).await.unwrap();
        assert_eq!(session.lock().await.state, SessionState::QrDisplayed);

        registry.transition(&id, SessionState::Signaling).await.unwrap();
        registry.transition(&id, SessionState::Connecting).await.unwrap();
        registry.transition(&id, SessionState::Authenticating).await.unwrap();
        registry.transition(&id, SessionState::Authenticated).await.unwrap();
        assert_eq!(session.lock().await.state, SessionState::Authenticated);
    }

    #[tokio::test]
    async fn invalid_transition_rejected() {
        let registry = SessionRegistry::new(PairingPolicy::default());
        let (id, _, _) = registry.create().await.unwrap();
        let err = registry.transition(&id, SessionState::Authenticated).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn signaling_timeout_expires_before_qr_timeout() {
        let policy = PairingPolicy {
            qr_timeout: Duration::from_secs(5 * 60),
            signaling_timeout: Duration::from_millis(10),
            max_sessions: 64,
        };
        let registry = SessionRegistry::new(policy.clone());
        let (id, _, _) = registry.create().await.unwrap();
        registry.transition(&id, SessionState::Signaling).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let session = registry.get(&id).await.unwrap();
        assert!(session.lock().await.is_expired(&policy));
    }

    #[tokio::test]
    async fn cancel_after_authenticated_does_not_touch_peer() {
        let registry = SessionRegistry::new(PairingPolicy::default());
        let (id, _, _) = registry.create().await.unwrap();
        registry.transition(&id, SessionState::Signaling).await.unwrap();
        registry.transition(&id, SessionState::Connecting).await.unwrap();
        registry.transition(&id, SessionState::Authenticating).await.unwrap();
        registry.transition(&id, SessionState::Authenticated).await.unwrap();

        // property 10: peer reference cleared after hand-off already
        // happened elsewhere; cancel must still be a safe no-op.
        registry.cancel(&id).await.unwrap();
        let session = registry.get(&id).await.unwrap();
        assert!(session.lock().await.peer.is_none());
    }
}
