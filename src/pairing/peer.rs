//! Peer connection (C8) and the transport factory collaborator contract.
//!
//! `PeerConnection` is ownership-typed: only the subsystem currently marked
//! as owner may close it. This is what prevents the signaling handler's
//! cleanup path from racing the connection manager's cleanup path after a
//! successful handoff (see §4.8 for the three-step scheme this encodes).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use super::error::{ConnectionError, TransportError};

/// Invoked by a [`Transport`] the moment it detects the underlying
/// connection is gone — a remote close, an ICE failure, a socket error —
/// independent of whether the core ever called `close()`.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Owner {
    SignalingHandler = 0,
    ConnectionManager = 1,
    Disposed = 2,
}

impl Owner {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Owner::SignalingHandler,
            1 => Owner::ConnectionManager,
            _ => Owner::Disposed,
        }
    }
}

/// The interface the core consumes from a WebRTC/LAN-WebSocket/Tailscale-UDP
/// transport. Implementations live outside this crate; the core never talks
/// to aioice, a WebRTC PeerConnection, or a raw socket directly.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn accept_offer(&self, sdp: &str) -> Result<String, TransportError>;
    async fn create_offer(&self) -> Result<String, TransportError>;
    async fn set_remote_description(&self, sdp: &str) -> Result<(), TransportError>;
    async fn wait_connected(&self, timeout: Duration) -> Result<(), ConnectionError>;
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;
    async fn close(&self);

    /// Registers the callback this transport must invoke exactly once, the
    /// first time it detects the connection is gone, whether or not `close`
    /// is ever called on it. An implementation that only ever reports
    /// closed in response to its own `close()` leaves real disconnects
    /// unobservable to the core: `PeerConnection` relies on this to retire
    /// its inbound channel and let the connection manager's reader loop
    /// notice the drop.
    async fn on_close(&self, handler: CloseHandler);
}

/// Produces a fresh [`Transport`] for an inbound offer. The same factory
/// backs both the HTTP signaling endpoint (C6) and the ntfy rendezvous
/// subscriber (C7); only the host application knows whether that means a
/// WebRTC peer connection, a LAN WebSocket, or a Tailscale UDP socket.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn new_peer(&self) -> Arc<dyn Transport>;
}

/// Injected by the host application so an `answer` can optionally carry a
/// daemon-side capabilities object (e.g. a Tailscale listener address). The
/// default implementation includes nothing — inclusion is driven entirely
/// by what the provider returns, never hard-coded.
pub trait CapabilitiesProvider: Send + Sync {
    fn capabilities(&self) -> Option<serde_json::Value> {
        None
    }
}

pub struct NoCapabilities;
impl CapabilitiesProvider for NoCapabilities {}

/// One transport, ownership-typed so cleanup paths can't race a handoff.
pub struct PeerConnection {
    transport: Arc<dyn Transport>,
    owner: AtomicU8,
    messages: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    message_tx: SyncMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl PeerConnection {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            transport: transport.clone(),
            owner: AtomicU8::new(Owner::SignalingHandler as u8),
            messages: Mutex::new(Some(rx)),
            message_tx: SyncMutex::new(Some(tx)),
        });

        // Registration is async (the transport may need to talk to its own
        // internals to wire this up), so it happens on a spawned task; the
        // transport is expected to hold the handler until it actually
        // closes, which for every real implementation is well after this
        // task has had a chance to run.
        let hook = peer.clone();
        tokio::spawn(async move {
            transport.on_close(Arc::new(move || hook.on_transport_closed())).await;
        });

        peer
    }

    pub fn owner(&self) -> Owner {
        Owner::from_u8(self.owner.load(Ordering::SeqCst))
    }

    /// Invoked by the transport's own `on_close` callback, regardless of
    /// which side (if either) called `close()` first. Marks the peer
    /// disposed and drops the inbound sender so a reader loop blocked on
    /// `rx.recv()` observes `None` and runs its own cleanup.
    fn on_transport_closed(&self) {
        self.owner.store(Owner::Disposed as u8, Ordering::SeqCst);
        if let Ok(mut tx) = self.message_tx.lock() {
            *tx = None;
        }
    }

    /// Delivers one frame from the transport into this peer's inbound
    /// queue. Called by the transport's `on_message` callback.
    pub fn deliver(&self, bytes: Vec<u8>) {
        if let Ok(tx) = self.message_tx.lock() {
            if let Some(tx) = tx.as_ref() {
                let _ = tx.send(bytes);
            }
        }
    }

    /// Takes the inbound message receiver. Only one consumer may hold it at
    /// a time (the signaling handshake, then the connection manager after
    /// handoff); returns `None` if already taken.
    pub async fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.messages.lock().await.take()
    }

    pub async fn put_receiver_back(&self, rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        *self.messages.lock().await = Some(rx);
    }

    /// Returns `false` if ownership was already `Disposed`; otherwise sets
    /// `owner = new` and returns `true`. Never closes anything itself.
    pub fn transfer_ownership(&self, new: Owner) -> bool {
        loop {
            let current = self.owner.load(Ordering::SeqCst);
            if Owner::from_u8(current) == Owner::Disposed {
                return false;
            }
            let new_val = new as u8;
            if self
                .owner
                .compare_exchange(current, new_val, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Returns `false` unless `caller == owner`; otherwise marks the peer
    /// `Disposed` and closes the transport. This is what makes a stale
    /// cleanup path into a no-op after a handoff.
    pub async fn close_by_owner(&self, caller: Owner) -> bool {
        let current = self.owner.load(Ordering::SeqCst);
        if Owner::from_u8(current) != caller {
            return false;
        }
        if self
            .owner
            .compare_exchange(current, Owner::Disposed as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.transport.close().await;
        if let Ok(mut tx) = self.message_tx.lock() {
            *tx = None;
        }
        true
    }

    /// Unconditional close, regardless of ownership. Used by
    /// `ConnectionManager::close_all`, where ownership rules don't apply.
    pub async fn close(&self) {
        self.owner.store(Owner::Disposed as u8, Ordering::SeqCst);
        self.transport.close().await;
        if let Ok(mut tx) = self.message_tx.lock() {
            *tx = None;
        }
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.transport.send(bytes).await
    }

    pub async fn wait_connected(&self, budget: Duration) -> Result<(), ConnectionError> {
        timeout(budget, self.transport.wait_connected(budget))
            .await
            .map_err(|_| ConnectionError::Timeout)?
    }

    pub async fn accept_offer(&self, sdp: &str) -> Result<String, TransportError> {
        self.transport.accept_offer(sdp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct MockTransport {
        connected: AtomicBool,
        closed: AtomicBool,
        on_close: Mutex<Option<CloseHandler>>,
    }

    impl MockTransport {
        /// Simulates the transport noticing the connection is gone on its
        /// own, without `close()` ever being called by the core.
        async fn fire_organic_close(&self) {
            if let Some(handler) = self.on_close.lock().await.as_ref() {
                handler();
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn accept_offer(&self, _sdp: &str) -> Result<String, TransportError> {
            Ok("v=0\r\n".to_string())
        }
        async fn create_offer(&self) -> Result<String, TransportError> {
            Ok("v=0\r\n".to_string())
        }
        async fn set_remote_description(&self, _sdp: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn wait_connected(&self, _timeout: Duration) -> Result<(), ConnectionError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn send(&self, _bytes: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        async fn on_close(&self, handler: CloseHandler) {
            *self.on_close.lock().await = Some(handler);
        }
    }

    fn mock_peer() -> (Arc<PeerConnection>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport {
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(None),
        });
        (PeerConnection::new(transport.clone()), transport)
    }

    #[tokio::test]
    async fn handoff_blocks_stale_close() {
        let (peer, transport) = mock_peer();
        assert!(peer.transfer_ownership(Owner::ConnectionManager));

        // Scenario F / property 11: a stale close from the old owner is a
        // no-op and leaves the transport open.
        assert!(!peer.close_by_owner(Owner::SignalingHandler).await);
        assert!(!transport.closed.load(Ordering::SeqCst));

        assert!(peer.close_by_owner(Owner::ConnectionManager).await);
        assert!(transport.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn transfer_after_dispose_fails() {
        let (peer, _transport) = mock_peer();
        peer.close().await;
        assert!(!peer.transfer_ownership(Owner::ConnectionManager));
    }

    #[tokio::test]
    async fn unconditional_close_ignores_ownership() {
        let (peer, transport) = mock_peer();
        peer.transfer_ownership(Owner::ConnectionManager);
        peer.close().await;
        assert!(transport.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn organic_transport_close_unblocks_the_reader() {
        let (peer, transport) = mock_peer();
        let mut rx = peer.take_receiver().await.unwrap();

        // Give `PeerConnection::new`'s spawned registration task a chance
        // to install the handler before the transport "notices" the
        // disconnect on its own, with no `close()` call from the core.
        for _ in 0..50 {
            if transport.on_close.lock().await.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        transport.fire_organic_close().await;

        assert_eq!(rx.recv().await, None);
        assert_eq!(peer.owner(), Owner::Disposed);
        // The transport itself was never told to close; only the core's
        // own close path does that.
        assert!(!transport.closed.load(Ordering::SeqCst));
    }
}
