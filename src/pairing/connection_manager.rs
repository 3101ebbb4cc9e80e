//! Connection manager (C9).
//!
//! Registry of authenticated peers, keyed by device id. Replaces an
//! existing connection on reconnect without firing that old connection's
//! `on_connection_lost`, and fans a broadcast out to every peer with a
//! per-send timeout so one slow peer can't stall the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::message::{Message, MessageCodec};
use super::peer::{Owner, PeerConnection};

pub const DEFAULT_BROADCAST_TIMEOUT: Duration = Duration::from_secs(5);

struct ConnectionRecord {
    device_id: String,
    peer: Arc<PeerConnection>,
    codec: Arc<Mutex<MessageCodec>>,
    connected_at: chrono::DateTime<chrono::Utc>,
    last_activity: Arc<std::sync::atomic::AtomicI64>,
    suppress_lost: Arc<AtomicBool>,
}

/// Callback invoked once a full plaintext `Message` has been decoded off a
/// connection. Routing it further (into the orchestrator's dispatch
/// tables) is outside this type's concern.
pub type DecodedHandler = Arc<dyn Fn(String, Message) + Send + Sync>;
/// Callback invoked strictly after a connection has been removed from the
/// map.
pub type LostHandler = Arc<dyn Fn(String) + Send + Sync>;

pub struct ConnectionManager {
    connections: Mutex<HashMap<String, Arc<ConnectionRecord>>>,
    on_decoded: Mutex<Option<DecodedHandler>>,
    on_lost: Mutex<Option<LostHandler>>,
    broadcast_timeout: Duration,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Self::with_broadcast_timeout(DEFAULT_BROADCAST_TIMEOUT)
    }

    pub fn with_broadcast_timeout(broadcast_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            on_decoded: Mutex::new(None),
            on_lost: Mutex::new(None),
            broadcast_timeout,
        })
    }

    pub async fn set_on_decoded(&self, handler: DecodedHandler) {
        *self.on_decoded.lock().await = Some(handler);
    }

    pub async fn set_on_lost(&self, handler: LostHandler) {
        *self.on_lost.lock().await = Some(handler);
    }

    /// Registers `peer` under `device_id`. If a connection already existed
    /// for that device, its close handler is suppressed before it is closed
    /// unconditionally — the replaced peer never fires `on_connection_lost`.
    pub async fn add(
        self: &Arc<Self>,
        device_id: String,
        peer: Arc<PeerConnection>,
        codec: MessageCodec,
    ) {
        let record = Arc::new(ConnectionRecord {
            device_id: device_id.clone(),
            peer: peer.clone(),
            codec: Arc::new(Mutex::new(codec)),
            connected_at: chrono::Utc::now(),
            last_activity: Arc::new(std::sync::atomic::AtomicI64::new(chrono::Utc::now().timestamp())),
            suppress_lost: Arc::new(AtomicBool::new(false)),
        });

        let old = {
            let mut guard = self.connections.lock().await;
            guard.insert(device_id.clone(), record.clone())
        };

        if let Some(old_record) = old {
            old_record.suppress_lost.store(true, Ordering::SeqCst);
            old_record.peer.close().await;
        }

        self.spawn_reader(record);
    }

    fn spawn_reader(self: &Arc<Self>, record: Arc<ConnectionRecord>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut rx = match record.peer.take_receiver().await {
                Some(rx) => rx,
                None => return,
            };
            loop {
                match rx.recv().await {
                    Some(bytes) => manager.handle_inbound(&record, bytes).await,
                    None => break,
                }
            }
            manager.on_connection_closed(&record).await;
        });
    }

    async fn handle_inbound(&self, record: &Arc<ConnectionRecord>, bytes: Vec<u8>) {
        record
            .last_activity
            .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
        let decoded = {
            let mut codec = record.codec.lock().await;
            codec.decode(&bytes)
        };
        match decoded {
            Ok(msg) => {
                if let Some(handler) = self.on_decoded.lock().await.as_ref() {
                    handler(record.device_id.clone(), msg);
                }
            }
            Err(e) => {
                // Decrypt/format failures are noise, not a reason to close
                // the connection.
                debug!(device_id = %record.device_id, error = %e, "dropping undecodable frame");
            }
        }
    }

    async fn on_connection_closed(&self, record: &Arc<ConnectionRecord>) {
        if record.suppress_lost.load(Ordering::SeqCst) {
            return;
        }
        let removed = {
            let mut guard = self.connections.lock().await;
            match guard.get(&record.device_id) {
                Some(current) if Arc::ptr_eq(current, record) => {
                    guard.remove(&record.device_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            if let Some(handler) = self.on_lost.lock().await.as_ref() {
                handler(record.device_id.clone());
            }
        }
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<PeerConnection>> {
        self.connections
            .lock()
            .await
            .get(device_id)
            .map(|r| r.peer.clone())
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Encodes `msg` per-connection (each connection has its own codec
    /// state) and sends to every peer with a bounded per-send timeout. A
    /// single slow or failing peer never blocks the others.
    pub async fn broadcast(&self, msg: Message) {
        let snapshot: Vec<Arc<ConnectionRecord>> =
            self.connections.lock().await.values().cloned().collect();

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        for record in snapshot {
            let tx = tx.clone();
            let msg = msg.clone();
            let budget = self.broadcast_timeout;
            tokio::spawn(async move {
                let result = timeout(budget, send_one(&record, msg)).await;
                if let Err(_) | Ok(Err(_)) = result {
                    warn!(device_id = %record.device_id, "broadcast send failed or timed out");
                }
                let _ = tx.send(());
            });
        }
        drop(tx);
        while rx.recv().await.is_some() {}
    }

    /// Snapshots and clears the map, then closes every peer concurrently
    /// with failures suppressed.
    pub async fn close_all(&self) {
        let snapshot: Vec<Arc<ConnectionRecord>> = {
            let mut guard = self.connections.lock().await;
            let all = guard.values().cloned().collect();
            guard.clear();
            all
        };
        for record in &snapshot {
            record.suppress_lost.store(true, Ordering::SeqCst);
        }
        let mut handles = Vec::new();
        for record in snapshot {
            handles.push(tokio::spawn(async move {
                record.peer.close().await;
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }
}

async fn send_one(record: &ConnectionRecord, msg: Message) -> Result<(), ()> {
    let bytes = {
        let mut codec = record.codec.lock().await;
        codec.encode(msg).map_err(|_| ())?
    };
    record.peer.send(&bytes).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::crypto;
    use crate::pairing::error::{ConnectionError, TransportError};
    use crate::pairing::peer::Transport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct CountingTransport {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
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
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_close(&self, _handler: crate::pairing::peer::CloseHandler) {}
    }

    /// A transport that can simulate noticing the connection is gone on its
    /// own, independent of the core ever calling `close()`.
    struct DisconnectingTransport {
        on_close: Mutex<Option<crate::pairing::peer::CloseHandler>>,
    }

    #[async_trait]
    impl Transport for DisconnectingTransport {
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
        async fn on_close(&self, handler: crate::pairing::peer::CloseHandler) {
            *self.on_close.lock().await = Some(handler);
        }
    }

    #[tokio::test]
    async fn organic_disconnect_fires_lost_callback() {
        let manager = ConnectionManager::new();
        let lost = Arc::new(std::sync::Mutex::new(Vec::new()));
        let lost_clone = lost.clone();
        manager
            .set_on_lost(Arc::new(move |device_id| {
                if let Ok(mut guard) = lost_clone.lock() {
                    guard.push(device_id);
                }
            }))
            .await;

        let transport = Arc::new(DisconnectingTransport { on_close: Mutex::new(None) });
        let peer = PeerConnection::new(transport.clone());
        manager
            .add("phone-1".into(), peer, MessageCodec::new(crypto::generate_secret()))
            .await;

        // Wait for `PeerConnection::new`'s registration task to install the
        // handler before simulating the transport noticing a real
        // disconnect, with no `add()`/`close_all()` call involved.
        for _ in 0..50 {
            if transport.on_close.lock().await.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        if let Some(handler) = transport.on_close.lock().await.as_ref() {
            handler();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lost.lock().unwrap().as_slice(), &["phone-1".to_string()]);
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn replace_closes_old_without_lost_callback() {
        let manager = ConnectionManager::new();
        let lost_count = Arc::new(AtomicUsize::new(0));
        let counter = lost_count.clone();
        manager
            .set_on_lost(Arc::new(move |_device_id| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let closes = Arc::new(AtomicUsize::new(0));
        let old_peer = PeerConnection::new(Arc::new(CountingTransport { closes: closes.clone() }));
        let key = crypto::generate_secret();
        manager.add("phone-1".into(), old_peer, MessageCodec::new(key)).await;

        let new_peer = PeerConnection::new(Arc::new(CountingTransport { closes: closes.clone() }));
        manager.add("phone-1".into(), new_peer, MessageCodec::new(key)).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(lost_count.load(Ordering::SeqCst), 0);
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn close_all_closes_every_peer() {
        let manager = ConnectionManager::new();
        let closes = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let peer = PeerConnection::new(Arc::new(CountingTransport { closes: closes.clone() }));
            manager
                .add(format!("phone-{i}"), peer, MessageCodec::new(crypto::generate_secret()))
                .await;
        }
        manager.close_all().await;
        assert_eq!(closes.load(Ordering::SeqCst), 3);
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn broadcast_delivers_to_all_connections() {
        let manager = ConnectionManager::new();
        let closes = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let peer = PeerConnection::new(Arc::new(CountingTransport { closes: closes.clone() }));
            manager
                .add(format!("phone-{i}"), peer, MessageCodec::new(crypto::generate_secret()))
                .await;
        }
        manager
            .broadcast(Message::new("ping", json!({})))
            .await;
    }
}
