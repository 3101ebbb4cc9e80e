//! Heartbeat loop (C11).
//!
//! Per-connection periodic liveness frames and staleness detection. C11
//! never unilaterally disconnects a connection; it only reports which ones
//! look stale via [`HeartbeatManager::get_stale_connections`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub send_interval: Duration,
    pub receive_timeout: Duration,
}

impl HeartbeatConfig {
    pub fn new(send_interval: Duration, receive_timeout: Duration) -> Self {
        if send_interval >= Duration::from_secs(30) {
            warn!(
                send_interval_secs = send_interval.as_secs(),
                "heartbeat send_interval >= 30s; the transport's own timeout is typically ~30s"
            );
        }
        Self {
            send_interval,
            receive_timeout,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(15), Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ConnectionHealth {
    last_heartbeat_sent: i64,
    last_heartbeat_received: i64,
    last_activity: i64,
    seq: u64,
}

/// All liveness timestamps are stored in epoch milliseconds (matching the
/// heartbeat frame's own `ts_ms` field), not epoch seconds: `receive_timeout`
/// is often configured well under a second in tests and short-lived
/// deployments, and a seconds-resolution clock would make staleness
/// detection depend on which side of a second boundary two events land.
fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Callback used to actually push a heartbeat frame onto a connection.
pub type SendFn = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

pub struct HeartbeatManager {
    config: HeartbeatConfig,
    health: RwLock<HashMap<String, ConnectionHealth>>,
    send: Mutex<Option<SendFn>>,
    running: std::sync::atomic::AtomicBool,
}

impl HeartbeatManager {
    pub fn new(config: HeartbeatConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            health: RwLock::new(HashMap::new()),
            send: Mutex::new(None),
            running: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub async fn set_send_fn(&self, send: SendFn) {
        *self.send.lock().await = Some(send);
    }

    pub async fn track(&self, device_id: String) {
        let now = now_millis();
        self.health.write().await.insert(
            device_id,
            ConnectionHealth {
                last_heartbeat_sent: now,
                last_heartbeat_received: now,
                last_activity: now,
                seq: 0,
            },
        );
    }

    pub async fn untrack(&self, device_id: &str) {
        self.health.write().await.remove(device_id);
    }

    pub async fn on_heartbeat_received(&self, device_id: &str) {
        let now = now_millis();
        if let Some(h) = self.health.write().await.get_mut(device_id) {
            h.last_heartbeat_received = now;
            h.last_activity = now;
        }
    }

    pub async fn on_activity(&self, device_id: &str) {
        let now = now_millis();
        if let Some(h) = self.health.write().await.get_mut(device_id) {
            h.last_activity = now;
        }
    }

    pub async fn send_immediate(&self, device_id: &str) {
        let frame = {
            let mut guard = self.health.write().await;
            let h = match guard.get_mut(device_id) {
                Some(h) => h,
                None => return,
            };
            h.seq += 1;
            h.last_heartbeat_sent = now_millis();
            heartbeat_frame(h.seq)
        };
        if let Some(send) = self.send.lock().await.as_ref() {
            send(device_id.to_string(), frame);
        }
    }

    pub async fn get_stale_connections(&self) -> Vec<String> {
        let now = now_millis();
        let timeout_millis = self.config.receive_timeout.as_millis() as i64;
        self.health
            .read()
            .await
            .iter()
            .filter(|(_, h)| now - h.last_activity > timeout_millis)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Runs until `shutdown` resolves, sending a heartbeat to every tracked
    /// connection every `send_interval`.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        self.running.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut tick = interval(self.config.send_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let ids: Vec<String> = self.health.read().await.keys().cloned().collect();
                    for id in ids {
                        self.send_immediate(&id).await;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        self.running.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

fn heartbeat_frame(seq: u64) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "type": "heartbeat",
        "seq": seq,
        "ts_ms": Utc::now().timestamp_millis(),
    }))
    .unwrap_or_default()
}
