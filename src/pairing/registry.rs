//! Device registry (C3).
//!
//! Durable mapping from device id to master secret. One file per paired
//! device under `data_dir/devices/`, each written atomically (tmp file,
//! fsync, rename) as the daemon's other persistence paths already do (see
//! `tasks::queue_serializer::flush_queue`). Corrupt individual records are
//! skipped on load with a diagnostic rather than failing the whole registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use super::error::DeviceRegistryError;

static DEVICE_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("static pattern compiles"));

pub fn validate_device_id(id: &str) -> Result<(), DeviceRegistryError> {
    if id.is_empty() || id.len() > 128 || !DEVICE_ID_PATTERN.is_match(id) {
        return Err(DeviceRegistryError::InvalidDeviceId);
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedDevice {
    pub device_id: String,
    pub display_name: String,
    #[serde(with = "base64_secret")]
    pub master_secret: [u8; 32],
    pub paired_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

mod base64_secret {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(secret: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(secret))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("master_secret must decode to 32 bytes"));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Added(PairedDevice),
    Removed(String),
}

/// File-based, atomically-persisted device store.
pub struct DeviceRegistry {
    dir: PathBuf,
    devices: RwLock<HashMap<String, PairedDevice>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl DeviceRegistry {
    /// Loads every `device-*.json` under `data_dir/devices/`, skipping and
    /// logging any record that fails to parse or whose secret length is
    /// wrong, and creates the directory (mode 0700 on Unix) if absent.
    pub async fn load(data_dir: &Path) -> Result<Arc<Self>, DeviceRegistryError> {
        let dir = data_dir.join("devices");
        fs::create_dir_all(&dir).await?;
        set_dir_permissions(&dir).await;

        let mut devices = HashMap::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_one(&path).await {
                Ok(device) => {
                    devices.insert(device.device_id.clone(), device);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping corrupt device record");
                }
            }
        }

        let (tx, _rx) = broadcast::channel(64);
        Ok(Arc::new(Self {
            dir,
            devices: RwLock::new(devices),
            events: tx,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub async fn add(
        &self,
        device_id: &str,
        display_name: &str,
        master_secret: [u8; 32],
    ) -> Result<PairedDevice, DeviceRegistryError> {
        validate_device_id(device_id)?;
        let now = Utc::now();
        let device = PairedDevice {
            device_id: device_id.to_string(),
            display_name: display_name.to_string(),
            master_secret,
            paired_at: now,
            last_seen: now,
        };

        {
            let mut guard = self.devices.write().await;
            guard.insert(device_id.to_string(), device.clone());
        }
        // Persistence errors are logged and re-raised; in-memory state stays
        // updated regardless so a retried `add` can succeed without redoing
        // the handshake.
        self.persist(&device).await?;
        let _ = self.events.send(DeviceEvent::Added(device.clone()));
        Ok(device)
    }

    pub async fn remove(&self, device_id: &str) -> Result<bool, DeviceRegistryError> {
        let removed = {
            let mut guard = self.devices.write().await;
            guard.remove(device_id).is_some()
        };
        if removed {
            let path = self.path_for(device_id);
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(DeviceRegistryError::Io(e));
                }
            }
            let _ = self.events.send(DeviceEvent::Removed(device_id.to_string()));
        }
        Ok(removed)
    }

    pub async fn get(&self, device_id: &str) -> Option<PairedDevice> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn all(&self) -> Vec<PairedDevice> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn is_paired(&self, device_id: &str) -> bool {
        self.devices.read().await.contains_key(device_id)
    }

    pub async fn touch_last_seen(&self, device_id: &str) -> Result<(), DeviceRegistryError> {
        let device = {
            let mut guard = self.devices.write().await;
            match guard.get_mut(device_id) {
                Some(d) => {
                    d.last_seen = Utc::now();
                    d.clone()
                }
                None => return Err(DeviceRegistryError::NotFound(device_id.to_string())),
            }
        };
        self.persist(&device).await
    }

    fn path_for(&self, device_id: &str) -> PathBuf {
        self.dir.join(format!("device-{device_id}.json"))
    }

    async fn persist(&self, device: &PairedDevice) -> Result<(), DeviceRegistryError> {
        use tokio::io::AsyncWriteExt;

        let path = self.path_for(&device.device_id);
        let json = serde_json::to_string_pretty(device)?;
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
        }
        set_file_permissions(&tmp_path).await;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

async fn load_one(path: &Path) -> Result<PairedDevice, DeviceRegistryError> {
    let contents = fs::read_to_string(path).await?;
    let device: PairedDevice = serde_json::from_str(&contents)?;
    validate_device_id(&device.device_id)?;
    Ok(device)
}

#[cfg(unix)]
async fn set_dir_permissions(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(dir).await {
        let mut perms = meta.permissions();
        perms.set_mode(0o700);
        let _ = fs::set_permissions(dir, perms).await;
    }
}

#[cfg(not(unix))]
async fn set_dir_permissions(_dir: &Path) {}

#[cfg(unix)]
async fn set_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path).await {
        let mut perms = meta.permissions();
        perms.set_mode(0o600);
        let _ = fs::set_permissions(path, perms).await;
    }
}

#[cfg(not(unix))]
async fn set_file_permissions(_path: &Path) {}
