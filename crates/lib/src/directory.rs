//! Device directory: registered devices, their auth keys and exposed endpoints.
//!
//! The gateway only reads from it (`DeviceDirectory`). `DeviceStore` keeps the list in a
//! JSON file that the CLI edits; a running gateway picks up changes on the next lookup.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

use crate::gateway::DeviceId;

/// One registered device. `auth_key` is the secret it presents when dialing in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub auth_key: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

/// A capability exposed by a device, addressed by an opaque pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub pattern: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
}

/// Read-only lookups the gateway needs from the device directory.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn get_by_id(&self, device_id: DeviceId) -> Option<Device>;
    async fn get_by_key(&self, auth_key: &str) -> Option<Device>;
}

/// New random auth key: 32 bytes, URL-safe base64.
pub fn generate_auth_key() -> Result<String> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).map_err(|e| anyhow::anyhow!("getrandom: {}", e))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Files modified this recently may change again without a visible mtime change.
const MTIME_SETTLE: Duration = Duration::from_secs(2);

/// What the in-memory list was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
    digest: [u8; 32],
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(bytes));
    out
}

/// Device list backed by a JSON file (or memory only, for tests and embedding).
pub struct DeviceStore {
    path: Option<PathBuf>,
    devices: RwLock<Vec<Device>>,
    loaded: RwLock<Option<FileStamp>>,
}

impl DeviceStore {
    /// Load from path; if the file is missing or invalid, starts empty.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let (devices, stamp) = read_file(&path).await;
        Self {
            path: Some(path),
            devices: RwLock::new(devices),
            loaded: RwLock::new(stamp),
        }
    }

    pub fn in_memory(devices: Vec<Device>) -> Self {
        Self {
            path: None,
            devices: RwLock::new(devices),
            loaded: RwLock::new(None),
        }
    }

    /// Re-read the file when it changed since it was last loaded. Unchanged mtime and
    /// length are trusted only once the mtime has settled; otherwise contents are compared.
    async fn refresh(&self) {
        let Some(ref path) = self.path else { return };
        let Ok(meta) = tokio::fs::metadata(path).await else { return };
        let Ok(modified) = meta.modified() else { return };
        if let Some(ref stamp) = *self.loaded.read().await {
            let settled = SystemTime::now()
                .duration_since(modified)
                .map(|age| age > MTIME_SETTLE)
                .unwrap_or(false);
            if stamp.modified == modified && stamp.len == meta.len() && settled {
                return;
            }
        }
        let (devices, stamp) = read_file(path).await;
        let Some(stamp) = stamp else { return };
        let mut current = self.devices.write().await;
        let mut loaded = self.loaded.write().await;
        if loaded.as_ref().map(|s| s.digest) != Some(stamp.digest) {
            log::debug!("device directory reloaded from {} ({} devices)", path.display(), devices.len());
            *current = devices;
        }
        *loaded = Some(stamp);
    }

    async fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else { return Ok(()) };
        let devices = self.devices.read().await;
        let json = serde_json::to_string_pretty(&*devices)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &json)
            .await
            .with_context(|| format!("writing device directory {}", path.display()))?;
        let meta = tokio::fs::metadata(path).await?;
        *self.loaded.write().await = Some(FileStamp {
            modified: meta.modified()?,
            len: meta.len(),
            digest: digest(json.as_bytes()),
        });
        Ok(())
    }

    pub async fn list(&self) -> Vec<Device> {
        self.refresh().await;
        self.devices.read().await.clone()
    }

    /// Register a new device with a fresh auth key and persist.
    pub async fn add(
        &self,
        display_name: impl Into<String>,
        description: impl Into<String>,
        endpoints: Vec<Endpoint>,
    ) -> Result<Device> {
        self.refresh().await;
        let device = {
            let mut devices = self.devices.write().await;
            let id = devices.iter().map(|d| d.id).max().unwrap_or(0) + 1;
            let device = Device {
                id,
                display_name: display_name.into(),
                description: description.into(),
                auth_key: generate_auth_key()?,
                created_at: Utc::now(),
                endpoints,
            };
            devices.push(device.clone());
            device
        };
        self.save().await?;
        Ok(device)
    }

    /// Remove a device. Returns whether it existed.
    pub async fn remove(&self, device_id: DeviceId) -> Result<bool> {
        self.refresh().await;
        let removed = {
            let mut devices = self.devices.write().await;
            let before = devices.len();
            devices.retain(|d| d.id != device_id);
            devices.len() != before
        };
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Issue a new auth key; the old one stops authenticating. Returns the new key.
    pub async fn rotate_key(&self, device_id: DeviceId) -> Result<Option<String>> {
        self.refresh().await;
        let key = {
            let mut devices = self.devices.write().await;
            match devices.iter_mut().find(|d| d.id == device_id) {
                Some(d) => {
                    d.auth_key = generate_auth_key()?;
                    Some(d.auth_key.clone())
                }
                None => None,
            }
        };
        if key.is_some() {
            self.save().await?;
        }
        Ok(key)
    }
}

async fn read_file(path: &Path) -> (Vec<Device>, Option<FileStamp>) {
    let modified = tokio::fs::metadata(path).await.and_then(|m| m.modified()).ok();
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(_) => return (Vec::new(), None),
    };
    let devices = serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        log::warn!("device directory {} is invalid, starting empty: {}", path.display(), e);
        Vec::new()
    });
    let stamp = modified.map(|modified| FileStamp {
        modified,
        len: bytes.len() as u64,
        digest: digest(&bytes),
    });
    (devices, stamp)
}

#[async_trait]
impl DeviceDirectory for DeviceStore {
    async fn get_by_id(&self, device_id: DeviceId) -> Option<Device> {
        self.refresh().await;
        let devices = self.devices.read().await;
        devices.iter().find(|d| d.id == device_id).cloned()
    }

    async fn get_by_key(&self, auth_key: &str) -> Option<Device> {
        if auth_key.is_empty() {
            return None;
        }
        self.refresh().await;
        let devices = self.devices.read().await;
        devices.iter().find(|d| d.auth_key == auth_key).cloned()
    }
}
