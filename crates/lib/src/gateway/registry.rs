//! Tunnel registry: device id -> the single live session for that device.
//!
//! The table is split into shards so that connects, disconnects and revocations for
//! different devices do not contend on one lock. Locks are never held across I/O.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error::TunnelError;
use super::protocol::DeviceId;
use super::session::{CloseReason, Session};

const SHARDS: usize = 16;

type Shard = RwLock<HashMap<DeviceId, Arc<Session>>>;

pub struct TunnelRegistry {
    shards: Vec<Shard>,
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, device_id: DeviceId) -> &Shard {
        &self.shards[device_id.rem_euclid(SHARDS as i64) as usize]
    }

    /// Install `session` for its device. Last connect wins: an existing session is closed
    /// (reason `replaced`) and returned. A session that is no longer Connected is rejected.
    pub async fn register(&self, session: Arc<Session>) -> Result<Option<Arc<Session>>, TunnelError> {
        let device_id = session.device_id();
        let mut shard = self.shard(device_id).write().await;
        if !session.is_connected() {
            return Err(TunnelError::Connection);
        }
        if let Some(old) = shard.get(&device_id) {
            if Arc::ptr_eq(old, &session) {
                return Ok(None);
            }
            old.close(CloseReason::Replaced);
        }
        Ok(shard.insert(device_id, session))
    }

    /// The device's session, if one is Connected.
    pub async fn lookup(&self, device_id: DeviceId) -> Option<Arc<Session>> {
        let shard = self.shard(device_id).read().await;
        shard.get(&device_id).filter(|s| s.is_connected()).cloned()
    }

    /// Remove the mapping only if it still points at `session`; a stale teardown must not
    /// evict a newer connection.
    pub async fn unregister(&self, device_id: DeviceId, session: &Arc<Session>) -> bool {
        let mut shard = self.shard(device_id).write().await;
        match shard.get(&device_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                shard.remove(&device_id);
                true
            }
            _ => false,
        }
    }

    /// Forcibly close the device's session. Returns whether there was one.
    pub async fn revoke(&self, device_id: DeviceId) -> bool {
        let removed = self.shard(device_id).write().await.remove(&device_id);
        match removed {
            Some(session) => {
                session.close(CloseReason::Revoked);
                true
            }
            None => false,
        }
    }

    /// Close and remove every session; returns them so the caller can wait for teardown.
    pub async fn drain_all(&self) -> Vec<Arc<Session>> {
        let mut drained = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.write().await;
            drained.extend(shard.drain().map(|(_, s)| s));
        }
        for session in &drained {
            session.close(CloseReason::Shutdown);
        }
        drained
    }

    /// Snapshot of registered sessions, ordered by device id.
    pub async fn connected(&self) -> Vec<Arc<Session>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read().await.values().cloned());
        }
        out.sort_by_key(|s| s.device_id());
        out
    }

    pub async fn len(&self) -> usize {
        let mut n = 0;
        for shard in &self.shards {
            n += shard.read().await.len();
        }
        n
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
