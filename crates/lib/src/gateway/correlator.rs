//! Per-session correlation of outbound invocations with inbound replies.
//!
//! Each invocation gets a wait-slot (a oneshot) registered *before* its frame is sent.
//! The slot is removed by exactly one of: the matching reply, the caller giving up
//! (timeout or drop), or session teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::protocol::RequestId;

/// Reply delivered by the device for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReply {
    pub request_id: RequestId,
    pub payload: String,
    pub status: u16,
}

/// Why a wait-slot resolved without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitError {
    TimedOut,
    ConnectionLost,
}

#[derive(Default)]
struct Slots {
    /// Set once by `resolve_all_failed`; no slot can be registered afterwards.
    closed: bool,
    waiting: HashMap<RequestId, oneshot::Sender<InvocationReply>>,
}

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Correlator {
    next_id: AtomicU64,
    slots: Arc<Mutex<Slots>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    /// Allocate a request id and its wait-slot. Returns None once the session has been torn down.
    pub fn register(&self) -> Option<WaitSlot> {
        let (tx, rx) = oneshot::channel();
        let mut slots = lock(&self.slots);
        if slots.closed {
            return None;
        }
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        slots.waiting.insert(request_id, tx);
        Some(WaitSlot {
            request_id,
            rx,
            slots: Arc::clone(&self.slots),
        })
    }

    /// Hand a reply to its waiting caller. Late, duplicate or forged ids are dropped.
    pub fn resolve(&self, reply: InvocationReply) -> bool {
        let request_id = reply.request_id;
        let sender = lock(&self.slots).waiting.remove(&request_id);
        match sender {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    log::debug!("caller for request {} went away before its reply", request_id);
                    return false;
                }
                true
            }
            None => {
                log::debug!("discarding reply for unknown or expired request {}", request_id);
                false
            }
        }
    }

    /// Fail every pending slot with `ConnectionLost` and refuse new ones. Returns how many failed.
    pub fn resolve_all_failed(&self) -> usize {
        let drained: Vec<_> = {
            let mut slots = lock(&self.slots);
            slots.closed = true;
            slots.waiting.drain().collect()
        };
        // Dropping the senders wakes each receiver with RecvError.
        drained.len()
    }

    pub fn pending(&self) -> usize {
        lock(&self.slots).waiting.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.slots).closed
    }
}

/// Caller side of one pending invocation. Dropping it deregisters the slot.
pub struct WaitSlot {
    request_id: RequestId,
    rx: oneshot::Receiver<InvocationReply>,
    slots: Arc<Mutex<Slots>>,
}

impl WaitSlot {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Suspend until the reply arrives, the deadline passes, or the session dies.
    pub async fn wait(mut self, deadline: Instant) -> Result<InvocationReply, AwaitError> {
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(AwaitError::ConnectionLost),
            Err(_) => Err(AwaitError::TimedOut),
        }
    }
}

impl Drop for WaitSlot {
    fn drop(&mut self) {
        lock(&self.slots).waiting.remove(&self.request_id);
    }
}
