//! One device's live tunnel: lifecycle state, outbound queue and correlator.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::correlator::Correlator;
use super::error::TunnelError;
use super::protocol::{DeviceId, Frame};

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Revoked,
    /// A newer connection for the same device took over.
    Replaced,
    Disconnected,
    TransportError,
    ProtocolError,
    HeartbeatTimeout,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Revoked => "revoked",
            CloseReason::Replaced => "replaced",
            CloseReason::Disconnected => "disconnected",
            CloseReason::TransportError => "transport-error",
            CloseReason::ProtocolError => "protocol-error",
            CloseReason::HeartbeatTimeout => "heartbeat-timeout",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// True when the transport is still healthy, so late replies may still arrive while draining.
    pub fn allows_drain(&self) -> bool {
        matches!(
            self,
            CloseReason::Revoked | CloseReason::Replaced | CloseReason::Shutdown
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Close requested: no new invocations, in-flight replies still accepted.
    Draining(CloseReason),
    Closed(CloseReason),
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connected => "connected",
            SessionState::Draining(_) => "draining",
            SessionState::Closed(_) => "closed",
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            SessionState::Connected => None,
            SessionState::Draining(r) | SessionState::Closed(r) => Some(*r),
        }
    }
}

pub struct Session {
    device_id: DeviceId,
    created_at: DateTime<Utc>,
    state: watch::Sender<SessionState>,
    /// Drained by the session's single writer task.
    outbound: mpsc::Sender<Frame>,
    correlator: Correlator,
}

impl Session {
    /// Create a Connected session; the receiver is the session's outbound frame queue.
    pub fn new(device_id: DeviceId, queue: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::channel(queue.max(1));
        let (state, _) = watch::channel(SessionState::Connected);
        let session = Arc::new(Self {
            device_id,
            created_at: Utc::now(),
            state,
            outbound,
            correlator: Correlator::new(),
        });
        (session, outbound_rx)
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Queue a frame for the device. Only allowed while Connected; waits for queue room
    /// until `deadline`.
    pub async fn send(&self, frame: Frame, deadline: Instant) -> Result<(), TunnelError> {
        if !self.is_connected() {
            return Err(TunnelError::Connection);
        }
        match tokio::time::timeout_at(deadline, self.outbound.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.close(CloseReason::TransportError);
                Err(TunnelError::Connection)
            }
            Err(_) => Err(TunnelError::Connection),
        }
    }

    /// Queue a control frame regardless of state (hello, pong, final close). Never waits.
    pub(crate) fn push(&self, frame: Frame) -> bool {
        self.outbound.try_send(frame).is_ok()
    }

    /// Request teardown. Only the first call has an effect; returns whether it was this one.
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = self.state.send_if_modified(|state| {
            if *state == SessionState::Connected {
                *state = SessionState::Draining(reason);
                true
            } else {
                false
            }
        });
        if first {
            log::info!("device {} session draining ({})", self.device_id, reason);
        }
        first
    }

    /// Final transition, run by the engine once teardown is complete.
    pub(crate) fn mark_closed(&self) {
        self.state.send_modify(|state| {
            let reason = state.close_reason().unwrap_or(CloseReason::Disconnected);
            *state = SessionState::Closed(reason);
        });
    }

    /// Wait until teardown has finished.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| matches!(state, SessionState::Closed(_)))
            .await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device_id", &self.device_id)
            .field("created_at", &self.created_at)
            .field("state", &self.state())
            .field("pending", &self.correlator.pending())
            .finish()
    }
}
