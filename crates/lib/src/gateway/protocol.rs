//! Tunnel wire protocol: JSON text frames tagged by `type`.
//!
//! Device dials in and sends `connect` first; the gateway answers `hello-ok` (or `error`
//! and hangs up). After that the gateway pushes `invoke` frames and the device answers
//! each with a `reply` carrying the same `requestId`. Either side may `ping`.

use serde::{Deserialize, Serialize};

use super::error::TunnelError;

pub const PROTOCOL_VERSION: u32 = 1;

/// Status a device reports when the invocation succeeded.
pub const STATUS_OK: u16 = 200;

/// Stable device identifier, owned by the device directory.
pub type DeviceId = i64;

/// Correlation id of one invocation, unique among the pending invocations of a session.
pub type RequestId = u64;

fn default_status() -> u16 {
    STATUS_OK
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// First frame from the device. `deviceId` is optional; when present it must match the key.
    #[serde(rename_all = "camelCase")]
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<DeviceId>,
        auth_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    HelloOk {
        protocol: u32,
        device_id: DeviceId,
        tick_interval_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Invoke {
        request_id: RequestId,
        device_id: DeviceId,
        pattern: String,
        payload: String,
    },
    #[serde(rename_all = "camelCase")]
    Reply {
        request_id: RequestId,
        payload: String,
        #[serde(default = "default_status")]
        status: u16,
    },
    Ping {
        #[serde(default)]
        ts: u64,
    },
    Pong {
        #[serde(default)]
        ts: u64,
    },
    /// Gateway is tearing the tunnel down (revoked, replaced, shutdown, ...).
    Close { reason: String },
    /// Handshake rejected.
    Error { message: String },
}

impl Frame {
    pub fn decode(text: &str) -> Result<Self, TunnelError> {
        serde_json::from_str(text).map_err(|e| TunnelError::Protocol(format!("malformed frame: {}", e)))
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Wire name of the frame, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Connect { .. } => "connect",
            Frame::HelloOk { .. } => "hello-ok",
            Frame::Invoke { .. } => "invoke",
            Frame::Reply { .. } => "reply",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Close { .. } => "close",
            Frame::Error { .. } => "error",
        }
    }
}

/// Unix time in ms, used for ping timestamps.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
