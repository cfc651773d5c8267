//! Tunnel error taxonomy.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// No live session, send failure, timeout or session death while waiting. Callers
    /// cannot act differently on any of these, so they are not told which one it was.
    #[error("device connection error")]
    Connection,

    /// Connection-time credential rejection; never returned from invoke.
    #[error("device authentication failed: {0}")]
    Auth(String),

    /// Malformed or unexpected frame on a tunnel.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TunnelError {
    /// Stable code used in REST error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            TunnelError::Connection => "CONNECTION_ERROR",
            TunnelError::Auth(_) => "AUTH_ERROR",
            TunnelError::Protocol(_) => "PROTOCOL_ERROR",
        }
    }
}
