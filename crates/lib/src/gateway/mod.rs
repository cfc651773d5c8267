//! Gateway: reverse-tunnel invocation over device-initiated WebSockets.
//!
//! Devices dial `/tunnel` and stay connected; the control plane calls `TunnelService::invoke`
//! (or the REST routes on the same port) and gets the device's reply back synchronously.

mod correlator;
mod engine;
mod error;
mod protocol;
mod registry;
mod server;
mod service;
mod session;
#[cfg(test)]
mod test_support;

pub use correlator::{AwaitError, Correlator, InvocationReply, WaitSlot};
pub use error::TunnelError;
pub use protocol::{now_ms, DeviceId, Frame, RequestId, PROTOCOL_VERSION, STATUS_OK};
pub use registry::TunnelRegistry;
pub use server::{run_gateway, serve_gateway};
pub use service::{InvokeResponse, TunnelService};
pub use session::{CloseReason, Session, SessionState};
