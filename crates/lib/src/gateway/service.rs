//! Tunnel service: the entry point for invoking device endpoints and admitting devices.

use futures_util::{Sink, Stream};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::correlator::AwaitError;
use super::engine::{self, EngineOptions};
use super::error::TunnelError;
use super::protocol::{DeviceId, Frame, PROTOCOL_VERSION};
use super::registry::TunnelRegistry;
use super::session::{CloseReason, Session};
use crate::config::TunnelConfig;
use crate::directory::{Device, DeviceDirectory};

/// What the device answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeResponse {
    pub data: String,
    pub status: u16,
}

pub struct TunnelService {
    registry: Arc<TunnelRegistry>,
    directory: Arc<dyn DeviceDirectory>,
    options: TunnelConfig,
    shutting_down: AtomicBool,
}

/// Deadline `timeout` from now; durations too large for the clock mean "effectively never".
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

impl TunnelService {
    pub fn new(directory: Arc<dyn DeviceDirectory>, options: TunnelConfig) -> Self {
        Self {
            registry: Arc::new(TunnelRegistry::new()),
            directory,
            options,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<dyn DeviceDirectory> {
        &self.directory
    }

    pub fn options(&self) -> &TunnelConfig {
        &self.options
    }

    /// True once `shutdown` has started; new tunnels are refused from then on.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Invoke `pattern` on the device with the configured default timeout.
    pub async fn invoke_device(
        &self,
        device_id: DeviceId,
        pattern: &str,
        data: &str,
    ) -> Result<InvokeResponse, TunnelError> {
        self.invoke(device_id, pattern, data, self.options.invoke_timeout())
            .await
    }

    /// Send one invocation over the device's tunnel and wait for its reply. Fails at once
    /// when the device is not connected; otherwise waits at most `timeout`.
    pub async fn invoke(
        &self,
        device_id: DeviceId,
        pattern: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<InvokeResponse, TunnelError> {
        let deadline = deadline_after(timeout);
        let session = self.registry.lookup(device_id).await.ok_or_else(|| {
            log::debug!("invoke {} on device {}: not connected", pattern, device_id);
            TunnelError::Connection
        })?;
        let slot = session
            .correlator()
            .register()
            .ok_or(TunnelError::Connection)?;
        let request_id = slot.request_id();

        let frame = Frame::Invoke {
            request_id,
            device_id,
            pattern: pattern.to_string(),
            payload: payload.to_string(),
        };
        session.send(frame, deadline).await?;

        match slot.wait(deadline).await {
            Ok(reply) => Ok(InvokeResponse {
                data: reply.payload,
                status: reply.status,
            }),
            Err(AwaitError::TimedOut) => {
                log::debug!(
                    "invoke {} on device {} (request {}) timed out",
                    pattern,
                    device_id,
                    request_id
                );
                Err(TunnelError::Connection)
            }
            Err(AwaitError::ConnectionLost) => {
                log::debug!(
                    "invoke {} on device {} (request {}): session closed",
                    pattern,
                    device_id,
                    request_id
                );
                Err(TunnelError::Connection)
            }
        }
    }

    /// Drop the device's tunnel, failing its pending invocations. Succeeds whether or not
    /// the device was connected.
    pub async fn revoke_device(&self, device_id: DeviceId) -> Result<(), TunnelError> {
        if self.registry.revoke(device_id).await {
            log::info!("device {} revoked", device_id);
        }
        Ok(())
    }

    /// Validate a device's credential. `claimed` is the id the device says it is, if any.
    pub async fn authenticate(
        &self,
        claimed: Option<DeviceId>,
        auth_key: &str,
    ) -> Result<Device, TunnelError> {
        if auth_key.trim().is_empty() {
            return Err(TunnelError::Auth("missing auth key".to_string()));
        }
        let device = self
            .directory
            .get_by_key(auth_key)
            .await
            .ok_or_else(|| TunnelError::Auth("invalid auth key".to_string()))?;
        if let Some(claimed) = claimed {
            if claimed != device.id {
                return Err(TunnelError::Auth(format!(
                    "auth key does not belong to device {}",
                    claimed
                )));
            }
        }
        Ok(device)
    }

    /// Authenticate a dialing device and bring its tunnel up over `inbound`/`outbound`.
    pub async fn admit_connection<S, K>(
        &self,
        claimed: Option<DeviceId>,
        auth_key: &str,
        inbound: S,
        outbound: K,
    ) -> Result<Arc<Session>, TunnelError>
    where
        S: Stream<Item = Result<String, String>> + Send + 'static,
        K: Sink<String> + Send + 'static,
        K::Error: Display,
    {
        let device = self.authenticate(claimed, auth_key).await?;
        self.attach(device.id, inbound, outbound).await
    }

    /// Register a session for an already authenticated device and spawn its engine.
    pub async fn attach<S, K>(
        &self,
        device_id: DeviceId,
        inbound: S,
        outbound: K,
    ) -> Result<Arc<Session>, TunnelError>
    where
        S: Stream<Item = Result<String, String>> + Send + 'static,
        K: Sink<String> + Send + 'static,
        K::Error: Display,
    {
        if self.is_shutting_down() {
            log::debug!("device {} refused: gateway shutting down", device_id);
            return Err(TunnelError::Connection);
        }
        let (session, outbound_rx) = Session::new(device_id, self.options.outbound_queue);
        session.push(Frame::HelloOk {
            protocol: PROTOCOL_VERSION,
            device_id,
            tick_interval_ms: self.options.tick_interval_ms,
        });
        if let Some(previous) = self.registry.register(Arc::clone(&session)).await? {
            log::info!(
                "device {} reconnected, replacing session from {}",
                device_id,
                previous.created_at()
            );
        } else {
            log::info!("device {} connected", device_id);
        }

        let options = EngineOptions {
            heartbeat_timeout: self.options.heartbeat_timeout(),
            drain_grace: self.options.drain_grace(),
        };
        tokio::spawn(engine::run(
            Arc::clone(&session),
            Arc::clone(&self.registry),
            inbound,
            outbound,
            outbound_rx,
            options,
        ));
        // Registered after shutdown's drain pass: the engine tears it down like the others.
        if self.is_shutting_down() {
            session.close(CloseReason::Shutdown);
            return Err(TunnelError::Connection);
        }
        Ok(session)
    }

    /// Close every tunnel and wait (up to `timeout`) for their teardown.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let sessions = self.registry.drain_all().await;
        if sessions.is_empty() {
            return;
        }
        log::info!("draining {} device session(s)", sessions.len());
        let all_closed = futures_util::future::join_all(sessions.iter().map(|s| s.closed()));
        if tokio::time::timeout(timeout, all_closed).await.is_err() {
            log::warn!("device sessions did not finish draining within {:?}", timeout);
        }
    }
}
