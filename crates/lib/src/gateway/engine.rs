//! Session protocol engine: drives one tunnel's read loop, its writer task and teardown.
//!
//! Reads are processed in arrival order on the session task. Writes go through the
//! session's outbound queue to a single writer task, so concurrent invocations never
//! interleave on the transport.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::correlator::InvocationReply;
use super::error::TunnelError;
use super::protocol::Frame;
use super::registry::TunnelRegistry;
use super::session::{CloseReason, Session};

/// How long teardown waits for the writer to flush the final `close` frame.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub(crate) struct EngineOptions {
    /// Close the session when nothing arrives for this long.
    pub heartbeat_timeout: Duration,
    /// How long a draining session keeps reading replies for its in-flight invocations.
    pub drain_grace: Duration,
}

/// Run a registered session until it is closed, then tear it down.
pub(crate) async fn run<S, K>(
    session: Arc<Session>,
    registry: Arc<TunnelRegistry>,
    inbound: S,
    outbound: K,
    outbound_rx: mpsc::Receiver<Frame>,
    options: EngineOptions,
) where
    S: Stream<Item = Result<String, String>> + Send + 'static,
    K: Sink<String> + Send + 'static,
    K::Error: Display,
{
    let device_id = session.device_id();
    let mut writer = tokio::spawn(write_frames(Arc::clone(&session), outbound_rx, outbound));
    let mut inbound = Box::pin(inbound);
    let mut state_rx = session.subscribe();

    while session.is_connected() {
        tokio::select! {
            biased;

            _ = state_rx.changed() => {}
            next = tokio::time::timeout(options.heartbeat_timeout, inbound.next()) => {
                match next {
                    Err(_) => {
                        log::info!("device {} missed heartbeats", device_id);
                        session.close(CloseReason::HeartbeatTimeout);
                    }
                    Ok(None) => {
                        session.close(CloseReason::Disconnected);
                    }
                    Ok(Some(Err(e))) => {
                        log::debug!("device {} transport read failed: {}", device_id, e);
                        session.close(CloseReason::TransportError);
                    }
                    Ok(Some(Ok(text))) => {
                        let _ = on_text(&session, &text);
                    }
                }
            }
        }
    }

    let reason = session
        .state()
        .close_reason()
        .unwrap_or(CloseReason::Disconnected);

    // Let legitimate late answers resolve their callers before everything is failed.
    if reason.allows_drain() && session.correlator().pending() > 0 {
        let deadline = Instant::now() + options.drain_grace;
        while session.correlator().pending() > 0 {
            match tokio::time::timeout_at(deadline, inbound.next()).await {
                Ok(Some(Ok(text))) => {
                    if on_text(&session, &text).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    let failed = session.correlator().resolve_all_failed();
    if failed > 0 {
        log::info!(
            "device {}: {} pending invocation(s) failed on close ({})",
            device_id,
            failed,
            reason
        );
    }
    registry.unregister(device_id, &session).await;
    session.push(Frame::Close {
        reason: reason.to_string(),
    });
    session.mark_closed();

    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    log::info!("device {} session closed ({})", device_id, reason);
}

/// Decode one inbound text frame and dispatch it.
fn on_text(session: &Session, text: &str) -> Result<(), TunnelError> {
    match Frame::decode(text) {
        Ok(frame) => on_frame(session, frame),
        Err(e) => {
            log::warn!("device {}: {}", session.device_id(), e);
            session.close(CloseReason::ProtocolError);
            Err(e)
        }
    }
}

pub(crate) fn on_frame(session: &Session, frame: Frame) -> Result<(), TunnelError> {
    match frame {
        Frame::Reply {
            request_id,
            payload,
            status,
        } => {
            session.correlator().resolve(InvocationReply {
                request_id,
                payload,
                status,
            });
            Ok(())
        }
        Frame::Ping { ts } => {
            if !session.push(Frame::Pong { ts }) {
                log::debug!("device {}: outbound queue full, pong dropped", session.device_id());
            }
            Ok(())
        }
        Frame::Pong { .. } => Ok(()),
        other => {
            let e = TunnelError::Protocol(format!("unexpected {} frame from device", other.kind()));
            log::warn!("device {}: {}", session.device_id(), e);
            session.close(CloseReason::ProtocolError);
            Err(e)
        }
    }
}

/// Single writer for the session's transport. Stops after the final `close` frame or on
/// the first write error.
async fn write_frames<K>(session: Arc<Session>, mut rx: mpsc::Receiver<Frame>, sink: K)
where
    K: Sink<String>,
    K::Error: Display,
{
    let mut sink = Box::pin(sink);
    while let Some(frame) = rx.recv().await {
        let last = matches!(frame, Frame::Close { .. });
        if let Err(e) = sink.send(frame.encode()).await {
            log::debug!("device {} transport write failed: {}", session.device_id(), e);
            session.close(CloseReason::TransportError);
            return;
        }
        if last {
            let _ = sink.close().await;
            return;
        }
    }
}
