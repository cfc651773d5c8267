//! Device side of the tunnel: dial the gateway, authenticate, answer invocations.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;

use crate::gateway::{now_ms, DeviceId, Frame, PROTOCOL_VERSION, STATUS_OK};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE: usize = 64;

/// What an endpoint answers to one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerReply {
    pub payload: String,
    pub status: u16,
}

impl HandlerReply {
    pub fn ok(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            status: STATUS_OK,
        }
    }

    pub fn with_status(payload: impl Into<String>, status: u16) -> Self {
        Self {
            payload: payload.into(),
            status,
        }
    }
}

/// Implements the endpoints a device exposes. Each invocation runs on its own task.
#[async_trait]
pub trait EndpointHandler: Send + Sync {
    async fn handle(&self, pattern: &str, payload: &str) -> HandlerReply;
}

/// `/ping` answers `{"pong":true}`; every other pattern echoes its payload.
pub struct EchoHandler;

#[async_trait]
impl EndpointHandler for EchoHandler {
    async fn handle(&self, pattern: &str, payload: &str) -> HandlerReply {
        if pattern == "/ping" {
            HandlerReply::ok(r#"{"pong":true}"#)
        } else {
            HandlerReply::ok(payload)
        }
    }
}

/// Dials `ws://host:port/tunnel` with a device auth key.
#[derive(Debug, Clone)]
pub struct DeviceClient {
    url: String,
    auth_key: String,
    device_id: Option<DeviceId>,
}

impl DeviceClient {
    pub fn new(url: impl Into<String>, auth_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_key: auth_key.into(),
            device_id: None,
        }
    }

    /// Also claim a device id; the gateway rejects the key if it belongs to another device.
    pub fn with_device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    /// Open the tunnel and complete the handshake. Invocations are served in the
    /// background until the gateway closes the tunnel or `disconnect` is called.
    pub async fn connect(&self, handler: Arc<dyn EndpointHandler>) -> Result<DeviceConnection> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("connecting to {}", self.url))?;
        let (mut sink, mut stream) = ws.split();

        let connect = Frame::Connect {
            device_id: self.device_id,
            auth_key: self.auth_key.clone(),
            client: Some(format!("wyrm/{}", env!("CARGO_PKG_VERSION"))),
        };
        sink.send(Message::Text(connect.encode()))
            .await
            .context("sending connect frame")?;

        let handshake = async {
            loop {
                let msg = stream
                    .next()
                    .await
                    .ok_or_else(|| anyhow::anyhow!("gateway closed the connection during handshake"))?
                    .context("reading handshake reply")?;
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => anyhow::bail!("gateway closed the connection during handshake"),
                    _ => continue,
                };
                match Frame::decode(&text)? {
                    Frame::HelloOk {
                        protocol,
                        device_id,
                        tick_interval_ms,
                    } => {
                        if protocol != PROTOCOL_VERSION {
                            anyhow::bail!("gateway speaks protocol {}, expected {}", protocol, PROTOCOL_VERSION);
                        }
                        return Ok::<_, anyhow::Error>((device_id, tick_interval_ms));
                    }
                    Frame::Error { message } => anyhow::bail!("gateway rejected connection: {}", message),
                    other => anyhow::bail!("unexpected {} frame during handshake", other.kind()),
                }
            }
        };
        let (device_id, tick_interval_ms) = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
            .await
            .map_err(|_| anyhow::anyhow!("no handshake reply within {:?}", HANDSHAKE_TIMEOUT))??;
        log::info!("tunnel up as device {} ({})", device_id, self.url);

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame.encode())).await {
                    log::debug!("tunnel write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(None::<String>);
        let tick = Duration::from_millis(tick_interval_ms.max(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.tick().await;
            let mut handlers = JoinSet::new();

            let reason = loop {
                tokio::select! {
                    _ = stop_rx.changed() => break "disconnected".to_string(),
                    _ = ticker.tick() => {
                        if out_tx.send(Frame::Ping { ts: now_ms() }).await.is_err() {
                            break "writer stopped".to_string();
                        }
                    }
                    Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
                    msg = stream.next() => match msg {
                        None => break "connection closed".to_string(),
                        Some(Err(e)) => break format!("transport error: {}", e),
                        Some(Ok(Message::Close(_))) => break "connection closed".to_string(),
                        Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                            Ok(Frame::Invoke { request_id, pattern, payload, .. }) => {
                                let handler = Arc::clone(&handler);
                                let out = out_tx.clone();
                                handlers.spawn(async move {
                                    let reply = handler.handle(&pattern, &payload).await;
                                    let _ = out
                                        .send(Frame::Reply {
                                            request_id,
                                            payload: reply.payload,
                                            status: reply.status,
                                        })
                                        .await;
                                });
                            }
                            Ok(Frame::Ping { ts }) => {
                                let _ = out_tx.send(Frame::Pong { ts }).await;
                            }
                            Ok(Frame::Pong { .. }) => {}
                            Ok(Frame::Close { reason }) => break reason,
                            Ok(other) => log::debug!("ignoring {} frame from gateway", other.kind()),
                            Err(e) => log::warn!("bad frame from gateway: {}", e),
                        },
                        Some(Ok(_)) => {}
                    },
                }
            };

            handlers.abort_all();
            drop(out_tx);
            let _ = writer.await;
            log::info!("tunnel for device {} closed: {}", device_id, reason);
            let _ = closed_tx.send(Some(reason));
        });

        Ok(DeviceConnection {
            device_id,
            stop: stop_tx,
            closed: closed_rx,
            task,
        })
    }
}

/// A live tunnel from this device to the gateway.
pub struct DeviceConnection {
    device_id: DeviceId,
    stop: watch::Sender<bool>,
    closed: watch::Receiver<Option<String>>,
    task: JoinHandle<()>,
}

impl DeviceConnection {
    /// Id the gateway assigned in hello-ok.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Wait until the tunnel is gone; returns why (e.g. "revoked", "replaced", "connection closed").
    pub async fn closed(&self) -> String {
        let mut rx = self.closed.clone();
        let reason = match rx.wait_for(|r| r.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection task ended".to_string(),
        };
        reason
    }

    /// Hang up and wait for the background tasks to finish.
    pub async fn disconnect(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}
