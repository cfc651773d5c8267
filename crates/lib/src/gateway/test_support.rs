//! In-process transport pair for exercising sessions without a socket.

use futures_util::{Sink, Stream};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::Frame;

/// The device's half of a simulated tunnel.
pub(crate) struct DeviceEnd {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
}

impl DeviceEnd {
    pub async fn send(&mut self, frame: Frame) {
        self.send_raw(&frame.encode()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        let _ = self.tx.send(text.to_string()).await;
    }

    /// Next frame from the gateway, or None after 2s of silence or hangup.
    pub async fn recv(&mut self) -> Option<Frame> {
        let text = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .ok()
            .flatten()?;
        Frame::decode(&text).ok()
    }

    /// Answer invocations in a background task. `answer` returning None means stay silent.
    pub fn serve<F>(mut self, answer: F) -> JoinHandle<()>
    where
        F: Fn(&str, &str) -> Option<String> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(text) = self.rx.recv().await {
                let Ok(frame) = Frame::decode(&text) else { continue };
                if let Frame::Invoke {
                    request_id,
                    pattern,
                    payload,
                    ..
                } = frame
                {
                    if let Some(reply) = answer(&pattern, &payload) {
                        let reply = Frame::Reply {
                            request_id,
                            payload: reply,
                            status: 200,
                        };
                        let _ = self.tx.send(reply.encode()).await;
                    }
                }
            }
        })
    }
}

/// Gateway-side inbound stream, outbound sink, and the device end wired to them.
pub(crate) fn simulated_transport() -> (
    impl Stream<Item = Result<String, String>> + Send + 'static,
    impl Sink<String, Error = &'static str> + Send + 'static,
    DeviceEnd,
) {
    let (to_gateway, from_device) = mpsc::channel::<String>(64);
    let (to_device, from_gateway) = mpsc::channel::<String>(64);

    let inbound = futures_util::stream::unfold(from_device, |mut rx| async move {
        rx.recv().await.map(|text| (Ok::<_, String>(text), rx))
    });
    let outbound = futures_util::sink::unfold(to_device, |tx, text: String| async move {
        tx.send(text).await.map(|_| tx).map_err(|_| "device hung up")
    });

    let device = DeviceEnd {
        tx: to_gateway,
        rx: from_gateway,
    };
    (inbound, outbound, device)
}
