//! Shared harness: a real gateway on a free loopback port with an in-memory device directory.

#![allow(dead_code)]

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use wyrm::config::Config;
use wyrm::directory::{Device, DeviceDirectory, DeviceStore};
use wyrm::gateway::{self, DeviceId, TunnelService};

pub struct TestGateway {
    pub port: u16,
    pub tunnels: Arc<TunnelService>,
    shutdown: Option<oneshot::Sender<()>>,
    pub handle: JoinHandle<anyhow::Result<()>>,
}

impl TestGateway {
    pub fn http_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn tunnel_url(&self) -> String {
        format!("ws://127.0.0.1:{}/tunnel", self.port)
    }

    /// Trigger graceful shutdown and wait for the server to exit.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("gateway did not stop within 10s")
            .expect("gateway task panicked")
    }
}

pub fn device(id: DeviceId, key: &str) -> Device {
    Device {
        id,
        display_name: format!("device-{}", id),
        description: String::new(),
        auth_key: key.to_string(),
        created_at: Utc::now(),
        endpoints: Vec::new(),
    }
}

pub async fn start_gateway(config: Config, devices: Vec<Device>) -> TestGateway {
    start_gateway_with_directory(config, Arc::new(DeviceStore::in_memory(devices))).await
}

pub async fn start_gateway_with_directory(
    mut config: Config,
    directory: Arc<dyn DeviceDirectory>,
) -> TestGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind free port");
    let port = listener.local_addr().expect("local_addr").port();
    config.gateway.port = port;
    let tunnels = Arc::new(TunnelService::new(directory, config.tunnel.clone()));
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(gateway::serve_gateway(
        listener,
        config,
        Arc::clone(&tunnels),
        async move {
            let _ = rx.await;
        },
    ));
    TestGateway {
        port,
        tunnels,
        shutdown: Some(tx),
        handle,
    }
}

/// Poll until `device_id` is registered. hello-ok is queued before registration completes.
pub async fn wait_connected(tunnels: &TunnelService, device_id: DeviceId) {
    for _ in 0..100 {
        if tunnels.registry().lookup(device_id).await.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("device {} never showed up as connected", device_id);
}
