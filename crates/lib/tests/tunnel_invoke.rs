//! Integration tests: real gateway, real device client over WebSocket, invocations through
//! the REST control API.

mod common;

use async_trait::async_trait;
use common::{device, start_gateway, start_gateway_with_directory, wait_connected};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wyrm::client::{DeviceClient, EchoHandler, EndpointHandler, HandlerReply};
use wyrm::config::Config;
use wyrm::control::ControlClient;
use wyrm::directory::DeviceStore;
use wyrm::gateway::TunnelError;

/// Sleeps before answering `/slow`; `/missing` answers 404; everything else echoes.
struct ScriptedHandler {
    delay: Duration,
}

#[async_trait]
impl EndpointHandler for ScriptedHandler {
    async fn handle(&self, pattern: &str, payload: &str) -> HandlerReply {
        match pattern {
            "/slow" => {
                tokio::time::sleep(self.delay).await;
                HandlerReply::ok("late")
            }
            "/missing" => HandlerReply::with_status("no such endpoint", 404),
            _ => HandlerReply::ok(payload),
        }
    }
}

#[tokio::test]
async fn ping_round_trip_through_rest() {
    let gw = start_gateway(Config::default(), vec![device(1, "key-1")]).await;
    let conn = DeviceClient::new(gw.tunnel_url(), "key-1")
        .connect(Arc::new(EchoHandler))
        .await
        .expect("device connects");
    assert_eq!(conn.device_id(), 1);
    wait_connected(&gw.tunnels, 1).await;

    let control = ControlClient::new(Some(gw.http_url()), None);
    let res = control.invoke(1, "/ping", "").await.expect("invoke /ping");
    assert_eq!(res.data, r#"{"pong":true}"#);
    assert_eq!(res.status, 200);

    let sessions = control.sessions().await.expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["deviceId"], 1);
    assert_eq!(sessions[0]["state"], "connected");

    conn.disconnect().await;
    gw.stop().await.expect("clean shutdown");
}

#[tokio::test]
async fn direct_service_invoke_echoes_payload() {
    let gw = start_gateway(Config::default(), vec![device(2, "key-2")]).await;
    let conn = DeviceClient::new(gw.tunnel_url(), "key-2")
        .with_device_id(2)
        .connect(Arc::new(EchoHandler))
        .await
        .expect("device connects");
    wait_connected(&gw.tunnels, 2).await;

    let res = gw
        .tunnels
        .invoke_device(2, "/lights", r#"{"on":true}"#)
        .await
        .expect("invoke");
    assert_eq!(res.data, r#"{"on":true}"#);

    conn.disconnect().await;
    gw.stop().await.expect("clean shutdown");
}

#[tokio::test]
async fn device_status_is_passed_through() {
    let gw = start_gateway(Config::default(), vec![device(1, "key-1")]).await;
    let conn = DeviceClient::new(gw.tunnel_url(), "key-1")
        .connect(Arc::new(ScriptedHandler {
            delay: Duration::ZERO,
        }))
        .await
        .expect("device connects");
    wait_connected(&gw.tunnels, 1).await;

    let control = ControlClient::new(Some(gw.http_url()), None);
    let res = control.invoke(1, "missing", "").await.expect("invoke");
    assert_eq!(res.status, 404);
    assert_eq!(res.data, "no such endpoint");

    conn.disconnect().await;
    gw.stop().await.expect("clean shutdown");
}

#[tokio::test]
async fn unconnected_device_fails_immediately() {
    let gw = start_gateway(Config::default(), vec![device(1, "key-1")]).await;
    let control = ControlClient::new(Some(gw.http_url()), None);

    let started = Instant::now();
    let err = control.invoke(1, "/ping", "").await.unwrap_err();
    assert_eq!(err.code(), Some("CONNECTION_ERROR"));
    assert!(started.elapsed() < Duration::from_secs(1));

    let err = control.invoke(77, "/ping", "").await.unwrap_err();
    assert_eq!(err.code(), Some("DEVICE_NOT_FOUND"));

    gw.stop().await.expect("clean shutdown");
}

#[tokio::test]
async fn slow_device_times_out_and_session_survives() {
    let mut config = Config::default();
    config.tunnel.invoke_timeout_ms = 200;
    let gw = start_gateway(config, vec![device(1, "key-1")]).await;
    let conn = DeviceClient::new(gw.tunnel_url(), "key-1")
        .connect(Arc::new(ScriptedHandler {
            delay: Duration::from_secs(2),
        }))
        .await
        .expect("device connects");
    wait_connected(&gw.tunnels, 1).await;

    let control = ControlClient::new(Some(gw.http_url()), None);
    let started = Instant::now();
    let err = control.invoke(1, "/slow", "").await.unwrap_err();
    assert_eq!(err.code(), Some("CONNECTION_ERROR"));
    assert!(started.elapsed() < Duration::from_millis(1500));

    // The late reply is discarded and the tunnel keeps serving.
    let res = control.invoke(1, "/echo", "still here").await.expect("invoke after timeout");
    assert_eq!(res.data, "still here");
    let session = gw.tunnels.registry().lookup(1).await.expect("still connected");
    assert!(session.is_connected());

    conn.disconnect().await;
    gw.stop().await.expect("clean shutdown");
}

#[tokio::test]
async fn concurrent_invocations_get_their_own_replies() {
    let gw = start_gateway(Config::default(), vec![device(1, "key-1")]).await;
    let conn = DeviceClient::new(gw.tunnel_url(), "key-1")
        .connect(Arc::new(EchoHandler))
        .await
        .expect("device connects");
    wait_connected(&gw.tunnels, 1).await;

    let calls = (0..20).map(|i| {
        let tunnels = Arc::clone(&gw.tunnels);
        async move {
            let payload = format!("payload-{}", i);
            let res = tunnels.invoke_device(1, "/echo", &payload).await;
            (payload, res)
        }
    });
    for (payload, res) in futures_util::future::join_all(calls).await {
        assert_eq!(res.expect("invoke").data, payload);
    }
    assert_eq!(
        gw.tunnels.registry().lookup(1).await.unwrap().correlator().pending(),
        0
    );

    conn.disconnect().await;
    gw.stop().await.expect("clean shutdown");
}

#[tokio::test]
async fn revoke_closes_tunnel_and_fails_later_invokes() {
    let gw = start_gateway(Config::default(), vec![device(1, "key-1")]).await;
    let conn = DeviceClient::new(gw.tunnel_url(), "key-1")
        .connect(Arc::new(EchoHandler))
        .await
        .expect("device connects");
    wait_connected(&gw.tunnels, 1).await;

    let control = ControlClient::new(Some(gw.http_url()), None);
    control.revoke(1).await.expect("revoke");
    let reason = tokio::time::timeout(Duration::from_secs(5), conn.closed())
        .await
        .expect("tunnel closes after revoke");
    assert_eq!(reason, "revoked");

    let err = control.invoke(1, "/ping", "").await.unwrap_err();
    assert_eq!(err.code(), Some("CONNECTION_ERROR"));
    // Revoking again is fine.
    control.revoke(1).await.expect("second revoke");

    gw.stop().await.expect("clean shutdown");
}

#[tokio::test]
async fn reconnect_replaces_previous_tunnel() {
    let gw = start_gateway(Config::default(), vec![device(1, "key-1")]).await;
    let first = DeviceClient::new(gw.tunnel_url(), "key-1")
        .connect(Arc::new(EchoHandler))
        .await
        .expect("first connect");
    wait_connected(&gw.tunnels, 1).await;
    let first_session = gw.tunnels.registry().lookup(1).await.unwrap();

    let second = DeviceClient::new(gw.tunnel_url(), "key-1")
        .connect(Arc::new(EchoHandler))
        .await
        .expect("second connect");
    let reason = tokio::time::timeout(Duration::from_secs(5), first.closed())
        .await
        .expect("first tunnel closes");
    assert_eq!(reason, "replaced");

    wait_connected(&gw.tunnels, 1).await;
    let current = gw.tunnels.registry().lookup(1).await.unwrap();
    assert!(!Arc::ptr_eq(&current, &first_session));
    assert_eq!(gw.tunnels.registry().len().await, 1);

    let res = gw.tunnels.invoke_device(1, "/ping", "").await.expect("invoke");
    assert_eq!(res.data, r#"{"pong":true}"#);

    second.disconnect().await;
    gw.stop().await.expect("clean shutdown");
}

#[tokio::test]
async fn bad_credentials_are_rejected() {
    let gw = start_gateway(Config::default(), vec![device(1, "key-1"), device(2, "key-2")]).await;

    let err = DeviceClient::new(gw.tunnel_url(), "wrong")
        .connect(Arc::new(EchoHandler))
        .await
        .err()
        .expect("unknown key rejected");
    assert!(err.to_string().contains("rejected"), "{}", err);

    let err = DeviceClient::new(gw.tunnel_url(), "key-1")
        .with_device_id(2)
        .connect(Arc::new(EchoHandler))
        .await
        .err()
        .expect("key for another device rejected");
    assert!(err.to_string().contains("rejected"), "{}", err);

    assert!(gw.tunnels.registry().is_empty().await);
    gw.stop().await.expect("clean shutdown");
}

#[tokio::test]
async fn disconnect_unregisters_session() {
    let gw = start_gateway(Config::default(), vec![device(1, "key-1")]).await;
    let conn = DeviceClient::new(gw.tunnel_url(), "key-1")
        .connect(Arc::new(EchoHandler))
        .await
        .expect("device connects");
    wait_connected(&gw.tunnels, 1).await;
    conn.disconnect().await;

    for _ in 0..100 {
        if gw.tunnels.registry().is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gw.tunnels.registry().is_empty().await);
    gw.stop().await.expect("clean shutdown");
}

#[tokio::test]
async fn shutdown_closes_device_tunnels() {
    let gw = start_gateway(Config::default(), vec![device(1, "key-1")]).await;
    let conn = DeviceClient::new(gw.tunnel_url(), "key-1")
        .connect(Arc::new(EchoHandler))
        .await
        .expect("device connects");
    wait_connected(&gw.tunnels, 1).await;

    let tunnels = Arc::clone(&gw.tunnels);
    gw.stop().await.expect("clean shutdown");
    let reason = tokio::time::timeout(Duration::from_secs(5), conn.closed())
        .await
        .expect("tunnel closes on shutdown");
    assert_eq!(reason, "shutdown");
    assert!(tunnels.registry().is_empty().await);
}

#[tokio::test]
async fn device_dialing_in_during_shutdown_is_turned_away() {
    let mut config = Config::default();
    config.tunnel.drain_grace_ms = 1500;
    let gw = start_gateway(config, vec![device(1, "key-1"), device(2, "key-2")]).await;
    let _busy = DeviceClient::new(gw.tunnel_url(), "key-1")
        .connect(Arc::new(ScriptedHandler {
            delay: Duration::from_secs(3),
        }))
        .await
        .expect("device connects");
    wait_connected(&gw.tunnels, 1).await;

    let tunnels = Arc::clone(&gw.tunnels);
    let pending = tokio::spawn(async move { tunnels.invoke_device(1, "/slow", "").await });
    let session = gw.tunnels.registry().lookup(1).await.unwrap();
    while session.correlator().pending() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let tunnels = Arc::clone(&gw.tunnels);
    let url = gw.tunnel_url();
    let stopping = tokio::spawn(gw.stop());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(tunnels.is_shutting_down());

    let err = DeviceClient::new(url, "key-2")
        .connect(Arc::new(EchoHandler))
        .await
        .err()
        .expect("late device refused");
    let message = format!("{:#}", err);
    assert!(message.contains("shutting down"), "{}", message);

    stopping
        .await
        .expect("stop task")
        .expect("clean shutdown");
    assert_eq!(pending.await.unwrap(), Err(TunnelError::Connection));
    assert!(tunnels.registry().is_empty().await);
}

#[tokio::test]
async fn rotated_key_takes_effect_and_live_tunnel_is_revoked() {
    let path = std::env::temp_dir()
        .join(format!(
            "wyrm-rotate-test-{}",
            wyrm::directory::generate_auth_key().unwrap()
        ))
        .join("devices.json");
    let editor = DeviceStore::load(&path).await;
    let dev = editor.add("camera", "", Vec::new()).await.unwrap();
    let gw = start_gateway_with_directory(
        Config::default(),
        Arc::new(DeviceStore::load(&path).await),
    )
    .await;

    let live = DeviceClient::new(gw.tunnel_url(), dev.auth_key.clone())
        .connect(Arc::new(EchoHandler))
        .await
        .expect("device connects");
    wait_connected(&gw.tunnels, dev.id).await;

    let new_key = editor.rotate_key(dev.id).await.unwrap().unwrap();
    assert!(DeviceClient::new(gw.tunnel_url(), dev.auth_key.clone())
        .connect(Arc::new(EchoHandler))
        .await
        .is_err());

    let control = ControlClient::new(Some(gw.http_url()), None);
    assert!(control.revoke_if_running(dev.id).await.expect("revoke"));
    let reason = tokio::time::timeout(Duration::from_secs(5), live.closed())
        .await
        .expect("old tunnel closes");
    assert_eq!(reason, "revoked");

    let fresh = DeviceClient::new(gw.tunnel_url(), new_key)
        .connect(Arc::new(EchoHandler))
        .await
        .expect("new key connects");
    assert_eq!(fresh.device_id(), dev.id);

    fresh.disconnect().await;
    gw.stop().await.expect("clean shutdown");
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}
