//! Gateway HTTP + WebSocket server (single port).
//!
//! `/tunnel` is where devices dial in; `/api/v1/...` is the control surface that turns
//! REST calls into invocations.

use crate::config::{self, Config};
use crate::directory::DeviceStore;
use crate::gateway::error::TunnelError;
use crate::gateway::protocol::{DeviceId, Frame, PROTOCOL_VERSION};
use crate::gateway::service::TunnelService;
use crate::init;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Upper bound on waiting for device sessions to tear down at shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct GatewayState {
    config: Arc<Config>,
    /// When Some, `/api/v1` requests must carry `Authorization: Bearer <token>`.
    required_token: Option<String>,
    tunnels: Arc<TunnelService>,
}

/// When auth mode is token and a token is configured, returns it for request validation.
fn require_control_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Run the gateway; binds to config.gateway.bind:config.gateway.port and loads the device
/// directory next to the config file. Blocks until shutdown (Ctrl+C / SIGTERM).
/// When bind is not loopback, token auth must be configured or startup fails.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or WYRM_GATEWAY_TOKEN)",
                bind
            );
        }
    }

    let devices_path = config::resolve_devices_path(&config, &config_path);
    let store = DeviceStore::load(&devices_path).await;
    log::info!(
        "loaded {} device(s) from {}",
        store.list().await.len(),
        devices_path.display()
    );
    let tunnels = Arc::new(TunnelService::new(Arc::new(store), config.tunnel.clone()));

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    serve_gateway(listener, config, tunnels, shutdown_signal()).await?;
    log::info!("gateway stopped");
    Ok(())
}

/// Serve the gateway routes on an already bound listener until `shutdown` completes,
/// then drain every device session.
pub async fn serve_gateway<F>(
    listener: TcpListener,
    config: Config,
    tunnels: Arc<TunnelService>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = GatewayState {
        required_token: require_control_token(&config),
        config: Arc::new(config),
        tunnels: Arc::clone(&tunnels),
    };
    let app = Router::new()
        .route("/", get(health_http))
        .route("/tunnel", get(tunnel_ws))
        .route("/api/v1/devices", get(list_sessions))
        .route("/api/v1/devices/:device_id", get(get_device))
        .route(
            "/api/v1/devices/:device_id/invoke/*pattern",
            get(invoke_device).post(invoke_device),
        )
        .route("/api/v1/devices/:device_id/revoke", post(revoke_device))
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("shutdown requested, draining device sessions");
            tunnels.shutdown(SHUTDOWN_DRAIN_TIMEOUT).await;
        })
        .await
        .context("gateway server exited")
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn send_response(result: serde_json::Value) -> Response {
    (StatusCode::OK, Json(json!({ "result": result, "error": null }))).into_response()
}

fn send_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = json!({
        "result": null,
        "error": { "code": code, "message": message.into() },
    });
    (status, Json(body)).into_response()
}

fn send_tunnel_error(e: &TunnelError) -> Response {
    let status = match e {
        TunnelError::Connection | TunnelError::Protocol(_) => StatusCode::BAD_GATEWAY,
        TunnelError::Auth(_) => StatusCode::UNAUTHORIZED,
    };
    send_error(status, e.code(), e.to_string())
}

fn authorize(state: &GatewayState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(ref required) = state.required_token else {
        return Ok(());
    };
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or("");
    if provided.is_empty() || provided != required {
        return Err(send_error(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "missing or invalid bearer token",
        ));
    }
    Ok(())
}

fn parse_device_id(raw: &str) -> Result<DeviceId, Response> {
    raw.parse()
        .map_err(|_| send_error(StatusCode::NOT_FOUND, "INVALID_ID", "Invalid ID"))
}

/// Route wildcards arrive without their leading slash; patterns are addressed with one.
fn normalize_pattern(raw: &str) -> String {
    if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{}", raw)
    }
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
        "sessions": state.tunnels.registry().len().await,
    }))
}

/// GET /api/v1/devices lists live tunnels.
async fn list_sessions(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    if let Err(res) = authorize(&state, &headers) {
        return res;
    }
    let sessions: Vec<serde_json::Value> = state
        .tunnels
        .registry()
        .connected()
        .await
        .iter()
        .map(|s| {
            json!({
                "deviceId": s.device_id(),
                "connectedAt": s.created_at().to_rfc3339(),
                "state": s.state().as_str(),
                "pending": s.correlator().pending(),
            })
        })
        .collect();
    send_response(json!({ "sessions": sessions }))
}

/// GET /api/v1/devices/:id returns the directory entry (never the auth key) and whether it is connected.
async fn get_device(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Response {
    if let Err(res) = authorize(&state, &headers) {
        return res;
    }
    let device_id = match parse_device_id(&device_id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    let Some(device) = state.tunnels.directory().get_by_id(device_id).await else {
        return send_error(StatusCode::NOT_FOUND, "DEVICE_NOT_FOUND", "Invalid ID");
    };
    let connected = state.tunnels.registry().lookup(device_id).await.is_some();
    send_response(json!({
        "device": {
            "id": device.id,
            "displayName": device.display_name,
            "description": device.description,
            "createdAt": device.created_at.to_rfc3339(),
            "endpoints": device.endpoints,
        },
        "connected": connected,
    }))
}

/// GET|POST /api/v1/devices/:id/invoke/*pattern: the request body is the payload.
async fn invoke_device(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path((device_id, pattern)): Path<(String, String)>,
    body: String,
) -> Response {
    if let Err(res) = authorize(&state, &headers) {
        return res;
    }
    let device_id = match parse_device_id(&device_id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    if state.tunnels.directory().get_by_id(device_id).await.is_none() {
        return send_error(StatusCode::NOT_FOUND, "DEVICE_NOT_FOUND", "Invalid ID");
    }
    let pattern = normalize_pattern(&pattern);
    match state.tunnels.invoke_device(device_id, &pattern, &body).await {
        Ok(res) => send_response(json!({ "response": res.data, "status": res.status })),
        Err(e) => send_tunnel_error(&e),
    }
}

/// POST /api/v1/devices/:id/revoke drops the device's tunnel. Idempotent.
async fn revoke_device(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Response {
    if let Err(res) = authorize(&state, &headers) {
        return res;
    }
    let device_id = match parse_device_id(&device_id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    match state.tunnels.revoke_device(device_id).await {
        Ok(()) => send_response(json!({ "deviceId": device_id })),
        Err(e) => send_tunnel_error(&e),
    }
}

/// GET /tunnel upgrades to WebSocket. First frame must be `connect`.
async fn tunnel_ws(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_tunnel_socket(socket, state))
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, message: String) {
    let frame = Frame::Error { message };
    let _ = sink.send(Message::Text(frame.encode())).await;
    let _ = sink.close().await;
}

/// Text carried by a data frame; control frames carry none.
fn data_text(msg: Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        _ => None,
    }
}

async fn handle_tunnel_socket(socket: WebSocket, state: GatewayState) {
    let (mut sink, mut stream) = socket.split();

    let handshake = state.config.tunnel.handshake_timeout();
    let first = match tokio::time::timeout(handshake, stream.next()).await {
        Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => {
            log::debug!("tunnel client disconnected before sending connect");
            return;
        }
        Ok(Some(Ok(msg))) => match data_text(msg) {
            Some(text) => text,
            None => {
                reject(&mut sink, "expected connect frame".to_string()).await;
                return;
            }
        },
        Err(_) => {
            log::debug!("tunnel client sent no connect within {:?}", handshake);
            reject(&mut sink, "handshake timeout".to_string()).await;
            return;
        }
    };

    let (claimed, auth_key) = match Frame::decode(&first) {
        Ok(Frame::Connect {
            device_id,
            auth_key,
            client,
        }) => {
            if let Some(client) = client {
                log::debug!("tunnel client identifies as {}", client);
            }
            (device_id, auth_key)
        }
        Ok(other) => {
            reject(&mut sink, format!("expected connect frame, got {}", other.kind())).await;
            return;
        }
        Err(e) => {
            reject(&mut sink, e.to_string()).await;
            return;
        }
    };

    let device = match state.tunnels.authenticate(claimed, &auth_key).await {
        Ok(device) => device,
        Err(e) => {
            log::info!("tunnel connect rejected: {}", e);
            reject(&mut sink, e.to_string()).await;
            return;
        }
    };
    if state.tunnels.is_shutting_down() {
        reject(&mut sink, "gateway is shutting down".to_string()).await;
        return;
    }

    let inbound = stream
        .take_while(|msg| futures_util::future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| async move {
            match msg {
                Ok(msg) => data_text(msg).map(Ok),
                Err(e) => Some(Err(e.to_string())),
            }
        });
    let outbound =
        sink.with(|text: String| async move { Ok::<_, axum::Error>(Message::Text(text)) });

    if let Err(e) = state.tunnels.attach(device.id, inbound, outbound).await {
        log::warn!("device {} tunnel could not be registered: {}", device.id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_get_a_leading_slash() {
        assert_eq!(normalize_pattern("ping"), "/ping");
        assert_eq!(normalize_pattern("/ping"), "/ping");
        assert_eq!(normalize_pattern("lights/kitchen"), "/lights/kitchen");
    }

    #[test]
    fn binary_frames_carry_text_control_frames_do_not() {
        assert_eq!(
            data_text(Message::Binary(br#"{"type":"connect","authKey":"k"}"#.to_vec())).as_deref(),
            Some(r#"{"type":"connect","authKey":"k"}"#)
        );
        assert_eq!(data_text(Message::Text("hi".to_string())).as_deref(), Some("hi"));
        assert!(data_text(Message::Ping(vec![1])).is_none());
        assert!(data_text(Message::Pong(Vec::new())).is_none());
    }

    #[test]
    fn control_token_only_in_token_mode() {
        let mut config = Config::default();
        assert!(require_control_token(&config).is_none());
        config.gateway.auth.mode = config::GatewayAuthMode::Token;
        config.gateway.auth.token = Some("abc".to_string());
        if std::env::var("WYRM_GATEWAY_TOKEN").is_err() {
            assert_eq!(require_control_token(&config).as_deref(), Some("abc"));
        }
    }
}
