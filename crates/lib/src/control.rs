//! Control-plane client for the gateway's `/api/v1` routes (http://127.0.0.1:8080 by default).

use serde::Deserialize;

use crate::gateway::{DeviceId, InvokeResponse};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";

#[derive(Clone)]
pub struct ControlClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("gateway request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Error envelope returned by the gateway, e.g. `CONNECTION_ERROR`.
    #[error("gateway error {status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
}

impl ControlError {
    pub fn code(&self) -> Option<&str> {
        match self {
            ControlError::Api { code, .. } => Some(code),
            ControlError::Request(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    result: Option<serde_json::Value>,
    error: Option<EnvelopeError>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct InvokeResult {
    response: String,
    status: u16,
}

impl ControlClient {
    pub fn new(base_url: Option<String>, token: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            token,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn unwrap_envelope(res: reqwest::Response) -> Result<serde_json::Value, ControlError> {
        let status = res.status();
        let envelope: Envelope = res.json().await?;
        if let Some(err) = envelope.error {
            return Err(ControlError::Api {
                status: status.as_u16(),
                code: err.code,
                message: err.message,
            });
        }
        Ok(envelope.result.unwrap_or(serde_json::Value::Null))
    }

    /// POST /api/v1/devices/:id/invoke/*pattern with `data` as the body.
    pub async fn invoke(
        &self,
        device_id: DeviceId,
        pattern: &str,
        data: &str,
    ) -> Result<InvokeResponse, ControlError> {
        let url = format!(
            "{}/api/v1/devices/{}/invoke/{}",
            self.base_url,
            device_id,
            pattern.trim_start_matches('/')
        );
        let res = self
            .authed(self.client.post(&url))
            .body(data.to_string())
            .send()
            .await?;
        let result: InvokeResult = serde_json::from_value(Self::unwrap_envelope(res).await?)
            .map_err(|e| ControlError::Api {
                status: 200,
                code: "PROTOCOL_ERROR".to_string(),
                message: format!("unexpected invoke result: {}", e),
            })?;
        Ok(InvokeResponse {
            data: result.response,
            status: result.status,
        })
    }

    /// POST /api/v1/devices/:id/revoke.
    pub async fn revoke(&self, device_id: DeviceId) -> Result<(), ControlError> {
        let url = format!("{}/api/v1/devices/{}/revoke", self.base_url, device_id);
        let res = self.authed(self.client.post(&url)).send().await?;
        Self::unwrap_envelope(res).await?;
        Ok(())
    }

    /// Revoke when a gateway is listening. Ok(false) means nothing answered at `base_url`.
    pub async fn revoke_if_running(&self, device_id: DeviceId) -> Result<bool, ControlError> {
        match self.revoke(device_id).await {
            Ok(()) => Ok(true),
            Err(ControlError::Request(e)) if e.is_connect() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// GET /api/v1/devices: live sessions.
    pub async fn sessions(&self) -> Result<Vec<serde_json::Value>, ControlError> {
        let url = format!("{}/api/v1/devices", self.base_url);
        let res = self.authed(self.client.get(&url)).send().await?;
        let result = Self::unwrap_envelope(res).await?;
        Ok(result
            .get("sessions")
            .and_then(|s| s.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// GET /api/v1/devices/:id: directory entry and connection flag.
    pub async fn device(&self, device_id: DeviceId) -> Result<serde_json::Value, ControlError> {
        let url = format!("{}/api/v1/devices/{}", self.base_url, device_id);
        let res = self.authed(self.client.get(&url)).send().await?;
        Self::unwrap_envelope(res).await
    }
}
