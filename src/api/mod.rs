//! Control plane client
//!
//! Typed HTTP client for the relay's control plane: tunnel lifecycle
//! (create, list, stop, delete) and credential verification. The tunnel
//! core consumes only the `relay_endpoint` and `session_token` a created
//! tunnel carries, plus best-effort stop notifications on shutdown.

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default control plane base URL.
pub const DEFAULT_API_URL: &str = "https://api.skyhook.dev";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Control plane errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{code}: {message}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
    },

    #[error("unable to reach the control plane: {0}")]
    Http(#[from] reqwest::Error),
}

impl ApiError {
    /// HTTP status of a structured API error, if this is one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Api { status, .. } => Some(*status),
            ApiError::Http(_) => None,
        }
    }
}

/// Body for `POST /api/v1/tunnels`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TunnelSpec {
    pub protocol: String,
    pub local_port: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub local_host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subdomain: String,
}

/// A tunnel object returned by the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelInfo {
    pub id: String,
    pub protocol: String,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub local_host: String,
    #[serde(default)]
    pub subdomain: String,
    pub public_url: String,
    pub status: String,
    #[serde(default)]
    pub relay_endpoint: String,
    #[serde(default)]
    pub session_token: String,
    #[serde(default)]
    pub bytes_in: i64,
    #[serde(default)]
    pub bytes_out: i64,
    #[serde(default)]
    pub request_count: i64,
    #[serde(default)]
    pub created_at: String,
}

/// User object returned by credential verification.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Deserialize)]
struct TunnelEnvelope {
    tunnel: TunnelInfo,
}

#[derive(Deserialize)]
struct TunnelsEnvelope {
    tunnels: Vec<TunnelInfo>,
}

#[derive(Deserialize)]
struct VerifyEnvelope {
    user: UserInfo,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Control plane API client.
pub struct ApiClient {
    base_url: String,
    api_key: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if base_url.is_empty() {
            base_url = DEFAULT_API_URL.to_string();
        }
        Self {
            base_url,
            api_key: api_key.into(),
            http: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Base URL the client is configured with.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a new tunnel. The response carries the relay endpoint and
    /// session token the agent dials with.
    pub async fn create_tunnel(&self, spec: &TunnelSpec) -> Result<TunnelInfo, ApiError> {
        let env: TunnelEnvelope = self
            .request(Method::POST, "/api/v1/tunnels", Some(spec))
            .await?;
        Ok(env.tunnel)
    }

    /// List the user's tunnels.
    pub async fn list_tunnels(&self) -> Result<Vec<TunnelInfo>, ApiError> {
        let env: TunnelsEnvelope = self
            .request::<(), _>(Method::GET, "/api/v1/tunnels", None)
            .await?;
        Ok(env.tunnels)
    }

    /// Fetch a single tunnel by ID.
    pub async fn get_tunnel(&self, tunnel_id: &str) -> Result<TunnelInfo, ApiError> {
        let env: TunnelEnvelope = self
            .request::<(), _>(Method::GET, &format!("/api/v1/tunnels/{tunnel_id}"), None)
            .await?;
        Ok(env.tunnel)
    }

    /// Mark a tunnel as stopped.
    pub async fn stop_tunnel(&self, tunnel_id: &str) -> Result<(), ApiError> {
        self.request_no_body(Method::POST, &format!("/api/v1/tunnels/{tunnel_id}/stop"))
            .await
    }

    /// Stop and delete a tunnel.
    pub async fn delete_tunnel(&self, tunnel_id: &str) -> Result<(), ApiError> {
        self.request_no_body(Method::DELETE, &format!("/api/v1/tunnels/{tunnel_id}"))
            .await
    }

    /// Validate the configured API key and return the owning user.
    pub async fn verify(&self) -> Result<UserInfo, ApiError> {
        let env: VerifyEnvelope = self
            .request::<(), _>(Method::GET, "/api/v1/auth/verify", None)
            .await?;
        Ok(env.user)
    }

    async fn request<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let data = self.send(method, path, body).await?;
        serde_json::from_slice(&data).map_err(|e| ApiError::Api {
            status: StatusCode::OK,
            code: "DECODE_ERROR".to_string(),
            message: format!("decoding response: {e}"),
        })
    }

    async fn request_no_body(&self, method: Method, path: &str) -> Result<(), ApiError> {
        self.send::<()>(method, path, None).await?;
        Ok(())
    }

    async fn send<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<bytes::Bytes, ApiError>
    where
        B: Serialize + ?Sized,
    {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header(reqwest::header::ACCEPT, "application/json");
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let data = response.bytes().await?;

        if status.is_client_error() || status.is_server_error() {
            return Err(parse_api_error(status, &data));
        }
        Ok(data)
    }
}

fn parse_api_error(status: StatusCode, body: &[u8]) -> ApiError {
    if let Ok(env) = serde_json::from_slice::<ErrorEnvelope>(body) {
        if !env.error.code.is_empty() {
            return ApiError::Api {
                status,
                code: env.error.code,
                message: env.error.message,
            };
        }
    }
    ApiError::Api {
        status,
        code: "UNKNOWN_ERROR".to_string(),
        message: format!("unexpected HTTP {}", status.as_u16()),
    }
}
