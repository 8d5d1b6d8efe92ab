// Provisioning server HTTP client

//! Client for the remote tunnel provisioning API
//!
//! Bearer-token authenticated JSON over HTTP. Any non-2xx answer becomes
//! [`ApiError::Status`] carrying the HTTP status and raw body.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::types::{TunnelRequest, TunnelResponse, TunnelStatus};

/// Errors returned by the provisioning API client
#[derive(Debug, Error)]
pub enum ApiError {
    /// Non-2xx answer
    #[error("request failed with status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body as text
        body: String,
    },

    /// Connection, timeout or TLS failure
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// 2xx answer that is not the expected JSON
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// HTTP status of a non-2xx answer
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Remote tunnel provisioning operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisioningApi: Send + Sync {
    /// POST /api/tunnels
    async fn create_tunnel(&self, req: &TunnelRequest) -> Result<TunnelResponse, ApiError>;

    /// PUT /api/tunnels/{id}
    async fn update_tunnel(
        &self,
        tunnel_id: &str,
        req: &TunnelRequest,
    ) -> Result<TunnelResponse, ApiError>;

    /// DELETE /api/tunnels/{id}
    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<(), ApiError>;

    /// GET /api/tunnels/{id}/status
    async fn tunnel_status(&self, tunnel_id: &str) -> Result<TunnelStatus, ApiError>;
}

/// reqwest-backed provisioning client
pub struct ProvisioningClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl ProvisioningClient {
    /// Create a client for `base_url` authenticating with `api_key`
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and return the raw body of a 2xx answer
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<String, ApiError> {
        let mut request = self
            .http
            .request(method, self.url(path))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        if let Some(body) = body {
            request = request.body(serde_json::to_vec(body)?);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(text)
    }

    async fn send_json<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let text = self.send(method, path, body).await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl ProvisioningApi for ProvisioningClient {
    async fn create_tunnel(&self, req: &TunnelRequest) -> Result<TunnelResponse, ApiError> {
        self.send_json(Method::POST, "/api/tunnels", Some(req)).await
    }

    async fn update_tunnel(
        &self,
        tunnel_id: &str,
        req: &TunnelRequest,
    ) -> Result<TunnelResponse, ApiError> {
        let path = format!("/api/tunnels/{}", tunnel_id);
        self.send_json(Method::PUT, &path, Some(req)).await
    }

    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<(), ApiError> {
        let path = format!("/api/tunnels/{}", tunnel_id);
        self.send::<()>(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn tunnel_status(&self, tunnel_id: &str) -> Result<TunnelStatus, ApiError> {
        let path = format!("/api/tunnels/{}/status", tunnel_id);
        self.send_json::<(), _>(Method::GET, &path, None).await
    }
}

/// True for errors worth logging as a missing remote record
pub fn is_not_found(err: &ApiError) -> bool {
    err.status() == Some(StatusCode::NOT_FOUND.as_u16())
}
