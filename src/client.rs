//! Cache management client
//!
//! Thin HTTP client over the `/v2/cache` endpoints, used by the `cache`
//! subcommands to manage the cache of a running server.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::{Method, RequestBuilder, Response};
use uuid::Uuid;

use crate::models::{CacheListResponse, ClearCacheResponse, ClearTarget};

#[derive(Debug, Clone)]
pub struct CacheClient {
    http: reqwest::Client,
    base_url: String,
}

impl CacheClient {
    /// Client for the server at `host:port`. `insecure` selects https and
    /// accepts any server certificate.
    pub fn new(host: &str, port: u16, insecure: bool) -> Result<Self> {
        let scheme = if insecure { "https" } else { "http" };
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: format!("{scheme}://{host}:{port}"),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{path}", self.base_url))
    }

    pub async fn list(&self) -> Result<CacheListResponse> {
        let response = send(self.request(Method::GET, "/v2/cache")).await?;
        response
            .json()
            .await
            .context("failed to parse cache listing")
    }

    pub async fn queue_image(&self, image_id: Uuid) -> Result<()> {
        send(self.request(Method::PUT, &format!("/v2/cache/{image_id}"))).await?;
        Ok(())
    }

    /// Removes one image from the cache and the queue.
    pub async fn delete_image(&self, image_id: Uuid) -> Result<()> {
        send(self.request(Method::DELETE, &format!("/v2/cache/{image_id}"))).await?;
        Ok(())
    }

    pub async fn clear(&self, target: ClearTarget) -> Result<ClearCacheResponse> {
        let request = self
            .request(Method::DELETE, "/v2/cache")
            .header(ClearTarget::HEADER, target.as_str());
        let response = send(request).await?;
        response
            .json()
            .await
            .context("failed to parse cache clear response")
    }
}

/// Sends the request and turns error statuses into errors carrying the
/// server's message.
async fn send(request: RequestBuilder) -> Result<Response> {
    let response = request.send().await.context("request to image service failed")?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let message = body
        .get("error")
        .and_then(|e| e.as_str())
        .unwrap_or("no error message");
    Err(anyhow!("image service returned {status}: {message}"))
}
