//! Authenticated HTTP surface of the control plane.
//!
//! Every request mints a fresh HMAC token so retries after long delays never
//! carry a stale one. The trait seam exists so builder and reconciler logic
//! can be tested against an in-memory control plane.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::auth::AuthContext;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait ControlPlaneApi: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<Value>;
    async fn post_json(&self, url: &str, payload: &Value) -> Result<Value>;
}

pub struct HttpControlPlane {
    client: reqwest::Client,
    auth: Arc<AuthContext>,
}

impl HttpControlPlane {
    pub fn new(client: reqwest::Client, auth: Arc<AuthContext>) -> Self {
        Self { client, auth }
    }

    async fn read_json(resp: reqwest::Response, url: &str) -> Result<Value> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("control plane returned {status} for {url}: {body}");
        }
        let body = resp.text().await.context("failed to read response body")?;
        if body.trim().is_empty() {
            // 204-style responses have no body.
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).context("failed to parse control plane response")
    }
}

#[async_trait]
impl ControlPlaneApi for HttpControlPlane {
    async fn get_json(&self, url: &str) -> Result<Value> {
        let token = self.auth.mint();
        let resp = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {token}"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        Self::read_json(resp, url).await
    }

    async fn post_json(&self, url: &str, payload: &Value) -> Result<Value> {
        let token = self.auth.mint();
        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {token}"))
            .json(payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        Self::read_json(resp, url).await
    }
}
