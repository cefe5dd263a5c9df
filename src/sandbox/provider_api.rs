//! HTTP client for the sandbox provider API.
//!
//! The provider owns all VM/container lifecycle: process supervision, rootfs,
//! networking, filesystem snapshots. This module is a thin relay — sandboxes
//! are created and driven entirely over its JSON API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::backend::{BackendSandbox, CreateSandboxRequest, ExecOutput, ImageRef, SandboxBackend};
use super::error::SandboxError;

#[derive(Debug, Clone)]
pub struct ProviderApiConfig {
    pub api_base_url: String,
    pub api_key: Option<String>,
}

pub struct ProviderApiBackend {
    client: reqwest::Client,
    config: ProviderApiConfig,
}

impl ProviderApiBackend {
    pub fn new(client: reqwest::Client, config: ProviderApiConfig) -> Self {
        Self { client, config }
    }
}

fn authorize(
    req: reqwest::RequestBuilder,
    api_key: &Option<String>,
) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) => req.bearer_auth(key),
        None => req,
    }
}

async fn read_json(resp: reqwest::Response, what: &str) -> Result<Value, SandboxError> {
    let status = resp.status();
    if status.as_u16() == 404 {
        return Err(SandboxError::NotFound(what.to_string()));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(SandboxError::Backend(format!(
            "provider API returned {status} for {what}: {body}"
        )));
    }
    let body = resp.text().await.map_err(|e| SandboxError::Backend(e.to_string()))?;
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| SandboxError::Serde(e.to_string()))
}

#[async_trait]
impl SandboxBackend for ProviderApiBackend {
    async fn create_sandbox(
        &self,
        req: CreateSandboxRequest,
    ) -> Result<Box<dyn BackendSandbox>, SandboxError> {
        let image = match &req.image {
            ImageRef::Base => Value::Null,
            ImageRef::Snapshot(id) => json!(id),
        };
        let body = json!({
            "image": image,
            "env": req.env,
            "timeoutSeconds": req.timeout_seconds,
            "secretGroups": req.secret_groups,
        });

        let url = format!("{}/v1/sandboxes", self.config.api_base_url);
        let resp = authorize(self.client.post(&url), &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SandboxError::Provision(e.to_string()))?;
        let created = read_json(resp, "create sandbox").await?;

        let object_id = created["objectId"]
            .as_str()
            .ok_or_else(|| SandboxError::Serde("create response missing objectId".into()))?
            .to_string();

        tracing::debug!(object_id = %object_id, "provider sandbox created");

        Ok(Box::new(ProviderApiSandbox {
            client: self.client.clone(),
            config: self.config.clone(),
            object_id,
        }))
    }
}

struct ProviderApiSandbox {
    client: reqwest::Client,
    config: ProviderApiConfig,
    object_id: String,
}

impl ProviderApiSandbox {
    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/v1/sandboxes/{}{suffix}",
            self.config.api_base_url, self.object_id
        )
    }
}

#[async_trait]
impl BackendSandbox for ProviderApiSandbox {
    fn object_id(&self) -> &str {
        &self.object_id
    }

    async fn wait(&self) -> Result<i32, SandboxError> {
        // The provider long-polls; an in-flight wait may be answered with a
        // keepalive (null returncode), in which case we ask again. The
        // request timeout must outlive the longest sandbox lifetime, so it
        // overrides the client-wide 30 s default.
        loop {
            let resp = authorize(self.client.post(self.url("/wait")), &self.config.api_key)
                .timeout(Duration::from_secs(1860))
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        SandboxError::Timeout
                    } else {
                        SandboxError::Backend(e.to_string())
                    }
                })?;
            let body = read_json(resp, "wait").await?;
            match body["returncode"].as_i64() {
                Some(code) => return Ok(code as i32),
                None => continue,
            }
        }
    }

    async fn exec(&self, argv: &[String]) -> Result<ExecOutput, SandboxError> {
        let resp = authorize(self.client.post(self.url("/exec")), &self.config.api_key)
            .json(&json!({ "argv": argv }))
            .send()
            .await
            .map_err(|e| SandboxError::Exec(e.to_string()))?;
        let body = read_json(resp, "exec").await?;
        Ok(ExecOutput {
            stdout: body["stdout"].as_str().unwrap_or_default().to_string(),
            stderr: body["stderr"].as_str().unwrap_or_default().to_string(),
            returncode: body["returncode"].as_i64().unwrap_or(-1) as i32,
        })
    }

    async fn snapshot_filesystem(&self) -> Result<String, SandboxError> {
        let resp = authorize(self.client.post(self.url("/snapshot")), &self.config.api_key)
            .send()
            .await
            .map_err(|e| SandboxError::Snapshot(e.to_string()))?;
        let body = read_json(resp, "snapshot").await?;
        body["imageId"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| SandboxError::Snapshot("snapshot response missing imageId".into()))
    }

    async fn terminate(&self) -> Result<(), SandboxError> {
        let resp = authorize(self.client.delete(self.url("")), &self.config.api_key)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(e.to_string()))?;
        read_json(resp, "terminate").await.map(|_| ())
    }
}
