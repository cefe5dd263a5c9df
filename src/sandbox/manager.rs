//! Sandbox creation, restore, and environment composition.
//!
//! The manager owns the contracts around what a sandbox sees in its
//! environment: system-injected variables always override caller-supplied
//! ones, SCM access variables are derived from the configured provider, and
//! build sandboxes never receive control-plane or LLM material.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};

use crate::vcs::{ScmProvider, vcs_env_vars};

use super::backend::{BackendSandbox, CreateSandboxRequest, ImageRef, SandboxBackend};
use super::error::SandboxError;

/// Session sandboxes are reclaimed after an hour unless the caller overrides.
pub const DEFAULT_SANDBOX_TIMEOUT_SECONDS: u64 = 3600;

/// Build sandboxes get 30 minutes to clone and run `setup.sh`.
pub const BUILD_SANDBOX_TIMEOUT_SECONDS: u64 = 1800;

/// Inputs for a session sandbox (fresh or from a pre-built repo image).
#[derive(Debug, Clone, Default)]
pub struct SessionSandboxConfig {
    pub repo_owner: String,
    pub repo_name: String,
    pub control_plane_url: Option<String>,
    pub sandbox_auth_token: Option<String>,
    pub session_config: Option<Value>,
    pub user_env_vars: BTreeMap<String, String>,
    pub clone_token: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub secret_groups: Vec<String>,
    /// Boot from a pre-built repo image instead of the base image.
    pub repo_image: Option<RepoImage>,
}

#[derive(Debug, Clone)]
pub struct RepoImage {
    pub provider_image_id: String,
    pub base_sha: String,
}

/// Extra inputs for restoring a sandbox from a session snapshot.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub control_plane_url: Option<String>,
    pub sandbox_auth_token: Option<String>,
    pub user_env_vars: BTreeMap<String, String>,
    pub clone_token: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub secret_groups: Vec<String>,
}

/// Handle to a sandbox the manager created.
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub provider_object_id: String,
    /// Unix seconds at creation.
    pub created_at: i64,
    sandbox: Box<dyn BackendSandbox>,
}

impl SandboxHandle {
    pub async fn wait(&self) -> Result<i32, SandboxError> {
        self.sandbox.wait().await
    }

    /// Read the repo's HEAD SHA from inside the sandbox. Returns an empty
    /// string on any failure; callers treat the SHA as advisory.
    pub async fn read_head_sha(&self, repo_name: &str) -> String {
        let repo_path = format!("/workspace/{repo_name}");
        let argv: Vec<String> = ["git", "-C", &repo_path, "rev-parse", "HEAD"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        match self.sandbox.exec(&argv).await {
            Ok(out) if out.returncode == 0 => out.stdout.trim().to_string(),
            Ok(out) => {
                tracing::warn!(
                    returncode = out.returncode,
                    stderr = %out.stderr.trim(),
                    "failed to read HEAD SHA from sandbox"
                );
                String::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read HEAD SHA from sandbox");
                String::new()
            }
        }
    }

    pub async fn snapshot_filesystem(&self) -> Result<String, SandboxError> {
        self.sandbox.snapshot_filesystem().await
    }

    pub async fn terminate(&self) -> Result<(), SandboxError> {
        self.sandbox.terminate().await
    }
}

pub struct SandboxManager {
    backend: Arc<dyn SandboxBackend>,
    scm: ScmProvider,
}

impl SandboxManager {
    pub fn new(backend: Arc<dyn SandboxBackend>, scm: ScmProvider) -> Self {
        Self { backend, scm }
    }

    /// Create a session sandbox (base image or pre-built repo image).
    pub async fn create_session_sandbox(
        &self,
        config: SessionSandboxConfig,
    ) -> Result<SandboxHandle, SandboxError> {
        let created_at = Utc::now().timestamp();
        let sandbox_id = format!(
            "sandbox-{}-{}-{created_at}",
            config.repo_owner, config.repo_name
        );
        let env = compose_session_env(&config, &sandbox_id, self.scm, false);
        let image = match &config.repo_image {
            Some(repo_image) => ImageRef::Snapshot(repo_image.provider_image_id.clone()),
            None => ImageRef::Base,
        };
        let timeout_seconds = config
            .timeout_seconds
            .unwrap_or(DEFAULT_SANDBOX_TIMEOUT_SECONDS);

        tracing::info!(
            sandbox_id = %sandbox_id,
            repo_owner = %config.repo_owner,
            repo_name = %config.repo_name,
            from_repo_image = config.repo_image.is_some(),
            "creating session sandbox"
        );

        let sandbox = self
            .backend
            .create_sandbox(CreateSandboxRequest {
                image,
                env,
                timeout_seconds,
                secret_groups: config.secret_groups.clone(),
            })
            .await?;

        Ok(SandboxHandle {
            sandbox_id,
            provider_object_id: sandbox.object_id().to_string(),
            created_at,
            sandbox,
        })
    }

    /// Create a build sandbox: clone + `setup.sh` only, then snapshot.
    ///
    /// No control-plane address, no auth token, no LLM secrets — the build
    /// runs fully isolated from everything except the SCM host.
    pub async fn create_build_sandbox(
        &self,
        repo_owner: &str,
        repo_name: &str,
        default_branch: &str,
        clone_token: Option<&str>,
    ) -> Result<SandboxHandle, SandboxError> {
        let created_at = Utc::now().timestamp();
        let sandbox_id = format!("build-{repo_owner}-{repo_name}-{created_at}");
        let env = compose_build_env(
            repo_owner,
            repo_name,
            default_branch,
            &sandbox_id,
            self.scm,
            clone_token,
        );

        tracing::info!(
            sandbox_id = %sandbox_id,
            repo_owner = %repo_owner,
            repo_name = %repo_name,
            default_branch = %default_branch,
            "creating build sandbox"
        );

        let sandbox = self
            .backend
            .create_sandbox(CreateSandboxRequest {
                image: ImageRef::Base,
                env,
                timeout_seconds: BUILD_SANDBOX_TIMEOUT_SECONDS,
                secret_groups: Vec::new(),
            })
            .await?;

        Ok(SandboxHandle {
            sandbox_id,
            provider_object_id: sandbox.object_id().to_string(),
            created_at,
            sandbox,
        })
    }

    /// Restore a sandbox from a session filesystem snapshot.
    pub async fn restore_from_snapshot(
        &self,
        snapshot_image_id: &str,
        session_config: Value,
        opts: RestoreOptions,
    ) -> Result<SandboxHandle, SandboxError> {
        let repo_owner = session_config["repo_owner"].as_str().unwrap_or_default();
        let repo_name = session_config["repo_name"].as_str().unwrap_or_default();

        let config = SessionSandboxConfig {
            repo_owner: repo_owner.to_string(),
            repo_name: repo_name.to_string(),
            control_plane_url: opts.control_plane_url,
            sandbox_auth_token: opts.sandbox_auth_token,
            session_config: Some(session_config),
            user_env_vars: opts.user_env_vars,
            clone_token: opts.clone_token,
            timeout_seconds: opts.timeout_seconds,
            secret_groups: opts.secret_groups,
            repo_image: None,
        };

        let created_at = Utc::now().timestamp();
        let sandbox_id = format!(
            "sandbox-{}-{}-{created_at}",
            config.repo_owner, config.repo_name
        );
        let env = compose_session_env(&config, &sandbox_id, self.scm, true);
        let timeout_seconds = config
            .timeout_seconds
            .unwrap_or(DEFAULT_SANDBOX_TIMEOUT_SECONDS);

        tracing::info!(
            sandbox_id = %sandbox_id,
            snapshot_image_id = %snapshot_image_id,
            "restoring sandbox from snapshot"
        );

        let sandbox = self
            .backend
            .create_sandbox(CreateSandboxRequest {
                image: ImageRef::Snapshot(snapshot_image_id.to_string()),
                env,
                timeout_seconds,
                secret_groups: config.secret_groups.clone(),
            })
            .await?;

        Ok(SandboxHandle {
            sandbox_id,
            provider_object_id: sandbox.object_id().to_string(),
            created_at,
            sandbox,
        })
    }
}

/// Compose the environment for a session sandbox.
///
/// Order matters: user vars first, then VCS vars, then system vars, so the
/// system-injected values always win on collision.
pub(crate) fn compose_session_env(
    config: &SessionSandboxConfig,
    sandbox_id: &str,
    scm: ScmProvider,
    restored_from_snapshot: bool,
) -> BTreeMap<String, String> {
    let mut env = config.user_env_vars.clone();
    env.extend(vcs_env_vars(scm, config.clone_token.as_deref()));

    env.insert("SANDBOX_ID".to_string(), sandbox_id.to_string());
    env.insert("REPO_OWNER".to_string(), config.repo_owner.clone());
    env.insert("REPO_NAME".to_string(), config.repo_name.clone());
    if let Some(url) = &config.control_plane_url {
        env.insert("CONTROL_PLANE_URL".to_string(), url.clone());
    }
    if let Some(token) = &config.sandbox_auth_token {
        env.insert("SANDBOX_AUTH_TOKEN".to_string(), token.clone());
    }
    if let Some(session_config) = &config.session_config {
        env.insert("SESSION_CONFIG".to_string(), session_config.to_string());
    }
    if let Some(repo_image) = &config.repo_image {
        env.insert("FROM_REPO_IMAGE".to_string(), "true".to_string());
        env.insert("REPO_IMAGE_SHA".to_string(), repo_image.base_sha.clone());
    }
    if restored_from_snapshot {
        env.insert("RESTORED_FROM_SNAPSHOT".to_string(), "true".to_string());
    }

    env
}

pub(crate) fn compose_build_env(
    repo_owner: &str,
    repo_name: &str,
    default_branch: &str,
    sandbox_id: &str,
    scm: ScmProvider,
    clone_token: Option<&str>,
) -> BTreeMap<String, String> {
    let mut env = vcs_env_vars(scm, clone_token);
    env.insert("IMAGE_BUILD_MODE".to_string(), "true".to_string());
    env.insert("REPO_OWNER".to_string(), repo_owner.to_string());
    env.insert("REPO_NAME".to_string(), repo_name.to_string());
    env.insert("SANDBOX_ID".to_string(), sandbox_id.to_string());
    env.insert(
        "SESSION_CONFIG".to_string(),
        json!({ "branch": default_branch }).to_string(),
    );
    env
}
