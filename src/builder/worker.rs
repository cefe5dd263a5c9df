//! Async image-build worker.
//!
//! One invocation per build: create a build sandbox, let its supervisor run
//! `setup.sh`, snapshot the filesystem, and report the result to the control
//! plane. Results travel over authenticated callbacks with bounded retries —
//! the worker itself never propagates failures upstream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::auth::github_app::GithubApp;
use crate::control_plane::ControlPlaneApi;
use crate::sandbox::{SandboxError, SandboxManager};

pub(crate) const CALLBACK_MAX_RETRIES: u32 = 3;

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("build sandbox exited with code {0}")]
    SandboxExit(i32),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub repo_owner: String,
    pub repo_name: String,
    pub default_branch: String,
    pub callback_url: String,
    pub build_id: String,
}

struct BuildOutcome {
    provider_image_id: String,
    base_sha: String,
}

pub struct BuildWorker {
    manager: SandboxManager,
    api: Arc<dyn ControlPlaneApi>,
    github_app: Option<GithubApp>,
    http: reqwest::Client,
    allowed_callback_urls: Vec<String>,
}

impl BuildWorker {
    pub fn new(
        manager: SandboxManager,
        api: Arc<dyn ControlPlaneApi>,
        github_app: Option<GithubApp>,
        http: reqwest::Client,
        allowed_callback_urls: Vec<String>,
    ) -> Self {
        Self {
            manager,
            api,
            github_app,
            http,
            allowed_callback_urls,
        }
    }

    /// Run one build end to end. Outcomes (success or failure) go to the
    /// callback URL; this method itself never fails.
    pub async fn build_repo_image(&self, req: BuildRequest) {
        if !req.callback_url.is_empty()
            && !callback_url_allowed(&req.callback_url, &self.allowed_callback_urls)
        {
            tracing::error!(
                url = %req.callback_url,
                build_id = %req.build_id,
                "callback URL is not an allowed control-plane URL, refusing build"
            );
            return;
        }

        let started = Instant::now();
        tracing::info!(
            build_id = %req.build_id,
            repo_owner = %req.repo_owner,
            repo_name = %req.repo_name,
            default_branch = %req.default_branch,
            "build starting"
        );

        match self.run_build(&req).await {
            Ok(outcome) => {
                let duration = started.elapsed().as_secs_f64();
                tracing::info!(
                    build_id = %req.build_id,
                    provider_image_id = %outcome.provider_image_id,
                    base_sha = %outcome.base_sha,
                    duration_s = format!("{duration:.1}"),
                    "build succeeded"
                );
                if !req.callback_url.is_empty() {
                    callback_with_retry(
                        self.api.as_ref(),
                        &req.callback_url,
                        &json!({
                            "build_id": req.build_id,
                            "provider_image_id": outcome.provider_image_id,
                            "base_sha": outcome.base_sha,
                            "build_duration_seconds": (duration * 100.0).round() / 100.0,
                        }),
                    )
                    .await;
                }
            }
            Err(e) => {
                tracing::error!(
                    build_id = %req.build_id,
                    error = %e,
                    duration_s = format!("{:.1}", started.elapsed().as_secs_f64()),
                    "build failed"
                );
                if !req.callback_url.is_empty() {
                    callback_with_retry(
                        self.api.as_ref(),
                        &failure_callback_url(&req.callback_url),
                        &json!({
                            "build_id": req.build_id,
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                }
            }
        }
    }

    async fn run_build(&self, req: &BuildRequest) -> Result<BuildOutcome, BuildError> {
        // Clone auth is best-effort; public repos build without it.
        let clone_token = match &self.github_app {
            Some(app) => app.clone_token(&self.http).await,
            None => None,
        };

        let handle = self
            .manager
            .create_build_sandbox(
                &req.repo_owner,
                &req.repo_name,
                &req.default_branch,
                clone_token.as_deref(),
            )
            .await?;

        let exit_code = handle.wait().await?;
        if exit_code != 0 {
            return Err(BuildError::SandboxExit(exit_code));
        }

        // Read the SHA before snapshotting so the image records what it
        // contains. Empty on failure; the reconciler treats that as stale.
        let base_sha = handle.read_head_sha(&req.repo_name).await;

        let provider_image_id = handle.snapshot_filesystem().await?;

        // The build sandbox sits idle once setup finishes; it is ours to
        // release now that the snapshot exists.
        if let Err(e) = handle.terminate().await {
            tracing::warn!(error = %e, "failed to terminate build sandbox");
        }

        Ok(BuildOutcome {
            provider_image_id,
            base_sha,
        })
    }
}

/// The failure callback lives next to the success one:
/// `{parent}/build-failed`.
pub(crate) fn failure_callback_url(callback_url: &str) -> String {
    match callback_url.rsplit_once('/') {
        Some((parent, _)) => format!("{parent}/build-failed"),
        None => format!("{callback_url}/build-failed"),
    }
}

/// Callback targets must sit under one of the configured control-plane
/// bases; anything else is treated as an SSRF attempt.
pub(crate) fn callback_url_allowed(url: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|base| {
        let base = base.trim_end_matches('/');
        !base.is_empty() && (url == base || url.starts_with(&format!("{base}/")))
    })
}

pub(crate) fn callback_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt + 1))
}

/// POST a payload to the control plane with retries (2 s, 4 s, 8 s). Each
/// attempt goes through [`ControlPlaneApi`], which mints a fresh token.
/// Returns whether any attempt succeeded; never raises.
pub(crate) async fn callback_with_retry(
    api: &dyn ControlPlaneApi,
    url: &str,
    payload: &Value,
) -> bool {
    for attempt in 0..CALLBACK_MAX_RETRIES {
        match api.post_json(url, payload).await {
            Ok(_) => {
                tracing::info!(url = %url, attempt = attempt + 1, "callback delivered");
                return true;
            }
            Err(e) => {
                let delay = callback_backoff(attempt);
                tracing::warn!(
                    url = %url,
                    attempt = attempt + 1,
                    max_retries = CALLBACK_MAX_RETRIES,
                    delay_s = delay.as_secs(),
                    error = %e,
                    "callback attempt failed"
                );
                if attempt < CALLBACK_MAX_RETRIES - 1 {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    tracing::error!(url = %url, max_retries = CALLBACK_MAX_RETRIES, "callback failed after all retries");
    false
}
