//! Periodic image-rebuild reconciler.
//!
//! Every tick: fetch the enabled repos and current build records from the
//! control plane, compare each repo's remote HEAD (via `git ls-remote`)
//! against the newest ready image, and trigger rebuilds where they differ.
//! The tick ends with housekeeping: stale `building` records get failed,
//! old `failed` records get deleted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use croner::Cron;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::auth::github_app::GithubApp;
use crate::control_plane::ControlPlaneApi;
use crate::sandbox::supervisor::redact_secret;
use crate::vcs;

/// `building` records older than this are marked failed (35 minutes —
/// slightly past the 30-minute build sandbox timeout).
pub const STALE_BUILD_THRESHOLD_SECONDS: u64 = 2100;

/// `failed` records older than this are deleted (24 hours).
pub const FAILED_BUILD_CLEANUP_SECONDS: u64 = 86400;

const LS_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnabledRepo {
    #[serde(default)]
    pub repo_owner: String,
    #[serde(default)]
    pub repo_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildRecord {
    #[serde(default)]
    pub repo_owner: String,
    #[serde(default)]
    pub repo_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub base_sha: String,
    /// RFC 3339; lexicographic order matches chronological order.
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Seam over `git ls-remote` so reconcile logic is testable without a
/// network or a git binary.
#[async_trait]
pub trait RemoteScan: Send + Sync {
    async fn head_sha(
        &self,
        repo_owner: &str,
        repo_name: &str,
        branch: &str,
        clone_token: Option<&str>,
    ) -> Option<String>;
}

pub struct GitRemoteScan;

#[async_trait]
impl RemoteScan for GitRemoteScan {
    async fn head_sha(
        &self,
        repo_owner: &str,
        repo_name: &str,
        branch: &str,
        clone_token: Option<&str>,
    ) -> Option<String> {
        let url = vcs::ls_remote_url(repo_owner, repo_name, clone_token);
        let refspec = format!("refs/heads/{branch}");

        let output = tokio::time::timeout(
            LS_REMOTE_TIMEOUT,
            Command::new("git").args(["ls-remote", &url, &refspec]).output(),
        )
        .await;

        match output {
            Ok(Ok(out)) if out.status.success() => {
                parse_ls_remote_output(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(Ok(out)) => {
                let stderr = redact_secret(&String::from_utf8_lossy(&out.stderr), clone_token);
                tracing::warn!(
                    repo_owner = %repo_owner,
                    repo_name = %repo_name,
                    branch = %branch,
                    stderr = %stderr,
                    "git ls-remote failed"
                );
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(repo_owner = %repo_owner, repo_name = %repo_name, error = %e, "git ls-remote error");
                None
            }
            Err(_) => {
                tracing::warn!(repo_owner = %repo_owner, repo_name = %repo_name, "git ls-remote timed out");
                None
            }
        }
    }
}

/// First field of the first line: `"{sha}\trefs/heads/{branch}"`.
pub(crate) fn parse_ls_remote_output(stdout: &str) -> Option<String> {
    let line = stdout.trim();
    if line.is_empty() {
        return None;
    }
    line.split('\t')
        .next()
        .filter(|sha| !sha.is_empty())
        .map(String::from)
}

/// Rebuild decision for one repo:
/// - a `building` record means a build is in flight → no;
/// - no `ready` record at all → yes;
/// - otherwise rebuild iff the newest ready record's SHA differs.
///
/// Repo matching is case-insensitive. The control plane claims to return
/// records newest-first, but we re-sort defensively.
pub fn should_rebuild(
    repo_owner: &str,
    repo_name: &str,
    remote_sha: &str,
    all_records: &[BuildRecord],
) -> bool {
    let owner_lower = repo_owner.to_lowercase();
    let name_lower = repo_name.to_lowercase();

    let mut repo_records: Vec<&BuildRecord> = all_records
        .iter()
        .filter(|record| {
            record.repo_owner.to_lowercase() == owner_lower
                && record.repo_name.to_lowercase() == name_lower
        })
        .collect();

    if repo_records.iter().any(|record| record.status == "building") {
        tracing::info!(
            repo_owner = %repo_owner,
            repo_name = %repo_name,
            "build already in flight, skipping"
        );
        return false;
    }

    repo_records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let Some(latest_ready) = repo_records.iter().find(|record| record.status == "ready") else {
        tracing::info!(repo_owner = %repo_owner, repo_name = %repo_name, "no ready image, rebuilding");
        return true;
    };

    if latest_ready.base_sha != remote_sha {
        tracing::info!(
            repo_owner = %repo_owner,
            repo_name = %repo_name,
            ready_sha = %truncate_sha(&latest_ready.base_sha),
            remote_sha = %truncate_sha(remote_sha),
            "remote HEAD moved, rebuilding"
        );
        return true;
    }

    false
}

fn truncate_sha(sha: &str) -> &str {
    &sha[..sha.len().min(12)]
}

pub struct Reconciler {
    api: Arc<dyn ControlPlaneApi>,
    scan: Arc<dyn RemoteScan>,
    control_plane_url: Option<String>,
    github_app: Option<GithubApp>,
    http: reqwest::Client,
}

impl Reconciler {
    pub fn new(
        api: Arc<dyn ControlPlaneApi>,
        scan: Arc<dyn RemoteScan>,
        control_plane_url: Option<String>,
        github_app: Option<GithubApp>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            api,
            scan,
            control_plane_url,
            github_app,
            http,
        }
    }

    /// Sleep-until-next-occurrence loop around [`run_tick`].
    pub async fn run_loop(&self, schedule: &str, shutdown: CancellationToken) {
        let cron = match Cron::new(schedule).parse() {
            Ok(cron) => cron,
            Err(e) => {
                tracing::error!(error = %e, "invalid reconcile schedule '{schedule}'");
                return;
            }
        };

        tracing::info!(schedule = %schedule, "reconciler started");

        loop {
            let now = Utc::now();
            let next = match cron.find_next_occurrence(&now, false) {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(error = %e, "failed to compute next reconcile time");
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    continue;
                }
            };

            let until_next = (next - now).to_std().unwrap_or(Duration::from_secs(1));
            tracing::info!(next = %next.format("%Y-%m-%d %H:%M:%S UTC"), "sleeping until next reconcile");
            tokio::select! {
                _ = tokio::time::sleep(until_next) => {}
                _ = shutdown.cancelled() => return,
            }

            // Guard against premature wake from sleep imprecision.
            let now_after = Utc::now();
            if now_after < next {
                tokio::time::sleep((next - now_after).to_std().unwrap_or_default()).await;
            }

            self.run_tick().await;
        }
    }

    /// One reconcile pass. All failures are local: a repo that cannot be
    /// scanned is skipped, housekeeping errors are logged, and the next tick
    /// starts fresh.
    pub async fn run_tick(&self) {
        let Some(base) = self.control_plane_url.as_deref() else {
            tracing::error!("CONTROL_PLANE_URL is not configured, skipping reconcile");
            return;
        };

        tracing::info!("reconcile pass starting");
        let started = Instant::now();
        let mut builds_triggered = 0u32;

        if let Err(e) = self.reconcile(base, &mut builds_triggered).await {
            tracing::error!(error = %e, "reconcile pass failed");
        }

        tracing::info!(
            builds_triggered,
            duration_s = format!("{:.1}", started.elapsed().as_secs_f64()),
            "reconcile pass done"
        );
    }

    async fn reconcile(&self, base: &str, builds_triggered: &mut u32) -> Result<()> {
        let enabled_body = self
            .api
            .get_json(&format!("{base}/repo-images/enabled-repos"))
            .await
            .context("failed to fetch enabled repos")?;
        let enabled: Vec<EnabledRepo> =
            serde_json::from_value(enabled_body["repos"].clone()).unwrap_or_default();

        if enabled.is_empty() {
            tracing::info!("no repos enabled for image builds");
            return Ok(());
        }

        let status_body = self
            .api
            .get_json(&format!("{base}/repo-images/status"))
            .await
            .context("failed to fetch image status")?;
        let records: Vec<BuildRecord> =
            serde_json::from_value(status_body["images"].clone()).unwrap_or_default();

        let clone_token = match &self.github_app {
            Some(app) => app.clone_token(&self.http).await,
            None => None,
        };

        for repo in &enabled {
            if repo.repo_owner.is_empty() || repo.repo_name.is_empty() {
                continue;
            }

            let Some(remote_sha) = self
                .scan
                .head_sha(&repo.repo_owner, &repo.repo_name, "main", clone_token.as_deref())
                .await
            else {
                continue;
            };

            if should_rebuild(&repo.repo_owner, &repo.repo_name, &remote_sha, &records) {
                let trigger_url = format!(
                    "{base}/repo-images/trigger/{}/{}",
                    repo.repo_owner, repo.repo_name
                );
                match self.api.post_json(&trigger_url, &json!({})).await {
                    Ok(_) => {
                        *builds_triggered += 1;
                        tracing::info!(
                            repo_owner = %repo.repo_owner,
                            repo_name = %repo.repo_name,
                            "build triggered"
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            repo_owner = %repo.repo_owner,
                            repo_name = %repo.repo_name,
                            error = %e,
                            "failed to trigger build"
                        );
                    }
                }
            }
        }

        // Housekeeping; neither call may abort the tick.
        match self
            .api
            .post_json(
                &format!("{base}/repo-images/mark-stale"),
                &json!({ "max_age_seconds": STALE_BUILD_THRESHOLD_SECONDS }),
            )
            .await
        {
            Ok(result) => {
                let marked = result["markedFailed"].as_u64().unwrap_or(0);
                if marked > 0 {
                    tracing::info!(marked, "stale builds marked failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "mark-stale failed"),
        }

        match self
            .api
            .post_json(
                &format!("{base}/repo-images/cleanup"),
                &json!({ "max_age_seconds": FAILED_BUILD_CLEANUP_SECONDS }),
            )
            .await
        {
            Ok(result) => {
                let deleted = result["deleted"].as_u64().unwrap_or(0);
                if deleted > 0 {
                    tracing::info!(deleted, "old failed builds cleaned up");
                }
            }
            Err(e) => tracing::warn!(error = %e, "cleanup failed"),
        }

        Ok(())
    }
}
