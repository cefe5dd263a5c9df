mod auth;
mod builder;
mod config;
mod control_plane;
mod sandbox;
mod vcs;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::auth::AuthContext;
use crate::auth::github_app::GithubApp;
use crate::builder::reconciler::GitRemoteScan;
use crate::builder::{BuildRequest, BuildWorker, Reconciler};
use crate::config::WorkerConfig;
use crate::control_plane::HttpControlPlane;
use crate::sandbox::SandboxManager;
use crate::sandbox::manager::{RestoreOptions, SessionSandboxConfig};
use crate::sandbox::provider_api::{ProviderApiBackend, ProviderApiConfig};
use crate::sandbox::supervisor::{SandboxSupervisor, SupervisorConfig};
use crate::vcs::ScmProvider;

#[derive(Parser)]
#[command(
    name = "openinspect-workers",
    about = "Sandbox-side runtime and image-build workers"
)]
enum Cli {
    /// Run the in-sandbox supervisor: boot the workspace, run hooks, start
    /// the agent and the control-plane bridge.
    Supervisor,
    /// Build one repository image and report the result to the control plane.
    BuildWorker {
        #[arg(long)]
        repo_owner: String,
        #[arg(long)]
        repo_name: String,
        #[arg(long, default_value = "main")]
        default_branch: String,
        #[arg(long, default_value = "")]
        callback_url: String,
        #[arg(long, default_value = "")]
        build_id: String,
    },
    /// Create a session sandbox and print its handle as JSON.
    CreateSandbox {
        #[arg(long)]
        repo_owner: String,
        #[arg(long)]
        repo_name: String,
        /// Session config JSON (becomes SESSION_CONFIG inside the sandbox).
        #[arg(long, default_value = "{}")]
        session_config: String,
        #[arg(long, default_value = "")]
        sandbox_auth_token: String,
        #[arg(long, default_value = "")]
        clone_token: String,
        #[arg(long)]
        timeout_seconds: Option<u64>,
    },
    /// Restore a session sandbox from a snapshot image and print its handle.
    RestoreSandbox {
        #[arg(long)]
        snapshot_image_id: String,
        /// Session config JSON of the session being restored.
        #[arg(long)]
        session_config: String,
        #[arg(long, default_value = "")]
        sandbox_auth_token: String,
        #[arg(long)]
        timeout_seconds: Option<u64>,
    },
    /// Periodically compare remote HEADs against built images and trigger
    /// rebuilds.
    Reconciler {
        /// Run a single reconcile pass and exit.
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("openinspect_workers=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    match Cli::parse() {
        Cli::Supervisor => {
            let config = SupervisorConfig::from_env();
            let supervisor = SandboxSupervisor::new(config, http);
            supervisor.run().await?;
        }
        Cli::BuildWorker {
            repo_owner,
            repo_name,
            default_branch,
            callback_url,
            build_id,
        } => {
            let config = WorkerConfig::from_env();
            let worker = build_worker(&config, http)?;
            worker
                .build_repo_image(BuildRequest {
                    repo_owner,
                    repo_name,
                    default_branch,
                    callback_url,
                    build_id,
                })
                .await;
        }
        Cli::CreateSandbox {
            repo_owner,
            repo_name,
            session_config,
            sandbox_auth_token,
            clone_token,
            timeout_seconds,
        } => {
            let config = WorkerConfig::from_env();
            let manager = sandbox_manager(&config, http)?;
            let session_config: serde_json::Value = serde_json::from_str(&session_config)
                .context("--session-config is not valid JSON")?;
            let handle = manager
                .create_session_sandbox(SessionSandboxConfig {
                    repo_owner,
                    repo_name,
                    control_plane_url: config.control_plane_url.clone(),
                    sandbox_auth_token: non_empty(sandbox_auth_token),
                    session_config: Some(session_config),
                    clone_token: non_empty(clone_token),
                    timeout_seconds,
                    ..Default::default()
                })
                .await?;
            print_handle(&handle);
        }
        Cli::RestoreSandbox {
            snapshot_image_id,
            session_config,
            sandbox_auth_token,
            timeout_seconds,
        } => {
            let config = WorkerConfig::from_env();
            let manager = sandbox_manager(&config, http)?;
            let session_config: serde_json::Value = serde_json::from_str(&session_config)
                .context("--session-config is not valid JSON")?;
            let handle = manager
                .restore_from_snapshot(
                    &snapshot_image_id,
                    session_config,
                    RestoreOptions {
                        control_plane_url: config.control_plane_url.clone(),
                        sandbox_auth_token: non_empty(sandbox_auth_token),
                        timeout_seconds,
                        ..Default::default()
                    },
                )
                .await?;
            print_handle(&handle);
        }
        Cli::Reconciler { once } => {
            let config = WorkerConfig::from_env();
            let auth = Arc::new(AuthContext::from_env()?);
            let api = Arc::new(HttpControlPlane::new(http.clone(), auth));
            let reconciler = Reconciler::new(
                api,
                Arc::new(GitRemoteScan),
                config.control_plane_url.clone(),
                GithubApp::from_env(),
                http,
            );

            if once {
                reconciler.run_tick().await;
            } else {
                let shutdown = CancellationToken::new();
                let signal_token = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("received interrupt, stopping reconciler");
                        signal_token.cancel();
                    }
                });
                reconciler
                    .run_loop(&config.reconcile_schedule, shutdown)
                    .await;
            }
        }
    }

    Ok(())
}

fn sandbox_manager(config: &WorkerConfig, http: reqwest::Client) -> anyhow::Result<SandboxManager> {
    let provider_url = config
        .provider_api_url
        .clone()
        .context("PROVIDER_API_URL is not configured")?;
    let backend = Arc::new(ProviderApiBackend::new(
        http,
        ProviderApiConfig {
            api_base_url: provider_url,
            api_key: config.provider_api_key.clone(),
        },
    ));
    Ok(SandboxManager::new(backend, ScmProvider::from_env()))
}

fn build_worker(config: &WorkerConfig, http: reqwest::Client) -> anyhow::Result<BuildWorker> {
    let manager = sandbox_manager(config, http.clone())?;

    let auth = Arc::new(AuthContext::from_env()?);
    let api = Arc::new(HttpControlPlane::new(http.clone(), auth));

    Ok(BuildWorker::new(
        manager,
        api,
        GithubApp::from_env(),
        http,
        config.allowed_callback_urls.clone(),
    ))
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn print_handle(handle: &crate::sandbox::SandboxHandle) {
    println!(
        "{}",
        serde_json::json!({
            "sandboxId": handle.sandbox_id,
            "providerObjectId": handle.provider_object_id,
            "createdAt": handle.created_at,
        })
    );
}
