//! GitHub App installation tokens for git clone/fetch access.
//!
//! The app JWT is short-lived (10 minutes, backdated 60 s for clock skew) and
//! exchanged for an installation access token scoped to the configured
//! installation. Callers that only need best-effort auth use
//! [`GithubApp::clone_token`], which logs and returns `None` on any failure.

use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = "openinspect-workers";

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Clone)]
pub struct GithubApp {
    app_id: String,
    private_key_pem: String,
    installation_id: String,
}

impl GithubApp {
    pub fn new(
        app_id: impl Into<String>,
        private_key_pem: impl Into<String>,
        installation_id: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            private_key_pem: private_key_pem.into(),
            installation_id: installation_id.into(),
        }
    }

    /// Build from `GITHUB_APP_ID` / `GITHUB_APP_PRIVATE_KEY` /
    /// `GITHUB_APP_INSTALLATION_ID`. Returns `None` unless all three are set.
    pub fn from_env() -> Option<Self> {
        let app_id = std::env::var("GITHUB_APP_ID").ok().filter(|v| !v.is_empty())?;
        let private_key = std::env::var("GITHUB_APP_PRIVATE_KEY")
            .ok()
            .filter(|v| !v.is_empty())?;
        let installation_id = std::env::var("GITHUB_APP_INSTALLATION_ID")
            .ok()
            .filter(|v| !v.is_empty())?;
        Some(Self::new(app_id, private_key, installation_id))
    }

    fn app_jwt(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 540,
            iss: self.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(self.private_key_pem.as_bytes())
            .context("invalid GitHub App private key")?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .context("failed to sign GitHub App JWT")
    }

    /// Exchange the app JWT for an installation access token.
    pub async fn mint_installation_token(&self, client: &reqwest::Client) -> Result<String> {
        let jwt = self.app_jwt()?;
        let url = format!(
            "{GITHUB_API}/app/installations/{}/access_tokens",
            self.installation_id
        );
        let resp = client
            .post(&url)
            .bearer_auth(jwt)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("failed to request installation token")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API error {status} minting installation token: {body}");
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse installation token response")?;
        body["token"]
            .as_str()
            .map(String::from)
            .context("installation token response missing 'token'")
    }

    /// Best-effort token for git operations: failures are logged and yield
    /// `None` so unauthenticated access can proceed.
    pub async fn clone_token(&self, client: &reqwest::Client) -> Option<String> {
        match self.mint_installation_token(client).await {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(error = %e, "failed to mint GitHub App installation token");
                None
            }
        }
    }
}
