pub mod github_app;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Token validity window (5 minutes either side of the verifier clock).
pub const TOKEN_VALIDITY_SECONDS: i64 = 5 * 60;

#[derive(thiserror::Error, Debug)]
#[error(
    "MODAL_API_SECRET environment variable is not configured. \
     This secret is required for authenticating control plane requests."
)]
pub struct AuthConfigError;

/// Shared-secret HMAC auth for service-to-service calls.
///
/// Tokens have the shape `{timestamp_ms}.{hmac_sha256_hex}`. The secret is
/// resolved once at construction so tests can inject one without touching the
/// process environment.
#[derive(Clone)]
pub struct AuthContext {
    secret: String,
}

impl AuthContext {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// Resolve the shared secret from `MODAL_API_SECRET`, failing fast when
    /// it is absent or empty.
    pub fn from_env() -> Result<Self, AuthConfigError> {
        match std::env::var("MODAL_API_SECRET") {
            Ok(secret) if !secret.is_empty() => Ok(Self::new(secret)),
            _ => Err(AuthConfigError),
        }
    }

    /// Mint a fresh token for an outbound request.
    pub fn mint(&self) -> String {
        self.mint_at(Utc::now().timestamp_millis())
    }

    pub(crate) fn mint_at(&self, now_ms: i64) -> String {
        let timestamp = now_ms.to_string();
        let signature = self.sign(&timestamp);
        format!("{timestamp}.{signature}")
    }

    /// Verify an `Authorization` header value (`Bearer {ts}.{sig}`).
    ///
    /// Any malformed, expired, or mismatched token collapses to `false`;
    /// nothing is raised so the caller cannot distinguish failure modes.
    pub fn verify(&self, auth_header: Option<&str>) -> bool {
        self.verify_at(auth_header, Utc::now().timestamp_millis())
    }

    pub(crate) fn verify_at(&self, auth_header: Option<&str>, now_ms: i64) -> bool {
        let Some(header) = auth_header else {
            return false;
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return false;
        };

        let parts: Vec<&str> = token.split('.').collect();
        let (timestamp, signature) = match parts.as_slice() {
            [timestamp, signature] => (*timestamp, *signature),
            _ => return false,
        };

        let Ok(token_ms) = timestamp.parse::<i64>() else {
            return false;
        };

        let age_ms = (now_ms - token_ms).abs();
        if age_ms > TOKEN_VALIDITY_SECONDS * 1000 {
            tracing::debug!(
                age_s = age_ms / 1000,
                max_s = TOKEN_VALIDITY_SECONDS,
                "rejecting expired auth token"
            );
            return false;
        }

        let Ok(signature_bytes) = hex::decode(signature) else {
            return false;
        };

        // Mac::verify_slice is constant-time.
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(timestamp.as_bytes());
        mac.verify_slice(&signature_bytes).is_ok()
    }

    fn sign(&self, timestamp: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(timestamp.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}
