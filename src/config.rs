/// Worker configuration loaded from environment variables.
///
/// `from_env` delegates to `from_raw_values` so tests can build configs
/// without mutating process-global environment.
pub struct WorkerConfig {
    pub control_plane_url: Option<String>,
    /// Callback URLs must be rooted under one of these bases (SSRF guard).
    pub allowed_callback_urls: Vec<String>,
    /// Cron cadence for the image-rebuild reconciler.
    pub reconcile_schedule: String,
    pub provider_api_url: Option<String>,
    pub provider_api_key: Option<String>,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("CONTROL_PLANE_URL").ok().as_deref(),
            std::env::var("ALLOWED_CALLBACK_URLS").ok().as_deref(),
            std::env::var("RECONCILE_SCHEDULE").ok().as_deref(),
            std::env::var("PROVIDER_API_URL").ok().as_deref(),
            std::env::var("PROVIDER_API_KEY").ok().as_deref(),
        )
    }

    /// Build a WorkerConfig from raw string values (as they would come from
    /// env vars).
    pub fn from_raw_values(
        control_plane_url: Option<&str>,
        allowed_callback_urls: Option<&str>,
        reconcile_schedule: Option<&str>,
        provider_api_url: Option<&str>,
        provider_api_key: Option<&str>,
    ) -> Self {
        let control_plane_url = control_plane_url
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_end_matches('/').to_string());

        // Explicit allow-list wins; otherwise only the control plane itself
        // may receive callbacks.
        let allowed_callback_urls = match allowed_callback_urls.filter(|s| !s.is_empty()) {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => control_plane_url.iter().cloned().collect(),
        };

        let reconcile_schedule = reconcile_schedule
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "*/30 * * * *".to_string());

        WorkerConfig {
            control_plane_url,
            allowed_callback_urls,
            reconcile_schedule,
            provider_api_url: provider_api_url.filter(|s| !s.is_empty()).map(String::from),
            provider_api_key: provider_api_key.filter(|s| !s.is_empty()).map(String::from),
        }
    }
}
