use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use idm_completion::ZhipuConfig;
use idm_completion::zhipu::{DEFAULT_BASE_URL, DEFAULT_MODEL};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub completion: ZhipuConfig,
    pub history_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = lookup("IDM_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("IDM_JWT_SECRET is unset or still a placeholder");
        }

        let api_key = lookup("IDM_COMPLETION_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            bail!("IDM_COMPLETION_API_KEY is unset");
        }

        let port: u16 = get("IDM_PORT", "3000")
            .parse()
            .context("IDM_PORT must be a port number")?;
        let timeout_secs: u64 = get("IDM_COMPLETION_TIMEOUT_SECS", "30")
            .parse()
            .context("IDM_COMPLETION_TIMEOUT_SECS must be a whole number of seconds")?;
        let history_capacity: usize = get("IDM_HISTORY_CAPACITY", "1024")
            .parse()
            .context("IDM_HISTORY_CAPACITY must be a positive integer")?;

        let mut completion = ZhipuConfig::new(api_key);
        completion.base_url = get("IDM_COMPLETION_BASE_URL", DEFAULT_BASE_URL);
        completion.model = get("IDM_COMPLETION_MODEL", DEFAULT_MODEL);
        completion.timeout = Duration::from_secs(timeout_secs);

        Ok(Self {
            host: get("IDM_HOST", "0.0.0.0"),
            port,
            db_path: get("IDM_DB_PATH", "idm.db").into(),
            jwt_secret,
            completion,
            history_capacity,
        })
    }
}
