use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_API_URL: &str = "http://localhost:3333";
pub const DEFAULT_DB_PATH: &str = "trap_sync.db";
pub const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_MAX_UPLOAD_RETRIES: u32 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub api_url: String,
    pub db_path: String,
    pub drain_interval_secs: u64,
    pub max_upload_retries: u32,
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            db_path: DEFAULT_DB_PATH.to_string(),
            drain_interval_secs: DEFAULT_DRAIN_INTERVAL_SECS,
            max_upload_retries: DEFAULT_MAX_UPLOAD_RETRIES,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl SyncConfig {
    /// Creates a config from environment variables, loading `.env` first
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup. Missing keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let api_url = lookup("TRAP_SYNC_API_URL").unwrap_or(defaults.api_url);
        url::Url::parse(&api_url)
            .map_err(|e| anyhow!("TRAP_SYNC_API_URL is not a valid URL ({}): {}", api_url, e))?;

        let db_path = lookup("TRAP_SYNC_DB_PATH").unwrap_or(defaults.db_path);

        Ok(Self {
            api_url,
            db_path,
            drain_interval_secs: parse_or(
                &lookup,
                "TRAP_SYNC_DRAIN_INTERVAL_SECS",
                defaults.drain_interval_secs,
            ),
            max_upload_retries: parse_or(
                &lookup,
                "TRAP_SYNC_MAX_UPLOAD_RETRIES",
                defaults.max_upload_retries,
            ),
            request_timeout_secs: parse_or(
                &lookup,
                "TRAP_SYNC_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            ),
        })
    }

    pub fn with_db_path(mut self, db_path: impl Into<String>) -> Self {
        self.db_path = db_path.into();
        self
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("{} has invalid value {:?}, using {}", key, raw, default);
                default
            }
        },
    }
}
