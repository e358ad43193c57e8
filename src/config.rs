use crate::error::ConfigError;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn env_required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::MissingVar(key))
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default_millis))
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

/// Credentials and endpoint for the token service.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub auth_url: String,
    pub subject: String,
    pub secret: String,
    /// Lifetime assumed when the token response carries no expiry.
    pub default_token_ttl: Duration,
    /// Re-authenticate this long before the token expires.
    pub refresh_skew: Duration,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            auth_url: env_required("AUTH_URL")?,
            subject: env_required("API_SUBJECT")?,
            secret: env_required("API_SECRET")?,
            default_token_ttl: env_duration_secs("SYNC_TOKEN_TTL_SECS", 3000),
            refresh_skew: env_duration_secs("SYNC_TOKEN_REFRESH_SKEW_SECS", 60),
        })
    }
}

/// HTTP client limits.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Upper bound on requests in flight across the whole run.
    pub max_in_flight: usize,
}

impl HttpConfig {
    pub fn from_env() -> Self {
        Self {
            request_timeout: env_duration_millis("SYNC_REQUEST_TIMEOUT_MS", 30_000),
            connect_timeout: env_duration_millis("SYNC_CONNECT_TIMEOUT_MS", 10_000),
            max_in_flight: env_usize("SYNC_MAX_IN_FLIGHT", 16).max(1),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Tuning for the fetch → enrich → write pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_api_url: String,
    pub page_size: usize,
    /// Records enriched concurrently.
    pub record_workers: usize,
    /// Safety cap on rows produced by one indexed mapping.
    pub max_indexed_rows: usize,
    pub snapshot_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            data_api_url: env_required("DATA_API_URL")?,
            page_size: env_usize("SYNC_PAGE_SIZE", 50).max(1),
            record_workers: env_usize("SYNC_RECORD_WORKERS", num_cpus::get().clamp(2, 8)).max(1),
            max_indexed_rows: env_usize("SYNC_MAX_INDEXED_ROWS", 50),
            snapshot_dir: env_path("SYNC_SNAPSHOT_DIR"),
        })
    }

    /// Defaults for a given listing endpoint, ignoring the environment.
    pub fn for_url(data_api_url: impl Into<String>) -> Self {
        Self {
            data_api_url: data_api_url.into(),
            page_size: 50,
            record_workers: 4,
            max_indexed_rows: 50,
            snapshot_dir: None,
        }
    }
}

/// Connection settings for the relational store.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_required("DATABASE_URL")?,
            max_connections: env_u32("SYNC_DB_MAX_CONNECTIONS", 5).max(1),
            acquire_timeout: env_duration_millis("SYNC_DB_ACQUIRE_TIMEOUT_MS", 30_000),
        })
    }
}

/// Location of a mapping document overriding the built-in booking mapping.
pub fn mapping_path_from_env() -> Option<PathBuf> {
    env_path("SYNC_MAPPING_PATH")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults_for_url() {
        let config = PipelineConfig::for_url("https://api.example.test/booking");
        assert_eq!(config.page_size, 50);
        assert_eq!(config.max_indexed_rows, 50);
        assert!(config.snapshot_dir.is_none());
    }

    #[test]
    fn missing_required_var_is_reported_by_name() {
        let err = env_required("BOOKING_SYNC_TEST_SURELY_UNSET").unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("BOOKING_SYNC_TEST_SURELY_UNSET")));
    }
}
