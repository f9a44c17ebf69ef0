//! Cache Configuration
//!
//! Loaded from a JSON file next to the persisted cache. Every field is
//! optional; missing fields fall back to the defaults below.

use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::remote::RetryPolicy;

/// Connection settings for the PostgREST-style remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    pub api_key: String,
    /// Session token of the signed-in user, if any
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which a slot is refreshed in the background
    pub stale_window_secs: u64,
    /// Max age of persisted slots and paused mutations
    pub retention_secs: u64,
    pub query_retries: u32,
    pub mutation_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Key of the persisted blob in durable storage
    pub storage_key: String,
    /// Persist in the background after every write and fetch
    pub auto_persist: bool,
    pub remote: Option<RemoteConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_window_secs: 5 * 60,
            retention_secs: 7 * 24 * 60 * 60,
            query_retries: 3,
            mutation_retries: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            storage_key: "budget-cache".to_string(),
            auto_persist: true,
            remote: None,
        }
    }
}

impl CacheConfig {
    /// Read config from `path`; a missing file yields the defaults
    pub fn from_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no cache config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(CacheError::Config(format!("{}: {}", path.display(), e))),
        };
        serde_json::from_str(&raw).map_err(|e| CacheError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn stale_window(&self) -> Duration {
        Duration::seconds(self.stale_window_secs as i64)
    }

    pub fn retention(&self) -> Duration {
        Duration::seconds(self.retention_secs as i64)
    }

    pub fn query_retry(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.query_retries,
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
        }
    }

    pub fn mutation_retry(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.mutation_retries,
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
        }
    }

    /// Config with retries that never sleep, for tests and tools
    pub fn without_backoff() -> Self {
        Self {
            retry_base_delay_ms: 0,
            retry_max_delay_ms: 0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache_config.json");
        std::fs::write(&path, r#"{"stale_window_secs": 60, "auto_persist": false}"#).unwrap();

        let config = CacheConfig::from_file(&path).unwrap();
        assert_eq!(config.stale_window(), Duration::minutes(1));
        assert!(!config.auto_persist);
        assert_eq!(config.retention(), Duration::days(7));
        assert_eq!(config.storage_key, "budget-cache");
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::from_file(dir.path().join("absent.json")).unwrap();
        assert_eq!(config, CacheConfig::default());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache_config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(CacheConfig::from_file(&path), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_retry_policies_share_backoff() {
        let config = CacheConfig {
            query_retries: 1,
            ..CacheConfig::default()
        };
        assert_eq!(config.query_retry().retries, 1);
        assert_eq!(config.mutation_retry().retries, 3);
        assert_eq!(config.query_retry().delay(1), config.mutation_retry().delay(1));
        assert!(CacheConfig::without_backoff().mutation_retry().delay(3).is_zero());
    }
}
