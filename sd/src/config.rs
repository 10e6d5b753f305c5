//! Configuration types and loading

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::keystore::{DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES, RetryPolicy, is_store_url};
use crate::lifecycle::WorkerSettings;
use crate::revoked::{DEFAULT_REVOKE_EXPIRES, DEFAULT_REVOKES_MAX, MAX_REVOKE_EXPIRES, RevokedTaskSet};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store connection and retry settings
    pub store: StoreConfig,

    /// Periodic sync
    pub sync: SyncConfig,

    /// Bounds for the in-memory revoked set
    pub revokes: RevokesConfig,
}

impl Config {
    /// Check settings that would otherwise fail later and less clearly
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.retry_base_delay_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store.retry-base-delay-ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if let Some(url) = &self.store.url {
            if !is_store_url(url) {
                return Err(ConfigError::UnsupportedScheme(url.clone()));
            }
        }
        if Duration::from_secs(self.revokes.expires_secs) > MAX_REVOKE_EXPIRES {
            return Err(ConfigError::InvalidValue {
                field: "revokes.expires-secs",
                reason: format!("must be at most {}", MAX_REVOKE_EXPIRES.as_secs()),
            });
        }
        if self.sync.interval_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "sync.interval-secs",
                reason: "must be greater than zero; omit it to disable periodic sync".to_string(),
            });
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `./statedb.yml`, then `~/.config/statedb/statedb.yml`,
    /// then defaults. Only an explicit path that fails to load is an error.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self, ConfigError> {
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        let local_config = PathBuf::from("statedb.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("statedb").join("statedb.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    /// Lifecycle settings for the named worker
    pub fn worker_settings(&self, hostname: impl Into<String>) -> WorkerSettings {
        let mut settings = WorkerSettings::new(hostname);
        settings.statedb = self.store.statedb.clone();
        settings.redis_statedb = self.store.url.clone();
        settings.key_prefix = self.store.key_prefix.clone();
        settings.retry = self.store.retry_policy();
        settings.connect_timeout = Duration::from_millis(self.store.connect_timeout_ms);
        settings.response_timeout = Duration::from_millis(self.store.response_timeout_ms);
        settings.migrate_statedb = self.store.migrate_statedb.clone();
        settings
    }
}

/// Store connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Dedicated store URL; wins over `statedb`
    pub url: Option<String>,

    /// Generic state database target, which may also be a local path
    pub statedb: Option<String>,

    /// Base key prefix; `STATEDB_KEY_PREFIX` overrides it
    #[serde(rename = "key-prefix")]
    pub key_prefix: Option<String>,

    /// Retries after the first attempt
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Delay before the first retry; doubles each retry
    #[serde(rename = "retry-base-delay-ms")]
    pub retry_base_delay_ms: u64,

    #[serde(rename = "connect-timeout-ms")]
    pub connect_timeout_ms: u64,

    #[serde(rename = "response-timeout-ms")]
    pub response_timeout_ms: u64,

    /// Legacy state file imported at worker startup
    #[serde(rename = "migrate-statedb")]
    pub migrate_statedb: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            statedb: None,
            key_prefix: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            connect_timeout_ms: 5_000,
            response_timeout_ms: 5_000,
            migrate_statedb: None,
        }
    }
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_base_delay_ms))
    }
}

/// Periodic sync configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between background syncs; off when absent
    #[serde(rename = "interval-secs")]
    pub interval_secs: Option<u64>,
}

impl SyncConfig {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs.map(Duration::from_secs)
    }
}

/// Revoked set bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevokesConfig {
    /// Maximum entries kept; 0 for unbounded
    pub max: usize,

    /// Entry lifetime in seconds; 0 for no expiry
    #[serde(rename = "expires-secs")]
    pub expires_secs: u64,
}

impl Default for RevokesConfig {
    fn default() -> Self {
        Self {
            max: DEFAULT_REVOKES_MAX,
            expires_secs: DEFAULT_REVOKE_EXPIRES.as_secs(),
        }
    }
}

impl RevokesConfig {
    /// An empty set with these bounds
    pub fn new_set(&self) -> RevokedTaskSet {
        let expires = (self.expires_secs > 0).then(|| Duration::from_secs(self.expires_secs));
        RevokedTaskSet::new(self.max, expires)
    }
}
