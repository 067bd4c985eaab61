//! TOML configuration for the `duratask` binary.
//!
//! ```toml
//! [storage]
//! database = "data/duratask.db"
//!
//! [blob_store]
//! root = "data/blobs"
//! container = "durable"
//!
//! [runtime]
//! worker_concurrency = 8
//! activity_max_attempts = 5
//! activity_timeout_ms = 30000
//! ```
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::blob_store::BlobStoreConfig;
use crate::runtime::{BackoffStrategy, RetryPolicy, RuntimeOptions};

#[derive(Debug)]
pub enum ConfigError {
    Read { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: toml::de::Error },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => write!(f, "cannot read {}: {source}", path.display()),
            ConfigError::Parse { path, source } => write!(f, "invalid config {}: {source}", path.display()),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub blob_store: BlobStoreConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("data/duratask.db"),
        }
    }
}

impl StorageConfig {
    pub fn database_url(&self) -> String {
        format!("sqlite:{}", self.database.display())
    }
}

/// Runtime knobs; unset fields keep [`RuntimeOptions::default`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub dispatcher_idle_sleep_ms: Option<u64>,
    pub orchestration_concurrency: Option<usize>,
    pub worker_concurrency: Option<usize>,
    pub orchestrator_lock_timeout_ms: Option<u64>,
    pub worker_lock_timeout_ms: Option<u64>,
    pub activity_max_attempts: Option<u32>,
    pub activity_timeout_ms: Option<u64>,
    pub activity_backoff_base_ms: Option<u64>,
    pub activity_backoff_max_ms: Option<u64>,
}

impl AppConfig {
    /// Load from `path`; a missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(target: "duratask::config", path = %path.display(), "No config file; using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Build [`RuntimeOptions`] from the `[runtime]` table.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for zero attempts or zero concurrency.
    pub fn runtime_options(&self) -> Result<RuntimeOptions, ConfigError> {
        let rc = &self.runtime;
        let mut opts = RuntimeOptions::default();
        if let Some(ms) = rc.dispatcher_idle_sleep_ms {
            opts.dispatcher_idle_sleep_ms = ms;
        }
        if let Some(n) = rc.orchestration_concurrency {
            if n == 0 {
                return Err(ConfigError::Invalid("orchestration_concurrency must be at least 1".into()));
            }
            opts.orchestration_concurrency = n;
        }
        if let Some(n) = rc.worker_concurrency {
            if n == 0 {
                return Err(ConfigError::Invalid("worker_concurrency must be at least 1".into()));
            }
            opts.worker_concurrency = n;
        }
        if let Some(ms) = rc.orchestrator_lock_timeout_ms {
            opts.orchestrator_lock_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = rc.worker_lock_timeout_ms {
            opts.worker_lock_timeout = Duration::from_millis(ms);
        }

        let mut retry = match rc.activity_max_attempts {
            Some(0) => return Err(ConfigError::Invalid("activity_max_attempts must be at least 1".into())),
            Some(n) => RetryPolicy::new(n),
            None => RetryPolicy::default(),
        };
        if let Some(ms) = rc.activity_timeout_ms {
            retry = retry.with_timeout(Duration::from_millis(ms));
        }
        if rc.activity_backoff_base_ms.is_some() || rc.activity_backoff_max_ms.is_some() {
            let base = Duration::from_millis(rc.activity_backoff_base_ms.unwrap_or(100));
            let max = Duration::from_millis(rc.activity_backoff_max_ms.unwrap_or(30_000));
            retry = retry.with_backoff(BackoffStrategy::Exponential {
                base,
                multiplier: 2.0,
                max,
            });
        }
        opts.activity_retry = retry;
        Ok(opts)
    }
}
