use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of resident ledger entries before LRU eviction kicks in.
    pub capacity: usize,
    pub flush_interval_secs: u64,
    /// Extra store attempts after the first failed one.
    pub flush_retries: u32,
    pub flush_retry_delay_ms: u64,
    /// Upper bound on every persistence call.
    pub store_timeout_ms: u64,
    /// How many different users a sweep flushes at once.
    pub flush_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            flush_interval_secs: 60,
            flush_retries: 1,
            flush_retry_delay_ms: 2_000,
            store_timeout_ms: 10_000,
            flush_concurrency: 4,
        }
    }
}

impl CacheConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn flush_retry_delay(&self) -> Duration {
        Duration::from_millis(self.flush_retry_delay_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub retention_days: u32,
    pub max_records: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            max_records: 1_000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    File {
        dir: PathBuf,
    },
    Sqlite {
        path: PathBuf,
    },
    Redis {
        url: String,
        #[serde(default = "default_redis_prefix")]
        prefix: String,
    },
}

fn default_redis_prefix() -> String {
    "credit_ledger".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub cache: CacheConfig,
    pub retention: RetentionConfig,
    pub low_balance_floor: u64,
    /// Starter credits granted once per user; zero disables the grant.
    pub seed_balance: u64,
    pub store: StoreConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            retention: RetentionConfig::default(),
            low_balance_floor: 100,
            seed_balance: 0,
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse toml config failed: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("parse json config failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("store backend unavailable: {0}")]
    Store(String),
}

impl LedgerConfig {
    /// Loads a `.json` file as JSON and anything else as TOML, then validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&raw)?,
            _ => toml::from_str(&raw)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be > 0".to_string()));
        }
        if self.cache.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.flush_interval_secs must be > 0".to_string(),
            ));
        }
        if self.cache.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "cache.store_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.cache.flush_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "cache.flush_concurrency must be > 0".to_string(),
            ));
        }
        if self.retention.max_records == 0 {
            return Err(ConfigError::Invalid(
                "retention.max_records must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
