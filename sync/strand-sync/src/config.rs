///
/// # Synchronization Config
///
/// Construction parameters for the primitives that take any: the worker
/// pool size and thread name prefix, and the named lock's default timeout
/// and fairness policy. Every field has a default, so an empty file (or no
/// file at all) is a valid config.
///
/// ## Example strand.toml
///
/// ```toml
/// [pool]
/// workers = 8
/// name = "strand"
///
/// [rwlock]
/// default_timeout_ms = 120000
/// fairness = "reader-preferred"
/// ```
///
/// Omitting `default_timeout_ms` means guards taken with `NamedRwLock::guard`
/// wait indefinitely.
///

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::error::SyncError;
use crate::rwlock::Fairness;

const FALLBACK_WORKERS: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub rwlock: RwLockConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_pool_name")]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RwLockConfig {
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
    #[serde(default)]
    pub fairness: Fairness,
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKERS)
}

fn default_pool_name() -> String {
    "strand".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            name: default_pool_name(),
        }
    }
}

impl RwLockConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

impl SyncConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, SyncError> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let content = std::fs::read_to_string(path)?;
        let config: SyncConfig = toml::from_str(&content).map_err(|e| SyncError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.pool.workers == 0 {
            return Err(SyncError::InvalidWorkerCount { count: 0 });
        }
        Ok(())
    }
}
