//! Per-storage configuration loaded from `<prefix>/config.toml`.

use crate::core::error::TauError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.toml";
pub const LOCK_TIMEOUT_ENV: &str = "TAU_LOCK_TIMEOUT_SECS";
pub const LOG_ENV: &str = "TAU_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Seconds to wait for the interprocess lock before giving up.
    pub lock_timeout_secs: u64,
    /// A lock file older than this is treated as abandoned by a crashed process.
    pub stale_lock_secs: u64,
    /// Default tracing filter when `TAU_LOG` is unset.
    pub log_filter: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 120,
            stale_lock_secs: 3600,
            log_filter: "info".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }
}

/// Load configuration from a storage prefix. A missing file yields defaults.
pub fn load_config(prefix: &Path) -> Result<StoreConfig, TauError> {
    let path = prefix.join(CONFIG_FILE);
    let mut config = if path.exists() {
        let content = fs::read_to_string(&path)?;
        toml::from_str::<StoreConfig>(&content).map_err(|e| {
            TauError::configuration(
                format!("Invalid configuration file '{}': {}", path.display(), e),
                &["Fix or delete the configuration file and try again."],
            )
        })?
    } else {
        StoreConfig::default()
    };

    if let Some(secs) = std::env::var(LOCK_TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        config.lock_timeout_secs = secs;
    }
    Ok(config)
}
