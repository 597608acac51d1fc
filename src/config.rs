//! Terminal configuration.
//!
//! Loaded from an optional JSON file, then overridden by `POS_*`
//! environment variables:
//!
//! | variable                   | field                  |
//! |----------------------------|------------------------|
//! | `POS_SERVER_URL`           | `server_url`           |
//! | `POS_API_KEY`              | `api_key`              |
//! | `POS_DATA_DIR`             | `data_dir`             |
//! | `POS_PROBE_INTERVAL_SECS`  | `probe_interval_secs`  |
//! | `POS_PROBE_TIMEOUT_SECS`   | `probe_timeout_secs`   |
//! | `POS_REQUEST_TIMEOUT_SECS` | `request_timeout_secs` |
//! | `POS_DRAIN_INTERVAL_SECS`  | `drain_interval_secs`  |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::api;
use crate::error::{CoreError, CoreResult};

const DEFAULT_PROBE_INTERVAL_SECS: u64 = 20;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 15;
const DEFAULT_STUCK_AFTER_ATTEMPTS: i64 = 5;

fn default_data_dir() -> PathBuf {
    PathBuf::from("./pos-data")
}

fn default_probe_interval() -> u64 {
    DEFAULT_PROBE_INTERVAL_SECS
}

fn default_probe_timeout() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_drain_interval() -> u64 {
    DEFAULT_DRAIN_INTERVAL_SECS
}

fn default_stuck_after() -> i64 {
    DEFAULT_STUCK_AFTER_ATTEMPTS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Base URL of the POS server API, e.g. `https://pos.example.com/api`.
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,
    /// Failed drain attempts after which a pending entry is reported as stuck.
    #[serde(default = "default_stuck_after")]
    pub stuck_after_attempts: i64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            api_key: None,
            data_dir: default_data_dir(),
            probe_interval_secs: DEFAULT_PROBE_INTERVAL_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            drain_interval_secs: DEFAULT_DRAIN_INTERVAL_SECS,
            stuck_after_attempts: DEFAULT_STUCK_AFTER_ATTEMPTS,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_secs(key: &str) -> Option<u64> {
    let raw = env_string(key)?;
    match raw.parse::<u64>() {
        Ok(v) if v > 0 => Some(v),
        _ => {
            warn!(key, value = %raw, "ignoring invalid duration override");
            None
        }
    }
}

impl CoreConfig {
    /// Load from `path` (if given and present), apply environment overrides,
    /// normalize and validate.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                let parsed: CoreConfig = serde_json::from_str(&raw)
                    .map_err(|e| CoreError::Config(format!("{}: {e}", p.display())))?;
                info!("Loaded config from {}", p.display());
                parsed
            }
            Some(p) => {
                warn!("Config file {} not found, using defaults", p.display());
                CoreConfig::default()
            }
            None => CoreConfig::default(),
        };

        config.apply_env();
        config.finish()
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("POS_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = env_string("POS_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = env_string("POS_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_secs("POS_PROBE_INTERVAL_SECS") {
            self.probe_interval_secs = v;
        }
        if let Some(v) = env_secs("POS_PROBE_TIMEOUT_SECS") {
            self.probe_timeout_secs = v;
        }
        if let Some(v) = env_secs("POS_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = v;
        }
        if let Some(v) = env_secs("POS_DRAIN_INTERVAL_SECS") {
            self.drain_interval_secs = v;
        }
    }

    /// Normalize the server URL and reject configs the engine cannot run with.
    pub fn finish(mut self) -> CoreResult<Self> {
        if self.server_url.trim().is_empty() {
            return Err(CoreError::Config(
                "server_url is not set (config file or POS_SERVER_URL)".into(),
            ));
        }
        self.server_url = api::normalize_base_url(&self.server_url);
        self.api_key = self
            .api_key
            .take()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        if self.probe_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(CoreError::Config("timeouts must be greater than zero".into()));
        }
        Ok(self)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
