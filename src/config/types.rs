//! Configuration data model.
//!
//! Every section deserializes with field-level defaults, so an empty file
//! (or no file at all) yields [`Config::default`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::defaults::{
    DEFAULT_BASE_URL, DEFAULT_MAX_THREADS, DEFAULT_SANDBOX_COOLDOWN_MS, DEFAULT_STATE_DIR,
    DEFAULT_TIMEOUT_SECS, DEFAULT_USER_ID,
};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub threads: ThreadsConfig,
    pub log: LogConfig,
}

/// `[server]`: agent backend connection.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub base_url: String,
    pub user_id: String,
    /// Model requested for new runs; the server picks when unset.
    pub model: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_id: DEFAULT_USER_ID.to_string(),
            model: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// `[sandbox]`: play session behavior.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    pub cooldown_ms: u64,
    /// Runtime forced on every session; inferred from the entry file when unset.
    pub runtime: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: DEFAULT_SANDBOX_COOLDOWN_MS,
            runtime: None,
        }
    }
}

impl SandboxConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// `[threads]`: local persistence.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ThreadsConfig {
    pub max_threads: usize,
    pub state_dir: String,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            state_dir: DEFAULT_STATE_DIR.to_string(),
        }
    }
}

/// `[log]`: tracing filter used when `RUST_LOG` is unset.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub filter: Option<String>,
}
