//! Host configuration
//!
//! Built in code with the `with_*` methods or deserialised from a JSON
//! file. Every field has a default, so a partial file is fine:
//!
//! ```json
//! {
//!   "extensions_dir": "/var/lib/glint/extensions",
//!   "runtime_dir": "/var/lib/glint/runtime",
//!   "failure_threshold": 5,
//!   "tick_interval_secs": 30.0,
//!   "config": { "city": "Berlin" }
//! }
//! ```

use glint_ext_api::DEFAULT_API_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while reading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration of the extension runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Shared root: holds unit files and every extension's private folder
    pub extensions_dir: PathBuf,

    /// Read-only root for host runtime data
    pub runtime_dir: PathBuf,

    /// API version a unit must declare to be instantiated
    pub required_api_version: String,

    /// Platform string exposed to extensions
    pub platform: String,

    /// Configuration values exposed to extensions
    pub config: Map<String, Value>,

    /// Generic failures tolerated before an extension is disabled
    pub failure_threshold: u32,

    /// Interval between `on_tick` passes in [`crate::ExtensionManager::tick_loop`]
    pub tick_interval_secs: f64,

    /// Per-extension limit for one `on_tick` call
    pub tick_timeout_secs: Option<f64>,

    /// File name of per-extension storage inside the private root
    pub storage_file: String,

    /// Fuel granted to a wasm unit for each call
    pub wasm_fuel: u64,

    /// Extra guarded segment prefixes; `.env` is always guarded
    pub guarded_prefixes: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            extensions_dir: PathBuf::from("extensions"),
            runtime_dir: PathBuf::from("runtime"),
            required_api_version: DEFAULT_API_VERSION.to_string(),
            platform: std::env::consts::OS.to_string(),
            config: Map::new(),
            failure_threshold: 3,
            tick_interval_secs: 10.0,
            tick_timeout_secs: None,
            storage_file: "storage.json".to_string(),
            wasm_fuel: 10_000_000,
            guarded_prefixes: vec![".env".to_string()],
        }
    }
}

impl HostConfig {
    /// Create a configuration for the given shared and runtime roots
    pub fn new(extensions_dir: impl Into<PathBuf>, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            extensions_dir: extensions_dir.into(),
            runtime_dir: runtime_dir.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn with_required_api_version(mut self, version: impl Into<String>) -> Self {
        self.required_api_version = version.into();
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Set one configuration value exposed to extensions
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_secs = interval.as_secs_f64();
        self
    }

    pub fn with_tick_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tick_timeout_secs = timeout.map(|t| t.as_secs_f64());
        self
    }

    pub fn with_storage_file(mut self, name: impl Into<String>) -> Self {
        self.storage_file = name.into();
        self
    }

    pub fn with_wasm_fuel(mut self, fuel: u64) -> Self {
        self.wasm_fuel = fuel;
        self
    }

    pub fn with_guarded_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.guarded_prefixes = prefixes;
        self
    }

    /// Interval between tick passes (invalid values fall back to the default)
    pub fn tick_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.tick_interval_secs)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(10))
    }

    /// Per-call tick timeout, if any
    pub fn tick_timeout(&self) -> Option<Duration> {
        self.tick_timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// Get the default extensions directory for an application
///
/// `~/.local/share/<app>/extensions` on Linux, the platform equivalent
/// elsewhere.
pub fn default_extensions_dir(app_name: &str) -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join(app_name).join("extensions"))
}
