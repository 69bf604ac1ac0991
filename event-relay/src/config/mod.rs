//! Host configuration.
//!
//! The relay is configured from a single JSON document. Receiver entries are kept as
//! raw JSON here and parsed one by one by the receiver factory, so a malformed entry
//! only disables itself.

mod secret;

pub use secret::{REDACTED_SECRET_MASK, Secret};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

/// Environment variable selecting the configuration file.
pub const CONFIG_PATH_ENV: &str = "EVENT_RELAY_CONFIG";
/// Environment variable overriding `logging.directory`.
pub const LOG_DIR_ENV: &str = "EVENT_RELAY_LOG_DIR";
/// Configuration file used when [`CONFIG_PATH_ENV`] is not set.
pub const DEFAULT_CONFIG_PATH: &str = "./event-relay.json";

fn default_environment_name() -> String {
    "local".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_retention_days() -> i64 {
    7
}

/// Logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingOptions {
    /// Directory for daily rolling log files. Console only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Emit JSON lines instead of the human readable format.
    #[serde(default)]
    pub json: bool,
    /// Rolled log files older than this are deleted.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Filter directive used when `RUST_LOG` is not set.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            directory: None,
            json: false,
            retention_days: default_retention_days(),
            filter: None,
        }
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Deployment name, attached to the startup log line.
    #[serde(default = "default_environment_name")]
    pub environment_name: String,
    /// Time given to receivers to drain before in-flight actions are cancelled.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub logging: LoggingOptions,
    /// Receiver entries, each tagged by `type`.
    #[serde(default)]
    pub receivers: Vec<Value>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            environment_name: default_environment_name(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            logging: LoggingOptions::default(),
            receivers: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Parse a configuration document.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::config(format!("invalid configuration: {e}")))
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading configuration", path, e))?;
        let config = Self::from_json(&raw)?;
        debug!(path = %path.display(), receivers = config.receivers.len(), "Loaded configuration");
        Ok(config)
    }

    /// Load the file named by `EVENT_RELAY_CONFIG` and apply environment overrides.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(Path::new(&path))?;
        config.apply_overrides(std::env::var(LOG_DIR_ENV).ok());
        Ok(config)
    }

    fn apply_overrides(&mut self, log_dir: Option<String>) {
        if let Some(dir) = log_dir.filter(|d| !d.trim().is_empty()) {
            self.logging.directory = Some(PathBuf::from(dir));
        }
    }
}
