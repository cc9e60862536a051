//! Client configuration.
//!
//! Settings come from, in increasing priority: built-in defaults, the JSON
//! file at `<config_dir>/plremote/config.json`, and `PLREMOTE_*` environment
//! variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Options applied when a connection is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Shell command used to launch a server.
    pub command: String,
    /// Deadline of the liveness probe, in milliseconds.
    pub ping_timeout_ms: u64,
    /// Clear the serializer's copies map before each call.
    pub clear_maps: bool,
    /// Ask the server to switch to binary mode during the handshake.
    pub binary_mode: bool,
    /// Call `implicit_storage(true)` during the handshake.
    pub implicit_storage: bool,
    /// Attempts made by `Connection::connect_with_retry`.
    pub connect_attempts: u32,
    /// Log every request and reply at debug level.
    pub log_traffic: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command: "plearn server".to_string(),
            ping_timeout_ms: 2000,
            clear_maps: true,
            binary_mode: true,
            implicit_storage: true,
            connect_attempts: 1,
            log_traffic: false,
        }
    }
}

impl ClientConfig {
    /// Loads the user config file, if any, then applies environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let mut config = match default_config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Using config file: {}", path.display());
                Self::from_file(&path)?
            }
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parses a JSON object; missing fields keep their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse client config JSON")
    }

    /// Applies `PLREMOTE_COMMAND`, `PLREMOTE_PING_TIMEOUT_MS` and
    /// `PLREMOTE_LOG_TRAFFIC` as returned by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(command) = lookup("PLREMOTE_COMMAND") {
            self.command = command;
        }
        if let Some(ms) = lookup("PLREMOTE_PING_TIMEOUT_MS") {
            self.ping_timeout_ms = ms
                .trim()
                .parse()
                .with_context(|| format!("PLREMOTE_PING_TIMEOUT_MS is not a number: {:?}", ms))?;
        }
        if let Some(flag) = lookup("PLREMOTE_LOG_TRAFFIC") {
            self.log_traffic = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        Ok(())
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// `<config_dir>/plremote/config.json`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("plremote").join("config.json"))
}
