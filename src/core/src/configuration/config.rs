use super::types::*;
use crate::error_handling::types::ConfigError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Daemon configuration, read once at startup from a TOML file.
///
/// Every section and field has a default, so a file only needs to carry what
/// differs from it (usually `[remote]`). The value is handed to each component
/// at construction; nothing reads it from global state.
///
/// ```toml
/// [remote]
/// url = "https://panel.example.com/"
/// token = "node-token"
///
/// [docker]
/// dns_servers = ["1.1.1.1"]
///
/// [console]
/// max_lines = 2000
/// eviction_batch = 1000
/// ```
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub docker: DockerConfig,
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub remote: RemoteConfig,
    pub console: ConsoleConfig,
    pub monitor: MonitorConfig,
}

impl Config {
    /// Reads and validates the configuration file at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations the daemon cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.url.trim().is_empty() {
            return Err(ConfigError::MissingValue(String::from("remote.url")));
        }
        if self.docker.binary.trim().is_empty() {
            return Err(ConfigError::MissingValue(String::from("docker.binary")));
        }
        if self.remote.page_size == 0 {
            return Err(ConfigError::NotInRange(String::from(
                "remote.page_size must be greater than 0",
            )));
        }
        if self.console.max_lines == 0 {
            return Err(ConfigError::NotInRange(String::from(
                "console.max_lines must be greater than 0",
            )));
        }
        if self.console.eviction_batch == 0 || self.console.eviction_batch > self.console.max_lines
        {
            return Err(ConfigError::NotInRange(format!(
                "console.eviction_batch must be between 1 and {}",
                self.console.max_lines
            )));
        }
        if self.console.replay_chunk_size == 0 {
            return Err(ConfigError::NotInRange(String::from(
                "console.replay_chunk_size must be greater than 0",
            )));
        }
        if self.console.viewer_queue == 0 {
            return Err(ConfigError::NotInRange(String::from(
                "console.viewer_queue must be greater than 0",
            )));
        }
        if self.server.memory_overhead_multiplier < 0.0 || self.server.swap_multiplier < 0.0 {
            return Err(ConfigError::NotInRange(String::from(
                "server multipliers must not be negative",
            )));
        }
        Ok(())
    }
}
