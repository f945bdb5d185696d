//! Store configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Tuning and policy knobs for one store instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Prefixes under which a delete of an unknown identifier still
    /// creates a tombstoned record
    pub always_delete_in_prefixes: Vec<String>,
    /// Maximum concurrently suspended long-poll connections
    pub max_suspended_connections: usize,
    /// Render datestamps with microsecond precision
    pub precise_datestamp: bool,
    /// Persistent deletes forbid purging (OAI-PMH "persistent" deletedRecord)
    pub persistent_delete: bool,
    /// Batch size used when a select query does not give one
    pub default_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            always_delete_in_prefixes: Vec::new(),
            max_suspended_connections: 100,
            precise_datestamp: false,
            persistent_delete: true,
            default_batch_size: 200,
        }
    }
}

/// Error loading a config file
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl StoreConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(ConfigError::Parse)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&contents)
    }
}
