//! Service configuration.
//!
//! Everything comes from `FORGE_*` environment variables plus an optional
//! JSON worker definition file that can be reloaded at runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::worker_manager::DEFAULT_PING_TIMEOUT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("failed to read worker definitions from {path}")]
    WorkersFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse worker definitions from {path}")]
    WorkersFormat {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Master service configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Default port specifier workers connect to, e.g. "tcp:9989".
    pub master_port: String,

    /// How long to wait for a ping from an old connection during duplicate
    /// arbitration.
    pub ping_timeout: Duration,

    /// Worker definition file, reloaded on SIGHUP.
    pub workers_file: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset.
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let master_port =
            std::env::var("FORGE_MASTER_PORT").unwrap_or_else(|_| "tcp:9989".to_string());

        let ping_timeout = match std::env::var("FORGE_PING_TIMEOUT_SECS") {
            Ok(value) => {
                let secs: u64 = value.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "FORGE_PING_TIMEOUT_SECS",
                    value,
                })?;
                Duration::from_secs(secs)
            }
            Err(_) => DEFAULT_PING_TIMEOUT,
        };

        let workers_file = std::env::var("FORGE_WORKERS_FILE").ok().map(PathBuf::from);

        let log_level = std::env::var("FORGE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            master_port,
            ping_timeout,
            workers_file,
            log_level,
        })
    }
}

/// One worker as declared in the definitions file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerDefinition {
    pub name: String,
    pub password: String,

    /// Per-worker port specifier; falls back to the master port.
    #[serde(default)]
    pub port: Option<String>,
}

/// Load worker definitions from a JSON array file.
pub fn load_worker_definitions(path: &Path) -> Result<Vec<WorkerDefinition>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::WorkersFile {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::WorkersFormat {
        path: path.display().to_string(),
        source,
    })
}
