//! Daemon configuration.
//!
//! A single YAML document (default `/etc/meshadmin-revertit/config.yaml`)
//! with four sections: `global`, `snapshot`, `monitoring`, `timeout`.
//! Invalid configuration is fatal at startup.

mod load;
mod schema;

pub use load::{load, load_or_init, write_config};
pub use schema::{
    Config, GlobalConfig, LogLevel, SnapshotConfig, TimeoutAction, TimeoutConfig,
};

use thiserror::Error;

/// Configuration errors. All of these are fatal at daemon startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("failed to write {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
