//! core::config
//!
//! Engine configuration schema and loading.
//!
//! # Overview
//!
//! The engine takes a small amount of tuning configuration; everything else
//! (credentials, store location, module registration) is supplied by the
//! embedding application. Values are resolved in this order (later overrides
//! earlier):
//!
//! 1. Default values
//! 2. A TOML config file, when the embedder passes one
//!
//! # Example
//!
//! ```toml
//! batch_threshold = 500
//! save_on_commit = true
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Engine tuning configuration.
///
/// # Fields
///
/// - `batch_threshold`: maximum entries per commit batch (must be nonzero)
/// - `save_on_commit`: whether overlay commits are followed by a session
///   save; disabled only by tests that inspect intermediate state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Maximum number of entries per commit batch.
    pub batch_threshold: usize,
    /// Save the backing session after every overlay commit.
    pub save_on_commit: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_threshold: 500,
            save_on_commit: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the file cannot be read or parsed, or when
    /// a value fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|err| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "batch_threshold must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
