//! Configuration management for Editor Fleet
//!
//! This module provides a hierarchical configuration system with the
//! following precedence:
//! 1. CLI arguments (highest priority)
//! 2. Environment variables (prefixed with `EDITOR_FLEET_`)
//! 3. Config files (`~/.config/editor-fleet/config.toml`)
//! 4. Defaults (lowest priority)
//!
//! # Examples
//!
//! ```no_run
//! use editor_fleet_core::config::ConfigLoader;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Load configuration with all sources
//! let config = ConfigLoader::new().load()?;
//!
//! // Load from a specific file
//! let config = ConfigLoader::new()
//!     .with_file("/path/to/config.toml")
//!     .load()?;
//! # Ok(())
//! # }
//! ```

pub mod models;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File};
use serde_valid::Validate;
use std::path::{Path, PathBuf};

pub use models::{Config, DispatcherConfig, NodeConfig};

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default configuration directory name
const CONFIG_DIR_NAME: &str = "editor-fleet";

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "EDITOR_FLEET";

/// Environment variable separator for nested configuration
/// Example: `EDITOR_FLEET_DISPATCHER__ROUTING_STRATEGY`
const ENV_SEPARATOR: &str = "__";

/// Configuration loader with builder pattern.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Optional custom configuration file path
    custom_file: Option<PathBuf>,
    /// Whether to skip loading from the default config file
    skip_default_file: bool,
    /// Whether to skip loading from environment variables
    skip_env: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Specify a custom configuration file path, used in addition to (and
    /// overriding) the default file location.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.custom_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip loading from the default configuration file.
    #[must_use]
    pub fn skip_default_file(mut self) -> Self {
        self.skip_default_file = true;
        self
    }

    /// Skip loading from environment variables.
    #[must_use]
    pub fn skip_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Load the configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error when a config file cannot be parsed, an environment
    /// override has the wrong shape, or validation rejects a value.
    pub fn load(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::builder();

        if !self.skip_default_file {
            if let Some(config_path) = Self::find_default_file() {
                tracing::debug!("Loading config from: {}", config_path.display());
                builder = builder.add_source(
                    File::from(config_path)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        if let Some(ref custom_path) = self.custom_file {
            builder = builder.add_source(
                File::from(custom_path.as_path())
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        if !self.skip_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            );
        }

        let merged = builder.build().context("failed to assemble configuration")?;

        // Missing sections and keys fall back to the serde defaults.
        let config: Config = merged
            .try_deserialize()
            .context("failed to parse configuration")?;

        config
            .validate()
            .context("configuration failed validation")?;

        Ok(config)
    }

    /// Locate the default config file, if any.
    fn find_default_file() -> Option<PathBuf> {
        let path = dirs::config_dir()?.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
        path.exists().then_some(path)
    }
}
