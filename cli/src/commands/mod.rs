//! CLI subcommand implementations.

pub mod dispatcher;
pub mod job;
pub mod node;
pub mod stream;

use crate::error::CliError;
use editor_fleet_core::config::{Config, ConfigLoader};
use std::path::PathBuf;

/// Load the layered configuration, honoring an explicit `--config` file.
pub fn load_config(custom_file: Option<&PathBuf>) -> Result<Config, CliError> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = custom_file {
        loader = loader.with_file(path);
    }
    loader
        .load()
        .map_err(|err| CliError::config("failed to load configuration", err))
}
