use colored::Colorize;
use thiserror::Error;

/// CLI errors mapped onto the documented process exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// The dispatcher could not be reached at startup
    #[error("Dispatcher unreachable at {address}")]
    DispatcherUnreachable {
        address: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// The listen address is already taken
    #[error("Address already in use: {address}")]
    AddressInUse { address: String },

    /// Any other failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// The process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => exit_codes::CONFIG_ERROR,
            Self::DispatcherUnreachable { .. } => exit_codes::DISPATCHER_UNREACHABLE,
            Self::AddressInUse { .. } => exit_codes::ADDRESS_IN_USE,
            Self::Other(_) => exit_codes::CONFIG_ERROR,
        }
    }

    /// Print the error with its cause chain.
    pub fn print_error(&self, verbose: bool) {
        eprintln!("{} {}", "Error:".red().bold(), self);
        if verbose {
            let mut source = std::error::Error::source(self);
            if source.is_some() {
                eprintln!("\nCaused by:");
            }
            while let Some(err) = source {
                eprintln!("  {err}");
                source = err.source();
            }
        }
    }
}

/// Wrap a reqwest failure, detecting an unreachable dispatcher.
pub fn map_dispatcher_error(address: &str, err: reqwest::Error) -> CliError {
    if err.is_connect() || err.is_timeout() {
        CliError::DispatcherUnreachable {
            address: address.to_string(),
            source: Some(err.into()),
        }
    } else {
        CliError::Other(err.into())
    }
}

/// Process exit codes.
pub mod exit_codes {
    /// Clean shutdown
    pub const SUCCESS: i32 = 0;

    /// Configuration error (also general failures)
    pub const CONFIG_ERROR: i32 = 1;

    /// Dispatcher unreachable at startup
    pub const DISPATCHER_UNREACHABLE: i32 = 2;

    /// Listen address already in use
    pub const ADDRESS_IN_USE: i32 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let config = CliError::Config {
            message: "bad toml".to_string(),
            source: None,
        };
        assert_eq!(config.exit_code(), 1);

        let unreachable = CliError::DispatcherUnreachable {
            address: "http://localhost:7400".to_string(),
            source: None,
        };
        assert_eq!(unreachable.exit_code(), 2);

        let in_use = CliError::AddressInUse {
            address: "127.0.0.1:7400".to_string(),
        };
        assert_eq!(in_use.exit_code(), 3);
    }
}
