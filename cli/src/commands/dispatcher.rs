//! `editor-fleet dispatcher` - run the cluster dispatcher.

use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use editor_fleet_core::api;
use editor_fleet_core::cluster::Dispatcher;

use crate::commands::load_config;
use crate::error::CliError;

/// Arguments for the dispatcher entrypoint.
#[derive(Debug, Args)]
pub struct DispatcherArgs {
    /// Path to a configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Listen address override (host:port)
    #[arg(long)]
    pub listen: Option<String>,

    /// Routing strategy override
    #[arg(long)]
    pub routing_strategy: Option<String>,
}

/// Run the dispatcher until interrupted.
pub async fn execute(args: DispatcherArgs, _verbose: bool) -> Result<(), CliError> {
    let mut config = load_config(args.config.as_ref())?.dispatcher;

    if let Some(listen) = &args.listen {
        let (host, port) = parse_listen_address(listen)?;
        config.host = host;
        config.port = port;
    }
    if let Some(strategy) = &args.routing_strategy {
        config.routing_strategy = strategy
            .parse()
            .map_err(|err| CliError::config("invalid routing strategy", anyhow::Error::new(err)))?;
    }

    let address = config.listen_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::AddrInUse {
                CliError::AddressInUse { address: address.clone() }
            } else {
                CliError::Other(err.into())
            }
        })?;

    let dispatcher = Arc::new(Dispatcher::with_http_transport(config));
    let _loops = dispatcher.spawn_background_loops();
    info!(address = %address, cluster_id = %dispatcher.config().cluster_id, "dispatcher up");

    let serve_dispatcher = Arc::clone(&dispatcher);
    tokio::select! {
        result = api::serve(serve_dispatcher, listener) => {
            result.map_err(CliError::Other)?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            dispatcher.stop();
        }
    }
    Ok(())
}

pub(crate) fn parse_listen_address(listen: &str) -> Result<(String, u16), CliError> {
    let (host, port) = listen.rsplit_once(':').ok_or_else(|| CliError::Config {
        message: format!("invalid listen address '{listen}', expected host:port"),
        source: None,
    })?;
    let port = port.parse().map_err(|_| CliError::Config {
        message: format!("invalid port in listen address '{listen}'"),
        source: None,
    })?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_address() {
        assert_eq!(
            parse_listen_address("0.0.0.0:7400").unwrap(),
            ("0.0.0.0".to_string(), 7400)
        );
        assert!(parse_listen_address("no-port").is_err());
        assert!(parse_listen_address("host:notaport").is_err());
    }
}
