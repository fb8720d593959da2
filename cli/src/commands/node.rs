//! `editor-fleet node` - run a worker node.

use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use editor_fleet_core::bridge::SimulatedBridge;
use editor_fleet_core::cluster::types::ClusterError;
use editor_fleet_core::node::{server, NodeRuntime};

use crate::commands::load_config;
use crate::error::CliError;

/// Arguments for the node entrypoint.
#[derive(Debug, Args)]
pub struct NodeArgs {
    /// Path to a configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Dispatcher base URL override
    #[arg(long, env = "EDITOR_FLEET_DISPATCHER")]
    pub dispatcher: Option<String>,

    /// Listen address override (host:port)
    #[arg(long)]
    pub listen: Option<String>,

    /// Comma-separated capability tags override
    #[arg(long, value_delimiter = ',')]
    pub capabilities: Option<Vec<String>>,

    /// Maximum concurrent jobs override
    #[arg(long)]
    pub max_concurrent: Option<usize>,
}

/// Run a worker node until interrupted.
pub async fn execute(args: NodeArgs, _verbose: bool) -> Result<(), CliError> {
    let mut config = load_config(args.config.as_ref())?.node;

    if let Some(dispatcher) = args.dispatcher {
        config.dispatcher_address = dispatcher;
    }
    if let Some(listen) = &args.listen {
        let (host, port) = super::dispatcher::parse_listen_address(listen)?;
        config.host = host;
        config.port = port;
    }
    if let Some(capabilities) = args.capabilities {
        config.capabilities = capabilities;
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent_jobs = max_concurrent;
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

    let dispatcher_address = config.dispatcher_address.clone();
    let runtime = Arc::new(NodeRuntime::new(config, Arc::new(SimulatedBridge::new())));

    // The listener must serve before registration so the dispatcher can
    // reach the node as soon as it becomes a routing candidate.
    let serve_runtime = Arc::clone(&runtime);
    let server_task = tokio::spawn(async move { server::serve(serve_runtime, listener).await });

    if let Err(err) = runtime.start().await {
        server_task.abort();
        return Err(match err.downcast_ref::<ClusterError>() {
            Some(ClusterError::NodeUnreachable(_) | ClusterError::RpcTimeout(_)) => {
                CliError::DispatcherUnreachable {
                    address: dispatcher_address,
                    source: Some(err),
                }
            }
            _ => CliError::Other(err),
        });
    }
    info!(address = %address, node_id = %runtime.node_id(), "node up");

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| CliError::Other(err.into()))?;
    info!("interrupt received, shutting down");
    runtime.shutdown().await;
    server_task.abort();
    Ok(())
}
