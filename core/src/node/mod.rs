// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Worker node runtime
//!
//! A node owns one editor process (through a [`crate::bridge::EditorBridge`])
//! and executes jobs the dispatcher assigns to it. On startup it opens its
//! HTTP listener, dials the dispatcher and registers; it then heartbeats on
//! an interval and schedules accepted jobs locally in priority order under
//! the configured concurrency cap. On shutdown it cancels its active jobs
//! with `node-shutdown` and unregisters.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use editor_fleet_core::bridge::SimulatedBridge;
//! use editor_fleet_core::config::NodeConfig;
//! use editor_fleet_core::node::{server, NodeRuntime};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = NodeConfig::default();
//! let address = config.listen_address();
//! let runtime = Arc::new(NodeRuntime::new(config, Arc::new(SimulatedBridge::new())));
//! runtime.start().await?;
//!
//! let listener = tokio::net::TcpListener::bind(&address).await?;
//! server::serve(runtime, listener).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod executor;
pub mod runtime;
pub mod server;

pub use client::DispatcherClient;
pub use executor::JobExecutor;
pub use runtime::{LocalJob, NodeRuntime, NodeStats};

// Re-exported so callers configuring a node need a single import path.
pub use crate::config::NodeConfig;
