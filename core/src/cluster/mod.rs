// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Cluster control plane
//!
//! This module implements the dispatcher side of the cluster: a priority
//! queue of jobs, a registry of worker nodes, routing policies, and the
//! background loops that keep both healthy.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Dispatcher                             │
//! │  ┌────────────────┐  ┌────────────────┐  ┌───────────────┐  │
//! │  │  Job Queue     │  │  Node Registry │  │ Health Sweep  │  │
//! │  │  - Queued      │  │  - Healthy     │  │  - Heartbeat  │  │
//! │  │  - priorities  │  │  - Degraded    │  │  - Latency    │  │
//! │  │  - FIFO ties   │  │  - Unhealthy   │  │  - Deadlines  │  │
//! │  └────────────────┘  └────────────────┘  └───────────────┘  │
//! │           │                   │                  │          │
//! │           └───────────────────┼──────────────────┘          │
//! │                               │                             │
//! │                        HTTP RPC surface                     │
//! └───────────────────────────────┼─────────────────────────────┘
//!                                 │
//!          ┌──────────────────────┼──────────────────────┐
//!          │                      │                      │
//!          ▼                      ▼                      ▼
//!  ┌───────────────┐      ┌───────────────┐     ┌───────────────┐
//!  │   Node 1      │      │   Node 2      │     │   Node N      │
//!  │  - Executor   │      │  - Executor   │     │  - Executor   │
//!  │  - Bridge     │      │  - Bridge     │     │  - Bridge     │
//!  └───────────────┘      └───────────────┘     └───────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **At-most-once assignment**: a job is bound to one node at any instant
//! - **Requeue on failure**: node loss returns jobs to the queue with their
//!   original ordering key, up to a bounded retry budget
//! - **Capacity**: a node is never handed more jobs than it declared
//! - **Priority with FIFO ties**: higher priority first, then older first
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use editor_fleet_core::cluster::{Dispatcher, SubmitJobRequest};
//! use editor_fleet_core::config::DispatcherConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let dispatcher = Arc::new(Dispatcher::with_http_transport(DispatcherConfig::default()));
//! let handles = dispatcher.spawn_background_loops();
//!
//! let response = dispatcher.submit_job(
//!     SubmitJobRequest::builder()
//!         .job_type("open_file")
//!         .payload(serde_json::json!({"path": "/images/a.psd"}))
//!         .priority(5)
//!         .build(),
//! )?;
//! println!("queued {}", response.job_id);
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod health;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod transport;
pub mod types;

pub use dispatcher::{ClusterEvent, ClusterEventKind, Dispatcher, UNHEALTHY_PURGE_SECONDS};
pub use health::{cluster_median_latency, HealthPolicy, DEGRADED_FAILURE_RATE};
pub use protocol::{
    CancelJobResponse, ClusterStatusResponse, ExecuteJobRequest, ExecuteJobResponse,
    HeartbeatRequest, HeartbeatResponse, JobCallbackPayload, JobResultReport, JobStartedReport,
    NodeSummary, RegisterNodeRequest, RegisterNodeResponse, SubmitJobRequest, SubmitJobResponse,
    UnregisterNodeRequest, UnregisterNodeResponse,
};
pub use queue::{JobQueue, PopDecision};
pub use registry::NodeRegistry;
pub use transport::{HttpNodeTransport, NodeTransport, DEFAULT_RPC_TIMEOUT};
pub use types::{
    ClusterError, ClusterResult, Job, JobErrorKind, JobId, JobStatus, Node, NodeId, NodeStatus,
    RoutingPolicy,
};

// Re-exported so callers configuring a dispatcher need a single import path.
pub use crate::config::DispatcherConfig;
