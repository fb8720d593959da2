// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Transport seam between the dispatcher and worker nodes.
//!
//! The dispatch loop talks to nodes exclusively through [`NodeTransport`],
//! so tests can substitute an in-memory implementation and the production
//! HTTP client stays at the edge.

use async_trait::async_trait;
use std::time::{Duration, Instant};

use crate::cluster::protocol::{ExecuteJobRequest, ExecuteJobResponse};
use crate::cluster::types::{ClusterError, ClusterResult, JobId, NodeId};

/// Default deadline for control-plane RPCs.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Dispatcher-side view of the RPCs a node serves.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Hand a job to a node for execution.
    async fn execute(
        &self,
        node_id: NodeId,
        address: String,
        request: ExecuteJobRequest,
    ) -> ClusterResult<ExecuteJobResponse>;

    /// Best-effort cancellation of an in-flight job.
    async fn cancel(&self, node_id: NodeId, address: String, job_id: JobId) -> ClusterResult<()>;

    /// Liveness probe; returns the observed round-trip latency.
    async fn probe(&self, node_id: NodeId, address: String) -> ClusterResult<Duration>;
}

/// HTTP implementation of [`NodeTransport`] against the node's listener.
#[derive(Debug, Clone)]
pub struct HttpNodeTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpNodeTransport {
    /// Create a transport with the given per-call deadline.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn url(address: &str, path: &str) -> String {
        format!("http://{address}{path}")
    }

    fn map_error(node_id: &NodeId, context: &str, err: &reqwest::Error) -> ClusterError {
        if err.is_timeout() {
            ClusterError::RpcTimeout(format!("{context} to node {node_id}"))
        } else if err.is_connect() {
            ClusterError::NodeUnreachable(format!("{context} to node {node_id}: {err}"))
        } else {
            ClusterError::TransportDropped(format!("{context} to node {node_id}: {err}"))
        }
    }
}

impl Default for HttpNodeTransport {
    fn default() -> Self {
        Self::new(DEFAULT_RPC_TIMEOUT)
    }
}

#[async_trait]
impl NodeTransport for HttpNodeTransport {
    async fn execute(
        &self,
        node_id: NodeId,
        address: String,
        request: ExecuteJobRequest,
    ) -> ClusterResult<ExecuteJobResponse> {
        let response = self
            .client
            .post(Self::url(&address, "/execute"))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::map_error(&node_id, "execute", &e))?;

        response
            .json::<ExecuteJobResponse>()
            .await
            .map_err(|e| Self::map_error(&node_id, "execute response", &e))
    }

    async fn cancel(&self, node_id: NodeId, address: String, job_id: JobId) -> ClusterResult<()> {
        self.client
            .post(Self::url(&address, &format!("/cancel/{job_id}")))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Self::map_error(&node_id, "cancel", &e))?;
        Ok(())
    }

    async fn probe(&self, node_id: NodeId, address: String) -> ClusterResult<Duration> {
        let started = Instant::now();
        let response = self
            .client
            .get(Self::url(&address, "/healthz"))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Self::map_error(&node_id, "probe", &e))?;

        if response.status().is_success() {
            Ok(started.elapsed())
        } else {
            Err(ClusterError::NodeUnreachable(format!(
                "probe to node {node_id}: status {}",
                response.status()
            )))
        }
    }
}
