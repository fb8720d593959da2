// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Protocol definitions for dispatcher-node and client-dispatcher exchanges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::types::{JobErrorKind, JobId, JobStatus, NodeId, NodeStatus};

/// Register a worker node with the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    /// Requested node id; the dispatcher assigns one when absent
    pub node_id: Option<NodeId>,
    /// Node network address (`host:port`)
    pub address: String,
    /// Declared capability tags
    pub capabilities: Vec<String>,
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
}

/// Registration outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    /// Registration success
    pub success: bool,
    /// The cluster this node joined
    pub cluster_id: String,
    /// The id the dispatcher recorded (may be freshly generated)
    pub node_id: NodeId,
    /// Interval at which the node is expected to heartbeat
    pub heartbeat_interval_seconds: u64,
}

/// Remove a node from the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterNodeRequest {
    /// The node to remove
    pub node_id: NodeId,
}

/// Unregistration outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterNodeResponse {
    /// Unregistration success
    pub success: bool,
}

/// Periodic node heartbeat.
///
/// Counters are informational; the dispatcher derives availability from its
/// own in-flight view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Reporting node
    pub node_id: NodeId,
    /// Jobs the node believes it is running
    pub active_jobs: usize,
    /// Jobs the node has completed since startup
    pub completed_jobs: u64,
    /// Jobs the node has failed since startup
    pub failed_jobs: u64,
    /// Node-local send time; out-of-order heartbeats are no-ops
    pub sent_at: DateTime<Utc>,
}

/// Heartbeat acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Dispatcher clock at receipt
    pub server_time: DateTime<Utc>,
    /// Interval the dispatcher expects between heartbeats
    pub expected_interval_seconds: u64,
}

/// Submit a job to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    /// Selects the bridge operation
    pub job_type: String,
    /// Opaque payload handed to the bridge
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Higher priority wins
    #[serde(default)]
    pub priority: i32,
    /// Optional URL to POST a terminal callback to
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Per-job override of the cluster retry cap
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl SubmitJobRequest {
    /// Create a submission builder.
    pub fn builder() -> SubmitJobRequestBuilder {
        SubmitJobRequestBuilder::default()
    }
}

/// Builder for [`SubmitJobRequest`].
#[derive(Debug, Default)]
pub struct SubmitJobRequestBuilder {
    job_type: Option<String>,
    payload: Option<serde_json::Value>,
    priority: i32,
    callback_url: Option<String>,
    max_retries: Option<u32>,
}

impl SubmitJobRequestBuilder {
    /// Set the job type.
    #[must_use]
    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the callback target.
    #[must_use]
    pub fn callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// Override the retry cap.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Build the request.
    pub fn build(self) -> SubmitJobRequest {
        SubmitJobRequest {
            job_type: self.job_type.unwrap_or_else(|| "execute_script".to_string()),
            payload: self.payload.unwrap_or_else(|| serde_json::json!({})),
            priority: self.priority,
            callback_url: self.callback_url,
            max_retries: self.max_retries,
        }
    }
}

/// Submission outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    /// Assigned job id
    pub job_id: JobId,
    /// Status at submission (always Queued)
    pub status: JobStatus,
    /// Rough completion hint; absent when no node is available
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Cancellation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelJobResponse {
    /// The cancelled job
    pub job_id: JobId,
    /// Final status after the call
    pub status: JobStatus,
    /// Set when the job was already terminal and the call changed nothing
    pub already_terminal: bool,
}

/// Aggregate cluster counters with an optional per-node breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatusResponse {
    /// Cluster identity
    pub cluster_id: String,
    /// Active routing policy name
    pub routing_strategy: String,
    /// Seconds since the dispatcher started
    pub uptime_seconds: u64,
    /// Registered nodes
    pub total_nodes: usize,
    /// Nodes currently accepting work
    pub available_nodes: usize,
    /// Jobs waiting in the queue
    pub queued_jobs: usize,
    /// Jobs currently Assigned or Running
    pub active_jobs: usize,
    /// Jobs completed since startup
    pub completed_jobs: u64,
    /// Jobs failed since startup
    pub failed_jobs: u64,
    /// Per-node detail, present when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeSummary>>,
}

/// Per-node status row in [`ClusterStatusResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    /// Node identity
    pub node_id: NodeId,
    /// Node address
    pub address: String,
    /// Lifecycle status
    pub status: NodeStatus,
    /// Jobs currently bound to the node
    pub active_jobs: usize,
    /// Capacity limit
    pub max_concurrent_jobs: usize,
    /// Load factor in `[0.0, 1.0]`
    pub load_factor: f64,
    /// Rolling average latency in seconds; absent with no samples
    pub average_latency: Option<f64>,
    /// Declared capability tags
    pub capabilities: Vec<String>,
    /// Most recent accepted heartbeat
    pub last_heartbeat: DateTime<Utc>,
}

impl NodeSummary {
    /// Build a summary row from a node record.
    pub fn from_node(node: &crate::cluster::types::Node) -> Self {
        let avg = node.average_latency();
        Self {
            node_id: node.id.clone(),
            address: node.address.clone(),
            status: node.status,
            active_jobs: node.active_jobs,
            max_concurrent_jobs: node.max_concurrent_jobs,
            load_factor: node.load_factor(),
            average_latency: avg.is_finite().then_some(avg),
            capabilities: node.capabilities.clone(),
            last_heartbeat: node.last_heartbeat,
        }
    }
}

/// Dispatch a job to a node for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteJobRequest {
    /// Job identity
    pub job_id: JobId,
    /// Selects the bridge operation
    pub job_type: String,
    /// Opaque payload
    pub payload: serde_json::Value,
    /// Priority, used by the node's local scheduler
    pub priority: i32,
    /// Callback target delivered by the node on terminal transition
    pub callback_url: Option<String>,
}

/// Node acknowledgment of an execute request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteJobResponse {
    /// Whether the node accepted the job
    pub accepted: bool,
    /// Rejection kind when not accepted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<JobErrorKind>,
    /// Human-readable context
    pub message: String,
}

/// Node report that execution began.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStartedReport {
    /// The job that started
    pub job_id: JobId,
    /// The executing node
    pub node_id: NodeId,
    /// Node-local start time
    pub started_at: DateTime<Utc>,
}

/// Node report of a terminal job outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultReport {
    /// The finished job
    pub job_id: JobId,
    /// The node that ran it
    pub node_id: NodeId,
    /// Whether the job completed successfully
    pub success: bool,
    /// Result payload on success
    pub result: Option<serde_json::Value>,
    /// Error kind on failure
    pub error_kind: Option<JobErrorKind>,
    /// Error message on failure
    pub error_message: Option<String>,
    /// Node-local completion time
    pub completed_at: DateTime<Utc>,
}

/// JSON body POSTed to a job's callback URL after a terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCallbackPayload {
    /// The finished job
    pub job_id: JobId,
    /// Terminal status
    pub status: JobStatus,
    /// Result payload, null unless Completed
    pub result: Option<serde_json::Value>,
    /// Error message, null unless Failed or Cancelled
    pub error: Option<String>,
    /// When execution began
    pub started_at: Option<DateTime<Utc>>,
    /// When the job finished
    pub completed_at: Option<DateTime<Utc>>,
    /// The node that ran the job
    pub node_id: NodeId,
}
