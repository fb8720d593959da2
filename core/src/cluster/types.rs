// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core types for the cluster control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Node identifier
pub type NodeId = String;

/// Job identifier
pub type JobId = String;

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Number of latency samples and job outcomes retained per node
pub const NODE_HISTORY_LEN: usize = 10;

/// Errors surfaced by the dispatcher RPC surface.
///
/// Each variant maps to a stable wire kind (see [`ClusterError::kind`]);
/// clients distinguish retryable from non-retryable failures by kind alone.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ClusterError {
    /// Malformed or unprocessable request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown node or job id
    #[error("not found: {0}")]
    NotFound(String),

    /// Cancel or mutate attempted on a job already in a terminal state
    #[error("job {job_id} is already terminal ({status})")]
    AlreadyTerminal {
        /// The job in question
        job_id: JobId,
        /// Its current terminal status
        status: JobStatus,
    },

    /// Job type the target node does not claim to support
    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// Submission rejected because the waiting set is at capacity
    #[error("queue full: {0} jobs queued")]
    QueueFull(usize),

    /// Another registered node already owns the address
    #[error("address conflict: {0}")]
    AddressConflict(String),

    /// Connection to a node could not be established
    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    /// An RPC did not complete within its deadline
    #[error("rpc timeout: {0}")]
    RpcTimeout(String),

    /// The transport dropped mid-exchange
    #[error("transport dropped: {0}")]
    TransportDropped(String),

    /// Invariant violation; logged with context, never retried
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Stable wire identifier for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad-request",
            Self::NotFound(_) => "not-found",
            Self::AlreadyTerminal { .. } => "already-terminal",
            Self::UnsupportedCapability(_) => "unsupported-capability",
            Self::QueueFull(_) => "queue-full",
            Self::AddressConflict(_) => "address-conflict",
            Self::NodeUnreachable(_) => "node-unreachable",
            Self::RpcTimeout(_) => "rpc-timeout",
            Self::TransportDropped(_) => "transport-dropped",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the dispatcher may retry the assignment that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NodeUnreachable(_) | Self::RpcTimeout(_) | Self::TransportDropped(_)
        )
    }
}

/// Terminal error kinds recorded on a failed or cancelled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobErrorKind {
    /// The editor bridge reported a failure
    BridgeFailed,
    /// The job was cancelled cooperatively
    Cancelled,
    /// The job exceeded its deadline before completing
    DeadlineExceeded,
    /// The retry budget was exhausted after repeated node loss
    RetriesExhausted,
    /// The owning node shut down while the job was active
    NodeShutdown,
    /// The node did not claim the capability required by the job type
    UnsupportedCapability,
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BridgeFailed => write!(f, "bridge-failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline-exceeded"),
            Self::RetriesExhausted => write!(f, "retries-exhausted"),
            Self::NodeShutdown => write!(f, "node-shutdown"),
            Self::UnsupportedCapability => write!(f, "unsupported-capability"),
        }
    }
}

/// Node lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Registered but not yet probed
    Unknown,
    /// Live and accepting work
    Healthy,
    /// Live but slow or error-prone; still accepts work
    Degraded,
    /// Heartbeat older than the node timeout
    Unhealthy,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the priority queue
    Queued,
    /// Bound to a node, not yet acknowledged as running
    Assigned,
    /// Executing on a node
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled before completion
    Cancelled,
}

impl JobStatus {
    /// Terminal states are absorbing: no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Assigned => write!(f, "assigned"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Cluster-wide node selection rule.
///
/// Exactly one policy is active per cluster; every policy breaks ties by
/// lower node id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Minimum load factor
    #[default]
    LeastBusy,
    /// Monotonically advancing index over the available candidates
    RoundRobin,
    /// Uniform over the candidate set
    Random,
    /// Minimum rolling average latency; empty history counts as +inf
    LowestLatency,
    /// Capability subset match, then least busy
    CapabilityBased,
}

impl fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeastBusy => write!(f, "least_busy"),
            Self::RoundRobin => write!(f, "round_robin"),
            Self::Random => write!(f, "random"),
            Self::LowestLatency => write!(f, "lowest_latency"),
            Self::CapabilityBased => write!(f, "capability_based"),
        }
    }
}

impl FromStr for RoutingPolicy {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least_busy" => Ok(Self::LeastBusy),
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "lowest_latency" => Ok(Self::LowestLatency),
            "capability_based" => Ok(Self::CapabilityBased),
            other => Err(ClusterError::BadRequest(format!(
                "unknown routing strategy: {other}"
            ))),
        }
    }
}

/// A registered worker node as seen by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable node identity
    pub id: NodeId,
    /// Network address (`host:port`)
    pub address: String,
    /// Declared capability tags, matched against job requirements
    pub capabilities: Vec<String>,
    /// Maximum concurrent jobs this node accepts
    pub max_concurrent_jobs: usize,
    /// Lifecycle status
    pub status: NodeStatus,
    /// Jobs currently bound to the node (dispatcher's own view)
    pub active_jobs: usize,
    /// Jobs completed on this node
    pub completed_jobs: u64,
    /// Jobs failed on this node
    pub failed_jobs: u64,
    /// Registration time
    pub registered_at: DateTime<Utc>,
    /// Most recent heartbeat the dispatcher accepted
    pub last_heartbeat: DateTime<Utc>,
    /// Rolling probe latency samples in seconds, most recent last
    pub latency_history: VecDeque<f64>,
    /// Rolling success flags for the node's most recent jobs
    pub recent_outcomes: VecDeque<bool>,
    /// Identifiers of jobs the node currently owns
    pub in_flight: HashSet<JobId>,
}

impl Node {
    /// Create a freshly registered node.
    pub fn new(
        id: NodeId,
        address: String,
        capabilities: Vec<String>,
        max_concurrent_jobs: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            address,
            capabilities,
            max_concurrent_jobs,
            status: NodeStatus::Healthy,
            active_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            registered_at: now,
            last_heartbeat: now,
            latency_history: VecDeque::new(),
            recent_outcomes: VecDeque::new(),
            in_flight: HashSet::new(),
        }
    }

    /// A node accepts new work while Healthy or Degraded with spare capacity.
    pub fn is_available(&self) -> bool {
        matches!(self.status, NodeStatus::Healthy | NodeStatus::Degraded)
            && self.active_jobs < self.max_concurrent_jobs
    }

    /// Load factor in `[0.0, 1.0]`; a node with no capacity is always full.
    pub fn load_factor(&self) -> f64 {
        if self.max_concurrent_jobs == 0 {
            1.0
        } else {
            self.active_jobs as f64 / self.max_concurrent_jobs as f64
        }
    }

    /// Rolling average latency in seconds, `+inf` with no samples so warm
    /// nodes win under `lowest_latency`.
    pub fn average_latency(&self) -> f64 {
        if self.latency_history.is_empty() {
            f64::INFINITY
        } else {
            self.latency_history.iter().sum::<f64>() / self.latency_history.len() as f64
        }
    }

    /// Record a probe latency sample, keeping the most recent ten.
    pub fn record_latency(&mut self, seconds: f64) {
        self.latency_history.push_back(seconds);
        while self.latency_history.len() > NODE_HISTORY_LEN {
            self.latency_history.pop_front();
        }
    }

    /// Record a job outcome, keeping the most recent ten.
    pub fn record_outcome(&mut self, success: bool) {
        self.recent_outcomes.push_back(success);
        while self.recent_outcomes.len() > NODE_HISTORY_LEN {
            self.recent_outcomes.pop_front();
        }
        if success {
            self.completed_jobs += 1;
        } else {
            self.failed_jobs += 1;
        }
    }

    /// Fraction of recent jobs that failed, 0.0 with no history.
    pub fn failure_rate(&self) -> f64 {
        if self.recent_outcomes.is_empty() {
            0.0
        } else {
            let failures = self.recent_outcomes.iter().filter(|ok| !**ok).count();
            failures as f64 / self.recent_outcomes.len() as f64
        }
    }

    /// Whether the declared capabilities cover the given requirement set.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|tag| self.capabilities.iter().any(|c| c == tag))
    }
}

/// A unit of work flowing through the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Stable job identity
    pub id: JobId,
    /// Selects the bridge operation to run
    pub job_type: String,
    /// Opaque payload handed to the bridge
    pub payload: serde_json::Value,
    /// Higher priority wins
    pub priority: i32,
    /// Lifecycle status
    pub status: JobStatus,
    /// Submission time; retries keep this value so requeues do not lose
    /// queue position
    pub created_at: DateTime<Utc>,
    /// When the dispatcher bound the job to a node
    pub assigned_at: Option<DateTime<Utc>>,
    /// When the node acknowledged execution
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// The owning node while Assigned or Running
    pub assigned_node: Option<NodeId>,
    /// Coarse progress, 0-100
    pub progress: u8,
    /// Result payload once Completed
    pub result: Option<serde_json::Value>,
    /// Terminal error kind once Failed or Cancelled
    pub error_kind: Option<JobErrorKind>,
    /// Human-readable error message
    pub error_message: Option<String>,
    /// Optional URL to POST a terminal callback to
    pub callback_url: Option<String>,
    /// Times this job has been re-queued after node loss
    pub retry_count: u32,
    /// Retry budget for this job
    pub max_retries: u32,
}

impl Job {
    /// Create a queued job.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: JobId,
        job_type: String,
        payload: serde_json::Value,
        priority: i32,
        callback_url: Option<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            id,
            job_type,
            payload,
            priority,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            assigned_node: None,
            progress: 0,
            result: None,
            error_kind: None,
            error_message: None,
            callback_url,
            retry_count: 0,
            max_retries,
        }
    }

    /// Whether the job is in an absorbing state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Bind the job to a node.
    pub fn mark_assigned(&mut self, node_id: NodeId) {
        self.status = JobStatus::Assigned;
        self.assigned_node = Some(node_id);
        self.assigned_at = Some(Utc::now());
    }

    /// Record the node's acknowledgment that execution began.
    pub fn mark_running(&mut self, started_at: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(started_at);
    }

    /// Record successful completion.
    pub fn mark_completed(&mut self, result: serde_json::Value) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.progress = 100;
        self.completed_at = Some(Utc::now());
    }

    /// Record terminal failure.
    pub fn mark_failed(&mut self, kind: JobErrorKind, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }

    /// Record cancellation.
    pub fn mark_cancelled(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Cancelled;
        self.error_kind = Some(JobErrorKind::Cancelled);
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }

    /// Return the job to the queue after node loss, keeping `created_at`.
    pub fn reset_for_requeue(&mut self) {
        self.status = JobStatus::Queued;
        self.assigned_node = None;
        self.assigned_at = None;
        self.started_at = None;
        self.retry_count += 1;
    }
}
