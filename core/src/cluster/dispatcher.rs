// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Dispatcher core.
//!
//! Owns the node registry, the job table and the priority queue, and runs
//! the three background loops (dispatch, health-check, cleanup). The
//! registry and job table are independent maps iterated copy-on-read; no
//! lock is held across a suspension point. Lock order where both are taken:
//! job table, then registry.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge;
use crate::cluster::health::{cluster_median_latency, HealthPolicy};
use crate::cluster::protocol::{
    CancelJobResponse, ClusterStatusResponse, ExecuteJobRequest, HeartbeatRequest,
    HeartbeatResponse, JobResultReport, JobStartedReport, NodeSummary, RegisterNodeRequest,
    RegisterNodeResponse, SubmitJobRequest, SubmitJobResponse, UnregisterNodeRequest,
    UnregisterNodeResponse,
};
use crate::cluster::queue::{JobQueue, PopDecision};
use crate::cluster::registry::NodeRegistry;
use crate::cluster::transport::{HttpNodeTransport, NodeTransport};
use crate::cluster::types::{
    ClusterError, ClusterResult, Job, JobErrorKind, JobId, JobStatus, Node, NodeId, NodeStatus,
    RoutingPolicy,
};
use crate::config::DispatcherConfig;

/// Seconds an Unhealthy node may linger before the cleanup loop purges it.
pub const UNHEALTHY_PURGE_SECONDS: i64 = 3600;

/// Rough per-job duration used for the submission completion hint.
const ESTIMATED_JOB_SECONDS: i64 = 3;

/// Period of the dispatch loop between queue scans.
const DISPATCH_TICK: Duration = Duration::from_millis(100);

/// Cluster lifecycle events published to facade subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterEventKind {
    /// A job entered the queue
    JobSubmitted,
    /// A job was bound to a node
    JobAssigned,
    /// A job completed successfully
    JobCompleted,
    /// A job reached a failed terminal state
    JobFailed,
    /// A job was cancelled
    JobCancelled,
    /// A job returned to the queue after node loss
    JobRequeued,
    /// A node joined the cluster
    NodeRegistered,
    /// A node left the cluster
    NodeUnregistered,
    /// A node stopped heartbeating and was marked Unhealthy
    NodeUnhealthy,
}

impl ClusterEventKind {
    /// Dotted topic name used on the event channel.
    pub fn topic(self) -> &'static str {
        match self {
            Self::JobSubmitted => "job.submitted",
            Self::JobAssigned => "job.assigned",
            Self::JobCompleted => "job.completed",
            Self::JobFailed => "job.failed",
            Self::JobCancelled => "job.cancelled",
            Self::JobRequeued => "job.requeued",
            Self::NodeRegistered => "node.registered",
            Self::NodeUnregistered => "node.unregistered",
            Self::NodeUnhealthy => "node.unhealthy",
        }
    }
}

/// One event on the cluster event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    /// What happened
    pub kind: ClusterEventKind,
    /// Event payload
    pub data: serde_json::Value,
    /// When the dispatcher observed it
    pub timestamp: DateTime<Utc>,
}

impl ClusterEvent {
    fn new(kind: ClusterEventKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// The cluster dispatcher.
///
/// One instance owns one cluster. All state is process-local and volatile;
/// construct it as an explicit value and share it behind an [`Arc`].
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: NodeRegistry,
    jobs: RwLock<HashMap<JobId, Job>>,
    queue: JobQueue,
    transport: Arc<dyn NodeTransport>,
    round_robin: Mutex<usize>,
    started_at: DateTime<Utc>,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    events: broadcast::Sender<ClusterEvent>,
    shutdown: watch::Sender<bool>,
}

impl Dispatcher {
    /// Create a dispatcher over the given node transport.
    pub fn new(config: DispatcherConfig, transport: Arc<dyn NodeTransport>) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        info!(cluster_id = %config.cluster_id, "dispatcher initialized");
        Self {
            config,
            registry: NodeRegistry::new(),
            jobs: RwLock::new(HashMap::new()),
            queue: JobQueue::new(),
            transport,
            round_robin: Mutex::new(0),
            started_at: Utc::now(),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            events,
            shutdown,
        }
    }

    /// Create a dispatcher speaking HTTP to its nodes.
    pub fn with_http_transport(config: DispatcherConfig) -> Self {
        Self::new(config, Arc::new(HttpNodeTransport::default()))
    }

    /// The dispatcher configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Subscribe to cluster lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    fn emit(&self, kind: ClusterEventKind, data: serde_json::Value) {
        // Send errors just mean nobody is listening.
        let _ = self.events.send(ClusterEvent::new(kind, data));
    }

    // ---- RPC surface -----------------------------------------------------

    /// Register a worker node, or refresh an existing registration.
    pub fn register_node(
        &self,
        request: RegisterNodeRequest,
    ) -> ClusterResult<RegisterNodeResponse> {
        if request.max_concurrent_jobs == 0 {
            return Err(ClusterError::BadRequest(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        let node_id = request
            .node_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Refresh in place when the node is already known, keeping its
        // counters and in-flight view.
        let refreshed = self
            .registry
            .update(&node_id, |node| {
                node.address = request.address.clone();
                node.capabilities = request.capabilities.clone();
                node.max_concurrent_jobs = request.max_concurrent_jobs;
                node.status = NodeStatus::Healthy;
                node.last_heartbeat = Utc::now();
            })
            .is_some();

        if !refreshed {
            let node = Node::new(
                node_id.clone(),
                request.address,
                request.capabilities,
                request.max_concurrent_jobs,
            );
            self.registry.register(node)?;
            info!(node_id = %node_id, "node registered");
        } else {
            info!(node_id = %node_id, "node registration refreshed");
        }

        self.emit(
            ClusterEventKind::NodeRegistered,
            serde_json::json!({ "node_id": node_id }),
        );
        Ok(RegisterNodeResponse {
            success: true,
            cluster_id: self.config.cluster_id.clone(),
            node_id,
            heartbeat_interval_seconds: self.config.health_check_interval_seconds,
        })
    }

    /// Remove a node from the cluster, requeueing everything it owned.
    pub fn unregister_node(
        &self,
        request: &UnregisterNodeRequest,
    ) -> ClusterResult<UnregisterNodeResponse> {
        if !self.registry.contains(&request.node_id) {
            return Err(ClusterError::NotFound(format!(
                "node {} is not registered",
                request.node_id
            )));
        }

        self.requeue_node_jobs(&request.node_id);
        self.registry.remove(&request.node_id);
        info!(node_id = %request.node_id, "node unregistered");
        self.emit(
            ClusterEventKind::NodeUnregistered,
            serde_json::json!({ "node_id": request.node_id }),
        );
        Ok(UnregisterNodeResponse { success: true })
    }

    /// Accept a node heartbeat. Out-of-order heartbeats are no-ops.
    pub fn heartbeat(&self, request: &HeartbeatRequest) -> ClusterResult<HeartbeatResponse> {
        let updated = self.registry.update(&request.node_id, |node| {
            if request.sent_at > node.last_heartbeat {
                node.last_heartbeat = request.sent_at;
                if node.status == NodeStatus::Unhealthy || node.status == NodeStatus::Unknown {
                    node.status = NodeStatus::Healthy;
                }
            }
        });

        if updated.is_none() {
            return Err(ClusterError::NotFound(format!(
                "node {} is not registered; re-register before heartbeating",
                request.node_id
            )));
        }

        debug!(
            node_id = %request.node_id,
            active = request.active_jobs,
            "heartbeat accepted"
        );
        Ok(HeartbeatResponse {
            server_time: Utc::now(),
            expected_interval_seconds: self.config.health_check_interval_seconds,
        })
    }

    /// Submit a job to the cluster.
    pub fn submit_job(&self, request: SubmitJobRequest) -> ClusterResult<SubmitJobResponse> {
        if bridge::required_capabilities(&request.job_type).is_none() {
            return Err(ClusterError::UnsupportedCapability(request.job_type));
        }
        let queued = self.queue.len();
        if queued >= self.config.max_queued_jobs {
            return Err(ClusterError::QueueFull(queued));
        }

        let job = Job::new(
            uuid::Uuid::new_v4().to_string(),
            request.job_type,
            request.payload,
            request.priority,
            request.callback_url,
            request.max_retries.unwrap_or(self.config.max_retries),
        );
        let job_id = job.id.clone();
        let key = (job.priority, job.created_at);

        self.jobs.write().insert(job_id.clone(), job);
        self.queue.push(job_id.clone(), key.0, key.1);

        let estimated_completion = (!self.registry.available().is_empty())
            .then(|| Utc::now() + ChronoDuration::seconds(ESTIMATED_JOB_SECONDS));

        info!(job_id = %job_id, priority = key.0, "job queued");
        self.emit(
            ClusterEventKind::JobSubmitted,
            serde_json::json!({ "job_id": job_id, "priority": key.0 }),
        );
        Ok(SubmitJobResponse {
            job_id,
            status: JobStatus::Queued,
            estimated_completion,
        })
    }

    /// Fetch the full record of a job.
    pub fn get_job(&self, job_id: &JobId) -> ClusterResult<Job> {
        self.jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("job {job_id} not found")))
    }

    /// Cancel a job.
    ///
    /// Queued jobs cancel atomically; Assigned and Running jobs get a
    /// best-effort Cancel RPC to their node. Cancelling an already-terminal
    /// job is a no-op that reports the existing state.
    pub async fn cancel_job(&self, job_id: &JobId) -> ClusterResult<CancelJobResponse> {
        // Tombstone any queue entry first so the dispatch loop cannot grab
        // the job mid-cancellation.
        self.queue.remove(job_id);

        let decision = {
            let mut jobs = self.jobs.write();
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| ClusterError::NotFound(format!("job {job_id} not found")))?;

            if job.is_terminal() {
                return Ok(CancelJobResponse {
                    job_id: job_id.clone(),
                    status: job.status,
                    already_terminal: true,
                });
            }

            match job.status {
                JobStatus::Queued => {
                    job.mark_cancelled("cancelled by request");
                    None
                }
                JobStatus::Assigned | JobStatus::Running => {
                    job.assigned_node.clone().map(|node| (node, job.status))
                }
                _ => None,
            }
        };

        if let Some((node_id, _)) = decision {
            let address = self.registry.get(&node_id).map(|n| n.address);
            if let Some(address) = address {
                if let Err(err) = self
                    .transport
                    .cancel(node_id.clone(), address, job_id.clone())
                    .await
                {
                    warn!(job_id = %job_id, node_id = %node_id, error = %err, "cancel rpc failed");
                }
            }

            // The node may have finished meanwhile; terminal states win.
            let mut jobs = self.jobs.write();
            if let Some(job) = jobs.get_mut(job_id) {
                if !job.is_terminal() {
                    job.mark_cancelled("cancelled by request");
                }
            }
            self.registry.release(&node_id, job_id);
            drop(jobs);
        }

        let job = self.get_job(job_id)?;
        if job.status == JobStatus::Cancelled {
            self.emit(
                ClusterEventKind::JobCancelled,
                serde_json::json!({ "job_id": job_id }),
            );
        }
        Ok(CancelJobResponse {
            job_id: job_id.clone(),
            status: job.status,
            already_terminal: false,
        })
    }

    /// Aggregate cluster counters, optionally with per-node detail.
    pub fn cluster_status(&self, include_nodes: bool) -> ClusterStatusResponse {
        let nodes = self.registry.snapshot();
        let available = nodes.iter().filter(|n| n.is_available()).count();
        let (queued, active) = {
            let jobs = self.jobs.read();
            let queued = jobs
                .values()
                .filter(|j| j.status == JobStatus::Queued)
                .count();
            let active = jobs
                .values()
                .filter(|j| matches!(j.status, JobStatus::Assigned | JobStatus::Running))
                .count();
            (queued, active)
        };

        ClusterStatusResponse {
            cluster_id: self.config.cluster_id.clone(),
            routing_strategy: self.config.routing_strategy.to_string(),
            uptime_seconds: Utc::now()
                .signed_duration_since(self.started_at)
                .num_seconds()
                .max(0) as u64,
            total_nodes: nodes.len(),
            available_nodes: available,
            queued_jobs: queued,
            active_jobs: active,
            completed_jobs: self.jobs_completed.load(Ordering::Relaxed),
            failed_jobs: self.jobs_failed.load(Ordering::Relaxed),
            nodes: include_nodes.then(|| nodes.iter().map(NodeSummary::from_node).collect()),
        }
    }

    // ---- Node reports ----------------------------------------------------

    /// Record a node's acknowledgment that a job began executing.
    pub fn report_job_started(&self, report: &JobStartedReport) {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&report.job_id) {
            Some(job)
                if job.status == JobStatus::Assigned
                    && job.assigned_node.as_deref() == Some(report.node_id.as_str()) =>
            {
                job.mark_running(report.started_at);
            }
            Some(_) => debug!(job_id = %report.job_id, "stale start report ignored"),
            None => debug!(job_id = %report.job_id, "start report for unknown job"),
        }
    }

    /// Record a terminal job outcome reported by a node.
    pub fn report_job_result(&self, report: JobResultReport) {
        let accepted = {
            let mut jobs = self.jobs.write();
            match jobs.get_mut(&report.job_id) {
                Some(job) if job.is_terminal() => false,
                Some(job)
                    if job.assigned_node.as_deref() == Some(report.node_id.as_str()) =>
                {
                    // The node streams results without a separate running
                    // ack; infer the transition when it was never reported.
                    if job.status == JobStatus::Assigned {
                        job.mark_running(report.completed_at);
                    }
                    if report.success {
                        job.mark_completed(report.result.clone().unwrap_or_default());
                    } else {
                        match report.error_kind {
                            Some(JobErrorKind::Cancelled) => job.mark_cancelled(
                                report
                                    .error_message
                                    .clone()
                                    .unwrap_or_else(|| "cancelled".to_string()),
                            ),
                            kind => job.mark_failed(
                                kind.unwrap_or(JobErrorKind::BridgeFailed),
                                report
                                    .error_message
                                    .clone()
                                    .unwrap_or_else(|| "job failed".to_string()),
                            ),
                        }
                    }
                    true
                }
                Some(_) => {
                    // Requeued to another node in the meantime; this
                    // outcome no longer owns the job record.
                    warn!(
                        job_id = %report.job_id,
                        node_id = %report.node_id,
                        "result from a node that no longer owns the job"
                    );
                    false
                }
                None => {
                    warn!(job_id = %report.job_id, "result for unknown job");
                    false
                }
            }
        };

        if !accepted {
            return;
        }

        self.registry
            .finish_job(&report.node_id, &report.job_id, report.success);
        if report.success {
            self.jobs_completed.fetch_add(1, Ordering::Relaxed);
            info!(job_id = %report.job_id, node_id = %report.node_id, "job completed");
            self.emit(
                ClusterEventKind::JobCompleted,
                serde_json::json!({ "job_id": report.job_id, "node_id": report.node_id }),
            );
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
            info!(
                job_id = %report.job_id,
                node_id = %report.node_id,
                kind = ?report.error_kind,
                "job finished unsuccessfully"
            );
            let kind = match report.error_kind {
                Some(JobErrorKind::Cancelled) => ClusterEventKind::JobCancelled,
                _ => ClusterEventKind::JobFailed,
            };
            self.emit(
                kind,
                serde_json::json!({ "job_id": report.job_id, "node_id": report.node_id }),
            );
        }
    }

    // ---- Dispatch --------------------------------------------------------

    /// Dispatch as many queued jobs as current capacity allows.
    ///
    /// Returns the number of jobs handed to nodes. Invoked repeatedly by
    /// the dispatch loop and directly by tests.
    pub async fn dispatch_pending(&self) -> usize {
        let mut dispatched = 0;
        while self.try_dispatch_one().await {
            dispatched += 1;
        }
        dispatched
    }

    /// Attempt to dispatch the best queued job. Returns whether an Execute
    /// was sent (successfully or not); `false` means nothing dispatchable.
    async fn try_dispatch_one(&self) -> bool {
        let candidates = self.registry.available();
        if candidates.is_empty() {
            return false;
        }

        let job_id = {
            let jobs = self.jobs.read();
            self.queue.pop_best_matching(|id| match jobs.get(id) {
                None => PopDecision::Drop,
                Some(job) if job.status != JobStatus::Queued => PopDecision::Drop,
                Some(job) => match bridge::required_capabilities(&job.job_type) {
                    None => PopDecision::Drop,
                    Some(required) => {
                        if candidates.iter().any(|n| n.has_capabilities(&required)) {
                            PopDecision::Take
                        } else {
                            PopDecision::Keep
                        }
                    }
                },
            })
        };
        let Some(job_id) = job_id else {
            return false;
        };

        // Assignment protocol: guard, then transition job and node state in
        // one critical section ordered job table before registry.
        let assignment = {
            let mut jobs = self.jobs.write();
            let Some(job) = jobs.get_mut(&job_id) else {
                return true;
            };
            if job.status != JobStatus::Queued {
                return true;
            }

            let required = bridge::required_capabilities(&job.job_type).unwrap_or_default();
            let eligible: Vec<&Node> = candidates
                .iter()
                .filter(|n| n.has_capabilities(&required))
                .collect();
            let Some(node) = self.select_node(&eligible) else {
                // Candidates went away between the snapshot and now; put
                // the job back untouched.
                self.release_to_queue(job);
                return true;
            };

            if !self.registry.try_reserve(&node.id, &job_id) {
                self.release_to_queue(job);
                return true;
            }

            job.mark_assigned(node.id.clone());
            Some((
                node.id.clone(),
                node.address.clone(),
                ExecuteJobRequest {
                    job_id: job_id.clone(),
                    job_type: job.job_type.clone(),
                    payload: job.payload.clone(),
                    priority: job.priority,
                    callback_url: job.callback_url.clone(),
                },
            ))
        };
        let Some((node_id, address, request)) = assignment else {
            return true;
        };

        info!(job_id = %job_id, node_id = %node_id, "job assigned");
        self.emit(
            ClusterEventKind::JobAssigned,
            serde_json::json!({ "job_id": job_id, "node_id": node_id }),
        );

        match self
            .transport
            .execute(node_id.clone(), address, request)
            .await
        {
            Ok(ack) if ack.accepted => true,
            Ok(ack) => {
                // The node refused the job outright; this is not retryable.
                let kind = ack.error_kind.unwrap_or(JobErrorKind::UnsupportedCapability);
                warn!(job_id = %job_id, node_id = %node_id, kind = %kind, "node rejected job");
                self.fail_assigned_job(&job_id, &node_id, kind, ack.message);
                true
            }
            Err(err) => {
                warn!(job_id = %job_id, node_id = %node_id, error = %err, "execute rpc failed");
                self.rollback_assignment(&job_id, &node_id, &err);
                true
            }
        }
    }

    /// Inverse of the assignment critical section, applied when the
    /// Execute send fails. Job and node state revert together under the
    /// same lock order as the assignment itself.
    fn rollback_assignment(&self, job_id: &JobId, node_id: &NodeId, err: &ClusterError) {
        let push = {
            let mut jobs = self.jobs.write();
            let Some(job) = jobs.get_mut(job_id) else {
                self.registry.release(node_id, job_id);
                return;
            };
            if job.status != JobStatus::Assigned {
                self.registry.release(node_id, job_id);
                return;
            }
            let push = if job.retry_count >= job.max_retries {
                job.mark_failed(
                    JobErrorKind::RetriesExhausted,
                    format!("assignment retries exhausted: {err}"),
                );
                None
            } else {
                job.reset_for_requeue();
                Some((job.priority, job.created_at))
            };
            self.registry.release(node_id, job_id);
            push
        };

        match push {
            Some((priority, created_at)) => {
                self.queue.push(job_id.clone(), priority, created_at);
                self.emit(
                    ClusterEventKind::JobRequeued,
                    serde_json::json!({ "job_id": job_id }),
                );
            }
            None => {
                self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                self.emit(
                    ClusterEventKind::JobFailed,
                    serde_json::json!({ "job_id": job_id }),
                );
            }
        }
    }

    /// Terminate a job the owning node refused to run.
    fn fail_assigned_job(
        &self,
        job_id: &JobId,
        node_id: &NodeId,
        kind: JobErrorKind,
        message: String,
    ) {
        let mut jobs = self.jobs.write();
        if let Some(job) = jobs.get_mut(job_id) {
            if !job.is_terminal() {
                job.mark_failed(kind, message);
                self.jobs_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.registry.release(node_id, job_id);
        drop(jobs);
        self.emit(
            ClusterEventKind::JobFailed,
            serde_json::json!({ "job_id": job_id, "node_id": node_id }),
        );
    }

    fn release_to_queue(&self, job: &Job) {
        self.queue.push(job.id.clone(), job.priority, job.created_at);
    }

    /// Pick one node from the eligible candidates under the active policy.
    /// All policies break ties by lower node id.
    fn select_node<'a>(&self, eligible: &[&'a Node]) -> Option<&'a Node> {
        if eligible.is_empty() {
            return None;
        }
        match self.config.routing_strategy {
            RoutingPolicy::LeastBusy | RoutingPolicy::CapabilityBased => eligible
                .iter()
                .min_by(|a, b| {
                    a.load_factor()
                        .total_cmp(&b.load_factor())
                        .then_with(|| a.id.cmp(&b.id))
                })
                .copied(),
            RoutingPolicy::LowestLatency => eligible
                .iter()
                .min_by(|a, b| {
                    a.average_latency()
                        .total_cmp(&b.average_latency())
                        .then_with(|| a.id.cmp(&b.id))
                })
                .copied(),
            RoutingPolicy::Random => eligible.choose(&mut rand::thread_rng()).copied(),
            RoutingPolicy::RoundRobin => {
                // Rotate over the available candidates only, sorted for a
                // stable cycle; the index always advances after a pick.
                let mut sorted: Vec<&Node> = eligible.to_vec();
                sorted.sort_by(|a, b| a.id.cmp(&b.id));
                let mut index = self.round_robin.lock();
                let picked = sorted[*index % sorted.len()];
                *index = index.wrapping_add(1);
                Some(picked)
            }
        }
    }

    // ---- Requeue protocol ------------------------------------------------

    /// Requeue every Assigned or Running job owned by a lost node.
    ///
    /// Retries keep the original `created_at` key so they do not lose queue
    /// position; jobs past their retry cap terminate as Failed.
    pub fn requeue_node_jobs(&self, node_id: &NodeId) {
        let Some(node) = self.registry.get(node_id) else {
            return;
        };

        let mut pushes = Vec::new();
        {
            let mut jobs = self.jobs.write();
            for job_id in &node.in_flight {
                let Some(job) = jobs.get_mut(job_id) else {
                    self.registry.release(node_id, job_id);
                    continue;
                };
                if !matches!(job.status, JobStatus::Assigned | JobStatus::Running) {
                    self.registry.release(node_id, job_id);
                    continue;
                }
                if job.retry_count >= job.max_retries {
                    job.mark_failed(
                        JobErrorKind::RetriesExhausted,
                        format!("node {node_id} lost; retries exhausted"),
                    );
                    self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                    self.emit(
                        ClusterEventKind::JobFailed,
                        serde_json::json!({ "job_id": job_id }),
                    );
                } else {
                    info!(job_id = %job_id, node_id = %node_id, "requeueing job from lost node");
                    job.reset_for_requeue();
                    pushes.push((job_id.clone(), job.priority, job.created_at));
                }
                self.registry.release(node_id, job_id);
            }
        }

        for (job_id, priority, created_at) in pushes {
            self.queue.push(job_id.clone(), priority, created_at);
            self.emit(
                ClusterEventKind::JobRequeued,
                serde_json::json!({ "job_id": job_id }),
            );
        }
    }

    // ---- Background sweeps -----------------------------------------------

    /// One pass of the health-check loop: mark silent nodes Unhealthy and
    /// requeue their jobs, probe live nodes, derive Degraded, and enforce
    /// job deadlines.
    pub async fn run_health_check(&self) {
        let now = Utc::now();
        let policy = HealthPolicy {
            node_timeout_seconds: self.config.node_timeout_seconds,
            degraded_latency_factor: self.config.degraded_latency_factor,
        };

        for node in self.registry.snapshot() {
            if !policy.is_live(&node, now) {
                if node.status != NodeStatus::Unhealthy {
                    warn!(node_id = %node.id, "node timed out, marking unhealthy");
                    self.registry
                        .update(&node.id, |n| n.status = NodeStatus::Unhealthy);
                    self.emit(
                        ClusterEventKind::NodeUnhealthy,
                        serde_json::json!({ "node_id": node.id }),
                    );
                    self.requeue_node_jobs(&node.id);
                }
                continue;
            }

            match self
                .transport
                .probe(node.id.clone(), node.address.clone())
                .await
            {
                Ok(latency) => {
                    self.registry.update(&node.id, |n| {
                        n.record_latency(latency.as_secs_f64());
                        n.last_heartbeat = now;
                    });
                }
                Err(err) => {
                    warn!(node_id = %node.id, error = %err, "health probe failed");
                    if node.status != NodeStatus::Unhealthy {
                        self.registry
                            .update(&node.id, |n| n.status = NodeStatus::Unhealthy);
                        self.emit(
                            ClusterEventKind::NodeUnhealthy,
                            serde_json::json!({ "node_id": node.id }),
                        );
                        self.requeue_node_jobs(&node.id);
                    }
                }
            }
        }

        // Degraded is derived from the post-probe view of the cluster.
        let nodes = self.registry.snapshot();
        let median = cluster_median_latency(&nodes);
        for node in &nodes {
            if node.status == NodeStatus::Unhealthy {
                continue;
            }
            let derived = policy.classify_live(node, median);
            if derived != node.status {
                debug!(node_id = %node.id, from = %node.status, to = %derived, "status derived");
                self.registry.update(&node.id, |n| n.status = derived);
            }
        }

        self.enforce_job_deadlines(now).await;
    }

    /// Fail Queued and Assigned jobs past the job deadline; ask nodes to
    /// cancel Running ones. A Running job's final state still follows the
    /// node's acknowledgment.
    async fn enforce_job_deadlines(&self, now: DateTime<Utc>) {
        let deadline = ChronoDuration::seconds(self.config.job_timeout_seconds as i64);
        let mut to_cancel: Vec<(NodeId, JobId)> = Vec::new();
        let mut expired: Vec<(JobId, Option<NodeId>)> = Vec::new();

        {
            let jobs = self.jobs.read();
            for job in jobs.values() {
                if now.signed_duration_since(job.created_at) <= deadline {
                    continue;
                }
                match job.status {
                    JobStatus::Queued | JobStatus::Assigned => {
                        expired.push((job.id.clone(), job.assigned_node.clone()));
                    }
                    JobStatus::Running => {
                        if let Some(node) = &job.assigned_node {
                            to_cancel.push((node.clone(), job.id.clone()));
                        }
                    }
                    _ => {}
                }
            }
        }

        for (job_id, node_id) in expired {
            self.queue.remove(&job_id);
            {
                let mut jobs = self.jobs.write();
                if let Some(job) = jobs.get_mut(&job_id) {
                    if matches!(job.status, JobStatus::Queued | JobStatus::Assigned) {
                        job.mark_failed(JobErrorKind::DeadlineExceeded, "job deadline exceeded");
                        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        continue;
                    }
                }
                if let Some(node_id) = &node_id {
                    self.registry.release(node_id, &job_id);
                }
            }
            info!(job_id = %job_id, "job failed: deadline exceeded");
            self.emit(
                ClusterEventKind::JobFailed,
                serde_json::json!({ "job_id": job_id, "kind": "deadline-exceeded" }),
            );
        }

        for (node_id, job_id) in to_cancel {
            if let Some(node) = self.registry.get(&node_id) {
                if let Err(err) = self
                    .transport
                    .cancel(node_id.clone(), node.address, job_id.clone())
                    .await
                {
                    warn!(job_id = %job_id, error = %err, "deadline cancel rpc failed");
                }
            }
        }
    }

    /// One pass of the cleanup loop: drop terminal jobs past retention and
    /// purge nodes that stayed Unhealthy beyond the long-absence threshold.
    pub fn run_cleanup(&self) {
        let now = Utc::now();
        let cutoff = now - self.config.retention();

        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff))
        });
        let dropped = before - jobs.len();
        drop(jobs);
        if dropped > 0 {
            debug!(dropped, "cleaned up terminal jobs past retention");
        }

        let purged = self
            .registry
            .purge_unhealthy(now - ChronoDuration::seconds(UNHEALTHY_PURGE_SECONDS));
        for node in purged {
            info!(node_id = %node.id, "purged long-absent node");
        }
    }

    // ---- Lifecycle -------------------------------------------------------

    /// Spawn the dispatch, health-check and cleanup loops.
    ///
    /// Loops run until [`Self::stop`] fires; a panicking loop is logged and
    /// restarted with exponential backoff.
    pub fn spawn_background_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_supervised("dispatch", |d| async move {
                d.run_loop(DISPATCH_TICK, |d| async move {
                    d.dispatch_pending().await;
                })
                .await;
            }),
            self.spawn_supervised("health-check", |d| async move {
                let interval = d.config.health_check_interval();
                d.run_loop(interval, |d| async move {
                    d.run_health_check().await;
                })
                .await;
            }),
            self.spawn_supervised("cleanup", |d| async move {
                let interval = d.config.cleanup_interval();
                d.run_loop(interval, |d| async move {
                    d.run_cleanup();
                })
                .await;
            }),
        ]
    }

    async fn run_loop<F, Fut>(self: Arc<Self>, period: Duration, body: F)
    where
        F: Fn(Arc<Self>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => body(Arc::clone(&self)).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn spawn_supervised<F, Fut>(self: &Arc<Self>, name: &'static str, body: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = Duration::from_millis(100);
            loop {
                let handle = tokio::spawn(body(Arc::clone(&dispatcher)));
                match handle.await {
                    Ok(()) => break,
                    Err(err) => {
                        error!(loop_name = name, error = %err, "background loop panicked; restarting");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(30));
                    }
                }
            }
        })
    }

    /// Signal the background loops to drain and exit, cancelling every
    /// non-terminal job.
    pub fn stop(&self) {
        info!("dispatcher stopping");
        let mut jobs = self.jobs.write();
        for job in jobs.values_mut() {
            if !job.is_terminal() {
                job.mark_cancelled("dispatcher shutdown");
            }
        }
        drop(jobs);
        let _ = self.shutdown.send(true);
    }
}
