// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker node runtime.
//!
//! A node registers with its dispatcher, serves Execute and Cancel RPCs,
//! and runs two long-lived loops: a heartbeat loop (re-registering after
//! three consecutive send failures) and a local scheduler that pulls queued
//! jobs in priority order under the configured concurrency cap.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::bridge::{self, EditorBridge};
use crate::cluster::protocol::{
    ExecuteJobRequest, ExecuteJobResponse, HeartbeatRequest, JobCallbackPayload, JobResultReport,
    JobStartedReport, RegisterNodeRequest, UnregisterNodeRequest,
};
use crate::cluster::types::{JobErrorKind, JobId, JobStatus, NodeId};
use crate::config::NodeConfig;
use crate::node::client::DispatcherClient;
use crate::node::executor::{deliver_callback, JobExecutor};
use crate::streaming::{progress_channel, CancelFlag, StreamFrame};

/// Terminal jobs kept in node-local memory before pruning.
const MAX_TERMINAL_JOBS: usize = 512;

/// Consecutive heartbeat failures that trigger re-registration.
const HEARTBEAT_FAILURE_LIMIT: u32 = 3;

/// Period of the local scheduler between queue scans.
const SCHEDULER_TICK: Duration = Duration::from_millis(100);

/// A job as tracked on the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalJob {
    /// Job identity
    pub job_id: JobId,
    /// Selects the bridge operation
    pub job_type: String,
    /// Opaque payload
    pub payload: serde_json::Value,
    /// Local scheduling priority
    pub priority: i32,
    /// Lifecycle status (node-local view)
    pub status: JobStatus,
    /// When the node accepted the job
    pub received_at: DateTime<Utc>,
    /// When execution began
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Result payload once Completed
    pub result: Option<serde_json::Value>,
    /// Terminal error kind
    pub error_kind: Option<JobErrorKind>,
    /// Terminal error message
    pub error_message: Option<String>,
    /// Callback target
    pub callback_url: Option<String>,
    /// Cooperative cancel flag
    #[serde(skip)]
    pub cancel: CancelFlag,
}

impl LocalJob {
    fn from_request(request: ExecuteJobRequest) -> Self {
        Self {
            job_id: request.job_id,
            job_type: request.job_type,
            payload: request.payload,
            priority: request.priority,
            status: JobStatus::Queued,
            received_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error_kind: None,
            error_message: None,
            callback_url: request.callback_url,
            cancel: CancelFlag::new(),
        }
    }
}

/// Point-in-time node counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStats {
    /// Node identity
    pub node_id: NodeId,
    /// Jobs currently executing
    pub active_jobs: usize,
    /// Jobs completed since startup
    pub completed_jobs: u64,
    /// Jobs failed since startup
    pub failed_jobs: u64,
    /// Seconds since the runtime started
    pub uptime_seconds: u64,
}

/// The worker node runtime.
pub struct NodeRuntime {
    config: NodeConfig,
    node_id: RwLock<NodeId>,
    executor: JobExecutor,
    dispatcher: DispatcherClient,
    callback_client: reqwest::Client,
    jobs: DashMap<JobId, LocalJob>,
    terminal_order: Mutex<VecDeque<JobId>>,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    started_at: DateTime<Utc>,
    shutdown: watch::Sender<bool>,
}

impl NodeRuntime {
    /// Create a runtime over the given bridge.
    pub fn new(config: NodeConfig, bridge: Arc<dyn EditorBridge>) -> Self {
        let dispatcher = DispatcherClient::new(config.dispatcher_address.clone());
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            node_id: RwLock::new(node_id),
            executor: JobExecutor::new(bridge),
            dispatcher,
            callback_client: reqwest::Client::new(),
            jobs: DashMap::new(),
            terminal_order: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started_at: Utc::now(),
            shutdown,
        }
    }

    /// The node's identity (dispatcher-assigned after registration).
    pub fn node_id(&self) -> NodeId {
        self.node_id.read().clone()
    }

    /// The node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Current counters, as reported in heartbeats and `/healthz`.
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            node_id: self.node_id(),
            active_jobs: self.active.load(Ordering::Relaxed),
            completed_jobs: self.completed.load(Ordering::Relaxed),
            failed_jobs: self.failed.load(Ordering::Relaxed),
            uptime_seconds: Utc::now()
                .signed_duration_since(self.started_at)
                .num_seconds()
                .max(0) as u64,
        }
    }

    /// Clone the local record of a job.
    pub fn job(&self, job_id: &JobId) -> Option<LocalJob> {
        self.jobs.get(job_id).map(|j| j.clone())
    }

    /// Register with the dispatcher.
    ///
    /// On success the runtime adopts the dispatcher-assigned node id.
    pub async fn register(&self) -> Result<()> {
        let request = RegisterNodeRequest {
            node_id: Some(self.node_id()),
            address: self.config.listen_address(),
            capabilities: self.config.capabilities.clone(),
            max_concurrent_jobs: self.config.max_concurrent_jobs,
        };
        let response = self.dispatcher.register(&request).await?;
        *self.node_id.write() = response.node_id.clone();
        info!(
            node_id = %response.node_id,
            cluster_id = %response.cluster_id,
            "registered with dispatcher"
        );
        Ok(())
    }

    /// Register and start the heartbeat and scheduler loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.register().await?;

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            runtime.heartbeat_loop().await;
        });

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            runtime.scheduler_loop().await;
        });

        info!(node_id = %self.node_id(), "node runtime started");
        Ok(())
    }

    /// Accept an Execute RPC into the local queue.
    ///
    /// Rejects job types outside the node's declared capabilities with
    /// `unsupported-capability`.
    pub fn accept(&self, request: ExecuteJobRequest) -> ExecuteJobResponse {
        let supported = bridge::required_capabilities(&request.job_type)
            .is_some_and(|required| {
                required
                    .iter()
                    .all(|tag| self.config.capabilities.iter().any(|c| c == tag))
            });
        if !supported {
            warn!(
                job_id = %request.job_id,
                job_type = %request.job_type,
                "rejecting job outside declared capabilities"
            );
            return ExecuteJobResponse {
                accepted: false,
                error_kind: Some(JobErrorKind::UnsupportedCapability),
                message: format!("node does not support job type {}", request.job_type),
            };
        }

        let job_id = request.job_id.clone();
        debug!(job_id = %job_id, job_type = %request.job_type, "job accepted");
        self.jobs.insert(job_id.clone(), LocalJob::from_request(request));
        ExecuteJobResponse {
            accepted: true,
            error_kind: None,
            message: format!("job {job_id} queued"),
        }
    }

    /// Cancel a local job.
    ///
    /// Queued jobs terminate immediately; running jobs get their cancel
    /// flag set and finish at the next bridge boundary.
    pub async fn cancel(self: &Arc<Self>, job_id: &JobId) -> bool {
        let flagged = {
            let Some(mut job) = self.jobs.get_mut(job_id) else {
                return false;
            };
            if job.status.is_terminal() {
                return false;
            }
            job.cancel.cancel();
            if job.status == JobStatus::Queued {
                job.status = JobStatus::Cancelled;
                job.error_kind = Some(JobErrorKind::Cancelled);
                job.error_message = Some("cancelled by dispatcher".to_string());
                job.completed_at = Some(Utc::now());
                Some(job.clone())
            } else {
                None
            }
        };

        if let Some(job) = flagged {
            info!(job_id = %job_id, "queued job cancelled");
            self.record_terminal(&job);
            self.report_and_callback(job).await;
        } else {
            info!(job_id = %job_id, "cancel flag set on running job");
        }
        true
    }

    /// Run a streaming job, returning its id and the frame stream.
    ///
    /// The job executes to completion even if the returned receiver is
    /// dropped; its terminal state is recorded like any other job.
    pub fn run_streaming(
        self: &Arc<Self>,
        job_type: &str,
        payload: serde_json::Value,
    ) -> (JobId, mpsc::Receiver<StreamFrame>) {
        let job_id = uuid::Uuid::new_v4().to_string();
        let (sender, rx) = progress_channel(32);

        let mut job = LocalJob::from_request(ExecuteJobRequest {
            job_id: job_id.clone(),
            job_type: job_type.to_string(),
            payload: payload.clone(),
            priority: 0,
            callback_url: None,
        });
        job.cancel = sender.cancel_flag();
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        self.jobs.insert(job_id.clone(), job);

        let runtime = Arc::clone(self);
        let id = job_id.clone();
        let job_type = job_type.to_string();
        tokio::spawn(async move {
            runtime.active.fetch_add(1, Ordering::Relaxed);
            let outcome = runtime
                .executor
                .execute_streaming(&job_type, &payload, sender)
                .await;
            runtime.active.fetch_sub(1, Ordering::Relaxed);
            runtime.finish_local(&id, outcome).await;
        });

        (job_id, rx)
    }

    /// Heartbeat loop. After three consecutive failures the node assumes
    /// the dispatcher lost its registration and re-registers.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.stats();
                    let request = HeartbeatRequest {
                        node_id: stats.node_id,
                        active_jobs: stats.active_jobs,
                        completed_jobs: stats.completed_jobs,
                        failed_jobs: stats.failed_jobs,
                        sent_at: Utc::now(),
                    };
                    match self.dispatcher.heartbeat(&request).await {
                        Ok(_) => failures = 0,
                        Err(err) => {
                            failures += 1;
                            warn!(error = %err, failures, "heartbeat failed");
                            if failures >= HEARTBEAT_FAILURE_LIMIT {
                                info!("re-registering after repeated heartbeat failures");
                                if self.register().await.is_ok() {
                                    failures = 0;
                                }
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Local scheduler: pull queued jobs in priority order while below the
    /// concurrency cap.
    async fn scheduler_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(SCHEDULER_TICK);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    while self.active.load(Ordering::Relaxed) < self.config.max_concurrent_jobs {
                        let Some(job_id) = self.next_queued() else {
                            break;
                        };
                        self.spawn_worker(job_id);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Pick the best queued job: highest priority, then oldest receipt.
    fn next_queued(&self) -> Option<JobId> {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Queued)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.received_at.cmp(&b.received_at))
                    .then_with(|| a.job_id.cmp(&b.job_id))
            })
            .map(|j| j.job_id.clone())
    }

    fn spawn_worker(self: &Arc<Self>, job_id: JobId) {
        // Claim the job before spawning so the scheduler cannot pick it twice.
        let claimed = {
            match self.jobs.get_mut(&job_id) {
                Some(mut job) if job.status == JobStatus::Queued => {
                    job.status = JobStatus::Running;
                    job.started_at = Some(Utc::now());
                    Some((job.job_type.clone(), job.payload.clone(), job.cancel.clone()))
                }
                _ => None,
            }
        };
        let Some((job_type, payload, cancel)) = claimed else {
            return;
        };

        self.active.fetch_add(1, Ordering::Relaxed);
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let report = JobStartedReport {
                job_id: job_id.clone(),
                node_id: runtime.node_id(),
                started_at: Utc::now(),
            };
            if let Err(err) = runtime.dispatcher.report_started(&report).await {
                debug!(job_id = %job_id, error = %err, "start report failed");
            }

            let outcome = runtime.executor.execute(&job_type, &payload, &cancel).await;
            runtime.active.fetch_sub(1, Ordering::Relaxed);
            runtime.finish_local(&job_id, outcome).await;
        });
    }

    /// Record a terminal outcome, report it to the dispatcher and deliver
    /// the callback when one is set.
    async fn finish_local(
        self: &Arc<Self>,
        job_id: &JobId,
        outcome: Result<serde_json::Value, (JobErrorKind, String)>,
    ) {
        let finished = {
            let Some(mut job) = self.jobs.get_mut(job_id) else {
                return;
            };
            if job.status.is_terminal() {
                // Cancelled out from under the worker; keep that outcome.
                job.clone()
            } else {
                job.completed_at = Some(Utc::now());
                match &outcome {
                    Ok(result) => {
                        job.status = JobStatus::Completed;
                        job.result = Some(result.clone());
                    }
                    Err((kind, message)) => {
                        job.status = if *kind == JobErrorKind::Cancelled {
                            JobStatus::Cancelled
                        } else {
                            JobStatus::Failed
                        };
                        job.error_kind = Some(*kind);
                        job.error_message = Some(message.clone());
                    }
                }
                job.clone()
            }
        };

        match finished.status {
            JobStatus::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                info!(job_id = %job_id, "job completed");
            }
            _ => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                info!(job_id = %job_id, status = %finished.status, "job did not complete");
            }
        }

        self.record_terminal(&finished);
        self.report_and_callback(finished).await;
    }

    async fn report_and_callback(self: &Arc<Self>, job: LocalJob) {
        let report = JobResultReport {
            job_id: job.job_id.clone(),
            node_id: self.node_id(),
            success: job.status == JobStatus::Completed,
            result: job.result.clone(),
            error_kind: job.error_kind,
            error_message: job.error_message.clone(),
            completed_at: job.completed_at.unwrap_or_else(Utc::now),
        };
        if let Err(err) = self.dispatcher.report_result(&report).await {
            warn!(job_id = %job.job_id, error = %err, "result report failed");
        }

        if let Some(url) = &job.callback_url {
            let payload = JobCallbackPayload {
                job_id: job.job_id.clone(),
                status: job.status,
                result: job.result.clone(),
                error: job.error_message.clone(),
                started_at: job.started_at,
                completed_at: job.completed_at,
                node_id: self.node_id(),
            };
            deliver_callback(&self.callback_client, url, &payload).await;
        }
    }

    /// Keep the terminal-job store bounded.
    fn record_terminal(&self, job: &LocalJob) {
        let mut order = self.terminal_order.lock();
        order.push_back(job.job_id.clone());
        while order.len() > MAX_TERMINAL_JOBS {
            if let Some(oldest) = order.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }

    /// Cancel all active jobs with `node-shutdown`, report them, and
    /// unregister from the dispatcher.
    pub async fn shutdown(self: &Arc<Self>) {
        info!(node_id = %self.node_id(), "node shutting down");
        let _ = self.shutdown.send(true);

        let open: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.job_id.clone())
            .collect();

        for job_id in open {
            let terminated = {
                match self.jobs.get_mut(&job_id) {
                    Some(mut job) if !job.status.is_terminal() => {
                        job.cancel.cancel();
                        job.status = JobStatus::Failed;
                        job.error_kind = Some(JobErrorKind::NodeShutdown);
                        job.error_message = Some("node shutdown".to_string());
                        job.completed_at = Some(Utc::now());
                        Some(job.clone())
                    }
                    _ => None,
                }
            };
            if let Some(job) = terminated {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.record_terminal(&job);
                self.report_and_callback(job).await;
            }
        }

        let request = UnregisterNodeRequest {
            node_id: self.node_id(),
        };
        if let Err(err) = self.dispatcher.unregister(&request).await {
            error!(error = %err, "unregister failed during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{SimulatedBridge, JOB_OPEN_FILE, JOB_THUMBNAIL};
    use serde_json::json;

    fn test_runtime() -> Arc<NodeRuntime> {
        let config = NodeConfig {
            node_id: Some("node-test".to_string()),
            capabilities: vec![JOB_OPEN_FILE.to_string(), JOB_THUMBNAIL.to_string()],
            max_concurrent_jobs: 2,
            ..NodeConfig::default()
        };
        Arc::new(NodeRuntime::new(
            config,
            Arc::new(SimulatedBridge::new().with_step_delay(Duration::ZERO)),
        ))
    }

    fn execute_request(job_id: &str, job_type: &str) -> ExecuteJobRequest {
        ExecuteJobRequest {
            job_id: job_id.to_string(),
            job_type: job_type.to_string(),
            payload: json!({"path": "/a.psd"}),
            priority: 0,
            callback_url: None,
        }
    }

    #[tokio::test]
    async fn test_accept_checks_capabilities() {
        let runtime = test_runtime();

        let accepted = runtime.accept(execute_request("job-1", JOB_OPEN_FILE));
        assert!(accepted.accepted);

        let rejected = runtime.accept(execute_request("job-2", "auto_retouch"));
        assert!(!rejected.accepted);
        assert_eq!(
            rejected.error_kind,
            Some(JobErrorKind::UnsupportedCapability)
        );

        let unknown = runtime.accept(execute_request("job-3", "transmogrify"));
        assert!(!unknown.accepted);
    }

    #[tokio::test]
    async fn test_scheduler_prefers_priority_then_age() {
        let runtime = test_runtime();
        let mut low = execute_request("job-low", JOB_OPEN_FILE);
        low.priority = 1;
        let mut high = execute_request("job-high", JOB_OPEN_FILE);
        high.priority = 9;

        runtime.accept(low);
        runtime.accept(high);

        assert_eq!(runtime.next_queued().as_deref(), Some("job-high"));
    }

    #[tokio::test]
    async fn test_cancel_queued_job_is_terminal() {
        let runtime = test_runtime();
        runtime.accept(execute_request("job-1", JOB_OPEN_FILE));

        assert!(runtime.cancel(&"job-1".to_string()).await);
        let job = runtime.job(&"job-1".to_string()).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // A second cancel is a no-op.
        assert!(!runtime.cancel(&"job-1".to_string()).await);
        assert!(!runtime.cancel(&"ghost".to_string()).await);
    }

    #[tokio::test]
    async fn test_streaming_job_records_terminal_state() {
        let runtime = test_runtime();
        let (job_id, mut rx) = runtime.run_streaming(
            JOB_THUMBNAIL,
            json!({"width": 64, "height": 64, "format": "png"}),
        );

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert!(frames.last().unwrap().is_terminal());

        // Give the worker task a moment to finish bookkeeping.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let job = runtime.job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_streaming_survives_dropped_listener() {
        let runtime = test_runtime();
        let (job_id, rx) = runtime.run_streaming(
            JOB_THUMBNAIL,
            json!({"width": 64, "height": 64, "format": "png"}),
        );
        drop(rx);

        // The job still runs to completion and records its terminal state.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let job = runtime.job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_store_is_bounded() {
        let runtime = test_runtime();
        for i in 0..(MAX_TERMINAL_JOBS + 10) {
            let job = LocalJob::from_request(execute_request(&format!("job-{i}"), JOB_OPEN_FILE));
            runtime.jobs.insert(job.job_id.clone(), job.clone());
            runtime.record_terminal(&job);
        }
        assert!(runtime.jobs.len() <= MAX_TERMINAL_JOBS);
    }
}
