// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Node-side client for the dispatcher control plane.

use std::time::Duration;

use crate::cluster::protocol::{
    HeartbeatRequest, HeartbeatResponse, JobResultReport, JobStartedReport, RegisterNodeRequest,
    RegisterNodeResponse, UnregisterNodeRequest, UnregisterNodeResponse,
};
use crate::cluster::transport::DEFAULT_RPC_TIMEOUT;
use crate::cluster::types::{ClusterError, ClusterResult};

/// HTTP client a node uses to talk to its dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl DispatcherClient {
    /// Create a client against the dispatcher base URL
    /// (e.g. `http://127.0.0.1:7400`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Override the per-call deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The dispatcher base URL this client targets.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register this node with the dispatcher.
    pub async fn register(
        &self,
        request: &RegisterNodeRequest,
    ) -> ClusterResult<RegisterNodeResponse> {
        self.post("/register_node", request).await
    }

    /// Unregister this node.
    pub async fn unregister(
        &self,
        request: &UnregisterNodeRequest,
    ) -> ClusterResult<UnregisterNodeResponse> {
        self.post("/unregister_node", request).await
    }

    /// Send a heartbeat with the node's current counters.
    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> ClusterResult<HeartbeatResponse> {
        self.post("/heartbeat", request).await
    }

    /// Report that a job began executing.
    pub async fn report_started(&self, report: &JobStartedReport) -> ClusterResult<()> {
        self.post::<_, serde_json::Value>("/internal/job_started", report)
            .await
            .map(|_| ())
    }

    /// Report a terminal job outcome.
    pub async fn report_result(&self, report: &JobResultReport) -> ClusterResult<()> {
        self.post::<_, serde_json::Value>("/internal/job_result", report)
            .await
            .map(|_| ())
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> ClusterResult<R>
    where
        B: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::map_error(path, &e))?;

        if response.status().is_success() {
            response
                .json::<R>()
                .await
                .map_err(|e| Self::map_error(path, &e))
        } else {
            // The dispatcher returns a structured {kind, message} body.
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            match serde_json::from_str::<ErrorBody>(&body) {
                Ok(err) if err.kind == "not-found" => Err(ClusterError::NotFound(err.message)),
                Ok(err) if err.kind == "address-conflict" => {
                    Err(ClusterError::AddressConflict(err.message))
                }
                Ok(err) => Err(ClusterError::BadRequest(format!(
                    "{} ({})",
                    err.message, err.kind
                ))),
                Err(_) => Err(ClusterError::BadRequest(format!(
                    "dispatcher returned {status} for {path}"
                ))),
            }
        }
    }

    fn map_error(context: &str, err: &reqwest::Error) -> ClusterError {
        if err.is_timeout() {
            ClusterError::RpcTimeout(format!("dispatcher call {context}"))
        } else if err.is_connect() {
            ClusterError::NodeUnreachable(format!("dispatcher call {context}: {err}"))
        } else {
            ClusterError::TransportDropped(format!("dispatcher call {context}: {err}"))
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    kind: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let client = DispatcherClient::new("http://localhost:7400/");
        assert_eq!(client.base_url(), "http://localhost:7400");
    }

    #[tokio::test]
    async fn test_unreachable_dispatcher() {
        let client =
            DispatcherClient::new("http://127.0.0.1:1").with_timeout(Duration::from_millis(500));
        let err = client
            .heartbeat(&HeartbeatRequest {
                node_id: "node-1".to_string(),
                active_jobs: 0,
                completed_jobs: 0,
                failed_jobs: 0,
                sent_at: chrono::Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClusterError::NodeUnreachable(_) | ClusterError::RpcTimeout(_)
        ));
    }
}
