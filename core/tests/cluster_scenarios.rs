// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! End-to-end cluster scenarios over real HTTP listeners.
//!
//! A dispatcher and one or more worker nodes run in-process on loopback
//! ports; jobs are submitted through the HTTP facade and executed through
//! the simulated editor bridge.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use editor_fleet_core::api;
use editor_fleet_core::bridge::SimulatedBridge;
use editor_fleet_core::cluster::Dispatcher;
use editor_fleet_core::config::{DispatcherConfig, NodeConfig};
use editor_fleet_core::node::{server as node_server, NodeRuntime};

struct TestCluster {
    dispatcher_url: String,
    client: reqwest::Client,
}

impl TestCluster {
    /// Start a dispatcher with its HTTP facade on a loopback port.
    async fn start(config: DispatcherConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::with_http_transport(config));
        let _loops = dispatcher.spawn_background_loops();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            api::serve(dispatcher, listener).await.unwrap();
        });

        Self {
            dispatcher_url: format!("http://{address}"),
            client: reqwest::Client::new(),
        }
    }

    /// Start a worker node registered against this dispatcher. Returns the
    /// node's listen address.
    async fn start_node(&self, capabilities: Vec<String>, max_concurrent: usize) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let config = NodeConfig {
            node_id: None,
            host: address.ip().to_string(),
            port: address.port(),
            dispatcher_address: self.dispatcher_url.clone(),
            max_concurrent_jobs: max_concurrent,
            capabilities,
            heartbeat_interval_seconds: 1,
        };
        let runtime = Arc::new(NodeRuntime::new(
            config,
            Arc::new(SimulatedBridge::new().with_step_delay(Duration::from_millis(2))),
        ));

        let serve_runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            node_server::serve(serve_runtime, listener).await.unwrap();
        });
        runtime.start().await.unwrap();

        address.to_string()
    }

    async fn submit(&self, body: serde_json::Value) -> serde_json::Value {
        self.client
            .post(format!("{}/submit_job", self.dispatcher_url))
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn job_status(&self, job_id: &str) -> serde_json::Value {
        self.client
            .get(format!("{}/job_status/{job_id}", self.dispatcher_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Poll until the job reaches a terminal state.
    async fn wait_terminal(&self, job_id: &str) -> serde_json::Value {
        for _ in 0..100 {
            let job = self.job_status(job_id).await;
            let status = job["status"].as_str().unwrap_or_default().to_string();
            if matches!(status.as_str(), "completed" | "failed" | "cancelled") {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }
}

#[tokio::test]
async fn job_flows_through_the_cluster() {
    let cluster = TestCluster::start(DispatcherConfig::default()).await;
    cluster
        .start_node(vec!["open_file".to_string()], 4)
        .await;

    let response = cluster
        .submit(json!({
            "job_type": "open_file",
            "payload": {"path": "/images/portrait.psd"},
            "priority": 3,
        }))
        .await;
    let job_id = response["job_id"].as_str().unwrap();
    assert_eq!(response["status"], "queued");

    let job = cluster.wait_terminal(job_id).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["result"]["opened"], true);
    assert_eq!(job["result"]["path"], "/images/portrait.psd");
    assert_eq!(job["progress"], 100);
    assert!(job["assigned_node"].is_string());
}

#[tokio::test]
async fn cluster_status_reflects_registered_nodes() {
    let cluster = TestCluster::start(DispatcherConfig::default()).await;
    cluster
        .start_node(vec!["open_file".to_string(), "save_file".to_string()], 2)
        .await;

    let status: serde_json::Value = cluster
        .client
        .get(format!(
            "{}/cluster_status?include_nodes=true",
            cluster.dispatcher_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(status["total_nodes"], 1);
    assert_eq!(status["available_nodes"], 1);
    let nodes = status["nodes"].as_array().unwrap();
    assert_eq!(nodes[0]["max_concurrent_jobs"], 2);
}

#[tokio::test]
async fn cancel_before_dispatch_never_reaches_a_node() {
    // No nodes registered: the job stays queued until cancelled.
    let cluster = TestCluster::start(DispatcherConfig::default()).await;

    let response = cluster
        .submit(json!({ "job_type": "open_file", "payload": {} }))
        .await;
    let job_id = response["job_id"].as_str().unwrap();

    let cancel: serde_json::Value = cluster
        .client
        .post(format!("{}/cancel_job/{job_id}", cluster.dispatcher_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cancel["status"], "cancelled");
    assert_eq!(cancel["already_terminal"], false);

    // Cancelling again reports the existing terminal state.
    let again: serde_json::Value = cluster
        .client
        .post(format!("{}/cancel_job/{job_id}", cluster.dispatcher_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["status"], "cancelled");
    assert_eq!(again["already_terminal"], true);
}

#[tokio::test]
async fn unknown_job_type_is_rejected_with_kind() {
    let cluster = TestCluster::start(DispatcherConfig::default()).await;

    let response = cluster
        .client
        .post(format!("{}/submit_job", cluster.dispatcher_url))
        .json(&json!({ "job_type": "transmogrify" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "unsupported-capability");
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn missing_job_is_not_found() {
    let cluster = TestCluster::start(DispatcherConfig::default()).await;
    let response = cluster
        .client
        .get(format!("{}/job_status/ghost", cluster.dispatcher_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "not-found");
}

#[tokio::test]
async fn higher_priority_jobs_dispatch_first() {
    let cluster = TestCluster::start(DispatcherConfig::default()).await;

    // Submit both jobs before any node exists so they queue together.
    let low = cluster
        .submit(json!({ "job_type": "open_file", "payload": {}, "priority": 1 }))
        .await;
    let high = cluster
        .submit(json!({ "job_type": "open_file", "payload": {}, "priority": 5 }))
        .await;
    let low_id = low["job_id"].as_str().unwrap();
    let high_id = high["job_id"].as_str().unwrap();

    // A single-slot node forces serialization in queue order.
    cluster.start_node(vec!["open_file".to_string()], 1).await;

    let high_job = cluster.wait_terminal(high_id).await;
    let low_job = cluster.wait_terminal(low_id).await;
    assert_eq!(high_job["status"], "completed");
    assert_eq!(low_job["status"], "completed");

    let high_started: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(high_job["started_at"].clone()).unwrap();
    let low_started: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(low_job["started_at"].clone()).unwrap();
    assert!(
        high_started <= low_started,
        "high-priority job should start first ({high_started} vs {low_started})"
    );
}

#[tokio::test]
async fn streaming_thumbnail_emits_ordered_frames() {
    let cluster = TestCluster::start(DispatcherConfig::default()).await;
    let node_address = cluster
        .start_node(vec!["thumbnail".to_string()], 2)
        .await;

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{node_address}/thumbnail/stream"))
            .await
            .unwrap();

    socket
        .send(WsMessage::Text(
            json!({"width": 256, "height": 256, "format": "jpeg"}).to_string(),
        ))
        .await
        .unwrap();

    let mut frames: Vec<serde_json::Value> = Vec::new();
    while let Some(message) = socket.next().await {
        match message.unwrap() {
            WsMessage::Text(text) => {
                let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                let terminal = frame["type"] == "complete" || frame["type"] == "error";
                frames.push(frame);
                if terminal {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    assert_eq!(frames.first().unwrap()["type"], "start");
    assert_eq!(frames.first().unwrap()["data"]["width"], 256);
    assert_eq!(frames.first().unwrap()["data"]["format"], "jpeg");

    let last = frames.last().unwrap();
    assert_eq!(last["type"], "complete");
    assert_eq!(last["data"]["width"], 256);

    // Progress percentages are non-decreasing and the step order holds
    // even if adjacent same-step frames were coalesced.
    let progress: Vec<&serde_json::Value> =
        frames.iter().filter(|f| f["type"] == "progress").collect();
    assert!(!progress.is_empty());
    let percents: Vec<u64> = progress
        .iter()
        .map(|f| f["data"]["percent"].as_u64().unwrap())
        .collect();
    let mut sorted = percents.clone();
    sorted.sort_unstable();
    assert_eq!(percents, sorted, "progress must be monotonic: {percents:?}");

    let steps: Vec<&str> = progress
        .iter()
        .map(|f| f["data"]["step"].as_str().unwrap())
        .collect();
    let expected = [
        "opening_file",
        "generating_thumbnail",
        "executing_script",
        "encoding_image",
    ];
    let mut expected_iter = expected.iter();
    for step in &steps {
        assert!(
            expected_iter.any(|e| e == step),
            "unexpected step order: {steps:?}"
        );
    }
}

#[tokio::test]
async fn node_heartbeats_keep_it_healthy() {
    let config = DispatcherConfig {
        node_timeout_seconds: 2,
        health_check_interval_seconds: 1,
        ..DispatcherConfig::default()
    };
    let cluster = TestCluster::start(config).await;
    cluster.start_node(vec!["open_file".to_string()], 2).await;

    // Outlive several health-check periods; the 1s heartbeat keeps the
    // node available the whole time.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let status: serde_json::Value = cluster
        .client
        .get(format!("{}/cluster_status", cluster.dispatcher_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["available_nodes"], 1);

    // The cluster still executes work after the wait.
    let response = cluster
        .submit(json!({ "job_type": "open_file", "payload": {} }))
        .await;
    let job = cluster
        .wait_terminal(response["job_id"].as_str().unwrap())
        .await;
    assert_eq!(job["status"], "completed");
}
