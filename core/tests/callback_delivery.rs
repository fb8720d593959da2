// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Terminal-callback delivery against a mock HTTP endpoint.

use chrono::Utc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use editor_fleet_core::cluster::protocol::JobCallbackPayload;
use editor_fleet_core::cluster::types::JobStatus;
use editor_fleet_core::node::executor::deliver_callback;

fn payload(job_id: &str, status: JobStatus) -> JobCallbackPayload {
    JobCallbackPayload {
        job_id: job_id.to_string(),
        status,
        result: (status == JobStatus::Completed).then(|| serde_json::json!({"opened": true})),
        error: (status != JobStatus::Completed).then(|| "bridge failure".to_string()),
        started_at: Some(Utc::now()),
        completed_at: Some(Utc::now()),
        node_id: "node-1".to_string(),
    }
}

#[tokio::test]
async fn callback_posts_terminal_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/job-done"))
        .and(body_partial_json(serde_json::json!({
            "job_id": "job-1",
            "status": "completed",
            "node_id": "node-1",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    deliver_callback(
        &client,
        &format!("{}/hooks/job-done", server.uri()),
        &payload("job-1", JobStatus::Completed),
    )
    .await;
}

#[tokio::test]
async fn failed_job_callback_carries_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/job-done"))
        .and(body_partial_json(serde_json::json!({
            "job_id": "job-2",
            "status": "failed",
            "error": "bridge failure",
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    deliver_callback(
        &client,
        &format!("{}/hooks/job-done", server.uri()),
        &payload("job-2", JobStatus::Failed),
    )
    .await;
}

#[tokio::test]
async fn non_2xx_response_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/job-done"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    // A rejected delivery is logged and abandoned; it must not loop.
    deliver_callback(
        &client,
        &format!("{}/hooks/job-done", server.uri()),
        &payload("job-3", JobStatus::Completed),
    )
    .await;
}

#[tokio::test]
async fn unreachable_callback_target_gives_up_quietly() {
    let client = reqwest::Client::new();
    // Nothing listens here; all attempts fail and the call still returns.
    deliver_callback(
        &client,
        "http://127.0.0.1:1/hooks/job-done",
        &payload("job-4", JobStatus::Completed),
    )
    .await;
}
