// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! REST surface of the dispatcher.
//!
//! The client-facing paths (`/submit_job`, `/job_status/{id}`,
//! `/cluster_status`, `/cancel_job/{id}`) are stable; the remaining routes
//! are the node-facing control plane (register/unregister/heartbeat and
//! the internal job reports).

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::error::ApiResult;
use crate::api::models::{ClusterStatusQuery, HealthResponse};
use crate::api::websocket;
use crate::cluster::protocol::{
    CancelJobResponse, ClusterStatusResponse, HeartbeatRequest, HeartbeatResponse,
    JobResultReport, JobStartedReport, RegisterNodeRequest, RegisterNodeResponse,
    SubmitJobRequest, SubmitJobResponse, UnregisterNodeRequest, UnregisterNodeResponse,
};
use crate::cluster::types::Job;
use crate::cluster::Dispatcher;

/// Build the dispatcher's router.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/submit_job", post(submit_job))
        .route("/job_status/:job_id", get(job_status))
        .route("/cluster_status", get(cluster_status))
        .route("/cancel_job/:job_id", post(cancel_job))
        .route("/register_node", post(register_node))
        .route("/unregister_node", post(unregister_node))
        .route("/heartbeat", post(heartbeat))
        .route("/internal/job_started", post(job_started))
        .route("/internal/job_result", post(job_result))
        .route("/ws", get(websocket::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(dispatcher)
}

/// Serve the dispatcher listener until the task is aborted.
pub async fn serve(
    dispatcher: Arc<Dispatcher>,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    tracing::info!(address = %listener.local_addr()?, "dispatcher listener started");
    axum::serve(listener, router(dispatcher)).await?;
    Ok(())
}

async fn health(State(dispatcher): State<Arc<Dispatcher>>) -> Json<HealthResponse> {
    let status = dispatcher.cluster_status(false);
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: crate::VERSION.to_string(),
        timestamp: Utc::now(),
        uptime_seconds: status.uptime_seconds,
    })
}

async fn submit_job(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<SubmitJobRequest>,
) -> ApiResult<Json<SubmitJobResponse>> {
    Ok(Json(dispatcher.submit_job(request)?))
}

async fn job_status(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(dispatcher.get_job(&job_id)?))
}

async fn cluster_status(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(query): Query<ClusterStatusQuery>,
) -> Json<ClusterStatusResponse> {
    Json(dispatcher.cluster_status(query.include_nodes))
}

async fn cancel_job(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<CancelJobResponse>> {
    Ok(Json(dispatcher.cancel_job(&job_id).await?))
}

async fn register_node(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<RegisterNodeRequest>,
) -> ApiResult<Json<RegisterNodeResponse>> {
    Ok(Json(dispatcher.register_node(request)?))
}

async fn unregister_node(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<UnregisterNodeRequest>,
) -> ApiResult<Json<UnregisterNodeResponse>> {
    Ok(Json(dispatcher.unregister_node(&request)?))
}

async fn heartbeat(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    Ok(Json(dispatcher.heartbeat(&request)?))
}

async fn job_started(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(report): Json<JobStartedReport>,
) -> Json<serde_json::Value> {
    dispatcher.report_job_started(&report);
    Json(serde_json::json!({ "accepted": true }))
}

async fn job_result(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(report): Json<JobResultReport>,
) -> Json<serde_json::Value> {
    dispatcher.report_job_result(report);
    Json(serde_json::json!({ "accepted": true }))
}
