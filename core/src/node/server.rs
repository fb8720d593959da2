// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Node HTTP listener.
//!
//! Serves the dispatcher-facing RPCs (`/execute`, `/cancel/{job_id}`,
//! `/healthz`) and the client-facing streaming endpoints
//! (`/thumbnail/stream`, `/retouch/stream`). A streaming endpoint receives
//! one JSON request message, runs the operation through the bridge, and
//! forwards its frames; if the socket drops mid-stream the job keeps
//! running and its terminal state is still recorded locally.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::bridge::{JOB_AUTO_RETOUCH, JOB_THUMBNAIL};
use crate::cluster::protocol::{ExecuteJobRequest, ExecuteJobResponse};
use crate::node::runtime::{LocalJob, NodeRuntime, NodeStats};
use crate::streaming::{coalesce_progress, StreamFrame};

/// Build the node's router.
pub fn router(runtime: Arc<NodeRuntime>) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/cancel/:job_id", post(cancel))
        .route("/healthz", get(healthz))
        .route("/jobs/:job_id", get(job_status))
        .route("/thumbnail/stream", get(thumbnail_stream))
        .route("/retouch/stream", get(retouch_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}

/// Serve the node listener until the task is aborted.
pub async fn serve(runtime: Arc<NodeRuntime>, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    info!(address = %listener.local_addr()?, "node listener started");
    axum::serve(listener, router(runtime)).await?;
    Ok(())
}

async fn execute(
    State(runtime): State<Arc<NodeRuntime>>,
    Json(request): Json<ExecuteJobRequest>,
) -> Json<ExecuteJobResponse> {
    Json(runtime.accept(request))
}

async fn cancel(
    State(runtime): State<Arc<NodeRuntime>>,
    Path(job_id): Path<String>,
) -> Json<serde_json::Value> {
    let cancelled = runtime.cancel(&job_id).await;
    Json(serde_json::json!({ "job_id": job_id, "cancelled": cancelled }))
}

async fn healthz(State(runtime): State<Arc<NodeRuntime>>) -> Json<NodeStats> {
    Json(runtime.stats())
}

async fn job_status(
    State(runtime): State<Arc<NodeRuntime>>,
    Path(job_id): Path<String>,
) -> Result<Json<LocalJob>, StatusCode> {
    runtime.job(&job_id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn thumbnail_stream(
    ws: WebSocketUpgrade,
    State(runtime): State<Arc<NodeRuntime>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, runtime, JOB_THUMBNAIL))
}

async fn retouch_stream(ws: WebSocketUpgrade, State(runtime): State<Arc<NodeRuntime>>) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, runtime, JOB_AUTO_RETOUCH))
}

/// Drive one streaming operation over a websocket.
async fn handle_stream(mut socket: WebSocket, runtime: Arc<NodeRuntime>, job_type: &'static str) {
    // The first client message carries the operation parameters.
    let payload = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                Ok(value) => break value,
                Err(err) => {
                    let frame = StreamFrame::error(&format!("invalid request: {err}"));
                    let _ = send_frame(&mut socket, &frame).await;
                    return;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => return,
        }
    };

    let (job_id, rx) = runtime.run_streaming(job_type, payload);
    info!(job_id = %job_id, job_type, "streaming operation started");

    forward_frames(&mut socket, rx).await;
    debug!(job_id = %job_id, "stream finished");
}

/// Forward frames to the socket, coalescing bursts of same-step progress.
async fn forward_frames(socket: &mut WebSocket, mut rx: mpsc::Receiver<StreamFrame>) {
    while let Some(first) = rx.recv().await {
        // Drain whatever else is ready so adjacent progress frames with
        // the same step collapse to the latest one.
        let mut burst = vec![first];
        while let Ok(frame) = rx.try_recv() {
            burst.push(frame);
        }

        for frame in coalesce_progress(burst) {
            let terminal = frame.is_terminal();
            if send_frame(socket, &frame).await.is_err() {
                // Listener went away; the job keeps running.
                warn!("stream listener dropped mid-operation");
                return;
            }
            if terminal {
                return;
            }
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &StreamFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text)).await
}
