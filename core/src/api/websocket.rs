// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! WebSocket endpoint for real-time cluster events.
//!
//! Connected clients receive every cluster lifecycle event as an
//! `{"type": "event", "data": {...}}` frame and may send
//! `{"type": "ping"}` at any time to get a `pong` back.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::cluster::{ClusterEvent, Dispatcher};
use crate::streaming::StreamFrame;

/// Upgrade handler for `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Arc<Dispatcher>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, dispatcher))
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(rename = "type")]
    message_type: String,
}

/// Serialize a cluster event into its wire frame.
fn event_frame(event: &ClusterEvent) -> serde_json::Value {
    serde_json::json!({
        "type": "event",
        "data": {
            "topic": event.kind.topic(),
            "payload": event.data,
            "timestamp": event.timestamp,
        },
    })
}

async fn handle_socket(mut socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    info!("websocket client connected");
    let mut events = BroadcastStream::new(dispatcher.subscribe_events());

    loop {
        tokio::select! {
            event = events.next() => {
                match event {
                    Some(Ok(event)) => {
                        let text = event_frame(&event).to_string();
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Slow clients skip events rather than stall the cluster.
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        debug!(skipped, "websocket client lagged behind event stream");
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let is_ping = serde_json::from_str::<InboundMessage>(&text)
                            .is_ok_and(|m| m.message_type == "ping");
                        if is_ping {
                            let pong = serde_json::to_string(&StreamFrame::pong())
                                .unwrap_or_else(|_| r#"{"type":"pong","data":{}}"#.to_string());
                            if socket.send(Message::Text(pong)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    info!("websocket client disconnected");
}
