// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Streaming progress protocol.
//!
//! Long-running operations report progress as a totally ordered sequence of
//! `{type, data}` frames: exactly one `start`, zero or more `progress`
//! frames with non-decreasing percentages, an optional `result`, and
//! exactly one terminal frame (`complete` or `error`). Anything emitted
//! after the terminal frame is discarded. [`ProgressSender`] enforces the
//! contract at the emitting side so every consumer observes a well-formed
//! stream.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Frame discriminator on the streaming transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    /// Declares the stream inputs; first frame, exactly once
    Start,
    /// Step progress with a monotonically non-decreasing percentage
    Progress,
    /// Successful terminal frame
    Complete,
    /// Failed terminal frame
    Error,
    /// Final payload, emitted before the terminal frame when present
    Result,
    /// Keep-alive reply; carries empty data
    Pong,
}

/// One frame on the streaming transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFrame {
    /// Frame discriminator
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    /// Frame payload
    pub data: serde_json::Value,
}

impl StreamFrame {
    /// Build a `start` frame carrying the declared inputs.
    pub fn start(data: serde_json::Value) -> Self {
        Self {
            frame_type: FrameType::Start,
            data,
        }
    }

    /// Build a `progress` frame.
    pub fn progress(step: &str, percent: u8, message: &str) -> Self {
        Self {
            frame_type: FrameType::Progress,
            data: serde_json::json!({
                "step": step,
                "percent": percent,
                "message": message,
            }),
        }
    }

    /// Build a `complete` frame.
    pub fn complete(data: serde_json::Value) -> Self {
        Self {
            frame_type: FrameType::Complete,
            data,
        }
    }

    /// Build an `error` frame.
    pub fn error(message: &str) -> Self {
        Self {
            frame_type: FrameType::Error,
            data: serde_json::json!({ "message": message }),
        }
    }

    /// Build a `result` frame carrying the final payload.
    pub fn result(data: serde_json::Value) -> Self {
        Self {
            frame_type: FrameType::Result,
            data,
        }
    }

    /// Build a `pong` keep-alive frame.
    pub fn pong() -> Self {
        Self {
            frame_type: FrameType::Pong,
            data: serde_json::json!({}),
        }
    }

    /// Whether this frame terminates its stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.frame_type, FrameType::Complete | FrameType::Error)
    }

    /// The `step` tag of a progress frame, when present.
    pub fn step(&self) -> Option<&str> {
        if self.frame_type == FrameType::Progress {
            self.data.get("step").and_then(|s| s.as_str())
        } else {
            None
        }
    }
}

/// Cooperative cancellation flag shared between a worker and its canceller.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct StreamState {
    started: bool,
    last_percent: u8,
    terminal_sent: bool,
}

/// Emitting side of one progress stream.
///
/// Enforces the frame contract: duplicate `start` frames and anything after
/// a terminal frame are dropped, and progress percentages are clamped so
/// the delivered sequence is non-decreasing.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<StreamFrame>,
    state: Arc<Mutex<StreamState>>,
    cancel: CancelFlag,
}

impl ProgressSender {
    /// Declare the stream inputs. Only the first call emits a frame.
    pub async fn start(&self, data: serde_json::Value) {
        {
            let mut state = self.state.lock();
            if state.started || state.terminal_sent {
                return;
            }
            state.started = true;
        }
        self.send(StreamFrame::start(data)).await;
    }

    /// Emit a progress frame. The percentage is clamped to keep the stream
    /// monotonic.
    pub async fn progress(&self, step: &str, percent: u8, message: &str) {
        let percent = {
            let mut state = self.state.lock();
            if state.terminal_sent {
                return;
            }
            let clamped = percent.clamp(state.last_percent, 100);
            state.last_percent = clamped;
            clamped
        };
        self.send(StreamFrame::progress(step, percent, message)).await;
    }

    /// Emit the final payload. Dropped once a terminal frame was sent.
    pub async fn result(&self, data: serde_json::Value) {
        if self.state.lock().terminal_sent {
            return;
        }
        self.send(StreamFrame::result(data)).await;
    }

    /// Emit the successful terminal frame. Only the first terminal wins.
    pub async fn complete(&self, data: serde_json::Value) {
        if !self.try_terminate() {
            return;
        }
        self.send(StreamFrame::complete(data)).await;
    }

    /// Emit the failed terminal frame. Only the first terminal wins.
    pub async fn error(&self, message: &str) {
        if !self.try_terminate() {
            return;
        }
        self.send(StreamFrame::error(message)).await;
    }

    /// Whether the consumer requested cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The cancellation flag tied to this stream.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn try_terminate(&self) -> bool {
        let mut state = self.state.lock();
        if state.terminal_sent {
            false
        } else {
            state.terminal_sent = true;
            true
        }
    }

    async fn send(&self, frame: StreamFrame) {
        // A dropped receiver means the transport went away; the operation
        // itself keeps running and records its terminal state elsewhere.
        let _ = self.tx.send(frame).await;
    }
}

/// Create a bounded progress stream.
pub fn progress_channel(buffer: usize) -> (ProgressSender, mpsc::Receiver<StreamFrame>) {
    let (tx, rx) = mpsc::channel(buffer);
    (
        ProgressSender {
            tx,
            state: Arc::new(Mutex::new(StreamState::default())),
            cancel: CancelFlag::new(),
        },
        rx,
    )
}

/// Coalesce a burst of frames for delivery.
///
/// Adjacent `progress` frames sharing a step tag collapse to the latest
/// one; `start` and terminal frames always survive.
pub fn coalesce_progress(frames: Vec<StreamFrame>) -> Vec<StreamFrame> {
    let mut out: Vec<StreamFrame> = Vec::with_capacity(frames.len());
    for frame in frames {
        let replace = matches!(
            (out.last().and_then(StreamFrame::step), frame.step()),
            (Some(prev), Some(next)) if prev == next
        );
        if replace {
            *out.last_mut().expect("non-empty on replace") = frame;
        } else {
            out.push(frame);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut rx: mpsc::Receiver<StreamFrame>) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_well_formed_stream() {
        let (sender, rx) = progress_channel(16);
        sender.start(serde_json::json!({"width": 256})).await;
        sender.progress("opening_file", 10, "opening").await;
        sender.progress("encoding_image", 80, "encoding").await;
        sender.complete(serde_json::json!({"width": 256})).await;

        let frames = collect(rx).await;
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].frame_type, FrameType::Start);
        assert_eq!(frames[3].frame_type, FrameType::Complete);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let (sender, rx) = progress_channel(16);
        sender.start(serde_json::json!({})).await;
        sender.progress("a", 50, "half").await;
        sender.progress("b", 30, "regression clamped").await;
        sender.complete(serde_json::json!({})).await;

        let frames = collect(rx).await;
        let percents: Vec<u64> = frames
            .iter()
            .filter(|f| f.frame_type == FrameType::Progress)
            .map(|f| f.data["percent"].as_u64().unwrap())
            .collect();
        assert_eq!(percents, vec![50, 50]);
    }

    #[tokio::test]
    async fn test_single_terminal_frame() {
        let (sender, rx) = progress_channel(16);
        sender.start(serde_json::json!({})).await;
        sender.complete(serde_json::json!({"ok": true})).await;
        sender.error("too late").await;
        sender.progress("late", 99, "dropped").await;
        sender.result(serde_json::json!({"dropped": true})).await;

        let frames = collect(rx).await;
        assert_eq!(frames.len(), 2);
        assert!(frames[1].is_terminal());
        assert_eq!(frames[1].frame_type, FrameType::Complete);
    }

    #[tokio::test]
    async fn test_duplicate_start_dropped() {
        let (sender, rx) = progress_channel(16);
        sender.start(serde_json::json!({"n": 1})).await;
        sender.start(serde_json::json!({"n": 2})).await;
        sender.error("boom").await;

        let frames = collect(rx).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data["n"], 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_panic() {
        let (sender, rx) = progress_channel(1);
        drop(rx);
        sender.start(serde_json::json!({})).await;
        sender.progress("a", 10, "still fine").await;
        sender.complete(serde_json::json!({})).await;
    }

    #[test]
    fn test_coalesce_same_step() {
        let frames = vec![
            StreamFrame::start(serde_json::json!({})),
            StreamFrame::progress("encode", 10, "a"),
            StreamFrame::progress("encode", 20, "b"),
            StreamFrame::progress("encode", 30, "c"),
            StreamFrame::progress("save", 90, "d"),
            StreamFrame::complete(serde_json::json!({})),
        ];
        let coalesced = coalesce_progress(frames);
        assert_eq!(coalesced.len(), 4);
        assert_eq!(coalesced[1].data["percent"], 30);
        assert_eq!(coalesced[2].data["percent"], 90);
        assert!(coalesced[3].is_terminal());
    }

    #[test]
    fn test_frame_serialization_shape() {
        let frame = StreamFrame::progress("opening_file", 10, "opening");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["data"]["step"], "opening_file");
        assert_eq!(json["data"]["percent"], 10);

        let pong = serde_json::to_value(StreamFrame::pong()).unwrap();
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["data"], serde_json::json!({}));
    }

    #[test]
    fn test_cancel_flag() {
        let (sender, _rx) = progress_channel(1);
        assert!(!sender.is_cancelled());
        sender.cancel_flag().cancel();
        assert!(sender.is_cancelled());
    }
}
