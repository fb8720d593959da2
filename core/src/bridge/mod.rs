// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Editor bridge interface.
//!
//! A bridge drives one host-resident editor process. The cluster consumes
//! bridges through the narrow [`EditorBridge`] capability: execute one
//! operation against the editor, or execute it with streamed progress.
//! Platform backends implement this trait; the crate ships a
//! [`SimulatedBridge`] used by tests and local development. Bridges must be
//! safe to call from distinct jobs concurrently; the runtime never issues
//! two overlapping calls for the same underlying editor process.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::streaming::ProgressSender;

/// Job type tag: open a document.
pub const JOB_OPEN_FILE: &str = "open_file";
/// Job type tag: save the active document.
pub const JOB_SAVE_FILE: &str = "save_file";
/// Job type tag: export a named layer.
pub const JOB_EXPORT_LAYER: &str = "export_layer";
/// Job type tag: run a recorded editor action.
pub const JOB_RUN_ACTION: &str = "run_action";
/// Job type tag: evaluate a script inside the editor.
pub const JOB_EXECUTE_SCRIPT: &str = "execute_script";
/// Job type tag: describe the active document.
pub const JOB_DOCUMENT_INFO: &str = "get_document_info";
/// Job type tag: render a thumbnail (streaming variant).
pub const JOB_THUMBNAIL: &str = "thumbnail";
/// Job type tag: multi-step automated retouch (streaming variant).
pub const JOB_AUTO_RETOUCH: &str = "auto_retouch";

/// Every job type the cluster understands.
pub const KNOWN_JOB_TYPES: &[&str] = &[
    JOB_OPEN_FILE,
    JOB_SAVE_FILE,
    JOB_EXPORT_LAYER,
    JOB_RUN_ACTION,
    JOB_EXECUTE_SCRIPT,
    JOB_DOCUMENT_INFO,
    JOB_THUMBNAIL,
    JOB_AUTO_RETOUCH,
];

/// Capability tags a node declares unless configured otherwise.
pub fn default_capabilities() -> Vec<String> {
    [
        JOB_OPEN_FILE,
        JOB_SAVE_FILE,
        JOB_EXPORT_LAYER,
        JOB_RUN_ACTION,
        JOB_AUTO_RETOUCH,
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

/// Capability tags required to run a job type, or `None` for unknown types.
///
/// This is the dispatch registry: each known job type maps to the singleton
/// capability of the same name, and unknown types surface as
/// `unsupported-capability` at both routing and execution time.
pub fn required_capabilities(job_type: &str) -> Option<Vec<String>> {
    KNOWN_JOB_TYPES
        .contains(&job_type)
        .then(|| vec![job_type.to_string()])
}

/// Errors produced by a bridge backend.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// The editor reported a failure executing the operation
    #[error("bridge operation failed: {0}")]
    Failed(String),

    /// The operation observed its cancel flag and stopped early
    #[error("operation cancelled")]
    Cancelled,

    /// The backend does not implement this job type
    #[error("unsupported job type: {0}")]
    Unsupported(String),
}

/// Capability interface over one host-resident editor process.
#[async_trait]
pub trait EditorBridge: Send + Sync {
    /// Execute one editor operation and return its result payload.
    async fn execute(&self, job_type: &str, payload: &Value) -> Result<Value, BridgeError>;

    /// Whether this backend can stream progress for the given job type.
    fn supports_streaming(&self, _job_type: &str) -> bool {
        false
    }

    /// Execute with streamed progress.
    ///
    /// The default implementation synthesizes `start` and a terminal frame
    /// around the unary call so backends without native streaming still
    /// satisfy the protocol.
    async fn execute_streaming(
        &self,
        job_type: &str,
        payload: &Value,
        progress: ProgressSender,
    ) -> Result<Value, BridgeError> {
        progress.start(payload.clone()).await;
        match self.execute(job_type, payload).await {
            Ok(result) => {
                progress.result(result.clone()).await;
                progress.complete(json!({ "job_type": job_type })).await;
                Ok(result)
            }
            Err(err) => {
                progress.error(&err.to_string()).await;
                Err(err)
            }
        }
    }
}

/// In-process bridge standing in for a real editor.
///
/// Produces deterministic results per job type and streams the same step
/// sequence a real thumbnail or retouch backend reports.
#[derive(Debug, Clone)]
pub struct SimulatedBridge {
    step_delay: Duration,
}

impl Default for SimulatedBridge {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(5),
        }
    }
}

impl SimulatedBridge {
    /// Create a bridge with the default step delay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the delay between simulated steps.
    #[must_use]
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    fn thumbnail_result(payload: &Value) -> Value {
        let width = payload.get("width").and_then(Value::as_u64).unwrap_or(256);
        let height = payload.get("height").and_then(Value::as_u64).unwrap_or(256);
        let format = payload
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("jpeg");
        // A 1x1 placeholder; a real backend returns the rendered image.
        let data = base64::engine::general_purpose::STANDARD.encode([0u8, 0, 0]);
        json!({
            "width": width,
            "height": height,
            "format": format,
            "thumbnail": data,
        })
    }

    fn retouch_actions(payload: &Value) -> Vec<String> {
        payload
            .get("instructions")
            .and_then(Value::as_array)
            .map(|actions| {
                actions
                    .iter()
                    .filter_map(|a| a.as_str().map(ToString::to_string))
                    .collect()
            })
            .filter(|actions: &Vec<String>| !actions.is_empty())
            .unwrap_or_else(|| {
                vec![
                    "adjust_brightness".to_string(),
                    "adjust_contrast".to_string(),
                    "adjust_saturation".to_string(),
                ]
            })
    }
}

#[async_trait]
impl EditorBridge for SimulatedBridge {
    async fn execute(&self, job_type: &str, payload: &Value) -> Result<Value, BridgeError> {
        tokio::time::sleep(self.step_delay).await;
        let path = payload.get("path").and_then(Value::as_str).unwrap_or("");
        match job_type {
            JOB_OPEN_FILE => Ok(json!({ "opened": true, "path": path })),
            JOB_SAVE_FILE => Ok(json!({ "saved": true, "path": path })),
            JOB_EXPORT_LAYER => Ok(json!({
                "exported": true,
                "layer": payload.get("layer_name").cloned().unwrap_or(Value::Null),
                "path": path,
            })),
            JOB_RUN_ACTION => Ok(json!({
                "action_set": payload.get("action_set").cloned().unwrap_or(Value::Null),
                "action": payload.get("action_name").cloned().unwrap_or(Value::Null),
                "executed": true,
            })),
            JOB_EXECUTE_SCRIPT => Ok(json!({ "executed": true, "output": "" })),
            JOB_DOCUMENT_INFO => Ok(json!({
                "name": "untitled.psd",
                "width": 1920,
                "height": 1080,
                "color_mode": "rgb",
                "resolution": 72,
            })),
            JOB_THUMBNAIL => Ok(Self::thumbnail_result(payload)),
            JOB_AUTO_RETOUCH => Ok(json!({
                "actions_applied": Self::retouch_actions(payload).len(),
            })),
            other => Err(BridgeError::Unsupported(other.to_string())),
        }
    }

    fn supports_streaming(&self, job_type: &str) -> bool {
        matches!(job_type, JOB_THUMBNAIL | JOB_AUTO_RETOUCH)
    }

    async fn execute_streaming(
        &self,
        job_type: &str,
        payload: &Value,
        progress: ProgressSender,
    ) -> Result<Value, BridgeError> {
        match job_type {
            JOB_THUMBNAIL => {
                let width = payload.get("width").and_then(Value::as_u64).unwrap_or(256);
                let height = payload.get("height").and_then(Value::as_u64).unwrap_or(256);
                let format = payload
                    .get("format")
                    .and_then(Value::as_str)
                    .unwrap_or("jpeg")
                    .to_string();

                progress
                    .start(json!({ "width": width, "height": height, "format": format }))
                    .await;

                let steps: [(&str, u8, &str); 4] = [
                    ("opening_file", 10, "Opening file..."),
                    ("generating_thumbnail", 30, "Generating thumbnail..."),
                    ("executing_script", 50, "Executing script..."),
                    ("encoding_image", 80, "Encoding image..."),
                ];
                for (step, percent, message) in steps {
                    if progress.is_cancelled() {
                        progress.error("thumbnail generation cancelled").await;
                        return Err(BridgeError::Cancelled);
                    }
                    progress.progress(step, percent, message).await;
                    tokio::time::sleep(self.step_delay).await;
                }

                let result = Self::thumbnail_result(payload);
                progress
                    .complete(json!({ "width": width, "height": height, "format": format }))
                    .await;
                Ok(result)
            }
            JOB_AUTO_RETOUCH => {
                let actions = Self::retouch_actions(payload);
                progress
                    .start(json!({
                        "path": payload.get("path").cloned().unwrap_or(Value::Null),
                        "instruction_count": actions.len(),
                    }))
                    .await;

                let total = actions.len();
                for (done, action) in actions.iter().enumerate() {
                    if progress.is_cancelled() {
                        progress.error("retouch cancelled").await;
                        return Err(BridgeError::Cancelled);
                    }
                    let percent = ((done + 1) * 100 / total.max(1)).min(100) as u8;
                    progress
                        .progress(
                            "applying_adjustments",
                            percent,
                            &format!("Applying {action}"),
                        )
                        .await;
                    tokio::time::sleep(self.step_delay).await;
                }

                let result = json!({ "actions_applied": total });
                progress.complete(result.clone()).await;
                Ok(result)
            }
            other => {
                // No native streaming for the remaining types.
                EditorBridge::execute_streaming(
                    &UnaryOnly(self.clone()),
                    other,
                    payload,
                    progress,
                )
                .await
            }
        }
    }
}

// Wrapper that exposes only the unary path, so the default streaming
// synthesis can be reused without recursing into the override above.
struct UnaryOnly(SimulatedBridge);

#[async_trait]
impl EditorBridge for UnaryOnly {
    async fn execute(&self, job_type: &str, payload: &Value) -> Result<Value, BridgeError> {
        self.0.execute(job_type, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::{progress_channel, FrameType, StreamFrame};
    use tokio::sync::mpsc;

    async fn drain(mut rx: mpsc::Receiver<StreamFrame>) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_capability_registry() {
        assert_eq!(
            required_capabilities(JOB_THUMBNAIL),
            Some(vec!["thumbnail".to_string()])
        );
        assert!(required_capabilities("transmogrify").is_none());
        assert!(default_capabilities().contains(&"auto_retouch".to_string()));
    }

    #[tokio::test]
    async fn test_simulated_unary_execution() {
        let bridge = SimulatedBridge::new().with_step_delay(Duration::ZERO);
        let result = bridge
            .execute(JOB_OPEN_FILE, &json!({"path": "/tmp/a.psd"}))
            .await
            .unwrap();
        assert_eq!(result["opened"], true);
        assert_eq!(result["path"], "/tmp/a.psd");

        let err = bridge.execute("transmogrify", &json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_thumbnail_stream_frame_sequence() {
        let bridge = SimulatedBridge::new().with_step_delay(Duration::ZERO);
        let (sender, rx) = progress_channel(32);

        bridge
            .execute_streaming(
                JOB_THUMBNAIL,
                &json!({"width": 256, "height": 256, "format": "jpeg"}),
                sender,
            )
            .await
            .unwrap();

        let frames = drain(rx).await;
        let kinds: Vec<FrameType> = frames.iter().map(|f| f.frame_type).collect();
        assert_eq!(
            kinds,
            vec![
                FrameType::Start,
                FrameType::Progress,
                FrameType::Progress,
                FrameType::Progress,
                FrameType::Progress,
                FrameType::Complete,
            ]
        );

        assert_eq!(frames[0].data["width"], 256);
        assert_eq!(frames[0].data["format"], "jpeg");

        let steps: Vec<&str> = frames.iter().filter_map(StreamFrame::step).collect();
        assert_eq!(
            steps,
            vec![
                "opening_file",
                "generating_thumbnail",
                "executing_script",
                "encoding_image",
            ]
        );
        let percents: Vec<u64> = frames
            .iter()
            .filter(|f| f.frame_type == FrameType::Progress)
            .map(|f| f.data["percent"].as_u64().unwrap())
            .collect();
        assert_eq!(percents, vec![10, 30, 50, 80]);

        // Nothing after the terminal frame.
        assert!(frames.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_retouch_stream_counts_actions() {
        let bridge = SimulatedBridge::new().with_step_delay(Duration::ZERO);
        let (sender, rx) = progress_channel(32);

        let result = bridge
            .execute_streaming(
                JOB_AUTO_RETOUCH,
                &json!({"path": "/tmp/a.psd", "instructions": ["adjust_curves", "apply_filter"]}),
                sender,
            )
            .await
            .unwrap();
        assert_eq!(result["actions_applied"], 2);

        let frames = drain(rx).await;
        assert_eq!(frames[0].frame_type, FrameType::Start);
        assert_eq!(frames[0].data["instruction_count"], 2);
        let percents: Vec<u64> = frames
            .iter()
            .filter(|f| f.frame_type == FrameType::Progress)
            .map(|f| f.data["percent"].as_u64().unwrap())
            .collect();
        assert_eq!(percents, vec![50, 100]);
        assert_eq!(frames.last().unwrap().frame_type, FrameType::Complete);
    }

    #[tokio::test]
    async fn test_cancelled_stream_ends_with_error() {
        let bridge = SimulatedBridge::new().with_step_delay(Duration::ZERO);
        let (sender, rx) = progress_channel(32);
        sender.cancel_flag().cancel();

        let err = bridge
            .execute_streaming(JOB_THUMBNAIL, &json!({}), sender)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));

        let frames = drain(rx).await;
        assert_eq!(frames.last().unwrap().frame_type, FrameType::Error);
    }

    #[tokio::test]
    async fn test_synthesized_stream_for_unary_type() {
        let bridge = SimulatedBridge::new().with_step_delay(Duration::ZERO);
        assert!(!bridge.supports_streaming(JOB_OPEN_FILE));

        let (sender, rx) = progress_channel(32);
        bridge
            .execute_streaming(JOB_OPEN_FILE, &json!({"path": "/tmp/a.psd"}), sender)
            .await
            .unwrap();

        let frames = drain(rx).await;
        let kinds: Vec<FrameType> = frames.iter().map(|f| f.frame_type).collect();
        assert_eq!(
            kinds,
            vec![FrameType::Start, FrameType::Result, FrameType::Complete]
        );
    }
}
