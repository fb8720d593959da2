// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Job execution against the editor bridge, and terminal callbacks.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::bridge::{BridgeError, EditorBridge};
use crate::cluster::protocol::JobCallbackPayload;
use crate::cluster::types::JobErrorKind;
use crate::streaming::{CancelFlag, ProgressSender};

/// Callback delivery attempts before giving up.
const CALLBACK_ATTEMPTS: u32 = 3;

/// Base delay of the callback backoff; doubles per attempt.
const CALLBACK_BACKOFF: Duration = Duration::from_millis(200);

/// Executes jobs against an editor bridge with cooperative cancellation.
#[derive(Clone)]
pub struct JobExecutor {
    bridge: Arc<dyn EditorBridge>,
}

impl JobExecutor {
    /// Create an executor over a bridge.
    pub fn new(bridge: Arc<dyn EditorBridge>) -> Self {
        Self { bridge }
    }

    /// The bridge this executor drives.
    pub fn bridge(&self) -> &Arc<dyn EditorBridge> {
        &self.bridge
    }

    /// Run one job to completion.
    ///
    /// The cancel flag is observed at bridge boundaries: before the call,
    /// and again after it returns, so a cancellation that lands mid-call
    /// still terminates the job as cancelled.
    pub async fn execute(
        &self,
        job_type: &str,
        payload: &Value,
        cancel: &CancelFlag,
    ) -> Result<Value, (JobErrorKind, String)> {
        if cancel.is_cancelled() {
            return Err((JobErrorKind::Cancelled, "cancelled before start".to_string()));
        }

        let result = self.bridge.execute(job_type, payload).await;

        if cancel.is_cancelled() {
            return Err((JobErrorKind::Cancelled, "cancelled".to_string()));
        }

        result.map_err(|err| match err {
            BridgeError::Cancelled => (JobErrorKind::Cancelled, "cancelled".to_string()),
            BridgeError::Unsupported(t) => (
                JobErrorKind::UnsupportedCapability,
                format!("unsupported job type: {t}"),
            ),
            BridgeError::Failed(msg) => (JobErrorKind::BridgeFailed, msg),
        })
    }

    /// Run one job with streamed progress; the sink's cancel flag doubles
    /// as the job's cancel flag.
    pub async fn execute_streaming(
        &self,
        job_type: &str,
        payload: &Value,
        progress: ProgressSender,
    ) -> Result<Value, (JobErrorKind, String)> {
        self.bridge
            .execute_streaming(job_type, payload, progress)
            .await
            .map_err(|err| match err {
                BridgeError::Cancelled => (JobErrorKind::Cancelled, "cancelled".to_string()),
                BridgeError::Unsupported(t) => (
                    JobErrorKind::UnsupportedCapability,
                    format!("unsupported job type: {t}"),
                ),
                BridgeError::Failed(msg) => (JobErrorKind::BridgeFailed, msg),
            })
    }
}

/// Deliver a terminal callback to the job's callback URL.
///
/// Best-effort: up to three attempts with exponential backoff. A non-2xx
/// response is logged and abandoned without affecting job state.
pub async fn deliver_callback(client: &reqwest::Client, url: &str, payload: &JobCallbackPayload) {
    let mut delay = CALLBACK_BACKOFF;
    for attempt in 1..=CALLBACK_ATTEMPTS {
        match client.post(url).json(payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!(job_id = %payload.job_id, url, "callback delivered");
                return;
            }
            Ok(response) => {
                warn!(
                    job_id = %payload.job_id,
                    url,
                    status = %response.status(),
                    "callback rejected"
                );
                return;
            }
            Err(err) => {
                warn!(
                    job_id = %payload.job_id,
                    url,
                    attempt,
                    error = %err,
                    "callback delivery failed"
                );
                if attempt < CALLBACK_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{SimulatedBridge, JOB_OPEN_FILE};
    use serde_json::json;

    fn executor() -> JobExecutor {
        JobExecutor::new(Arc::new(
            SimulatedBridge::new().with_step_delay(Duration::ZERO),
        ))
    }

    #[tokio::test]
    async fn test_execute_success() {
        let result = executor()
            .execute(JOB_OPEN_FILE, &json!({"path": "/a.psd"}), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(result["opened"], true);
    }

    #[tokio::test]
    async fn test_unknown_type_maps_to_unsupported() {
        let (kind, _) = executor()
            .execute("transmogrify", &json!({}), &CancelFlag::new())
            .await
            .unwrap_err();
        assert_eq!(kind, JobErrorKind::UnsupportedCapability);
    }

    #[tokio::test]
    async fn test_pre_cancelled_job_never_runs() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let (kind, _) = executor()
            .execute(JOB_OPEN_FILE, &json!({}), &cancel)
            .await
            .unwrap_err();
        assert_eq!(kind, JobErrorKind::Cancelled);
    }
}
