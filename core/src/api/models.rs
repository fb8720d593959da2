// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Request and response models specific to the HTTP facade.
//!
//! The RPC payloads themselves live in [`crate::cluster::protocol`]; this
//! module holds the wrappers the HTTP layer adds around them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured error body returned for every failed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable error kind (e.g. `not-found`, `queue-full`)
    pub kind: String,
    /// Human-readable message
    pub message: String,
}

/// Facade liveness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always "healthy" while the process serves requests
    pub status: String,
    /// Library version
    pub version: String,
    /// Server time
    pub timestamp: DateTime<Utc>,
    /// Seconds since the dispatcher started
    pub uptime_seconds: u64,
}

/// Query parameters of `GET /cluster_status`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterStatusQuery {
    /// Include the per-node breakdown
    #[serde(default)]
    pub include_nodes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_shape() {
        let body = ErrorResponse {
            kind: "queue-full".to_string(),
            message: "queue full: 10000 jobs queued".to_string(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "queue-full");
    }

    #[test]
    fn test_cluster_status_query_defaults() {
        let query: ClusterStatusQuery = serde_json::from_str("{}").unwrap();
        assert!(!query.include_nodes);
    }
}
