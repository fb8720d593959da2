// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Node health derivation.
//!
//! Liveness comes from heartbeat age against the node timeout. For live
//! nodes, Degraded is derived from two probes: a rolling average latency
//! that exceeds a configured factor over the cluster median, or a failure
//! rate above the threshold across the node's last ten jobs.

use chrono::{DateTime, Utc};

use crate::cluster::types::{Node, NodeStatus};

/// Failure rate above which a live node is considered Degraded.
pub const DEGRADED_FAILURE_RATE: f64 = 0.10;

/// Rules for deriving a node's lifecycle status.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    /// Heartbeats older than this many seconds mark the node Unhealthy
    pub node_timeout_seconds: u64,
    /// Degraded when rolling latency exceeds `factor x cluster median`
    pub degraded_latency_factor: f64,
}

impl HealthPolicy {
    /// Whether the node's heartbeat is fresh at `now`.
    pub fn is_live(&self, node: &Node, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(node.last_heartbeat).num_seconds();
        age >= 0 && (age as u64) <= self.node_timeout_seconds
    }

    /// Derive the status of a live node given the cluster latency median.
    ///
    /// Callers must have established liveness first; this never returns
    /// Unhealthy.
    pub fn classify_live(&self, node: &Node, cluster_median_latency: Option<f64>) -> NodeStatus {
        if node.failure_rate() > DEGRADED_FAILURE_RATE {
            return NodeStatus::Degraded;
        }
        if let Some(median) = cluster_median_latency {
            let avg = node.average_latency();
            if avg.is_finite() && median > 0.0 && avg > self.degraded_latency_factor * median {
                return NodeStatus::Degraded;
            }
        }
        NodeStatus::Healthy
    }
}

/// Median of the rolling average latencies across nodes with history.
///
/// Nodes with an empty history are excluded so one cold node cannot skew
/// the baseline to infinity.
pub fn cluster_median_latency(nodes: &[Node]) -> Option<f64> {
    let mut samples: Vec<f64> = nodes
        .iter()
        .map(Node::average_latency)
        .filter(|avg| avg.is_finite())
        .collect();
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(f64::total_cmp);
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        Some((samples[mid - 1] + samples[mid]) / 2.0)
    } else {
        Some(samples[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn node_with_latency(id: &str, samples: &[f64]) -> Node {
        let mut node = Node::new(id.to_string(), format!("{id}:7401"), vec![], 4);
        for s in samples {
            node.record_latency(*s);
        }
        node
    }

    fn policy() -> HealthPolicy {
        HealthPolicy {
            node_timeout_seconds: 60,
            degraded_latency_factor: 2.0,
        }
    }

    #[test]
    fn test_liveness_by_heartbeat_age() {
        let policy = policy();
        let mut node = node_with_latency("node-1", &[]);
        let now = Utc::now();

        assert!(policy.is_live(&node, now));

        node.last_heartbeat = now - Duration::seconds(61);
        assert!(!policy.is_live(&node, now));
    }

    #[test]
    fn test_median_excludes_cold_nodes() {
        let nodes = vec![
            node_with_latency("a", &[0.1]),
            node_with_latency("b", &[0.3]),
            node_with_latency("cold", &[]),
        ];
        let median = cluster_median_latency(&nodes).unwrap();
        assert!((median - 0.2).abs() < 1e-9);

        let all_cold = vec![node_with_latency("x", &[]), node_with_latency("y", &[])];
        assert!(cluster_median_latency(&all_cold).is_none());
    }

    #[test]
    fn test_slow_node_is_degraded() {
        let policy = policy();
        let slow = node_with_latency("slow", &[0.5]);
        let status = policy.classify_live(&slow, Some(0.1));
        assert_eq!(status, NodeStatus::Degraded);

        let fine = node_with_latency("fine", &[0.15]);
        assert_eq!(policy.classify_live(&fine, Some(0.1)), NodeStatus::Healthy);
    }

    #[test]
    fn test_failure_rate_degrades() {
        let policy = policy();
        let mut node = node_with_latency("flaky", &[0.1]);
        for _ in 0..8 {
            node.record_outcome(true);
        }
        node.record_outcome(false);
        node.record_outcome(false);

        assert_eq!(policy.classify_live(&node, Some(0.1)), NodeStatus::Degraded);
    }

    #[test]
    fn test_cold_node_without_median_is_healthy() {
        let policy = policy();
        let node = node_with_latency("cold", &[]);
        assert_eq!(policy.classify_live(&node, None), NodeStatus::Healthy);
    }
}
