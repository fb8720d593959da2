//! Configuration data structures for Editor Fleet
//!
//! Defines the dispatcher and node sections of the configuration schema.
//! Both are loaded through [`crate::config::ConfigLoader`] and validated
//! before use.

use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::time::Duration;

use crate::bridge;
use crate::cluster::types::RoutingPolicy;

/// Root configuration combining the dispatcher and node sections.
///
/// Configuration sources are merged in this precedence (highest to lowest):
/// 1. CLI arguments
/// 2. Environment variables (`EDITOR_FLEET_` prefix)
/// 3. Config file (`~/.config/editor-fleet/config.toml`)
/// 4. Defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Dispatcher process settings
    #[validate]
    pub dispatcher: DispatcherConfig,

    /// Worker node process settings
    #[validate]
    pub node: NodeConfig,
}

/// Settings for the dispatcher process.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Listen host
    #[validate(min_length = 1)]
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Active routing policy, cluster-wide
    pub routing_strategy: RoutingPolicy,

    /// Heartbeats older than this mark a node Unhealthy
    #[validate(minimum = 1)]
    pub node_timeout_seconds: u64,

    /// Queued or Assigned jobs older than this fail with deadline-exceeded
    #[validate(minimum = 1)]
    pub job_timeout_seconds: u64,

    /// Period of the health-check loop
    #[validate(minimum = 1)]
    pub health_check_interval_seconds: u64,

    /// Period of the cleanup loop
    #[validate(minimum = 1)]
    pub cleanup_interval_seconds: u64,

    /// Requeue budget for jobs lost to node failure
    #[validate(maximum = 100)]
    pub max_retries: u32,

    /// Hours terminal jobs stay visible before cleanup
    pub retention_hours: u64,

    /// Submissions beyond this many queued jobs are rejected
    #[validate(minimum = 1)]
    pub max_queued_jobs: usize,

    /// Degraded when rolling latency exceeds this factor over cluster median
    #[validate(minimum = 1.0)]
    pub degraded_latency_factor: f64,

    /// Cluster identity; generated fresh when not configured
    #[validate(min_length = 1)]
    pub cluster_id: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7400,
            routing_strategy: RoutingPolicy::LeastBusy,
            node_timeout_seconds: 60,
            job_timeout_seconds: 300,
            health_check_interval_seconds: 30,
            cleanup_interval_seconds: 3600,
            max_retries: 3,
            retention_hours: 24,
            max_queued_jobs: 10_000,
            degraded_latency_factor: 2.0,
            cluster_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl DispatcherConfig {
    /// Listen address (`host:port`).
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Health-check loop period.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    /// Cleanup loop period.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    /// Retention window for terminal jobs.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }
}

/// Settings for a worker node process.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node identity; generated at registration when absent
    pub node_id: Option<String>,

    /// Listen host
    #[validate(min_length = 1)]
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Base URL of the dispatcher control plane
    #[validate(min_length = 1)]
    pub dispatcher_address: String,

    /// Bound of the local worker pool
    #[validate(minimum = 1)]
    pub max_concurrent_jobs: usize,

    /// Capability tags advertised at registration
    pub capabilities: Vec<String>,

    /// Interval between heartbeats
    #[validate(minimum = 1)]
    pub heartbeat_interval_seconds: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            host: "127.0.0.1".to_string(),
            port: 7401,
            dispatcher_address: "http://127.0.0.1:7400".to_string(),
            max_concurrent_jobs: num_cpus::get(),
            capabilities: bridge::default_capabilities(),
            heartbeat_interval_seconds: 30,
        }
    }
}

impl NodeConfig {
    /// Listen address (`host:port`).
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Heartbeat loop period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.port, 7400);
        assert_eq!(config.node_timeout_seconds, 60);
        assert_eq!(config.job_timeout_seconds, 300);
        assert_eq!(config.health_check_interval_seconds, 30);
        assert_eq!(config.cleanup_interval_seconds, 3600);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retention_hours, 24);
        assert_eq!(config.routing_strategy, RoutingPolicy::LeastBusy);
        assert!(!config.cluster_id.is_empty());
    }

    #[test]
    fn test_node_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.heartbeat_interval_seconds, 30);
        assert!(config.max_concurrent_jobs >= 1);
        assert!(config.capabilities.contains(&"open_file".to_string()));
        assert_eq!(config.listen_address(), "127.0.0.1:7401");
    }

    #[test]
    fn test_fresh_cluster_ids_differ() {
        assert_ne!(
            DispatcherConfig::default().cluster_id,
            DispatcherConfig::default().cluster_id
        );
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let config = DispatcherConfig {
            node_timeout_seconds: 0,
            ..DispatcherConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_routing_strategy_parses_from_toml() {
        let config: DispatcherConfig =
            toml::from_str(r#"routing_strategy = "lowest_latency""#).unwrap();
        assert_eq!(config.routing_strategy, RoutingPolicy::LowestLatency);
    }
}
