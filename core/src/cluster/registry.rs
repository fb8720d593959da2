// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Node registry.
//!
//! A flat table of registered nodes keyed by id. Iteration is copy-on-read:
//! callers get owned snapshots so no lock is ever held across a suspension
//! point. Per-node mutable fields (counters, status, in-flight set) are
//! updated under the registry lock.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::cluster::types::{ClusterError, ClusterResult, JobId, Node, NodeId, NodeStatus};

/// Registry of worker nodes known to the dispatcher.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Node>>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node, or refresh an existing registration with the same id.
    ///
    /// Fails with an address conflict when a different node already claims
    /// the address.
    pub fn register(&self, node: Node) -> ClusterResult<()> {
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes
            .values()
            .find(|n| n.address == node.address && n.id != node.id)
        {
            return Err(ClusterError::AddressConflict(format!(
                "address {} already registered by node {}",
                node.address, existing.id
            )));
        }
        nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node, returning its final record.
    pub fn remove(&self, node_id: &NodeId) -> Option<Node> {
        self.nodes.write().remove(node_id)
    }

    /// Clone a node record by id.
    pub fn get(&self, node_id: &NodeId) -> Option<Node> {
        self.nodes.read().get(node_id).cloned()
    }

    /// Whether a node is currently registered.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    /// Apply a mutation to a node under the registry lock.
    ///
    /// Returns `None` when the node is not registered.
    pub fn update<R>(&self, node_id: &NodeId, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        self.nodes.write().get_mut(node_id).map(f)
    }

    /// Atomically reserve one slot on a node for a job.
    ///
    /// Succeeds only while the node is available; adds the job to the
    /// in-flight set and increments the active counter in one critical
    /// section so capacity can never be oversubscribed.
    pub fn try_reserve(&self, node_id: &NodeId, job_id: &JobId) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(node_id) {
            Some(node) if node.is_available() => {
                node.in_flight.insert(job_id.clone());
                node.active_jobs = node.in_flight.len();
                true
            }
            _ => false,
        }
    }

    /// Release a previously reserved slot, the inverse of [`Self::try_reserve`].
    pub fn release(&self, node_id: &NodeId, job_id: &JobId) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(node_id) {
            node.in_flight.remove(job_id);
            node.active_jobs = node.in_flight.len();
        }
    }

    /// Release a slot and record the job outcome in the node's history.
    pub fn finish_job(&self, node_id: &NodeId, job_id: &JobId, success: bool) -> bool {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(node_id) {
            if node.in_flight.remove(job_id) {
                node.active_jobs = node.in_flight.len();
                node.record_outcome(success);
                return true;
            }
        }
        false
    }

    /// Owned snapshot of every node.
    pub fn snapshot(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }

    /// Owned snapshot of the nodes currently accepting work.
    pub fn available(&self) -> Vec<Node> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.is_available())
            .cloned()
            .collect()
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Drop nodes that have been Unhealthy since before `cutoff`, returning
    /// the removed records.
    pub fn purge_unhealthy(&self, cutoff: DateTime<Utc>) -> Vec<Node> {
        let mut nodes = self.nodes.write();
        let stale: Vec<NodeId> = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Unhealthy && n.last_heartbeat < cutoff)
            .map(|n| n.id.clone())
            .collect();
        stale.into_iter().filter_map(|id| nodes.remove(&id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn node(id: &str, address: &str, max: usize) -> Node {
        Node::new(
            id.to_string(),
            address.to_string(),
            vec!["open_file".to_string()],
            max,
        )
    }

    #[test]
    fn test_register_and_refresh() {
        let registry = NodeRegistry::new();
        registry.register(node("node-1", "localhost:7401", 4)).unwrap();
        assert_eq!(registry.len(), 1);

        // Same id re-registers in place.
        registry.register(node("node-1", "localhost:7401", 8)).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&"node-1".to_string()).unwrap().max_concurrent_jobs, 8);
    }

    #[test]
    fn test_address_conflict() {
        let registry = NodeRegistry::new();
        registry.register(node("node-1", "localhost:7401", 4)).unwrap();

        let err = registry
            .register(node("node-2", "localhost:7401", 4))
            .unwrap_err();
        assert_eq!(err.kind(), "address-conflict");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reserve_respects_capacity() {
        let registry = NodeRegistry::new();
        registry.register(node("node-1", "localhost:7401", 2)).unwrap();
        let id = "node-1".to_string();

        assert!(registry.try_reserve(&id, &"job-1".to_string()));
        assert!(registry.try_reserve(&id, &"job-2".to_string()));
        assert!(!registry.try_reserve(&id, &"job-3".to_string()));

        let n = registry.get(&id).unwrap();
        assert_eq!(n.active_jobs, 2);
        assert!(n.in_flight.contains("job-1"));
    }

    #[test]
    fn test_release_is_inverse_of_reserve() {
        let registry = NodeRegistry::new();
        registry.register(node("node-1", "localhost:7401", 1)).unwrap();
        let id = "node-1".to_string();

        assert!(registry.try_reserve(&id, &"job-1".to_string()));
        registry.release(&id, &"job-1".to_string());

        let n = registry.get(&id).unwrap();
        assert_eq!(n.active_jobs, 0);
        assert!(n.in_flight.is_empty());
        assert!(registry.try_reserve(&id, &"job-2".to_string()));
    }

    #[test]
    fn test_finish_job_records_outcome() {
        let registry = NodeRegistry::new();
        registry.register(node("node-1", "localhost:7401", 2)).unwrap();
        let id = "node-1".to_string();

        registry.try_reserve(&id, &"job-1".to_string());
        assert!(registry.finish_job(&id, &"job-1".to_string(), true));
        assert!(!registry.finish_job(&id, &"job-1".to_string(), true));

        let n = registry.get(&id).unwrap();
        assert_eq!(n.completed_jobs, 1);
        assert_eq!(n.active_jobs, 0);
    }

    #[test]
    fn test_unavailable_node_rejects_reservation() {
        let registry = NodeRegistry::new();
        registry.register(node("node-1", "localhost:7401", 4)).unwrap();
        let id = "node-1".to_string();
        registry.update(&id, |n| n.status = NodeStatus::Unhealthy);

        assert!(!registry.try_reserve(&id, &"job-1".to_string()));
        assert!(registry.available().is_empty());
    }

    #[test]
    fn test_purge_unhealthy() {
        let registry = NodeRegistry::new();
        registry.register(node("stale", "localhost:7401", 4)).unwrap();
        registry.register(node("live", "localhost:7402", 4)).unwrap();

        registry.update(&"stale".to_string(), |n| {
            n.status = NodeStatus::Unhealthy;
            n.last_heartbeat = Utc::now() - Duration::hours(2);
        });

        let removed = registry.purge_unhealthy(Utc::now() - Duration::hours(1));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "stale");
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&"live".to_string()));
    }
}
