//! Node registry — known peers, their capabilities and liveness.
//!
//! Entries move `Active` → `Stale` (missed one health-check interval) →
//! evicted (missed the configured number of intervals). The registry is a
//! concurrent map, so writers only contend on the shard holding their entry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Liveness of a node as seen by the health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Seen within the current health-check window.
    Active,
    /// Missed at least one health check.
    Stale,
    /// Missed the eviction threshold. Only observable in a [`SweepReport`].
    Unreachable,
}

/// A peer agent known to this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkNode {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
    pub capabilities: BTreeSet<String>,
    pub last_seen: DateTime<Utc>,
    pub status: NodeStatus,
    /// Whole health-check intervals elapsed since `last_seen`.
    pub missed_checks: u32,
    /// Round-trip latency of the last successful probe.
    pub latency_ms: Option<u64>,
}

impl NetworkNode {
    pub fn new(id: NodeId, host: impl Into<String>, port: u16, capabilities: BTreeSet<String>) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            capabilities,
            last_seen: Utc::now(),
            status: NodeStatus::Active,
            missed_checks: 0,
            latency_ms: None,
        }
    }

    /// `host:port` form of the node's address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Nodes that moved to (or remain in) `Stale`.
    pub stale: Vec<NodeId>,
    /// Nodes marked `Unreachable` and removed.
    pub evicted: Vec<NetworkNode>,
}

/// Thread-safe registry of known nodes. Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<DashMap<String, NetworkNode>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a node. A repeat registration replaces address
    /// and capabilities and refreshes `last_seen`.
    pub fn register(
        &self,
        id: NodeId,
        host: impl Into<String>,
        port: u16,
        capabilities: BTreeSet<String>,
    ) -> NetworkNode {
        let node = NetworkNode::new(id, host, port, capabilities);
        let previous = self.nodes.insert(node.id.as_str().to_string(), node.clone());
        if previous.is_none() {
            tracing::info!("Registered node {} at {}", node.id, node.address());
        } else {
            tracing::debug!("Refreshed node {} at {}", node.id, node.address());
        }
        node
    }

    pub fn get(&self, id: &str) -> Option<NetworkNode> {
        self.nodes.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<NetworkNode> {
        self.nodes.remove(id).map(|(_, node)| node)
    }

    pub fn list_all(&self) -> Vec<NetworkNode> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn list_active(&self) -> Vec<NetworkNode> {
        self.nodes
            .iter()
            .filter(|entry| entry.status == NodeStatus::Active)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|entry| entry.status == NodeStatus::Active)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.nodes.len()
    }

    /// Record that `id` answered. Returns false for unknown nodes.
    pub fn mark_seen(&self, id: &str, latency_ms: Option<u64>) -> bool {
        match self.nodes.get_mut(id) {
            Some(mut node) => {
                node.last_seen = Utc::now();
                node.status = NodeStatus::Active;
                node.missed_checks = 0;
                if latency_ms.is_some() {
                    node.latency_ms = latency_ms;
                }
                true
            }
            None => false,
        }
    }

    /// Replace the capability set of a known node.
    pub fn update_capabilities(&self, id: &str, capabilities: BTreeSet<String>) -> bool {
        match self.nodes.get_mut(id) {
            Some(mut node) => {
                node.capabilities = capabilities;
                true
            }
            None => false,
        }
    }

    /// Re-evaluate every node's status against `now`.
    ///
    /// A node whose `last_seen` is more than one `interval` old becomes
    /// `Stale`; one older than `interval * missed_threshold` becomes
    /// `Unreachable` and is removed.
    pub fn sweep(&self, now: DateTime<Utc>, interval: Duration, missed_threshold: u32) -> SweepReport {
        let interval_ms = interval.as_millis().max(1) as i64;
        let eviction_ms = interval_ms * i64::from(missed_threshold.max(1));

        let mut report = SweepReport::default();
        let mut to_evict = Vec::new();

        for mut entry in self.nodes.iter_mut() {
            let elapsed_ms = now.signed_duration_since(entry.last_seen).num_milliseconds();
            entry.missed_checks = (elapsed_ms.max(0) / interval_ms) as u32;

            if elapsed_ms > eviction_ms {
                entry.status = NodeStatus::Unreachable;
                to_evict.push(entry.key().clone());
            } else if elapsed_ms > interval_ms {
                entry.status = NodeStatus::Stale;
                report.stale.push(entry.id.clone());
            }
        }

        for id in to_evict {
            // A probe reply may have refreshed the entry since the scan.
            if let Some((_, node)) = self
                .nodes
                .remove_if(&id, |_, node| node.status == NodeStatus::Unreachable)
            {
                report.evicted.push(node);
            }
        }

        report
    }

    #[cfg(test)]
    pub(crate) fn set_last_seen(&self, id: &str, last_seen: DateTime<Utc>) {
        if let Some(mut node) = self.nodes.get_mut(id) {
            node.last_seen = last_seen;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_and_get() {
        let registry = NodeRegistry::new();
        registry.register(NodeId::from("alpha"), "127.0.0.1", 9470, caps(&["search"]));

        let node = registry.get("alpha").unwrap();
        assert_eq!(node.port, 9470);
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.address(), "127.0.0.1:9470");
        assert_eq!(registry.total_count(), 1);
    }

    #[test]
    fn test_register_is_idempotent_upsert() {
        let registry = NodeRegistry::new();
        registry.register(NodeId::from("alpha"), "10.0.0.1", 9470, caps(&["search"]));
        registry.set_last_seen("alpha", Utc::now() - chrono::Duration::seconds(45));

        registry.register(NodeId::from("alpha"), "10.0.0.2", 9480, caps(&["code"]));

        assert_eq!(registry.total_count(), 1);
        let node = registry.get("alpha").unwrap();
        assert_eq!(node.host, "10.0.0.2");
        assert_eq!(node.port, 9480);
        assert_eq!(node.capabilities, caps(&["code"]));
        assert!(Utc::now().signed_duration_since(node.last_seen).num_seconds() < 5);
    }

    #[test]
    fn test_sweep_active_stale_removed() {
        let registry = NodeRegistry::new();
        let now = Utc::now();
        for id in ["fresh", "late", "gone"] {
            registry.register(NodeId::from(id), "127.0.0.1", 9000, BTreeSet::new());
        }
        registry.set_last_seen("fresh", now - chrono::Duration::seconds(10));
        registry.set_last_seen("late", now - chrono::Duration::seconds(61));
        registry.set_last_seen("gone", now - chrono::Duration::seconds(91));

        let report = registry.sweep(now, Duration::from_secs(30), 3);

        assert_eq!(registry.get("fresh").unwrap().status, NodeStatus::Active);
        let late = registry.get("late").unwrap();
        assert_eq!(late.status, NodeStatus::Stale);
        assert_eq!(late.missed_checks, 2);
        assert!(registry.get("gone").is_none());

        assert_eq!(report.stale, vec![NodeId::from("late")]);
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].status, NodeStatus::Unreachable);
    }

    #[test]
    fn test_mark_seen_revives_stale_node() {
        let registry = NodeRegistry::new();
        registry.register(NodeId::from("beta"), "127.0.0.1", 9000, BTreeSet::new());
        registry.set_last_seen("beta", Utc::now() - chrono::Duration::seconds(40));
        registry.sweep(Utc::now(), Duration::from_secs(30), 3);
        assert_eq!(registry.get("beta").unwrap().status, NodeStatus::Stale);
        assert_eq!(registry.active_count(), 0);

        assert!(registry.mark_seen("beta", Some(12)));
        let node = registry.get("beta").unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.latency_ms, Some(12));
        assert_eq!(registry.list_active().len(), 1);
        assert!(!registry.mark_seen("unknown", None));
    }

    #[test]
    fn test_update_capabilities_and_remove() {
        let registry = NodeRegistry::new();
        registry.register(NodeId::from("gamma"), "127.0.0.1", 9000, caps(&["a"]));
        assert!(registry.update_capabilities("gamma", caps(&["a", "b"])));
        assert_eq!(registry.get("gamma").unwrap().capabilities.len(), 2);

        assert!(registry.remove("gamma").is_some());
        assert!(!registry.contains("gamma"));
        assert!(!registry.update_capabilities("gamma", BTreeSet::new()));
    }

    #[test]
    fn test_clones_share_entries() {
        let registry = NodeRegistry::new();
        let view = registry.clone();
        registry.register(NodeId::from("delta"), "127.0.0.1", 9000, BTreeSet::new());
        assert!(view.contains("delta"));
    }
}
