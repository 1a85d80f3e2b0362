use fnlb_common::protocol::{CapacitySnapshot, GroupCapacity, NodeStatus};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A runner node as last reported to the registry.
///
/// `timestamp` is the node's own clock and only orders snapshots from the
/// same node. `received_at` is the router's monotonic clock and drives
/// expiry, so clock skew between runner and router never affects liveness.
#[derive(Debug, Clone)]
pub struct RunnerNode {
    pub node_id: String,
    pub timestamp: u64,
    pub received_at: Instant,
    pub groups: HashMap<String, GroupCapacity>,
}

impl RunnerNode {
    pub fn from_snapshot(snapshot: CapacitySnapshot, received_at: Instant) -> Self {
        let groups = snapshot
            .groups
            .into_iter()
            .map(|g| (g.group_key.clone(), g))
            .collect();
        Self {
            node_id: snapshot.node_id,
            timestamp: snapshot.timestamp,
            received_at,
            groups,
        }
    }

    /// Free slots for a group, or `None` if the node did not report it.
    pub fn available(&self, group_key: &str) -> Option<u32> {
        self.groups.get(group_key).map(GroupCapacity::available)
    }

    /// Whether the node has gone longer than `ttl` without a snapshot.
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.received_at) > ttl
    }

    pub fn status(&self) -> NodeStatus {
        let mut groups: Vec<_> = self.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.group_key.cmp(&b.group_key));
        NodeStatus {
            node_id: self.node_id.clone(),
            timestamp: self.timestamp,
            groups,
        }
    }
}
