use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fnlb_common::protocol::{CapacitySnapshot, FnlbError, NodeStatus, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::node::RunnerNode;

/// Fleet capacity keyed by node ID.
///
/// Each ingestion takes only the shard lock for its own node, so snapshots
/// from different nodes proceed in parallel and a slow sweep never stalls
/// the whole registry.
pub struct CapacityRegistry {
    nodes: DashMap<String, RunnerNode>,
}

impl CapacityRegistry {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    /// Validates and stores a snapshot, replacing the node's previous state.
    ///
    /// # Errors
    /// `InvalidRequest` for a snapshot that fails validation, and
    /// `StaleSnapshot` when it is older than the stored one.
    pub fn ingest_snapshot(&self, snapshot: CapacitySnapshot) -> Result<()> {
        self.ingest_snapshot_at(snapshot, Instant::now())
    }

    /// Same as [`ingest_snapshot`](Self::ingest_snapshot) with an explicit
    /// receive instant.
    ///
    /// A snapshot strictly older than the stored one fails with
    /// `StaleSnapshot` and leaves the stored state untouched. An equal
    /// timestamp is accepted.
    pub fn ingest_snapshot_at(&self, snapshot: CapacitySnapshot, received_at: Instant) -> Result<()> {
        snapshot.validate()?;

        match self.nodes.entry(snapshot.node_id.clone()) {
            Entry::Occupied(mut entry) => {
                let last_seen = entry.get().timestamp;
                if snapshot.timestamp < last_seen {
                    warn!(
                        "Rejected stale snapshot from {}: {} < {}",
                        snapshot.node_id, snapshot.timestamp, last_seen
                    );
                    return Err(FnlbError::StaleSnapshot {
                        node_id: snapshot.node_id,
                        timestamp: snapshot.timestamp,
                        last_seen,
                    });
                }
                debug!(
                    "Snapshot from {} at {} ({} groups)",
                    snapshot.node_id,
                    snapshot.timestamp,
                    snapshot.groups.len()
                );
                entry.insert(RunnerNode::from_snapshot(snapshot, received_at));
            }
            Entry::Vacant(entry) => {
                info!("Node {} registered", snapshot.node_id);
                entry.insert(RunnerNode::from_snapshot(snapshot, received_at));
            }
        }

        Ok(())
    }

    /// Available slots per node for one group. Nodes that did not report
    /// the group are absent.
    pub fn query_capacity(&self, group_key: &str) -> HashMap<String, u32> {
        self.nodes
            .iter()
            .filter_map(|node| {
                node.available(group_key)
                    .map(|available| (node.node_id.clone(), available))
            })
            .collect()
    }

    /// Available slots for one group on one node.
    pub fn available(&self, node_id: &str, group_key: &str) -> Option<u32> {
        self.nodes.get(node_id).and_then(|n| n.available(group_key))
    }

    pub fn node(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|n| n.status())
    }

    /// All nodes, ordered by ID.
    pub fn nodes(&self) -> Vec<NodeStatus> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|n| n.status()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Removes nodes silent for longer than `ttl`, returning their IDs.
    pub fn sweep_expired(&self, ttl: Duration) -> Vec<String> {
        self.sweep_expired_at(Instant::now(), ttl)
    }

    /// Same as [`sweep_expired`](Self::sweep_expired) with an explicit
    /// current instant.
    ///
    /// # Arguments
    /// * `now` - Instant the silence of each node is measured against
    /// * `ttl` - Longest silence a node survives
    ///
    /// # Returns
    /// IDs of the removed nodes, in no particular order.
    pub fn sweep_expired_at(&self, now: Instant, ttl: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        self.nodes.retain(|node_id, node| {
            if node.is_expired(now, ttl) {
                expired.push(node_id.clone());
                false
            } else {
                true
            }
        });

        for node_id in &expired {
            info!("Node {} expired after {:?} without a snapshot", node_id, ttl);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for CapacityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
