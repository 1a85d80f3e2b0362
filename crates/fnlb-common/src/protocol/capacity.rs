use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::protocol::error::{FnlbError, Result};

/// Capacity for one logical routing group on one runner node.
///
/// `used` must never exceed `total`; snapshots violating this are rejected
/// by [`CapacitySnapshot::validate`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupCapacity {
    pub group_key: String,
    pub total: u32,
    pub used: u32,
}

impl GroupCapacity {
    pub fn new(group_key: impl Into<String>, total: u32, used: u32) -> Self {
        Self {
            group_key: group_key.into(),
            total,
            used,
        }
    }

    /// Free execution slots. Never negative.
    pub fn available(&self) -> u32 {
        debug_assert!(
            self.used <= self.total,
            "group {} reports used {} > total {}",
            self.group_key,
            self.used,
            self.total
        );
        self.total.saturating_sub(self.used)
    }
}

/// A runner node's self-reported capacity at one instant.
///
/// A snapshot is authoritative and total for its node: ingesting it replaces
/// everything previously known about that node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CapacitySnapshot {
    #[serde(alias = "nodeID", alias = "node_id")]
    pub node_id: String,
    /// Milliseconds since the UNIX epoch, as seen by the node
    pub timestamp: u64,
    #[serde(default)]
    pub groups: Vec<GroupCapacity>,
}

impl CapacitySnapshot {
    pub fn new(node_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp,
            groups: Vec::new(),
        }
    }

    /// Creates an empty snapshot stamped with the current wall-clock time.
    pub fn now(node_id: impl Into<String>) -> Self {
        Self::new(node_id, current_timestamp_ms())
    }

    pub fn with_group(mut self, group: GroupCapacity) -> Self {
        self.groups.push(group);
        self
    }

    /// Checks the structural invariants of a snapshot before ingestion.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(FnlbError::InvalidRequest(
                "snapshot nodeId must not be empty".to_string(),
            ));
        }

        for group in &self.groups {
            if group.group_key.is_empty() {
                return Err(FnlbError::InvalidRequest(format!(
                    "snapshot from {} contains a group with an empty key",
                    self.node_id
                )));
            }
            if group.used > group.total {
                return Err(FnlbError::InvalidRequest(format!(
                    "group {} on {} reports used {} greater than total {}",
                    group.group_key, self.node_id, group.used, group.total
                )));
            }
        }

        Ok(())
    }
}

/// Milliseconds since the UNIX epoch, or 0 if the clock is before it.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Answer to a capacity query: available slots per node for one group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityView {
    pub group: String,
    pub nodes: BTreeMap<String, u32>,
}

/// One registry entry as exposed by the node listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: String,
    pub timestamp: u64,
    pub groups: Vec<GroupCapacity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeListing {
    pub nodes: Vec<NodeStatus>,
}

/// Outcome of a streamed snapshot push.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: u64,
    pub rejected: u64,
}
