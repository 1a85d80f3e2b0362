//! Capacity heartbeat for runner nodes.
//!
//! A [`CapacityReporter`] asks its [`CapacityProvider`] for the node's
//! current group capacities and pushes them to the router every interval.
//! The router expires nodes that stop reporting, so the interval should be
//! well under the router's snapshot TTL.

use fnlb_common::protocol::{current_timestamp_ms, CapacitySnapshot, FnlbError, GroupCapacity, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ControlClient;

/// Source of a node's current capacity.
pub trait CapacityProvider: Send + Sync {
    fn groups(&self) -> Vec<GroupCapacity>;
}

impl<F> CapacityProvider for F
where
    F: Fn() -> Vec<GroupCapacity> + Send + Sync,
{
    fn groups(&self) -> Vec<GroupCapacity> {
        self()
    }
}

/// Periodically pushes one node's capacity snapshot to the router.
pub struct CapacityReporter {
    client: ControlClient,
    node_id: String,
    interval: Duration,
    provider: Arc<dyn CapacityProvider>,
    last_timestamp: u64,
}

impl CapacityReporter {
    pub fn new(
        client: ControlClient,
        node_id: impl Into<String>,
        interval: Duration,
        provider: impl CapacityProvider + 'static,
    ) -> Self {
        Self {
            client,
            node_id: node_id.into(),
            interval,
            provider: Arc::new(provider),
            last_timestamp: 0,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Builds the next snapshot. Timestamps strictly increase even if the
    /// wall clock stalls or steps back.
    pub fn next_snapshot(&mut self) -> CapacitySnapshot {
        let timestamp = current_timestamp_ms().max(self.last_timestamp + 1);
        self.last_timestamp = timestamp;

        self.provider
            .groups()
            .into_iter()
            .fold(CapacitySnapshot::new(self.node_id.clone(), timestamp), |s, g| {
                s.with_group(g)
            })
    }

    /// Sends one heartbeat.
    pub async fn report_once(&mut self) -> Result<()> {
        let snapshot = self.next_snapshot();
        debug!(
            "Reporting {} group(s) for {} at {}",
            snapshot.groups.len(),
            self.node_id,
            snapshot.timestamp
        );
        self.client.push_snapshot(&snapshot).await
    }

    /// Reports every interval until `token` is cancelled. Failed heartbeats
    /// are logged and the next one is sent on schedule.
    pub async fn run(mut self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Capacity reporter for {} started (every {:?} to {})",
            self.node_id,
            self.interval,
            self.client.base_url()
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.report_once().await {
                        Ok(()) => {}
                        Err(e @ FnlbError::StaleSnapshot { .. }) => {
                            warn!("Router rejected heartbeat: {}", e);
                        }
                        Err(e) => {
                            warn!("Failed to report capacity for {}: {}", self.node_id, e);
                        }
                    }
                }
            }
        }

        info!("Capacity reporter for {} stopped", self.node_id);
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }
}
