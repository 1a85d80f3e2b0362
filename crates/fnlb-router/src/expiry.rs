use fnlb_common::protocol::{FnlbError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::CapacityRegistry;

/// Node expiry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryConfig {
    /// How long a node may stay silent before it is dropped.
    /// Default: 30s
    pub ttl: Duration,
    /// Time between sweeps. `None` means half the TTL.
    pub sweep_interval: Option<Duration>,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            sweep_interval: None,
        }
    }
}

impl ExpiryConfig {
    pub fn interval(&self) -> Duration {
        self.sweep_interval.unwrap_or(self.ttl / 2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(FnlbError::InvalidRequest(
                "snapshot TTL must be greater than zero".to_string(),
            ));
        }
        if self.interval().is_zero() {
            return Err(FnlbError::InvalidRequest(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Periodically removes expired nodes from the registry.
pub struct ExpirySweeper {
    registry: Arc<CapacityRegistry>,
    config: ExpiryConfig,
}

impl ExpirySweeper {
    pub fn new(registry: Arc<CapacityRegistry>, config: ExpiryConfig) -> Self {
        Self { registry, config }
    }

    /// Runs a single sweep and returns the expired node IDs.
    pub fn run_once(&self) -> Vec<String> {
        self.registry.sweep_expired(self.config.ttl)
    }

    /// Starts the sweep loop; it stops when `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> SweeperHandle {
        let child = token.child_token();
        let handle = tokio::spawn(self.run(child.clone()));
        SweeperHandle {
            token: child,
            handle,
        }
    }

    async fn run(self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        // The first tick completes immediately.
        interval.tick().await;

        info!(
            "Expiry sweeper started (ttl {:?}, every {:?})",
            self.config.ttl,
            self.config.interval()
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let expired = self.run_once();
                    debug!("Sweep removed {} node(s)", expired.len());
                }
            }
        }

        info!("Expiry sweeper stopped");
    }
}

/// Owner handle for a running sweeper.
pub struct SweeperHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Cancels the sweeper and waits for it to exit.
    ///
    /// A sweep already in progress finishes first.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
