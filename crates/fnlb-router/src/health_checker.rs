//! Active health checking of route destinations.
//!
//! Every destination in the routing table is polled with an HTTP `GET` on a
//! fixed interval. After `failure_threshold` consecutive failed checks the
//! destination is marked unhealthy and the selector stops choosing it; the
//! next successful check restores it. Route membership is never changed.

use dashmap::DashMap;
use fnlb_common::protocol::{FnlbError, Result};
use futures::future::join_all;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::routing_table::RoutingTable;

/// Health check configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// Run the checker at all. Default: true
    pub enabled: bool,
    /// Time between check rounds. Default: 3s
    pub interval: Duration,
    /// Time allowed for one check, body included. Default: 2s
    pub timeout: Duration,
    /// Consecutive failures before a destination is skipped. Default: 2
    pub failure_threshold: u32,
    /// Path requested on each destination. Default: `/version`
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(2),
            failure_threshold: 2,
            path: "/version".to_string(),
        }
    }
}

impl HealthCheckConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(FnlbError::InvalidRequest(
                "health check failure threshold must be at least 1".to_string(),
            ));
        }
        if !self.enabled {
            return Ok(());
        }
        if self.interval.is_zero() || self.timeout.is_zero() {
            return Err(FnlbError::InvalidRequest(
                "health check interval and timeout must be greater than zero".to_string(),
            ));
        }
        if !self.path.starts_with('/') {
            return Err(FnlbError::InvalidRequest(format!(
                "health check path '{}' must start with '/'",
                self.path
            )));
        }
        Ok(())
    }
}

/// Consecutive health check failures per destination.
///
/// Destinations that were never checked, or whose last check passed, have
/// no entry and count as healthy.
#[derive(Debug)]
pub struct DestinationHealth {
    failure_threshold: u32,
    failures: DashMap<String, u32>,
}

impl DestinationHealth {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            failures: DashMap::new(),
        }
    }

    pub fn is_healthy(&self, destination: &str) -> bool {
        self.failures
            .get(destination)
            .map_or(true, |failures| *failures < self.failure_threshold)
    }

    /// Counts one failed check.
    ///
    /// # Returns
    /// `true` if this failure made the destination unhealthy.
    pub fn record_failure(&self, destination: &str) -> bool {
        let mut failures = self.failures.entry(destination.to_string()).or_insert(0);
        *failures = failures.saturating_add(1);
        *failures == self.failure_threshold
    }

    /// Clears the failure count.
    ///
    /// # Returns
    /// `true` if the destination was unhealthy until now.
    pub fn record_success(&self, destination: &str) -> bool {
        self.failures
            .remove(destination)
            .map_or(false, |(_, failures)| failures >= self.failure_threshold)
    }

    /// Forgets destinations that are no longer in any route.
    pub fn retain(&self, destinations: &HashSet<String>) {
        self.failures.retain(|destination, _| destinations.contains(destination));
    }

    /// Destinations currently skipped, sorted.
    pub fn unhealthy(&self) -> Vec<String> {
        let mut unhealthy: Vec<String> = self
            .failures
            .iter()
            .filter(|entry| *entry.value() >= self.failure_threshold)
            .map(|entry| entry.key().clone())
            .collect();
        unhealthy.sort();
        unhealthy
    }
}

impl Default for DestinationHealth {
    fn default() -> Self {
        Self::new(HealthCheckConfig::default().failure_threshold)
    }
}

/// Health checker for route destinations.
pub struct HealthChecker {
    routes: Arc<RoutingTable>,
    health: Arc<DestinationHealth>,
    client: Client<HttpConnector, Empty<Bytes>>,
    config: HealthCheckConfig,
}

impl HealthChecker {
    /// Creates a new health checker.
    ///
    /// # Arguments
    /// * `routes` - Source of the destinations to check
    /// * `health` - Shared state the selector reads
    /// * `config` - Health check configuration
    pub fn new(
        routes: Arc<RoutingTable>,
        health: Arc<DestinationHealth>,
        config: HealthCheckConfig,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.timeout));

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            routes,
            health,
            client,
            config,
        }
    }

    /// Checks every destination once, in parallel.
    ///
    /// # Returns
    /// The destinations that are unhealthy after this round.
    pub async fn check_once(&self) -> Vec<String> {
        let destinations: HashSet<String> = self
            .routes
            .routes()
            .iter()
            .flat_map(|route| route.destinations.iter().cloned())
            .collect();
        self.health.retain(&destinations);

        let checks = destinations.into_iter().map(|destination| async move {
            let result = self.check_destination(&destination).await;
            (destination, result)
        });

        for (destination, result) in join_all(checks).await {
            match result {
                Ok(()) => {
                    if self.health.record_success(&destination) {
                        info!("Destination {} is healthy again", destination);
                    }
                }
                Err(e) => {
                    debug!("Health check of {} failed: {}", destination, e);
                    if self.health.record_failure(&destination) {
                        warn!(
                            "Destination {} marked unhealthy after {} failed check(s): {}",
                            destination, self.config.failure_threshold, e
                        );
                    }
                }
            }
        }

        self.health.unhealthy()
    }

    async fn check_destination(&self, destination: &str) -> Result<()> {
        let uri: Uri = format!("http://{}{}", destination, self.config.path)
            .parse()
            .map_err(|e| FnlbError::unreachable(destination, format!("invalid address: {}", e)))?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Empty::<Bytes>::new())
            .map_err(|e| FnlbError::unreachable(destination, e.to_string()))?;

        let check = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| FnlbError::unreachable(destination, e.to_string()))?;
            let status = response.status();
            // Drain so the pooled connection can be reused.
            let _ = response.into_body().collect().await;
            if !status.is_success() {
                return Err(FnlbError::unreachable(
                    destination,
                    format!("health check returned {}", status),
                ));
            }
            Ok::<(), FnlbError>(())
        };

        tokio::time::timeout(self.config.timeout, check)
            .await
            .map_err(|_| FnlbError::Timeout(self.config.timeout.as_millis() as u64))?
    }

    /// Starts the check loop; it stops when `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> HealthCheckHandle {
        let child = token.child_token();
        let handle = tokio::spawn(self.run(child.clone()));
        HealthCheckHandle {
            token: child,
            handle,
        }
    }

    async fn run(self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        // The first tick completes immediately.
        interval.tick().await;

        info!(
            "Health checker started (GET {} every {:?}, threshold {})",
            self.config.path, self.config.interval, self.config.failure_threshold
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        unhealthy = self.check_once() => {
                            debug!("Health check round done, {} unhealthy", unhealthy.len());
                        }
                    }
                }
            }
        }

        info!("Health checker stopped");
    }
}

/// Owner handle for a running health checker.
pub struct HealthCheckHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthCheckHandle {
    /// Cancels the checker and waits for it to exit. Checks in flight are
    /// dropped.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
