use axum::body::Body;
use axum::extract::Query;
use fnlb_common::protocol::{
    route_key_from_host, CapacitySnapshot, CapacityView, FnlbError, NodeListing, Result,
    RouteListing, RouteMutationResult, RouteStatus,
};
use hyper::header::HOST;
use hyper::{Request, Response, Uri};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::expiry::{ExpiryConfig, ExpirySweeper, SweeperHandle};
use crate::health_checker::{DestinationHealth, HealthCheckConfig, HealthCheckHandle, HealthChecker};
use crate::metrics::{MetricsSnapshot, RouterMetrics, ServerInfo};
use crate::proxy::{ForwardRequest, ProxyConfig, ProxyEngine};
use crate::registry::CapacityRegistry;
use crate::routing_table::{Route, RoutingTable};
use crate::selector::{SelectionStrategy, Selector, StrategyKind};

/// Query parameter that overrides the `Host` header as route key.
pub const ROUTE_HOST_PARAM: &str = "rhost";

/// Configuration for re-selection after an unreachable destination.
///
/// Each failed destination is excluded for the rest of the request, so the
/// effective number of attempts is also bounded by the route's size.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per request, including the first.
    /// Default: 3
    pub max_attempts: usize,
    /// Wait before the second attempt.
    /// Default: 10ms
    pub initial_backoff_ms: u64,
    /// Cap on the wait between attempts.
    /// Default: 1000ms
    pub max_backoff_ms: u64,
    /// Each wait is the previous one times this.
    /// Default: 2.0
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(FnlbError::InvalidRequest(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(FnlbError::InvalidRequest(
                "backoff multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff that follows `current_ms`.
    pub fn next_backoff(&self, current_ms: u64) -> u64 {
        std::cmp::min(
            (current_ms as f64 * self.backoff_multiplier) as u64,
            self.max_backoff_ms,
        )
    }
}

/// Top-level router configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    pub retry: RetryConfig,
    pub expiry: ExpiryConfig,
    pub proxy: ProxyConfig,
    pub health: HealthCheckConfig,
    /// Prefer destinations with reported free capacity. Default: true
    pub capacity_aware: bool,
    pub strategy: StrategyKind,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            expiry: ExpiryConfig::default(),
            proxy: ProxyConfig::default(),
            health: HealthCheckConfig::default(),
            capacity_aware: true,
            strategy: StrategyKind::default(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.expiry.validate()?;
        self.proxy.validate()?;
        self.health.validate()
    }
}

/// fnlb router: routing table, capacity registry and proxy.
///
/// The router owns nothing global. Its routing table and registry are
/// injected (or created fresh by [`Router::new`]) and shared with the HTTP
/// handlers through an `Arc<Router>`.
///
/// # Request path
///
/// 1. The route key comes from the `rhost` query parameter or the `Host`
///    header, port stripped and lower-cased.
/// 2. The route is resolved; unknown keys fail with `RouteNotFound`.
/// 3. The selector picks a destination, skipping destinations that fail
///    health checks, capacity-aware when enabled.
/// 4. The proxy forwards. On `DestinationUnreachable` the destination is
///    excluded and another is selected, with exponential backoff, up to
///    `min(max_attempts, destinations)` attempts.
pub struct Router {
    routes: Arc<RoutingTable>,
    registry: Arc<CapacityRegistry>,
    health: Arc<DestinationHealth>,
    selector: Selector,
    proxy: ProxyEngine,
    metrics: Arc<RouterMetrics>,
    config: RouterConfig,
}

impl Router {
    /// Creates a router with an empty routing table and registry.
    ///
    /// # Errors
    /// `InvalidRequest` if `config` fails validation.
    pub fn new(config: RouterConfig) -> Result<Self> {
        Self::with_parts(
            config,
            Arc::new(RoutingTable::new()),
            Arc::new(CapacityRegistry::new()),
        )
    }

    /// Creates a router over existing state.
    pub fn with_parts(
        config: RouterConfig,
        routes: Arc<RoutingTable>,
        registry: Arc<CapacityRegistry>,
    ) -> Result<Self> {
        let strategy = config.strategy.build();
        Self::with_strategy(config, routes, registry, strategy)
    }

    /// Creates a router with a caller-supplied selection strategy.
    ///
    /// # Arguments
    /// * `config` - Router configuration, validated here
    /// * `routes` - Routing table shared with the caller
    /// * `registry` - Capacity registry shared with the caller
    /// * `strategy` - Source of the selector's draws
    pub fn with_strategy(
        config: RouterConfig,
        routes: Arc<RoutingTable>,
        registry: Arc<CapacityRegistry>,
        strategy: Arc<dyn SelectionStrategy>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(RouterMetrics::new());
        let health = Arc::new(DestinationHealth::new(config.health.failure_threshold));
        let selector = Selector::new(registry.clone(), strategy, config.capacity_aware)
            .with_health(health.clone());
        let proxy = ProxyEngine::new(config.proxy.clone(), metrics.clone());

        info!(
            "Router initialized (capacity-aware: {}, strategy: {}, max attempts: {}, health checks: {})",
            config.capacity_aware,
            config.strategy.as_str(),
            config.retry.max_attempts,
            config.health.enabled
        );

        Ok(Self {
            routes,
            registry,
            health,
            selector,
            proxy,
            metrics,
            config,
        })
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    pub fn registry(&self) -> &Arc<CapacityRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<DestinationHealth> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Starts the expiry sweeper for this router's registry.
    pub fn spawn_sweeper(&self, token: CancellationToken) -> SweeperHandle {
        ExpirySweeper::new(self.registry.clone(), self.config.expiry.clone()).spawn(token)
    }

    /// Starts the destination health checker, unless disabled.
    pub fn spawn_health_checker(&self, token: CancellationToken) -> Option<HealthCheckHandle> {
        if !self.config.health.enabled {
            return None;
        }
        let checker = HealthChecker::new(
            self.routes.clone(),
            self.health.clone(),
            self.config.health.clone(),
        );
        Some(checker.spawn(token))
    }

    // ============================================================================
    // Route management
    // ============================================================================

    /// Registers `destination` for `host`. The host is normalized first.
    ///
    /// # Arguments
    /// * `host` - Host the route answers to; port and case are ignored
    /// * `destination` - Runner address as `host:port`
    /// * `group` - Capacity group to pin on the route; a new route
    ///   without one uses its key
    ///
    /// # Returns
    /// The normalized mutation, with `added` false if the destination was
    /// already present.
    ///
    /// # Errors
    /// `InvalidRequest` for an empty host or a destination that is not a
    /// bare address.
    pub fn add_destination(
        &self,
        host: &str,
        destination: &str,
        group: Option<&str>,
    ) -> Result<RouteMutationResult> {
        let (key, destination) = Self::validate_mutation(host, destination)?;
        let added = match group.map(str::trim).filter(|g| !g.is_empty()) {
            Some(group) => self.routes.add_destination_with_group(&key, group, &destination),
            None => self.routes.add_destination(&key, &destination),
        };
        Ok(RouteMutationResult {
            host: key,
            destination,
            added: Some(added),
            removed: None,
        })
    }

    /// Removes every occurrence of `destination` from the route for `host`.
    /// The route itself stays, possibly empty.
    pub fn remove_destination(&self, host: &str, destination: &str) -> Result<RouteMutationResult> {
        let (key, destination) = Self::validate_mutation(host, destination)?;
        let removed = self.routes.remove_destination(&key, &destination);
        Ok(RouteMutationResult {
            host: key,
            destination,
            added: None,
            removed: Some(removed),
        })
    }

    fn validate_mutation(host: &str, destination: &str) -> Result<(String, String)> {
        let key = route_key_from_host(host);
        let destination = destination.trim();
        if key.is_empty() {
            return Err(FnlbError::InvalidRequest("host must not be empty".to_string()));
        }
        if destination.is_empty() || destination.contains('/') {
            return Err(FnlbError::InvalidRequest(format!(
                "destination '{}' must be a host:port address",
                destination
            )));
        }
        Ok((key, destination.to_string()))
    }

    pub fn list_routes(&self) -> RouteListing {
        RouteListing {
            routes: self.routes.routes().iter().map(|r| r.status()).collect(),
        }
    }

    pub fn route(&self, host: &str) -> Result<RouteStatus> {
        Ok(self.routes.resolve(&route_key_from_host(host))?.status())
    }

    // ============================================================================
    // Capacity
    // ============================================================================

    /// Stores a node's capacity snapshot and counts the outcome.
    pub fn ingest_snapshot(&self, snapshot: CapacitySnapshot) -> Result<()> {
        let result = self.registry.ingest_snapshot(snapshot);
        self.metrics.record_snapshot(result.is_ok());
        result
    }

    pub fn query_capacity(&self, group: &str) -> CapacityView {
        CapacityView {
            group: group.to_string(),
            nodes: self.registry.query_capacity(group).into_iter().collect(),
        }
    }

    pub fn list_nodes(&self) -> NodeListing {
        NodeListing {
            nodes: self.registry.nodes(),
        }
    }

    // ============================================================================
    // Proxying
    // ============================================================================

    /// Extracts the route key for a client request.
    ///
    /// A non-empty `rhost` query parameter wins over the `Host` header. Its
    /// value is percent-decoded before normalization.
    ///
    /// # Errors
    /// `InvalidRequest` when neither yields a host.
    pub fn route_key(request: &Request<Body>) -> Result<String> {
        if let Some(hint) = Self::route_host_param(request.uri()) {
            return Ok(route_key_from_host(&hint));
        }

        let host = request
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| request.uri().authority().map(|a| a.as_str()))
            .map(route_key_from_host)
            .unwrap_or_default();

        if host.is_empty() {
            return Err(FnlbError::InvalidRequest(
                "request has no Host header".to_string(),
            ));
        }
        Ok(host)
    }

    fn route_host_param(uri: &Uri) -> Option<String> {
        let Query(params) = Query::<HashMap<String, String>>::try_from_uri(uri).ok()?;
        params
            .get(ROUTE_HOST_PARAM)
            .filter(|value| !value.trim().is_empty())
            .cloned()
    }

    /// Routes and proxies one client request, recording its outcome.
    ///
    /// # Arguments
    /// * `request` - The client request, body not yet read
    /// * `client_addr` - Peer address, appended to `X-Forwarded-For`
    ///
    /// # Returns
    /// The backend's response, headers complete and body streaming.
    ///
    /// # Errors
    /// `InvalidRequest` without a usable route key, `RouteNotFound` for an
    /// unknown key, `NoDestinationAvailable` / `NoCapacityAvailable` when
    /// nothing can be selected, and the last `DestinationUnreachable` once
    /// attempts run out.
    pub async fn handle(
        &self,
        request: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>> {
        let start = Instant::now();
        let key = match Self::route_key(&request) {
            Ok(key) => key,
            Err(e) => {
                self.metrics.record_request(None, start, Some(&e));
                return Err(e);
            }
        };

        let result = self.forward(&key, request, client_addr).await;
        // Unknown keys come from clients; keep them out of the per-route map.
        let tracked = match &result {
            Err(FnlbError::RouteNotFound(_)) => None,
            _ => Some(key.as_str()),
        };
        self.metrics.record_request(tracked, start, result.as_ref().err());
        result
    }

    async fn forward(
        &self,
        key: &str,
        request: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>> {
        let route = self.routes.resolve(key)?;
        let mut request =
            ForwardRequest::prepare(request, client_addr, self.config.proxy.replay_limit).await?;
        self.forward_with_retry(&route, &mut request).await
    }

    async fn forward_with_retry(
        &self,
        route: &Route,
        request: &mut ForwardRequest,
    ) -> Result<Response<Body>> {
        let max_attempts = if request.is_replayable() {
            self.config
                .retry
                .max_attempts
                .min(route.destinations.len())
                .max(1)
        } else {
            1
        };

        let mut excluded = HashSet::new();
        let mut last_error: Option<FnlbError> = None;
        let mut backoff_ms = self.config.retry.initial_backoff_ms;

        for attempt in 0..max_attempts {
            let destination = match self.selector.select(route, &excluded) {
                Ok(destination) => destination,
                Err(e) => return Err(last_error.unwrap_or(e)),
            };

            match self.proxy.forward(request, &destination).await {
                Ok(response) => {
                    self.metrics.record_attempt(&destination, true);
                    return Ok(response);
                }
                Err(e) if Self::is_retryable_static(&e) => {
                    self.metrics.record_attempt(&destination, false);
                    if attempt + 1 < max_attempts {
                        warn!(
                            "Forward to {} failed (attempt {}/{}): {}, retrying in {}ms",
                            destination,
                            attempt + 1,
                            max_attempts,
                            e,
                            backoff_ms
                        );
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = self.config.retry.next_backoff(backoff_ms);
                    } else {
                        warn!(
                            "Forward to {} failed (attempt {}/{}): {}",
                            destination,
                            attempt + 1,
                            max_attempts,
                            e
                        );
                    }
                    excluded.insert(destination);
                    last_error = Some(e);
                }
                Err(e) => {
                    self.metrics.record_attempt(&destination, false);
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FnlbError::NoDestinationAvailable(route.key.clone())))
    }

    /// Only failures before any response bytes arrived may be retried.
    pub fn is_retryable_static(error: &FnlbError) -> bool {
        error.is_retryable()
    }

    // ============================================================================
    // Introspection
    // ============================================================================

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn info(&self) -> ServerInfo {
        let mut info = ServerInfo::new(self.metrics.uptime_ms());
        info.routes = self.routes.len();
        info.nodes = self.registry.len();
        info.capacity_aware = self.selector.capacity_aware();
        info.strategy = self.config.strategy.as_str().to_string();
        info.unhealthy_destinations = self.health.unhealthy();
        info
    }
}
