//! fnlb Router
//!
//! Capacity-aware load balancing for function runners. Requests are routed
//! by host to one of the route's destinations; runner nodes push capacity
//! snapshots so the router can prefer destinations with free slots.
//!
//! # Components
//!
//! - [`RoutingTable`]: route key to destinations, copy-on-write
//! - [`CapacityRegistry`]: latest capacity snapshot per node
//! - [`ExpirySweeper`]: drops nodes that stopped reporting
//! - [`HealthChecker`]: polls destinations and marks failing ones unhealthy
//! - [`Selector`]: picks a destination, weighted by free capacity
//! - [`ProxyEngine`]: forwards one request to one destination
//! - [`Router`]: ties the above together with retry on unreachable
//!   destinations
//! - [`HttpServer`]: control API, monitoring endpoints and proxy entrypoint
//!
//! # Example
//!
//! ```no_run
//! use fnlb_router::{HttpServer, Router, RouterConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let router = Arc::new(Router::new(RouterConfig::default())?);
//! router.add_destination("app1.example", "10.0.0.7:8080", None)?;
//!
//! let shutdown = CancellationToken::new();
//! HttpServer::new(router)
//!     .run("0.0.0.0:8081".parse()?, None, shutdown)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod expiry;
pub mod health_checker;
pub mod http_router;
pub mod http_server;
pub mod metrics;
pub mod node;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod routing_table;
pub mod selector;

pub use expiry::{ExpiryConfig, ExpirySweeper, SweeperHandle};
pub use health_checker::{DestinationHealth, HealthCheckConfig, HealthCheckHandle, HealthChecker};
pub use http_server::HttpServer;
pub use metrics::{MetricsSnapshot, RouterMetrics, ServerInfo};
pub use node::RunnerNode;
pub use proxy::{ForwardRequest, ProxyConfig, ProxyEngine};
pub use registry::CapacityRegistry;
pub use router::{RetryConfig, Router, RouterConfig};
pub use routing_table::{Route, RoutingTable};
pub use selector::{FirstStrategy, RandomStrategy, SelectionStrategy, Selector, StrategyKind};
