//! # fnlb CLI Entry Point
//!
//! Main binary for the fnlb capacity-aware router. Starts the router and
//! talks to a running one through its control API.
//!
//! ## Usage
//!
//! ```bash
//! # Start a router with one preloaded route
//! fnlb serve -b 0.0.0.0:8081 -r app1.example=10.0.0.7:8080
//!
//! # Keep the control API off the client-facing port
//! fnlb serve -b 0.0.0.0:8081 --admin-bind 127.0.0.1:8082
//!
//! # Manage routes
//! fnlb route add http://127.0.0.1:8081 app1.example 10.0.0.8:8080
//! fnlb route list http://127.0.0.1:8081
//!
//! # Report capacity for a runner by hand
//! fnlb capacity push http://127.0.0.1:8081 --node-id 10.0.0.7:8080 --group app1.example:8:3
//! fnlb capacity query http://127.0.0.1:8081 app1.example
//! ```
//!
//! ## URL Format
//!
//! All URLs must include the `http://` or `https://` prefix:
//! - ✅ `http://127.0.0.1:8081`
//! - ❌ `127.0.0.1:8081`

use anyhow::Result;
use argh::FromArgs;
use fnlb_cli::{parse_group_arg, parse_route_arg, validate_http_url};
use fnlb_client::ControlClient;
use fnlb_common::protocol::{current_timestamp_ms, CapacitySnapshot};
use fnlb_router::{
    ExpiryConfig, HealthCheckConfig, HttpServer, ProxyConfig, RetryConfig, Router, RouterConfig,
    StrategyKind,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(FromArgs)]
/// fnlb - capacity-aware load balancer for function runners
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
///
/// - **Serve**: Run the router
/// - **Route**, **Capacity**, **Nodes**: Control API calls against a running
///   router (unix-friendly JSON output)
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Route(RouteArgs),
    Capacity(CapacityArgs),
    Nodes(NodesArgs),
}

/// Arguments for starting the router.
///
/// # Example
///
/// ```bash
/// fnlb serve -b 0.0.0.0:8081 \
///   -r app1.example=10.0.0.7:8080 \
///   -r app1.example=10.0.0.8:8080 \
///   --snapshot-ttl-secs 15
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// start the router
struct ServeArgs {
    /// address to bind the router to
    ///
    /// Clients and runners both connect here unless --admin-bind is given.
    /// Defaults to "0.0.0.0:8081".
    #[argh(option, short = 'b', default = "\"0.0.0.0:8081\".into()")]
    bind: String,

    /// optional separate address for the control API
    ///
    /// When set, /1/lb/ is served only on this address and the main address
    /// proxies everything except /__health.
    #[argh(option, long = "admin-bind")]
    admin_bind: Option<String>,

    /// seconds a runner may go without reporting before it is forgotten
    #[argh(option, long = "snapshot-ttl-secs", default = "30")]
    snapshot_ttl_secs: u64,

    /// seconds between expiry sweeps (defaults to half the TTL)
    #[argh(option, long = "sweep-interval-secs")]
    sweep_interval_secs: Option<u64>,

    /// attempts per request when destinations are unreachable
    #[argh(option, long = "max-attempts", default = "3")]
    max_attempts: usize,

    /// milliseconds to wait for a destination's response headers
    #[argh(option, long = "upstream-timeout-ms", default = "30000")]
    upstream_timeout_ms: u64,

    /// milliseconds to wait for a TCP connection to a destination
    #[argh(option, long = "connect-timeout-ms", default = "2000")]
    connect_timeout_ms: u64,

    /// ignore reported capacity and pick destinations uniformly
    #[argh(switch, long = "disable-capacity-aware")]
    disable_capacity_aware: bool,

    /// stop polling destinations for health
    #[argh(switch, long = "disable-health-check")]
    disable_health_check: bool,

    /// seconds between destination health checks
    #[argh(option, long = "hc-interval-secs", default = "3")]
    hc_interval_secs: u64,

    /// milliseconds allowed for one health check
    #[argh(option, long = "hc-timeout-ms", default = "2000")]
    hc_timeout_ms: u64,

    /// consecutive failed checks before a destination is skipped
    #[argh(option, long = "hc-unhealthy", default = "2")]
    hc_unhealthy: u32,

    /// path requested by health checks
    #[argh(option, long = "hc-path", default = "\"/version\".into()")]
    hc_path: String,

    /// destination selection strategy: random or first
    #[argh(option, long = "strategy", default = "StrategyKind::Random")]
    strategy: StrategyKind,

    /// route to preload, as host=destination (repeatable)
    #[argh(option, short = 'r', long = "route")]
    routes: Vec<String>,
}

impl ServeArgs {
    fn router_config(&self) -> RouterConfig {
        RouterConfig {
            retry: RetryConfig {
                max_attempts: self.max_attempts,
                ..RetryConfig::default()
            },
            expiry: ExpiryConfig {
                ttl: Duration::from_secs(self.snapshot_ttl_secs),
                sweep_interval: self.sweep_interval_secs.map(Duration::from_secs),
            },
            proxy: ProxyConfig {
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                response_timeout: Duration::from_millis(self.upstream_timeout_ms),
                ..ProxyConfig::default()
            },
            health: HealthCheckConfig {
                enabled: !self.disable_health_check,
                interval: Duration::from_secs(self.hc_interval_secs),
                timeout: Duration::from_millis(self.hc_timeout_ms),
                failure_threshold: self.hc_unhealthy,
                path: self.hc_path.clone(),
            },
            capacity_aware: !self.disable_capacity_aware,
            strategy: self.strategy,
        }
    }
}

#[derive(FromArgs)]
#[argh(subcommand, name = "route")]
/// manage routes on a running router
struct RouteArgs {
    #[argh(subcommand)]
    command: RouteCommand,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum RouteCommand {
    Add(RouteAddArgs),
    Remove(RouteRemoveArgs),
    List(RouteListArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "add")]
/// add a destination to a route
struct RouteAddArgs {
    /// router address, e.g. http://127.0.0.1:8081
    #[argh(positional)]
    server_address: String,

    /// host the route answers to
    #[argh(positional)]
    host: String,

    /// destination address as host:port
    #[argh(positional)]
    destination: String,

    /// capacity group for a new route (defaults to the host)
    #[argh(option, long = "group")]
    group: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "remove")]
/// remove a destination from a route
struct RouteRemoveArgs {
    /// router address, e.g. http://127.0.0.1:8081
    #[argh(positional)]
    server_address: String,

    /// host the route answers to
    #[argh(positional)]
    host: String,

    /// destination address as host:port
    #[argh(positional)]
    destination: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "list")]
/// list all routes
struct RouteListArgs {
    /// router address, e.g. http://127.0.0.1:8081
    #[argh(positional)]
    server_address: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "capacity")]
/// report or inspect runner capacity
struct CapacityArgs {
    #[argh(subcommand)]
    command: CapacityCommand,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum CapacityCommand {
    Push(CapacityPushArgs),
    Query(CapacityQueryArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "push")]
/// push one capacity snapshot for a node
struct CapacityPushArgs {
    /// router address, e.g. http://127.0.0.1:8081
    #[argh(positional)]
    server_address: String,

    /// node reporting the capacity, usually its destination address
    #[argh(option, long = "node-id")]
    node_id: String,

    /// group capacity as key:total:used (repeatable)
    #[argh(option, long = "group")]
    groups: Vec<String>,

    /// snapshot timestamp in milliseconds since the epoch (defaults to now)
    #[argh(option, long = "timestamp")]
    timestamp: Option<u64>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "query")]
/// show available slots per node for a group
struct CapacityQueryArgs {
    /// router address, e.g. http://127.0.0.1:8081
    #[argh(positional)]
    server_address: String,

    /// capacity group to query
    #[argh(positional)]
    group: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "nodes")]
/// list the runner nodes known to the router
struct NodesArgs {
    /// router address, e.g. http://127.0.0.1:8081
    #[argh(positional)]
    server_address: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Client commands keep stdout clean for piping
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Route(args) => run_route(args.command).await,
        Commands::Capacity(args) => run_capacity(args.command).await,
        Commands::Nodes(args) => {
            let client = connect(&args.server_address)?;
            print_json(&client.list_nodes().await?)
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", args.bind, e))?;
    let admin_addr: Option<SocketAddr> = match &args.admin_bind {
        Some(bind) => Some(
            bind.parse()
                .map_err(|e| anyhow::anyhow!("Invalid admin bind address {}: {}", bind, e))?,
        ),
        None => None,
    };

    let config = args.router_config();
    tracing::info!(
        "Starting fnlb router (strategy: {}, capacity-aware: {}, snapshot TTL: {:?})",
        config.strategy.as_str(),
        config.capacity_aware,
        config.expiry.ttl
    );

    let router = Arc::new(Router::new(config)?);
    for arg in &args.routes {
        let (host, destination) = parse_route_arg(arg)?;
        let result = router.add_destination(&host, &destination, None)?;
        tracing::info!("Preloaded route {} -> {}", result.host, result.destination);
    }
    if args.routes.is_empty() {
        tracing::warn!("No routes preloaded; add some with `fnlb route add`.");
    }

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down");
        }
        on_signal.cancel();
    });

    HttpServer::new(router).run(addr, admin_addr, shutdown).await?;
    Ok(())
}

async fn run_route(command: RouteCommand) -> Result<()> {
    match command {
        RouteCommand::Add(args) => {
            let client = connect(&args.server_address)?;
            let result = match &args.group {
                Some(group) => {
                    client
                        .add_destination_with_group(&args.host, &args.destination, group)
                        .await?
                }
                None => client.add_destination(&args.host, &args.destination).await?,
            };
            print_json(&result)
        }
        RouteCommand::Remove(args) => {
            let client = connect(&args.server_address)?;
            print_json(
                &client
                    .remove_destination(&args.host, &args.destination)
                    .await?,
            )
        }
        RouteCommand::List(args) => {
            let client = connect(&args.server_address)?;
            print_json(&client.list_routes().await?)
        }
    }
}

async fn run_capacity(command: CapacityCommand) -> Result<()> {
    match command {
        CapacityCommand::Push(args) => {
            let client = connect(&args.server_address)?;
            let timestamp = args.timestamp.unwrap_or_else(current_timestamp_ms);
            let mut snapshot = CapacitySnapshot::new(args.node_id.clone(), timestamp);
            for arg in &args.groups {
                snapshot = snapshot.with_group(parse_group_arg(arg)?);
            }
            client.push_snapshot(&snapshot).await?;
            print_json(&json!({ "nodeId": snapshot.node_id, "accepted": true }))
        }
        CapacityCommand::Query(args) => {
            let client = connect(&args.server_address)?;
            print_json(&client.query_capacity(&args.group).await?)
        }
    }
}

fn connect(server_address: &str) -> Result<ControlClient> {
    validate_http_url(server_address, "server address")?;
    Ok(ControlClient::new(server_address)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
