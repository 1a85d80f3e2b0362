//! HTTP Router Integration Tests
//!
//! This test suite runs the router on a real listener in front of mock
//! backend servers and checks routing, capacity-aware selection, failover,
//! health checking, response relaying and cancellation end to end.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use fnlb_common::protocol::{CapacitySnapshot, GroupCapacity};
use fnlb_router::{
    CapacityRegistry, HealthCheckConfig, HttpServer, RetryConfig, Router, RouterConfig,
    RoutingTable, StrategyKind,
};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HOST;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock Backend
// ============================================================================

#[derive(Clone)]
struct BackendState {
    name: String,
    status: StatusCode,
    hits: Arc<AtomicUsize>,
}

/// A mock runner that answers every request with its name and echoes what
/// it saw in response headers.
struct MockBackend {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    _handle: tokio::task::JoinHandle<()>,
}

impl MockBackend {
    async fn start(name: &str) -> Self {
        Self::with_status(name, StatusCode::OK).await
    }

    async fn with_status(name: &str, status: StatusCode) -> Self {
        async fn handle(State(state): State<BackendState>, headers: HeaderMap, body: Bytes) -> Response {
            state.hits.fetch_add(1, Ordering::SeqCst);
            let echo = |name: &str| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string()
            };
            (
                state.status,
                [
                    ("x-backend", state.name.clone()),
                    ("x-seen-host", echo("host")),
                    ("x-seen-xff", echo("x-forwarded-for")),
                    ("x-body-len", body.len().to_string()),
                ],
                state.name.clone(),
            )
                .into_response()
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let state = BackendState {
            name: name.to_string(),
            status,
            hits: hits.clone(),
        };
        let app = axum::Router::new().fallback(handle).with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock backend");
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            hits,
            _handle: handle,
        }
    }

    fn addr(&self) -> String {
        self.addr.to_string()
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// A backend that sends response headers promising `content-length: 100`,
/// writes a few bytes and closes the connection. Returns its address and
/// the number of connections it accepted.
async fn truncating_backend() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut seen = Vec::new();
                while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => seen.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial")
                    .await;
                let _ = stream.flush().await;
                // Dropping the stream cuts the body short.
            });
        }
    });
    (addr, connections)
}

/// Sets its flag when dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct StalledState {
    entered: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
}

/// A backend whose handler never answers. `entered` is set once a request
/// arrives and `dropped` once the handler's future is dropped.
async fn stalled_backend() -> (String, StalledState) {
    async fn handle(State(state): State<StalledState>) -> Response {
        let _guard = DropFlag(state.dropped.clone());
        state.entered.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        StatusCode::OK.into_response()
    }

    let state = StalledState {
        entered: Arc::new(AtomicBool::new(false)),
        dropped: Arc::new(AtomicBool::new(false)),
    };
    let app = axum::Router::new().fallback(handle).with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

/// Polls `condition` every 10ms until it holds, for at most five seconds.
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

/// An address nothing listens on.
fn dead_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

// ============================================================================
// Router under test
// ============================================================================

struct TestRouter {
    addr: SocketAddr,
    router: Arc<Router>,
    token: CancellationToken,
    client: Client<HttpConnector, Full<Bytes>>,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }
}

impl TestRouter {
    async fn start(config: RouterConfig) -> Self {
        let router = Arc::new(Router::new(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();

        tokio::spawn(HttpServer::new(router.clone()).serve(listener, None, token.clone()));

        Self {
            addr,
            router,
            token,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    async fn send(&self, method: Method, host: &str, path: &str, body: Bytes) -> Reply {
        let request = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.addr, path))
            .header(HOST, host)
            .body(Full::new(body))
            .unwrap();
        let response = self.client.request(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        Reply {
            status,
            headers,
            body,
        }
    }

    async fn get(&self, host: &str, path: &str) -> Reply {
        self.send(Method::GET, host, path, Bytes::new()).await
    }

    fn report(&self, node: &str, group: &str, total: u32, used: u32) {
        self.router
            .ingest_snapshot(
                CapacitySnapshot::now(node).with_group(GroupCapacity::new(group, total, used)),
            )
            .unwrap();
    }
}

impl Drop for TestRouter {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn first_strategy(max_attempts: usize) -> RouterConfig {
    RouterConfig {
        strategy: StrategyKind::First,
        retry: RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            ..RetryConfig::default()
        },
        ..RouterConfig::default()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_proxies_to_registered_destination() {
    let backend = MockBackend::start("b1").await;
    let router = TestRouter::start(RouterConfig::default()).await;
    router
        .router
        .add_destination("app1.example", &backend.addr(), None)
        .unwrap();

    let reply = router.get("app1.example:8080", "/hello?x=1").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&reply.body[..], b"b1");
    assert_eq!(reply.header("x-seen-host"), "app1.example:8080");
    assert_eq!(reply.header("x-seen-xff"), "127.0.0.1");
    assert_eq!(backend.hits(), 1);
}

#[tokio::test]
async fn test_unknown_host_is_not_found() {
    let router = TestRouter::start(RouterConfig::default()).await;
    let reply = router.get("nope.example", "/").await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(&reply.body[..], b"no matching route for host 'nope.example'");
}

#[tokio::test]
async fn test_empty_route_is_not_found() {
    let router = TestRouter::start(RouterConfig::default()).await;
    router.router.add_destination("app1.example", "10.0.0.1:80", None).unwrap();
    router.router.remove_destination("app1.example", "10.0.0.1:80").unwrap();

    let reply = router.get("app1.example", "/").await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(&reply.body[..], b"route 'app1.example' has no destinations");
}

#[tokio::test]
async fn test_rhost_overrides_host_header() {
    let backend = MockBackend::start("b1").await;
    let router = TestRouter::start(RouterConfig::default()).await;
    router
        .router
        .add_destination("app2.example", &backend.addr(), None)
        .unwrap();

    let reply = router.get("lb.local", "/run?rhost=app2.example").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.header("x-backend"), "b1");
}

#[tokio::test]
async fn test_capacity_aware_prefers_free_destination() {
    let d1 = MockBackend::start("d1").await;
    let d2 = MockBackend::start("d2").await;
    let router = TestRouter::start(RouterConfig::default()).await;
    router.router.add_destination("app1.example", &d1.addr(), None).unwrap();
    router.router.add_destination("app1.example", &d2.addr(), None).unwrap();
    router.report(&d1.addr(), "app1.example", 4, 4);
    router.report(&d2.addr(), "app1.example", 5, 0);

    let mut to_d2 = 0;
    for _ in 0..100 {
        let reply = router.get("app1.example", "/").await;
        assert_eq!(reply.status, StatusCode::OK);
        if reply.header("x-backend") == "d2" {
            to_d2 += 1;
        }
    }
    assert!(to_d2 >= 95, "only {} of 100 requests reached d2", to_d2);
    assert_eq!(d2.hits(), to_d2);
}

#[tokio::test]
async fn test_no_capacity_is_service_unavailable() {
    let d1 = MockBackend::start("d1").await;
    let router = TestRouter::start(RouterConfig::default()).await;
    router.router.add_destination("app1.example", &d1.addr(), None).unwrap();
    router.report(&d1.addr(), "app1.example", 2, 2);

    let reply = router.get("app1.example", "/").await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(reply.header("retry-after"), "1");
    assert_eq!(d1.hits(), 0);
}

#[tokio::test]
async fn test_single_unreachable_destination_is_one_attempt() {
    let dead = dead_addr();
    let router = TestRouter::start(RouterConfig::default()).await;
    router.router.add_destination("app1.example", &dead, None).unwrap();

    let reply = router.get("app1.example", "/").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);

    let metrics = router.router.metrics_snapshot();
    assert_eq!(metrics.destinations[&dead].attempts, 1);
    assert_eq!(metrics.destinations[&dead].failures, 1);
    assert_eq!(metrics.failures.unreachable, 1);
}

#[tokio::test]
async fn test_failover_to_next_destination() {
    let dead = dead_addr();
    let live = MockBackend::start("live").await;
    let router = TestRouter::start(first_strategy(2)).await;
    router.router.add_destination("app1.example", &dead, None).unwrap();
    router.router.add_destination("app1.example", &live.addr(), None).unwrap();

    let reply = router
        .send(Method::POST, "app1.example", "/", Bytes::from_static(b"payload"))
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.header("x-backend"), "live");
    // The replayed body reached the second destination intact.
    assert_eq!(reply.header("x-body-len"), "7");

    let metrics = router.router.metrics_snapshot();
    assert_eq!(metrics.destinations[&dead].attempts, 1);
    assert_eq!(metrics.destinations[&live.addr()].successes, 1);
}

#[tokio::test]
async fn test_attempts_bounded_by_max_attempts() {
    let dead1 = dead_addr();
    let dead2 = dead_addr();
    let live = MockBackend::start("live").await;
    let router = TestRouter::start(first_strategy(2)).await;
    for destination in [&dead1, &dead2, &live.addr()] {
        router.router.add_destination("app1.example", destination, None).unwrap();
    }

    let reply = router.get("app1.example", "/").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(live.hits(), 0);

    let metrics = router.router.metrics_snapshot();
    assert_eq!(metrics.destinations[&dead1].attempts, 1);
    assert_eq!(metrics.destinations[&dead2].attempts, 1);
}

#[tokio::test]
async fn test_backend_error_status_is_relayed_without_retry() {
    let failing = MockBackend::with_status("failing", StatusCode::INTERNAL_SERVER_ERROR).await;
    let other = MockBackend::start("other").await;
    let router = TestRouter::start(first_strategy(3)).await;
    router.router.add_destination("app1.example", &failing.addr(), None).unwrap();
    router.router.add_destination("app1.example", &other.addr(), None).unwrap();

    let reply = router.get("app1.example", "/").await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(&reply.body[..], b"failing");
    assert_eq!(other.hits(), 0);
}

#[tokio::test]
async fn test_large_body_is_streamed_with_single_attempt() {
    let dead = dead_addr();
    let live = MockBackend::start("live").await;
    let mut config = first_strategy(3);
    config.proxy.replay_limit = 1024;
    let router = TestRouter::start(config).await;
    router.router.add_destination("app1.example", &dead, None).unwrap();
    router.router.add_destination("app1.example", &live.addr(), None).unwrap();

    let body = Bytes::from(vec![b'x'; 64 * 1024]);

    // Too large to replay: the failed first attempt is final.
    let reply = router.send(Method::POST, "app1.example", "/", body.clone()).await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(live.hits(), 0);

    // Straight to the live backend the body streams through intact.
    router.router.remove_destination("app1.example", &dead).unwrap();
    let reply = router.send(Method::POST, "app1.example", "/", body).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.header("x-body-len"), (64 * 1024).to_string());
}

#[tokio::test]
async fn test_expired_node_loses_capacity_preference() {
    let d1 = MockBackend::start("d1").await;
    let d2 = MockBackend::start("d2").await;
    let routes = Arc::new(RoutingTable::new());
    let registry = Arc::new(CapacityRegistry::new());
    let router = Arc::new(
        Router::with_parts(
            RouterConfig {
                strategy: StrategyKind::First,
                ..RouterConfig::default()
            },
            routes.clone(),
            registry.clone(),
        )
        .unwrap(),
    );
    routes.add_destination("app1.example", &d1.addr());
    routes.add_destination("app1.example", &d2.addr());

    let ttl = router.config().expiry.ttl;
    let now = Instant::now();
    registry
        .ingest_snapshot_at(
            CapacitySnapshot::now(d2.addr()).with_group(GroupCapacity::new("app1.example", 1, 0)),
            now,
        )
        .unwrap();
    registry
        .ingest_snapshot_at(
            CapacitySnapshot::now(d1.addr()).with_group(GroupCapacity::new("app1.example", 1, 1)),
            now + ttl,
        )
        .unwrap();

    // d2 is the only one with free slots.
    let request = || {
        Request::builder()
            .uri("/")
            .header(HOST, "app1.example")
            .body(Body::empty())
            .unwrap()
    };
    let response = router.handle(request(), None).await.unwrap();
    assert_eq!(response.headers()["x-backend"], "d2");

    // Once d2 expires only d1's full report remains.
    let expired = registry.sweep_expired_at(now + ttl + Duration::from_secs(1), ttl);
    assert_eq!(expired, vec![d2.addr()]);
    let err = router.handle(request(), None).await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_control_api_over_http() {
    let backend = MockBackend::start("b1").await;
    let router = TestRouter::start(RouterConfig::default()).await;

    let body = format!(
        r#"{{"host":"app1.example","destination":"{}"}}"#,
        backend.addr()
    );
    let reply = router
        .send(Method::PUT, "lb.local", "/1/lb/routes", Bytes::from(body))
        .await;
    assert_eq!(reply.status, StatusCode::OK);

    let reply = router.get("app1.example", "/").await;
    assert_eq!(reply.header("x-backend"), "b1");

    let reply = router.get("lb.local", "/__metrics").await;
    let metrics: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(metrics["successful_requests"], 1);
}

#[tokio::test]
async fn test_truncated_response_is_counted_and_not_retried() {
    let (truncating, connections) = truncating_backend().await;
    let other = MockBackend::start("other").await;
    let router = TestRouter::start(first_strategy(3)).await;
    router.router.add_destination("app1.example", &truncating, None).unwrap();
    router.router.add_destination("app1.example", &other.addr(), None).unwrap();

    let request = Request::builder()
        .uri(format!("http://{}/", router.addr))
        .header(HOST, "app1.example")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = router.client.request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "100");

    // The client sees a broken body, not a short successful one.
    assert!(response.into_body().collect().await.is_err());

    let metrics = router.router.clone();
    wait_until("truncation to be counted", move || {
        metrics.metrics_snapshot().truncated_responses == 1
    })
    .await;

    let metrics = router.router.metrics_snapshot();
    assert_eq!(metrics.truncated_responses, 1);
    assert_eq!(metrics.destinations[&truncating].attempts, 1);
    assert_eq!(metrics.destinations[&truncating].successes, 1);
    assert!(!metrics.destinations.contains_key(&other.addr()));
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert_eq!(other.hits(), 0);
}

#[tokio::test]
async fn test_client_disconnect_cancels_backend_call() {
    let (stalled, state) = stalled_backend().await;
    let router = TestRouter::start(RouterConfig::default()).await;
    router.router.add_destination("app1.example", &stalled, None).unwrap();

    let request = Request::builder()
        .uri(format!("http://{}/", router.addr))
        .header(HOST, "app1.example")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let client = router.client.clone();
    let in_flight = tokio::spawn(async move { client.request(request).await });

    let entered = state.entered.clone();
    wait_until("the backend to receive the request", move || {
        entered.load(Ordering::SeqCst)
    })
    .await;
    assert!(!state.dropped.load(Ordering::SeqCst));

    // Dropping the client's request closes its connection to the router.
    in_flight.abort();
    let _ = in_flight.await;

    let dropped = state.dropped.clone();
    wait_until("the backend handler to be dropped", move || {
        dropped.load(Ordering::SeqCst)
    })
    .await;
}

#[tokio::test]
async fn test_unhealthy_destination_is_skipped_until_it_recovers() {
    let dead = dead_addr();
    let live = MockBackend::start("live").await;
    let mut config = first_strategy(1);
    config.health = HealthCheckConfig {
        interval: Duration::from_millis(20),
        timeout: Duration::from_millis(500),
        failure_threshold: 2,
        ..HealthCheckConfig::default()
    };
    let router = TestRouter::start(config).await;
    router.router.add_destination("app1.example", &dead, None).unwrap();
    router.router.add_destination("app1.example", &live.addr(), None).unwrap();

    let health = router.router.health().clone();
    let dead_for_check = dead.clone();
    wait_until("the dead destination to be marked unhealthy", move || {
        !health.is_healthy(&dead_for_check)
    })
    .await;

    for _ in 0..5 {
        let reply = router.get("app1.example", "/").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.header("x-backend"), "live");
    }

    // Health only affects selection; the route keeps both destinations.
    let route = router.router.route("app1.example").unwrap();
    assert_eq!(route.destinations.len(), 2);
    assert_eq!(router.router.info().unhealthy_destinations, vec![dead.clone()]);

    let metrics = router.router.metrics_snapshot();
    assert!(!metrics.destinations.contains_key(&dead));
    assert_eq!(metrics.destinations[&live.addr()].successes, 5);
}

#[tokio::test]
async fn test_health_checks_keep_live_destination_healthy() {
    let backend = MockBackend::start("b1").await;
    let mut config = RouterConfig::default();
    config.health.interval = Duration::from_millis(20);
    let router = TestRouter::start(config).await;
    router.router.add_destination("app1.example", &backend.addr(), None).unwrap();

    wait_until("a health check to reach the backend", || backend.hits() > 0).await;
    assert!(router.router.health().is_healthy(&backend.addr()));
    assert!(router.router.info().unhealthy_destinations.is_empty());
}
