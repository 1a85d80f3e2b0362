//! HTTP routes for the router.
//!
//! The control API lives under `/1/lb/`, monitoring under `/__*`, and every
//! other request falls through to the proxy.

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use fnlb_common::protocol::{CapacitySnapshot, FnlbError, IngestSummary, RouteMutation};
use fnlb_common::transport::{HttpTransport, HyperResponse, SnapshotDecoder};
use futures::StreamExt;
use hyper::body::Bytes;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::router::Router;

/// Routes served on a single listener: control API, monitoring and proxy.
pub fn app(router: Arc<Router>) -> axum::Router {
    control_routes()
        .merge(monitoring_routes())
        .layer(TraceLayer::new_for_http())
        .fallback(proxy_handler)
        .layer(CorsLayer::permissive())
        .with_state(router)
}

/// Routes for the client-facing listener when the control API is split off.
pub fn proxy_app(router: Arc<Router>) -> axum::Router {
    axum::Router::new()
        .route("/__health", get(health_check))
        .fallback(proxy_handler)
        .with_state(router)
}

/// Routes for a dedicated admin listener.
pub fn admin_app(router: Arc<Router>) -> axum::Router {
    control_routes()
        .merge(monitoring_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(router)
}

fn control_routes() -> axum::Router<Arc<Router>> {
    axum::Router::new()
        .route(
            "/1/lb/routes",
            get(list_routes).put(add_route).delete(remove_route),
        )
        .route("/1/lb/routes/:host", get(get_route))
        .route("/1/lb/capacity", post(ingest_snapshot))
        .route("/1/lb/capacity/stream", post(ingest_snapshot_stream))
        .route("/1/lb/capacity/:group", get(query_capacity))
        .route("/1/lb/nodes", get(list_nodes))
}

fn monitoring_routes() -> axum::Router<Arc<Router>> {
    axum::Router::new()
        .route("/__health", get(health_check))
        .route("/__info", get(info))
        .route("/__metrics", get(metrics))
}

fn to_axum(response: HyperResponse) -> Response {
    response.map(Body::new)
}

fn error_response(error: &FnlbError) -> Response {
    to_axum(HttpTransport::error_response(error))
}

fn json_ok<T: serde::Serialize>(value: &T) -> Response {
    to_axum(HttpTransport::json_response(StatusCode::OK, value))
}

/// Forwards any request that is not part of the control API.
async fn proxy_handler(
    State(router): State<Arc<Router>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
) -> Response {
    let client_addr = connect_info.map(|ConnectInfo(addr)| addr);
    match router.handle(request, client_addr).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

async fn add_route(State(router): State<Arc<Router>>, body: Bytes) -> Response {
    let result = HttpTransport::parse_json::<RouteMutation>(body).and_then(|m| {
        router.add_destination(&m.host, &m.destination, m.group.as_deref())
    });
    match result {
        Ok(result) => json_ok(&result),
        Err(e) => error_response(&e),
    }
}

async fn remove_route(State(router): State<Arc<Router>>, body: Bytes) -> Response {
    let result = HttpTransport::parse_json::<RouteMutation>(body)
        .and_then(|m| router.remove_destination(&m.host, &m.destination));
    match result {
        Ok(result) => json_ok(&result),
        Err(e) => error_response(&e),
    }
}

async fn list_routes(State(router): State<Arc<Router>>) -> Response {
    json_ok(&router.list_routes())
}

async fn get_route(State(router): State<Arc<Router>>, Path(host): Path<String>) -> Response {
    match router.route(&host) {
        Ok(route) => json_ok(&route),
        Err(e) => error_response(&e),
    }
}

async fn ingest_snapshot(State(router): State<Arc<Router>>, body: Bytes) -> Response {
    let result = HttpTransport::parse_json::<CapacitySnapshot>(body).and_then(|snapshot| {
        let node_id = snapshot.node_id.clone();
        router.ingest_snapshot(snapshot).map(|()| node_id)
    });
    match result {
        Ok(node_id) => json_ok(&json!({ "nodeId": node_id, "accepted": true })),
        Err(e) => error_response(&e),
    }
}

/// Ingests newline-delimited snapshots as they arrive on one long request.
///
/// Each line is handled on its own; a rejected line is counted and the
/// stream continues.
async fn ingest_snapshot_stream(State(router): State<Arc<Router>>, body: Body) -> Response {
    let mut summary = IngestSummary::default();
    let mut decoder = SnapshotDecoder::new();
    let mut stream = body.into_data_stream();

    let mut ingest = |decoded: fnlb_common::Result<CapacitySnapshot>| {
        match decoded.and_then(|snapshot| router.ingest_snapshot(snapshot)) {
            Ok(()) => summary.accepted += 1,
            Err(e) => {
                warn!("Rejected streamed snapshot: {}", e);
                summary.rejected += 1;
            }
        }
    };

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => decoder.feed(&chunk).into_iter().for_each(&mut ingest),
            Err(e) => {
                warn!("Snapshot stream ended with error: {}", e);
                break;
            }
        }
    }
    if let Some(last) = decoder.finish() {
        ingest(last);
    }

    json_ok(&summary)
}

async fn query_capacity(State(router): State<Arc<Router>>, Path(group): Path<String>) -> Response {
    json_ok(&router.query_capacity(&group))
}

async fn list_nodes(State(router): State<Arc<Router>>) -> Response {
    json_ok(&router.list_nodes())
}

async fn info(State(router): State<Arc<Router>>) -> Response {
    json_ok(&router.info())
}

async fn metrics(State(router): State<Arc<Router>>) -> Response {
    json_ok(&router.metrics_snapshot())
}

/// Handles health check GET requests.
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
