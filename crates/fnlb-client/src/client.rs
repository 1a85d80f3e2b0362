use fnlb_common::protocol::{
    CapacitySnapshot, CapacityView, FnlbError, IngestSummary, NodeListing, Result,
    RouteListing, RouteMutation, RouteMutationResult, RouteStatus,
};
use fnlb_common::transport::{encode_ndjson, HttpTransport};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Default timeout for one control API call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const JSON: &str = "application/json";
const NDJSON: &str = "application/x-ndjson";

/// Bytes escaped in a path segment: everything but RFC 3986 unreserved.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Client for the router's control API.
///
/// Connections are pooled by the underlying hyper client, so one instance
/// can be cloned and shared freely.
#[derive(Clone)]
pub struct ControlClient {
    base_url: String,
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl ControlClient {
    /// Create a client for the router at `base_url` (e.g. `http://127.0.0.1:8081`).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") || base_url.len() == "http://".len() {
            return Err(FnlbError::InvalidRequest(format!(
                "router URL '{}' must start with http://",
                base_url
            )));
        }

        Ok(Self {
            base_url,
            client: Client::builder(TokioExecutor::new()).build_http(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ============================================================================
    // Routes
    // ============================================================================

    pub async fn add_destination(
        &self,
        host: &str,
        destination: &str,
    ) -> Result<RouteMutationResult> {
        self.mutate_route(Method::PUT, RouteMutation::new(host, destination))
            .await
    }

    /// Like [`add_destination`](Self::add_destination), with an explicit
    /// capacity group for a newly created route.
    pub async fn add_destination_with_group(
        &self,
        host: &str,
        destination: &str,
        group: &str,
    ) -> Result<RouteMutationResult> {
        self.mutate_route(
            Method::PUT,
            RouteMutation::new(host, destination).with_group(group),
        )
        .await
    }

    pub async fn remove_destination(
        &self,
        host: &str,
        destination: &str,
    ) -> Result<RouteMutationResult> {
        self.mutate_route(Method::DELETE, RouteMutation::new(host, destination))
            .await
    }

    pub async fn list_routes(&self) -> Result<RouteListing> {
        self.send(Method::GET, "/1/lb/routes", None, "routes").await
    }

    /// Fetches one route.
    ///
    /// # Errors
    /// `RouteNotFound` for an unknown host, `NoDestinationAvailable` for a
    /// route whose destinations were all removed.
    pub async fn route(&self, host: &str) -> Result<RouteStatus> {
        let path = format!("/1/lb/routes/{}", path_segment(host));
        self.send(Method::GET, &path, None, host).await
    }

    async fn mutate_route(
        &self,
        method: Method,
        mutation: RouteMutation,
    ) -> Result<RouteMutationResult> {
        let body = json_body(&mutation)?;
        self.send(method, "/1/lb/routes", Some((JSON, body)), &mutation.host)
            .await
    }

    // ============================================================================
    // Capacity
    // ============================================================================

    /// Push one snapshot. A snapshot older than the one the router holds
    /// comes back as [`FnlbError::StaleSnapshot`].
    pub async fn push_snapshot(&self, snapshot: &CapacitySnapshot) -> Result<()> {
        let body = json_body(snapshot)?;
        self.send::<serde_json::Value>(
            Method::POST,
            "/1/lb/capacity",
            Some((JSON, body)),
            &snapshot.node_id,
        )
        .await
        .map(|_| ())
    }

    /// Push several snapshots in one streamed request.
    ///
    /// # Returns
    /// How many snapshots the router accepted and rejected. Rejections do
    /// not fail the call.
    pub async fn push_snapshots(&self, snapshots: &[CapacitySnapshot]) -> Result<IngestSummary> {
        let body = encode_ndjson(snapshots)?;
        self.send(
            Method::POST,
            "/1/lb/capacity/stream",
            Some((NDJSON, body)),
            "capacity stream",
        )
        .await
    }

    /// Free slots per node for `group`. Any group name is accepted; it is
    /// escaped into the request path.
    pub async fn query_capacity(&self, group: &str) -> Result<CapacityView> {
        let path = format!("/1/lb/capacity/{}", path_segment(group));
        self.send(Method::GET, &path, None, group).await
    }

    pub async fn list_nodes(&self) -> Result<NodeListing> {
        self.send(Method::GET, "/1/lb/nodes", None, "nodes").await
    }

    // ============================================================================
    // Transport
    // ============================================================================

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<(&'static str, Vec<u8>)>,
        subject: &str,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let builder = Request::builder().method(method).uri(&url);
        let request = match body {
            Some((content_type, body)) => builder
                .header(CONTENT_TYPE, content_type)
                .body(Full::new(Bytes::from(body))),
            None => builder.body(Full::new(Bytes::new())),
        }
        .map_err(|e| FnlbError::Transport(format!("Failed to build request: {}", e)))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| FnlbError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| FnlbError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| FnlbError::Transport(format!("Failed to read response: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(HttpTransport::error_from_status(status, &bytes, subject));
        }

        serde_json::from_slice(&bytes).map_err(FnlbError::JsonSerialization)
    }
}

fn path_segment(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

fn json_body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(FnlbError::JsonSerialization)
}
