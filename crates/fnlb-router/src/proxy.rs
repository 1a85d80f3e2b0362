//! Forwarding of one client request to one destination.
//!
//! Small bodies with a known length are buffered once so the router can
//! replay them on another destination after a connect failure. Anything
//! else is streamed through and gets a single attempt. Responses are never
//! buffered.

use axum::body::Body;
use fnlb_common::protocol::{FnlbError, Result};
use http_body_util::BodyExt;
use hyper::body::{Body as _, Bytes};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::metrics::RouterMetrics;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that describe a single connection and never cross a proxy.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Upstream connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// TCP connect timeout. Default: 2s
    pub connect_timeout: Duration,
    /// Time allowed until response headers arrive. Default: 30s
    pub response_timeout: Duration,
    /// Largest request body buffered for replay. Default: 1 MiB
    pub replay_limit: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(30),
            replay_limit: 1024 * 1024,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() || self.response_timeout.is_zero() {
            return Err(FnlbError::InvalidRequest(
                "upstream timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

enum OutboundBody {
    Buffered(Bytes),
    /// Taken by the first attempt
    Streaming(Option<Body>),
}

/// A client request prepared for forwarding.
pub struct ForwardRequest {
    method: Method,
    path_and_query: String,
    headers: HeaderMap,
    body: OutboundBody,
}

impl ForwardRequest {
    /// Strips connection headers, records the client address and decides
    /// whether the body can be replayed.
    pub async fn prepare(
        request: Request<Body>,
        client_addr: Option<SocketAddr>,
        replay_limit: usize,
    ) -> Result<Self> {
        let (parts, body) = request.into_parts();

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        if let Some(addr) = client_addr {
            append_forwarded_for(&mut headers, addr);
        }

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let body = match body.size_hint().exact() {
            Some(len) if len as usize <= replay_limit => {
                let bytes = body
                    .collect()
                    .await
                    .map_err(|e| FnlbError::InvalidRequest(format!("failed to read request body: {}", e)))?
                    .to_bytes();
                OutboundBody::Buffered(bytes)
            }
            _ => OutboundBody::Streaming(Some(body)),
        };

        Ok(Self {
            method: parts.method,
            path_and_query,
            headers,
            body,
        })
    }

    /// Whether the request may be sent more than once.
    pub fn is_replayable(&self) -> bool {
        matches!(self.body, OutboundBody::Buffered(_))
    }

    fn build(&mut self, destination: &str) -> Result<Request<Body>> {
        let body = match &mut self.body {
            OutboundBody::Buffered(bytes) => Body::from(bytes.clone()),
            OutboundBody::Streaming(body) => body.take().ok_or_else(|| {
                FnlbError::Transport("streamed request body already consumed".to_string())
            })?,
        };

        let uri: Uri = format!("http://{}{}", destination, self.path_and_query)
            .parse()
            .map_err(|e| FnlbError::unreachable(destination, format!("invalid destination: {}", e)))?;

        let mut request = Request::new(body);
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}

/// Sends prepared requests over a shared pooled client.
pub struct ProxyEngine {
    client: Client<HttpConnector, Body>,
    config: ProxyConfig,
    metrics: Arc<RouterMetrics>,
}

impl ProxyEngine {
    pub fn new(config: ProxyConfig, metrics: Arc<RouterMetrics>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            client,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Forwards `request` to `destination` and relays the response.
    ///
    /// Every failure before response headers arrive is
    /// `DestinationUnreachable`. Once headers are back the response is
    /// returned as-is, whatever its status; a later body failure is logged,
    /// counted and aborts the client connection.
    pub async fn forward(&self, request: &mut ForwardRequest, destination: &str) -> Result<Response<Body>> {
        let outbound = request.build(destination)?;

        let response = tokio::time::timeout(self.config.response_timeout, self.client.request(outbound))
            .await
            .map_err(|_| {
                FnlbError::unreachable(
                    destination,
                    format!("no response within {}ms", self.config.response_timeout.as_millis()),
                )
            })?
            .map_err(|e| FnlbError::unreachable(destination, describe_client_error(&e)))?;

        let (mut parts, incoming) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let metrics = self.metrics.clone();
        let destination = destination.to_string();
        let body = incoming.map_err(move |e| {
            warn!(
                "{}",
                FnlbError::TruncatedResponse(format!("body from {} failed: {}", destination, e))
            );
            metrics.record_truncated();
            e
        });

        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

fn describe_client_error(error: &hyper_util::client::legacy::Error) -> String {
    use std::error::Error as _;
    match error.source() {
        Some(source) => format!("{}: {}", error, source),
        None => error.to_string(),
    }
}

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: SocketAddr) {
    let ip = addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, ip),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
