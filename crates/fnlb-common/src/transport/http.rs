//! HTTP Transport Utilities
//!
//! Conversions between JSON payloads and hyper messages, used by the control
//! API and the control client.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::error::{FnlbError, Result};

/// Type alias for Hyper responses with full body
pub type HyperResponse = Response<Full<Bytes>>;

/// Seconds advertised in `Retry-After` when no capacity is available
pub const RETRY_AFTER_SECS: u64 = 1;

/// HTTP transport utility functions
pub struct HttpTransport;

impl HttpTransport {
    /// Parse a JSON body into `T`.
    ///
    /// Malformed JSON surfaces as [`FnlbError::InvalidRequest`] so it maps to
    /// a 400 rather than a server error.
    ///
    /// # Example
    ///
    /// ```
    /// use fnlb_common::transport::http::HttpTransport;
    /// use fnlb_common::RouteMutation;
    /// use hyper::body::Bytes;
    ///
    /// let body = Bytes::from(r#"{"host":"app1.example","destination":"10.0.0.1:80"}"#);
    /// let mutation: RouteMutation = HttpTransport::parse_json(body).unwrap();
    /// assert_eq!(mutation.host, "app1.example");
    /// ```
    pub fn parse_json<T: DeserializeOwned>(body: Bytes) -> Result<T> {
        serde_json::from_slice(&body)
            .map_err(|e| FnlbError::InvalidRequest(format!("malformed JSON body: {}", e)))
    }

    /// Build a JSON response with the given status.
    pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> HyperResponse {
        match serde_json::to_vec(value) {
            Ok(body) => Self::with_body(status, "application/json", Bytes::from(body)),
            Err(e) => Self::error_response(&FnlbError::JsonSerialization(e)),
        }
    }

    /// Render an error as a plain-text response with its mapped status.
    ///
    /// A 503 additionally carries `Retry-After`.
    pub fn error_response(error: &FnlbError) -> HyperResponse {
        let status = error.status_code();
        let mut response = Self::with_body(
            status,
            "text/plain; charset=utf-8",
            Bytes::from(error.to_string()),
        );
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response.headers_mut().insert(
                RETRY_AFTER,
                HeaderValue::from(RETRY_AFTER_SECS),
            );
        }
        response
    }

    /// Map a non-2xx control API response back into an error.
    ///
    /// The status picks the variant; the body text becomes the message. A
    /// 404 is `NoDestinationAvailable` when the body says the route exists
    /// but is empty, and `RouteNotFound` otherwise.
    ///
    /// # Arguments
    /// * `status` - Response status, not a success
    /// * `body` - Response body, the rendered error message
    /// * `subject` - Host, group or node the request was about
    pub fn error_from_status(status: StatusCode, body: &[u8], subject: &str) -> FnlbError {
        let message = String::from_utf8_lossy(body).trim().to_string();
        match status {
            StatusCode::NOT_FOUND if message.ends_with(NO_DESTINATIONS_SUFFIX) => {
                FnlbError::NoDestinationAvailable(subject.to_string())
            }
            StatusCode::NOT_FOUND => FnlbError::RouteNotFound(subject.to_string()),
            StatusCode::SERVICE_UNAVAILABLE => FnlbError::NoCapacityAvailable(subject.to_string()),
            StatusCode::BAD_GATEWAY => FnlbError::unreachable(subject, message),
            StatusCode::CONFLICT => parse_stale(subject, &message),
            StatusCode::BAD_REQUEST => FnlbError::InvalidRequest(message),
            StatusCode::GATEWAY_TIMEOUT => FnlbError::Timeout(0),
            other => FnlbError::Transport(format!("HTTP {}: {}", other, message)),
        }
    }

    fn with_body(status: StatusCode, content_type: &'static str, body: Bytes) -> HyperResponse {
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }
}

/// Tail of the rendered `NoDestinationAvailable` message.
const NO_DESTINATIONS_SUFFIX: &str = "has no destinations";

/// Recovers the timestamps from a rendered `StaleSnapshot` message.
fn parse_stale(node_id: &str, message: &str) -> FnlbError {
    let mut numbers = message
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<u64>().ok())
        .rev();
    let last_seen = numbers.next().unwrap_or(0);
    let timestamp = numbers.next().unwrap_or(0);
    FnlbError::StaleSnapshot {
        node_id: node_id.to_string(),
        timestamp,
        last_seen,
    }
}
