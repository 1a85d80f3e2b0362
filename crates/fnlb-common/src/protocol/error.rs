use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FnlbError {
    #[error("no matching route for host '{0}'")]
    RouteNotFound(String),

    #[error("route '{0}' has no destinations")]
    NoDestinationAvailable(String),

    #[error("no capacity available for route '{0}'")]
    NoCapacityAvailable(String),

    #[error("destination {destination} unreachable: {reason}")]
    DestinationUnreachable { destination: String, reason: String },

    #[error("stale snapshot from node {node_id}: timestamp {timestamp} is older than {last_seen}")]
    StaleSnapshot {
        node_id: String,
        timestamp: u64,
        last_seen: u64,
    },

    #[error("response truncated: {0}")]
    TruncatedResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),
}

impl FnlbError {
    /// HTTP status used when this error is turned into a client response.
    pub fn status_code(&self) -> StatusCode {
        match self {
            FnlbError::RouteNotFound(_) | FnlbError::NoDestinationAvailable(_) => {
                StatusCode::NOT_FOUND
            }
            FnlbError::NoCapacityAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            FnlbError::DestinationUnreachable { .. } | FnlbError::TruncatedResponse(_) => {
                StatusCode::BAD_GATEWAY
            }
            FnlbError::StaleSnapshot { .. } => StatusCode::CONFLICT,
            FnlbError::InvalidRequest(_) | FnlbError::JsonSerialization(_) => {
                StatusCode::BAD_REQUEST
            }
            FnlbError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            FnlbError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Only a failure to reach a destination before any response bytes
    /// arrived may be retried against another destination.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FnlbError::DestinationUnreachable { .. })
    }

    pub fn unreachable(destination: impl Into<String>, reason: impl ToString) -> Self {
        FnlbError::DestinationUnreachable {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FnlbError>;
