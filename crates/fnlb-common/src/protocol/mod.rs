pub mod capacity;
pub mod error;
pub mod routes;


pub use capacity::{
    current_timestamp_ms, CapacitySnapshot, CapacityView, GroupCapacity, IngestSummary,
    NodeListing, NodeStatus,
};
pub use error::{FnlbError, Result};
pub use routes::{
    route_key_from_host, RouteListing, RouteMutation, RouteMutationResult, RouteStatus,
};
