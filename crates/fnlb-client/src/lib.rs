//! Client side of the fnlb control API.
//!
//! [`ControlClient`] manages routes and reads capacity over HTTP;
//! [`CapacityReporter`] runs on a runner node and pushes its capacity to the
//! router on a fixed heartbeat.

pub mod client;
pub mod reporter;

pub use client::ControlClient;
pub use reporter::{CapacityProvider, CapacityReporter};
