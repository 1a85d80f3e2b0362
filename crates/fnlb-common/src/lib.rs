//! fnlb Common Types and Transport
//!
//! This crate provides the wire types, error taxonomy and HTTP helpers shared
//! by the fnlb router, its control client and the CLI.
//!
//! # Overview
//!
//! fnlb is a capacity-aware load-balancing router for a function-execution
//! platform. Clients address a logical function host; the router picks one
//! of the runner nodes registered for that host, preferring nodes that have
//! reported free execution slots, and proxies the HTTP exchange.
//!
//! - **Protocol Layer**: capacity snapshots, route mutations, listings, errors
//! - **Transport Layer**: JSON/NDJSON encoding and HTTP response helpers
//!
//! # Components
//!
//! - [`protocol`] - Core protocol types (snapshots, routes, `FnlbError`)
//! - [`transport`] - HTTP helpers and the streaming snapshot codec
//!
//! # Example
//!
//! ```
//! use fnlb_common::{CapacitySnapshot, GroupCapacity};
//!
//! let snapshot = CapacitySnapshot::new("10.0.0.7:8080", 1_700_000_000_000)
//!     .with_group(GroupCapacity::new("app1.example", 8, 3));
//!
//! assert_eq!(snapshot.groups[0].available(), 5);
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
