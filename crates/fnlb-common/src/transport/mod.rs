//! fnlb Transport Layer
//!
//! HTTP helpers and the newline-delimited JSON codec shared by the router and
//! the control client.
//!
//! # Components
//!
//! - **[`HttpTransport`]**: JSON bodies in and out of hyper requests/responses
//! - **[`SnapshotDecoder`]**: incremental decoder for streamed capacity
//!   snapshots (one JSON object per line)
//! - **[`encode_ndjson`]**: the matching encoder used by reporters
//!
//! # Example
//!
//! ```
//! use fnlb_common::transport::{encode_ndjson, SnapshotDecoder};
//! use fnlb_common::CapacitySnapshot;
//!
//! let body = encode_ndjson(&[CapacitySnapshot::new("n1", 1)]).unwrap();
//! let mut decoder = SnapshotDecoder::new();
//! let decoded = decoder.feed(&body);
//! assert_eq!(decoded.len(), 1);
//! ```

pub mod codec;
pub mod http;

pub use codec::{encode_ndjson, SnapshotDecoder, MAX_LINE_BYTES};
pub use http::{HttpTransport, HyperResponse};
