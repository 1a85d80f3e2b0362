// Copyright 2025 fnlb Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Router metrics.
//!
//! Counters are plain atomics on the hot path; per-route and
//! per-destination counters live in a `DashMap` so recording never takes a
//! global lock. [`RouterMetrics::snapshot`] produces the serializable view
//! served at `/__metrics`.

use dashmap::DashMap;
use fnlb_common::protocol::FnlbError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
struct RouteCounters {
    requests: AtomicU64,
    failures: AtomicU64,
    total_latency_us: AtomicU64,
}

#[derive(Debug, Default)]
struct DestinationCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Request outcomes that did not produce a backend response.
#[derive(Debug, Default)]
struct FailureCounters {
    route_not_found: AtomicU64,
    no_destination: AtomicU64,
    no_capacity: AtomicU64,
    unreachable: AtomicU64,
    invalid_request: AtomicU64,
    other: AtomicU64,
}

#[derive(Debug)]
pub struct RouterMetrics {
    started_at: Instant,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    truncated_responses: AtomicU64,
    snapshots_accepted: AtomicU64,
    snapshots_rejected: AtomicU64,
    failures: FailureCounters,
    routes: DashMap<String, RouteCounters>,
    destinations: DashMap<String, DestinationCounters>,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            truncated_responses: AtomicU64::new(0),
            snapshots_accepted: AtomicU64::new(0),
            snapshots_rejected: AtomicU64::new(0),
            failures: FailureCounters::default(),
            routes: DashMap::new(),
            destinations: DashMap::new(),
        }
    }

    /// Records the end of one client request.
    ///
    /// # Arguments
    /// * `route_key` - Key of the resolved route, or `None` when the request
    ///   never matched a route. Only resolved keys get per-route counters.
    /// * `start` - When the request arrived
    /// * `error` - The failure returned to the client, if any
    pub fn record_request(
        &self,
        route_key: Option<&str>,
        start: Instant,
        error: Option<&FnlbError>,
    ) {
        let latency_us = start.elapsed().as_micros() as u64;
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let route = route_key.map(|key| self.routes.entry(key.to_string()).or_default());
        if let Some(route) = &route {
            route.requests.fetch_add(1, Ordering::Relaxed);
            route.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
        }

        match error {
            None => {
                self.successful_requests.fetch_add(1, Ordering::Relaxed);
            }
            Some(e) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                if let Some(route) = &route {
                    route.failures.fetch_add(1, Ordering::Relaxed);
                }
                let counter = match e {
                    FnlbError::RouteNotFound(_) => &self.failures.route_not_found,
                    FnlbError::NoDestinationAvailable(_) => &self.failures.no_destination,
                    FnlbError::NoCapacityAvailable(_) => &self.failures.no_capacity,
                    FnlbError::DestinationUnreachable { .. } => &self.failures.unreachable,
                    FnlbError::InvalidRequest(_) => &self.failures.invalid_request,
                    _ => &self.failures.other,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Records one forward attempt against a destination.
    pub fn record_attempt(&self, destination: &str, success: bool) {
        let counters = self.destinations.entry(destination.to_string()).or_default();
        counters.attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            counters.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_truncated(&self) {
        self.truncated_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self, accepted: bool) {
        if accepted {
            self.snapshots_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.snapshots_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let routes = self
            .routes
            .iter()
            .map(|entry| {
                let requests = entry.requests.load(Ordering::Relaxed);
                let total_latency = entry.total_latency_us.load(Ordering::Relaxed);
                let metrics = RouteMetrics {
                    requests,
                    failures: entry.failures.load(Ordering::Relaxed),
                    avg_latency_us: if requests == 0 { 0 } else { total_latency / requests },
                };
                (entry.key().clone(), metrics)
            })
            .collect();

        let destinations = self
            .destinations
            .iter()
            .map(|entry| {
                let metrics = DestinationMetrics {
                    attempts: entry.attempts.load(Ordering::Relaxed),
                    successes: entry.successes.load(Ordering::Relaxed),
                    failures: entry.failures.load(Ordering::Relaxed),
                };
                (entry.key().clone(), metrics)
            })
            .collect();

        MetricsSnapshot {
            uptime_ms: self.uptime_ms(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            truncated_responses: self.truncated_responses.load(Ordering::Relaxed),
            snapshots_accepted: self.snapshots_accepted.load(Ordering::Relaxed),
            snapshots_rejected: self.snapshots_rejected.load(Ordering::Relaxed),
            failures: FailureMetrics {
                route_not_found: self.failures.route_not_found.load(Ordering::Relaxed),
                no_destination: self.failures.no_destination.load(Ordering::Relaxed),
                no_capacity: self.failures.no_capacity.load(Ordering::Relaxed),
                unreachable: self.failures.unreachable.load(Ordering::Relaxed),
                invalid_request: self.failures.invalid_request.load(Ordering::Relaxed),
                other: self.failures.other.load(Ordering::Relaxed),
            },
            routes,
            destinations,
        }
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureMetrics {
    pub route_not_found: u64,
    pub no_destination: u64,
    pub no_capacity: u64,
    pub unreachable: u64,
    pub invalid_request: u64,
    pub other: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteMetrics {
    pub requests: u64,
    pub failures: u64,
    pub avg_latency_us: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DestinationMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_ms: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub truncated_responses: u64,
    pub snapshots_accepted: u64,
    pub snapshots_rejected: u64,
    pub failures: FailureMetrics,
    pub routes: BTreeMap<String, RouteMetrics>,
    pub destinations: BTreeMap<String, DestinationMetrics>,
}

/// Server information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_type: String,
    pub version: String,
    pub uptime_ms: u64,
    pub routes: usize,
    pub nodes: usize,
    pub capacity_aware: bool,
    pub strategy: String,
    #[serde(default)]
    pub unhealthy_destinations: Vec<String>,
}

impl ServerInfo {
    pub fn new(uptime_ms: u64) -> Self {
        Self {
            server_type: "router".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms,
            routes: 0,
            nodes: 0,
            capacity_aware: true,
            strategy: String::new(),
            unhealthy_destinations: Vec::new(),
        }
    }
}
