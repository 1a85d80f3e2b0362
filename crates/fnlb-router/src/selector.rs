//! Destination selection.
//!
//! The selector narrows a route's destinations to the ones that are not
//! excluded and not failing health checks, prefers destinations with
//! reported free capacity, and leaves the actual draw to a
//! [`SelectionStrategy`].

use fnlb_common::protocol::{FnlbError, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::health_checker::DestinationHealth;
use crate::registry::CapacityRegistry;
use crate::routing_table::Route;

/// Source of the selector's choices.
pub trait SelectionStrategy: Send + Sync {
    /// Index in `0..len`. `len` is never zero.
    fn pick_uniform(&self, len: usize) -> usize;

    /// Index into `weights`, drawn proportionally to them. At least one
    /// weight is non-zero.
    /// Weights are free slot counts widened from `u32`.
    fn pick_weighted(&self, weights: &[u64]) -> usize;
}

/// Random choice using the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomStrategy;

impl SelectionStrategy for RandomStrategy {
    fn pick_uniform(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }

    fn pick_weighted(&self, weights: &[u64]) -> usize {
        match WeightedIndex::new(weights) {
            Ok(dist) => dist.sample(&mut rand::thread_rng()),
            Err(_) => self.pick_uniform(weights.len()),
        }
    }
}

/// Always the first eligible candidate. Deterministic, for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstStrategy;

impl SelectionStrategy for FirstStrategy {
    fn pick_uniform(&self, _len: usize) -> usize {
        0
    }

    fn pick_weighted(&self, weights: &[u64]) -> usize {
        weights.iter().position(|w| *w > 0).unwrap_or(0)
    }
}

/// Configured selection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StrategyKind {
    #[default]
    Random,
    First,
}

impl StrategyKind {
    pub fn build(self) -> Arc<dyn SelectionStrategy> {
        match self {
            StrategyKind::Random => Arc::new(RandomStrategy),
            StrategyKind::First => Arc::new(FirstStrategy),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Random => "random",
            StrategyKind::First => "first",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(StrategyKind::Random),
            "first" => Ok(StrategyKind::First),
            other => Err(format!(
                "unknown selection strategy '{}', expected 'random' or 'first'",
                other
            )),
        }
    }
}

/// Picks one destination for a route.
pub struct Selector {
    registry: Arc<CapacityRegistry>,
    health: Arc<DestinationHealth>,
    strategy: Arc<dyn SelectionStrategy>,
    capacity_aware: bool,
}

impl Selector {
    pub fn new(
        registry: Arc<CapacityRegistry>,
        strategy: Arc<dyn SelectionStrategy>,
        capacity_aware: bool,
    ) -> Self {
        Self {
            registry,
            health: Arc::new(DestinationHealth::default()),
            strategy,
            capacity_aware,
        }
    }

    /// Uses `health` to skip destinations that fail health checks.
    pub fn with_health(mut self, health: Arc<DestinationHealth>) -> Self {
        self.health = health;
        self
    }

    /// Chooses a destination from `route`, skipping `excluded`.
    ///
    /// Unhealthy destinations are skipped unless every remaining candidate
    /// is unhealthy. With capacity information for at least one candidate,
    /// only candidates with free slots are eligible and the draw is
    /// weighted by free slots; candidates without a report count as full.
    /// Without any information the draw is uniform.
    ///
    /// # Arguments
    /// * `route` - The resolved route
    /// * `excluded` - Destinations already tried for this request
    ///
    /// # Errors
    /// `NoDestinationAvailable` when no candidate is left, and
    /// `NoCapacityAvailable` when every reported candidate is full.
    pub fn select(&self, route: &Route, excluded: &HashSet<String>) -> Result<String> {
        let mut candidates: Vec<&String> = route
            .destinations
            .iter()
            .filter(|d| !excluded.contains(*d))
            .collect();

        if candidates.is_empty() {
            return Err(FnlbError::NoDestinationAvailable(route.key.clone()));
        }

        let healthy: Vec<&String> = candidates
            .iter()
            .copied()
            .filter(|d| self.health.is_healthy(d))
            .collect();
        if healthy.is_empty() {
            debug!(
                "Route {}: all {} candidate(s) unhealthy, ignoring health",
                route.key,
                candidates.len()
            );
        } else {
            candidates = healthy;
        }

        if self.capacity_aware {
            let reported: Vec<Option<u32>> = candidates
                .iter()
                .map(|d| self.registry.available(d, &route.group))
                .collect();

            if reported.iter().any(Option::is_some) {
                let weights: Vec<u64> = reported
                    .iter()
                    .map(|r| r.map(u64::from).unwrap_or(0))
                    .collect();
                if weights.iter().all(|w| *w == 0) {
                    debug!(
                        "Route {}: all {} candidate(s) report zero capacity in group {}",
                        route.key,
                        candidates.len(),
                        route.group
                    );
                    return Err(FnlbError::NoCapacityAvailable(route.key.clone()));
                }

                let index = self.strategy.pick_weighted(&weights);
                let chosen = candidates[index].clone();
                debug!(
                    "Route {}: selected {} ({} free)",
                    route.key, chosen, weights[index]
                );
                return Ok(chosen);
            }
        }

        let index = self.strategy.pick_uniform(candidates.len());
        let chosen = candidates[index].clone();
        debug!("Route {}: selected {} uniformly", route.key, chosen);
        Ok(chosen)
    }

    pub fn capacity_aware(&self) -> bool {
        self.capacity_aware
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnlb_common::protocol::{CapacitySnapshot, GroupCapacity};
    use std::collections::HashMap;

    fn route(destinations: &[&str]) -> Route {
        Route {
            key: "app1".to_string(),
            group: "app1".to_string(),
            destinations: destinations.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn report(registry: &CapacityRegistry, node: &str, total: u32, used: u32) {
        registry
            .ingest_snapshot(
                CapacitySnapshot::new(node, 1).with_group(GroupCapacity::new("app1", total, used)),
            )
            .unwrap();
    }

    fn selector(registry: Arc<CapacityRegistry>, strategy: StrategyKind) -> Selector {
        Selector::new(registry, strategy.build(), true)
    }

    #[test]
    fn test_empty_route_has_no_destination() {
        let selector = selector(Arc::new(CapacityRegistry::new()), StrategyKind::Random);
        let err = selector.select(&route(&[]), &HashSet::new()).unwrap_err();
        assert!(matches!(err, FnlbError::NoDestinationAvailable(_)));
    }

    #[test]
    fn test_all_excluded_has_no_destination() {
        let selector = selector(Arc::new(CapacityRegistry::new()), StrategyKind::Random);
        let excluded: HashSet<String> = ["a".to_string()].into_iter().collect();
        let err = selector.select(&route(&["a"]), &excluded).unwrap_err();
        assert!(matches!(err, FnlbError::NoDestinationAvailable(_)));
    }

    #[test]
    fn test_uniform_without_capacity_info() {
        let selector = selector(Arc::new(CapacityRegistry::new()), StrategyKind::Random);
        let route = route(&["a", "b", "c"]);
        let mut seen = HashSet::new();
        for _ in 0..500 {
            seen.insert(selector.select(&route, &HashSet::new()).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_weighted_bias() {
        let registry = Arc::new(CapacityRegistry::new());
        report(&registry, "a", 9, 0);
        report(&registry, "b", 1, 0);
        let selector = selector(registry, StrategyKind::Random);
        let route = route(&["a", "b"]);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..10_000 {
            *counts
                .entry(selector.select(&route, &HashSet::new()).unwrap())
                .or_default() += 1;
        }
        assert!(counts["a"] > 8_500, "a selected {} times", counts["a"]);
    }

    #[test]
    fn test_weighted_draw_with_full_u32_totals() {
        let registry = Arc::new(CapacityRegistry::new());
        report(&registry, "a", u32::MAX, 0);
        report(&registry, "b", u32::MAX, 0);
        report(&registry, "c", u32::MAX, u32::MAX);
        let selector = selector(registry, StrategyKind::Random);
        let route = route(&["a", "b", "c"]);

        let mut seen = HashSet::new();
        for _ in 0..200 {
            let chosen = selector.select(&route, &HashSet::new()).unwrap();
            assert_ne!(chosen, "c");
            seen.insert(chosen);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_random_strategy_large_weights() {
        let weights = [u64::from(u32::MAX); 4];
        for _ in 0..100 {
            assert!(RandomStrategy.pick_weighted(&weights) < weights.len());
        }
        assert_eq!(FirstStrategy.pick_weighted(&[0, u64::from(u32::MAX)]), 1);
    }

    #[test]
    fn test_zero_capacity_never_selected() {
        let registry = Arc::new(CapacityRegistry::new());
        report(&registry, "a", 4, 4);
        report(&registry, "b", 4, 3);
        let selector = selector(registry, StrategyKind::Random);
        let route = route(&["a", "b"]);
        for _ in 0..200 {
            assert_eq!(selector.select(&route, &HashSet::new()).unwrap(), "b");
        }
    }

    #[test]
    fn test_unreported_candidate_counts_as_full() {
        let registry = Arc::new(CapacityRegistry::new());
        report(&registry, "b", 2, 0);
        let selector = selector(registry, StrategyKind::Random);
        for _ in 0..200 {
            assert_eq!(
                selector.select(&route(&["a", "b"]), &HashSet::new()).unwrap(),
                "b"
            );
        }
    }

    #[test]
    fn test_all_zero_is_no_capacity() {
        let registry = Arc::new(CapacityRegistry::new());
        report(&registry, "a", 2, 2);
        let selector = selector(registry, StrategyKind::Random);
        let err = selector
            .select(&route(&["a", "b"]), &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, FnlbError::NoCapacityAvailable(_)));
    }

    #[test]
    fn test_capacity_for_other_group_is_ignored() {
        let registry = Arc::new(CapacityRegistry::new());
        registry
            .ingest_snapshot(
                CapacitySnapshot::new("a", 1).with_group(GroupCapacity::new("other", 1, 1)),
            )
            .unwrap();
        let selector = selector(registry, StrategyKind::First);
        assert_eq!(
            selector.select(&route(&["a", "b"]), &HashSet::new()).unwrap(),
            "a"
        );
    }

    #[test]
    fn test_capacity_unaware_ignores_registry() {
        let registry = Arc::new(CapacityRegistry::new());
        report(&registry, "a", 1, 1);
        let selector = Selector::new(registry, StrategyKind::First.build(), false);
        assert_eq!(
            selector.select(&route(&["a", "b"]), &HashSet::new()).unwrap(),
            "a"
        );
    }

    #[test]
    fn test_first_strategy_skips_excluded_and_full() {
        let registry = Arc::new(CapacityRegistry::new());
        report(&registry, "a", 1, 0);
        report(&registry, "b", 1, 1);
        report(&registry, "c", 1, 0);
        let selector = selector(registry, StrategyKind::First);
        let excluded: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(
            selector.select(&route(&["a", "b", "c"]), &excluded).unwrap(),
            "c"
        );
    }

    #[test]
    fn test_unhealthy_destination_skipped() {
        let health = Arc::new(DestinationHealth::new(1));
        health.record_failure("a");
        let selector = selector(Arc::new(CapacityRegistry::new()), StrategyKind::First)
            .with_health(health.clone());
        let route = route(&["a", "b"]);
        assert_eq!(selector.select(&route, &HashSet::new()).unwrap(), "b");

        health.record_success("a");
        assert_eq!(selector.select(&route, &HashSet::new()).unwrap(), "a");
    }

    #[test]
    fn test_unhealthy_with_free_capacity_still_skipped() {
        let registry = Arc::new(CapacityRegistry::new());
        report(&registry, "a", 8, 0);
        report(&registry, "b", 8, 7);
        let health = Arc::new(DestinationHealth::new(1));
        health.record_failure("a");
        let selector = selector(registry, StrategyKind::Random).with_health(health);
        for _ in 0..100 {
            assert_eq!(
                selector.select(&route(&["a", "b"]), &HashSet::new()).unwrap(),
                "b"
            );
        }
    }

    #[test]
    fn test_all_unhealthy_falls_back_to_route() {
        let health = Arc::new(DestinationHealth::new(1));
        health.record_failure("a");
        health.record_failure("b");
        let selector = selector(Arc::new(CapacityRegistry::new()), StrategyKind::First)
            .with_health(health);
        let excluded: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(
            selector.select(&route(&["a", "b"]), &excluded).unwrap(),
            "b"
        );
    }

    #[test]
    fn test_strategy_kind_from_str() {
        assert_eq!("random".parse::<StrategyKind>(), Ok(StrategyKind::Random));
        assert_eq!("FIRST".parse::<StrategyKind>(), Ok(StrategyKind::First));
        assert!("round-robin".parse::<StrategyKind>().is_err());
        assert_eq!(StrategyKind::default(), StrategyKind::Random);
    }
}
