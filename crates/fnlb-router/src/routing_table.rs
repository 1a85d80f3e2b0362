use arc_swap::ArcSwap;
use fnlb_common::protocol::{FnlbError, Result, RouteStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// One route key and the destinations that may serve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub key: String,
    /// Capacity group consulted by the selector, defaults to `key`
    pub group: String,
    pub destinations: Vec<String>,
}

impl Route {
    fn new(key: &str, group: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            group: group.unwrap_or(key).to_string(),
            destinations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn status(&self) -> RouteStatus {
        RouteStatus {
            host: self.key.clone(),
            group: self.group.clone(),
            destinations: self.destinations.clone(),
        }
    }
}

type RouteMap = HashMap<String, Arc<Route>>;

/// Route key to destination set, copy-on-write.
///
/// Readers load the current map without locking and never see a partially
/// applied mutation. Writers clone the map, apply their change and swap it
/// in; concurrent writers are linearized by `rcu` retrying on conflict.
pub struct RoutingTable {
    routes: ArcSwap<RouteMap>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Adds a destination, creating the route on first use.
    ///
    /// Returns `false` if the destination was already present; the set is
    /// left unchanged in that case.
    pub fn add_destination(&self, route_key: &str, destination: &str) -> bool {
        self.add_inner(route_key, None, destination)
    }

    /// Like [`add_destination`](Self::add_destination), also pinning the
    /// route's capacity group.
    pub fn add_destination_with_group(
        &self,
        route_key: &str,
        group_key: &str,
        destination: &str,
    ) -> bool {
        self.add_inner(route_key, Some(group_key), destination)
    }

    fn add_inner(&self, route_key: &str, group_key: Option<&str>, destination: &str) -> bool {
        let mut added = false;
        self.routes.rcu(|current| {
            let mut next = RouteMap::clone(current);
            let mut route = next
                .get(route_key)
                .map(|r| Route::clone(r))
                .unwrap_or_else(|| Route::new(route_key, group_key));

            if let Some(group) = group_key {
                route.group = group.to_string();
            }
            added = !route.destinations.iter().any(|d| d == destination);
            if added {
                route.destinations.push(destination.to_string());
            }

            next.insert(route_key.to_string(), Arc::new(route));
            next
        });

        if added {
            info!("Route {} -> {} added", route_key, destination);
        }
        added
    }

    /// Removes every occurrence of `destination` from the route.
    ///
    /// Unknown routes and absent destinations are a no-op returning 0. The
    /// route itself stays known even when it becomes empty.
    pub fn remove_destination(&self, route_key: &str, destination: &str) -> usize {
        if !self.routes.load().contains_key(route_key) {
            return 0;
        }

        let mut removed = 0;
        self.routes.rcu(|current| {
            removed = 0;
            let Some(existing) = current.get(route_key) else {
                return Arc::clone(current);
            };
            let mut route = Route::clone(existing);
            let before = route.destinations.len();
            route.destinations.retain(|d| d != destination);
            removed = before - route.destinations.len();
            if removed == 0 {
                return Arc::clone(current);
            }

            let mut next = RouteMap::clone(current);
            next.insert(route_key.to_string(), Arc::new(route));
            Arc::new(next)
        });

        if removed > 0 {
            info!("Route {} -> {} removed", route_key, destination);
        }
        removed
    }

    /// Looks up a route. A known route with no destinations is `Ok`.
    pub fn resolve(&self, route_key: &str) -> Result<Arc<Route>> {
        self.routes
            .load()
            .get(route_key)
            .cloned()
            .ok_or_else(|| FnlbError::RouteNotFound(route_key.to_string()))
    }

    /// All routes, ordered by key.
    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<_> = self.routes.load().values().cloned().collect();
        routes.sort_by(|a, b| a.key.cmp(&b.key));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.load().is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}
