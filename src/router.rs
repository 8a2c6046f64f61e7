use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tracing::debug;

pub const DEFAULT_HTTP_PORT: u16 = 80;

// Build the key used in the route table: the bare host for the default HTTP port,
// or `host:port` otherwise.
pub fn routing_key(host: &str, port: u16) -> String {
    let host = host.to_ascii_lowercase();
    if port == DEFAULT_HTTP_PORT {
        host
    } else {
        format!("{host}:{port}")
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("No route for {0}")]
pub struct RouteNotFound(pub String);

// Table of routing keys to local ports.
// Replacement swaps the whole table, so readers see either the old or the new routes.
#[derive(Debug, Default)]
pub struct DomainRouter {
    routes: RwLock<Arc<HashMap<String, u16>>>,
}

impl DomainRouter {
    pub fn new() -> Self {
        Self::default()
    }

    // Atomically replace every route.
    pub fn set_routes(&self, routes: HashMap<String, u16>) {
        let routes: HashMap<String, u16> = routes
            .into_iter()
            .map(|(key, port)| (key.to_ascii_lowercase(), port))
            .collect();
        debug!(count = routes.len(), "Replacing routes.");
        *self.routes.write().unwrap() = Arc::new(routes);
    }

    pub fn add_route(&self, key: &str, port: u16) {
        let mut routes = self.routes.write().unwrap();
        let mut updated = HashMap::clone(&routes);
        updated.insert(key.to_ascii_lowercase(), port);
        *routes = Arc::new(updated);
    }

    // Remove a route, returning its port if it existed.
    pub fn remove_route(&self, key: &str) -> Option<u16> {
        let mut routes = self.routes.write().unwrap();
        let key = key.to_ascii_lowercase();
        if !routes.contains_key(&key) {
            return None;
        }
        let mut updated = HashMap::clone(&routes);
        let port = updated.remove(&key);
        *routes = Arc::new(updated);
        port
    }

    // Snapshot of the current routes.
    pub fn routes(&self) -> Arc<HashMap<String, u16>> {
        Arc::clone(&self.routes.read().unwrap())
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Look up `host:port` first, then fall back to the bare host for non-default ports.
    pub fn resolve(&self, host: &str, port: u16) -> Result<u16, RouteNotFound> {
        let routes = self.routes();
        let key = routing_key(host, port);
        if let Some(port) = routes.get(&key) {
            return Ok(*port);
        }
        if port != DEFAULT_HTTP_PORT {
            if let Some(port) = routes.get(&host.to_ascii_lowercase()) {
                return Ok(*port);
            }
        }
        Err(RouteNotFound(key))
    }
}
