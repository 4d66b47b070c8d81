//! Request routing for intercepted fetches.
//!
//! Routes are an ordered list of `(pattern, route)` pairs tested against the
//! request path. The first match wins; no match means
//! [`Route::CacheOrNetwork`].

use std::sync::OnceLock;

use regex::Regex;
use tracing::trace;

use crate::ServiceWorkerError;

/// What the worker does with an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Synthetic response with a random integer.
    Generated,
    GetCookie,
    SetCookie,
    DeleteCookie,
    /// Drop the current cache generation.
    DeleteCache,
    /// Serve from the current cache, else from the network.
    CacheOrNetwork,
}

/// Patterns served by [`RouteTable::standard`], in precedence order.
pub const STANDARD_ROUTES: &[(&str, Route)] = &[
    (r"^/sw/generated/?", Route::Generated),
    (r"^/sw/get/cookie", Route::GetCookie),
    (r"^/sw/set/cookie", Route::SetCookie),
    (r"^/sw/delete/cookie", Route::DeleteCookie),
    (r"^/sw/delete/cache", Route::DeleteCache),
];

/// Ordered route table.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<(Regex, Route)>,
}

impl RouteTable {
    /// An empty table: everything goes to the cache-or-network fallback.
    pub fn new() -> Self {
        Self::default()
    }

    /// The worker's fixed route set.
    pub fn standard() -> Self {
        static STANDARD: OnceLock<RouteTable> = OnceLock::new();

        STANDARD
            .get_or_init(|| RouteTable {
                routes: STANDARD_ROUTES
                    .iter()
                    .map(|&(pattern, route)| {
                        (Regex::new(pattern).expect("standard route pattern"), route)
                    })
                    .collect(),
            })
            .clone()
    }

    /// Append a route. Earlier routes take precedence.
    pub fn add(&mut self, pattern: &str, route: Route) -> Result<(), ServiceWorkerError> {
        self.routes.push((Regex::new(pattern)?, route));
        Ok(())
    }

    /// Pick the route for a request path.
    pub fn route(&self, path: &str) -> Route {
        let route = self
            .routes
            .iter()
            .find(|(pattern, _)| pattern.is_match(path))
            .map(|&(_, route)| route)
            .unwrap_or(Route::CacheOrNetwork);

        trace!(path, ?route, "Routed request");
        route
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
