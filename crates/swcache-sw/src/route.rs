//! Pattern table and request dispatch.

use std::fmt;

use http::Method;
use serde::{Deserialize, Serialize};
use swcache_net::Request;
use tracing::trace;
use url::Url;

use crate::config::RouteConfig;

/// Caching strategy applied to an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Serve from cache, else network and store.
    CacheFirst,
    /// Serve from network, else cache.
    NetworkFirst,
    /// Serve from cache and refresh it in the background.
    StaleWhileRevalidate,
    /// Unmatched requests: network, else cache, never stored.
    NetworkFallback,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::CacheFirst => write!(f, "cache-first"),
            Strategy::NetworkFirst => write!(f, "network-first"),
            Strategy::StaleWhileRevalidate => write!(f, "stale-while-revalidate"),
            Strategy::NetworkFallback => write!(f, "network-fallback"),
        }
    }
}

/// Path pattern for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    /// Exact path match.
    Exact(String),
    /// Path prefix match.
    Prefix(String),
}

impl PathPattern {
    pub fn exact(path: &str) -> Self {
        Self::Exact(path.to_string())
    }

    pub fn prefix(prefix: &str) -> Self {
        Self::Prefix(prefix.to_string())
    }

    /// Check if a URL path matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(p) => path == p,
            PathPattern::Prefix(p) => path.starts_with(p.as_str()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PathPattern::Exact(p) | PathPattern::Prefix(p) => p,
        }
    }
}

/// A pattern and the strategy it selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub pattern: PathPattern,
    pub strategy: Strategy,
}

/// Ordered routes, evaluated top to bottom. First match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    routes: Vec<Route>,
    fallback: Strategy,
}

impl RouteTable {
    /// An empty table that sends everything to the default strategy.
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            fallback: Strategy::NetworkFallback,
        }
    }

    /// Cache-first prefixes, then network-first prefixes, then
    /// stale-while-revalidate exact paths.
    pub fn from_config(config: &RouteConfig) -> Self {
        let mut table = Self::new();
        for prefix in &config.cache_first {
            table.push(PathPattern::prefix(prefix), Strategy::CacheFirst);
        }
        for prefix in &config.network_first {
            table.push(PathPattern::prefix(prefix), Strategy::NetworkFirst);
        }
        for path in &config.stale_while_revalidate {
            table.push(PathPattern::exact(path), Strategy::StaleWhileRevalidate);
        }
        table
    }

    /// Append a route after all existing ones.
    pub fn push(&mut self, pattern: PathPattern, strategy: Strategy) {
        self.routes.push(Route { pattern, strategy });
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Strategy for a URL, by its path.
    pub fn classify(&self, url: &Url) -> Strategy {
        let path = url.path();
        self.routes
            .iter()
            .find(|route| route.pattern.matches(path))
            .map(|route| route.strategy)
            .unwrap_or(self.fallback)
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::from_config(&RouteConfig::default())
    }
}

/// Why a request was left to the network untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassthroughReason {
    /// Only GET requests are intercepted.
    Method(Method),
    /// Only http(s) requests are intercepted.
    Scheme(String),
    /// No activated worker controls the scope yet.
    NoController,
}

impl fmt::Display for PassthroughReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassthroughReason::Method(m) => write!(f, "method {m}"),
            PassthroughReason::Scheme(s) => write!(f, "scheme {s}"),
            PassthroughReason::NoController => write!(f, "no controller"),
        }
    }
}

/// Dispatch decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Do not intercept.
    Passthrough(PassthroughReason),
    /// Handle with the given strategy.
    Handle(Strategy),
}

/// Decide how to handle a request. Never touches a cache.
pub fn dispatch(table: &RouteTable, request: &Request) -> Dispatch {
    if request.method != Method::GET {
        return Dispatch::Passthrough(PassthroughReason::Method(request.method.clone()));
    }
    if !request.is_http() {
        return Dispatch::Passthrough(PassthroughReason::Scheme(
            request.url.scheme().to_string(),
        ));
    }

    let strategy = table.classify(&request.url);
    trace!(url = %request.url, %strategy, "Dispatched");
    Dispatch::Handle(strategy)
}
