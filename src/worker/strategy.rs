//! Routes, caching strategies and partition configuration.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use super::http::InterceptedRequest;
use crate::key::KeyStrategy;
use crate::{MuninnError, Result};

/// Default cache version suffix.
pub const DEFAULT_VERSION: &str = "v1";

/// Default NetworkFirst timeout.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(3);

static STATIC_ASSETS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(js|css|html)$").expect("static asset pattern is valid"));

static IMAGES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.(png|gif|jpg|jpeg|svg|ico)$").expect("image pattern is valid")
});

/// How a route combines the cache and the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Serve from cache when present, otherwise fetch and store.
    CacheFirst,
    /// Try the network for at most `timeout`, then fall back to the cache.
    NetworkFirst { timeout: Duration },
    /// Serve from cache and refresh in the background; fetch on miss.
    StaleWhileRevalidate,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::CacheFirst => "cache_first",
            CacheStrategy::NetworkFirst { .. } => "network_first",
            CacheStrategy::StaleWhileRevalidate => "stale_while_revalidate",
        }
    }
}

/// Strategy names as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

impl StrategyKind {
    /// Resolve to a [`CacheStrategy`], using `network_timeout` for NetworkFirst.
    pub fn with_timeout(self, network_timeout: Duration) -> CacheStrategy {
        match self {
            StrategyKind::CacheFirst => CacheStrategy::CacheFirst,
            StrategyKind::NetworkFirst => CacheStrategy::NetworkFirst {
                timeout: network_timeout,
            },
            StrategyKind::StaleWhileRevalidate => CacheStrategy::StaleWhileRevalidate,
        }
    }
}

/// Limits for one partition. `name` is the base name; the stored partition
/// is `<name>-<version>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionConfig {
    pub name: String,
    pub max_entries: usize,
    pub max_age: Duration,
}

impl PartitionConfig {
    pub fn new(name: impl Into<String>, max_entries: usize, max_age: Duration) -> Self {
        Self {
            name: name.into(),
            max_entries,
            max_age,
        }
    }

    /// Partition name for a cache version, e.g. `graphql-cache-v1`.
    pub fn versioned_name(&self, version: &str) -> String {
        format!("{}-{version}", self.name)
    }
}

/// URL test for a route.
#[derive(Debug, Clone)]
pub enum UrlPattern {
    /// Substring of the full URL.
    Contains(String),
    /// Regex over the URL without its query string.
    Regex(Regex),
}

impl UrlPattern {
    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(UrlPattern::Regex)
            .map_err(|e| MuninnError::Configuration(format!("invalid route pattern {pattern}: {e}")))
    }

    pub fn matches(&self, request: &InterceptedRequest) -> bool {
        match self {
            UrlPattern::Contains(needle) => request.url.contains(needle.as_str()),
            UrlPattern::Regex(re) => re.is_match(request.path_part()),
        }
    }
}

/// Which requests a route applies to.
#[derive(Debug, Clone)]
pub struct RouteMatcher {
    /// Required method, any if `None`.
    pub method: Option<Method>,
    pub pattern: UrlPattern,
}

impl RouteMatcher {
    pub fn matches(&self, request: &InterceptedRequest) -> bool {
        self.method
            .as_ref()
            .is_none_or(|method| *method == request.method)
            && self.pattern.matches(request)
    }
}

/// What a route caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// GraphQL POSTs, keyed on the decoded operation. Mutations and
    /// responses carrying `errors` are never cached.
    GraphQl { key_strategy: KeyStrategy },
    /// Plain resources keyed on `METHOD url`. Any success is cached.
    Asset,
}

/// One cache route. The first matching route handles a request.
#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    pub matcher: RouteMatcher,
    pub strategy: CacheStrategy,
    pub partition: PartitionConfig,
    pub kind: RouteKind,
}

/// Interceptor configuration: the cache version and its routes.
///
/// ```rust
/// # use muninn::worker::{CacheStrategy, InterceptorConfig};
/// # use std::time::Duration;
/// let config = InterceptorConfig::for_endpoint("http://127.0.0.1:4000/graphql")
///     .version("v2")
///     .graphql_strategy(CacheStrategy::NetworkFirst { timeout: Duration::from_secs(2) });
/// assert_eq!(
///     config.partition_names(),
///     vec!["graphql-cache-v2", "static-resources-v2", "images-v2"]
/// );
/// ```
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    pub version: String,
    pub routes: Vec<Route>,
    /// Activate as part of install instead of waiting for `on_activate`.
    pub skip_waiting: bool,
}

impl InterceptorConfig {
    /// Empty configuration for `version`.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            routes: Vec::new(),
            skip_waiting: true,
        }
    }

    /// The three standard routes for a GraphQL endpoint:
    ///
    /// | partition | matches | strategy | entries | max age |
    /// |---|---|---|---|---|
    /// | `graphql-cache` | POST to `endpoint` | CacheFirst | 50 | 24 h |
    /// | `static-resources` | `.js`, `.css`, `.html` | StaleWhileRevalidate | 50 | 7 d |
    /// | `images` | `.png`, `.gif`, `.jpg`, `.jpeg`, `.svg`, `.ico` | CacheFirst | 60 | 30 d |
    pub fn for_endpoint(endpoint: &str) -> Self {
        const DAY: u64 = 24 * 60 * 60;
        Self::new(DEFAULT_VERSION)
            .route(Route {
                name: "graphql".to_string(),
                matcher: RouteMatcher {
                    method: Some(Method::POST),
                    pattern: UrlPattern::Contains(endpoint.to_string()),
                },
                strategy: CacheStrategy::CacheFirst,
                partition: PartitionConfig::new("graphql-cache", 50, Duration::from_secs(DAY)),
                kind: RouteKind::GraphQl {
                    key_strategy: KeyStrategy::default(),
                },
            })
            .route(Route {
                name: "static".to_string(),
                matcher: RouteMatcher {
                    method: Some(Method::GET),
                    pattern: UrlPattern::Regex(STATIC_ASSETS.clone()),
                },
                strategy: CacheStrategy::StaleWhileRevalidate,
                partition: PartitionConfig::new(
                    "static-resources",
                    50,
                    Duration::from_secs(7 * DAY),
                ),
                kind: RouteKind::Asset,
            })
            .route(Route {
                name: "images".to_string(),
                matcher: RouteMatcher {
                    method: Some(Method::GET),
                    pattern: UrlPattern::Regex(IMAGES.clone()),
                },
                strategy: CacheStrategy::CacheFirst,
                partition: PartitionConfig::new("images", 60, Duration::from_secs(30 * DAY)),
                kind: RouteKind::Asset,
            })
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn skip_waiting(mut self, skip_waiting: bool) -> Self {
        self.skip_waiting = skip_waiting;
        self
    }

    /// Strategy for every GraphQL route.
    pub fn graphql_strategy(mut self, strategy: CacheStrategy) -> Self {
        for route in &mut self.routes {
            if matches!(route.kind, RouteKind::GraphQl { .. }) {
                route.strategy = strategy;
            }
        }
        self
    }

    /// Key derivation for every GraphQL route.
    pub fn key_strategy(mut self, key_strategy: KeyStrategy) -> Self {
        for route in &mut self.routes {
            if let RouteKind::GraphQl { key_strategy: ks } = &mut route.kind {
                *ks = key_strategy;
            }
        }
        self
    }

    /// Override the limits of the partition with base name `name`.
    pub fn partition_limits(mut self, name: &str, max_entries: usize, max_age: Duration) -> Self {
        for route in &mut self.routes {
            if route.partition.name == name {
                route.partition.max_entries = max_entries;
                route.partition.max_age = max_age;
            }
        }
        self
    }

    /// Partition names for the current version, in route order.
    pub fn partition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for route in &self.routes {
            let name = route.partition.versioned_name(&self.version);
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// First route matching `request`.
    pub fn route_for(&self, request: &InterceptedRequest) -> Option<&Route> {
        self.routes.iter().find(|route| route.matcher.matches(request))
    }
}
