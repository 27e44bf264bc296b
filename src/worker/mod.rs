//! Persistent HTTP response cache.
//!
//! The [`Interceptor`] plays the part of a service worker: it is installed
//! and activated for a cache version, then sees every outgoing request.
//! Requests matching a [`Route`] are answered according to the route's
//! [`CacheStrategy`] from a versioned [`Partition`] of a [`CacheStorage`];
//! everything else is forwarded to the [`Upstream`] untouched.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use muninn::clock::SystemClock;
//! use muninn::worker::{
//!     CacheStorage, InterceptedRequest, Interceptor, InterceptorConfig, ReqwestUpstream,
//! };
//!
//! # async fn demo() -> muninn::Result<()> {
//! let endpoint = "http://127.0.0.1:4000/graphql";
//! let storage = CacheStorage::open("/var/cache/muninn", Arc::new(SystemClock))?;
//! let interceptor = Interceptor::new(
//!     InterceptorConfig::for_endpoint(endpoint),
//!     Arc::new(storage),
//!     Arc::new(ReqwestUpstream::new(Duration::from_secs(30))?),
//! );
//! interceptor.on_install();
//!
//! let request = InterceptedRequest::post_json(
//!     endpoint,
//!     &serde_json::json!({"query": "query Launches { launches { id } }"}),
//! );
//! let response = interceptor.on_intercept(request).await;
//! println!("{} ({:?})", response.status, response.cache_status());
//! # Ok(())
//! # }
//! ```

mod http;
mod interceptor;
mod storage;
mod strategy;
mod upstream;

pub use http::{CACHE_STATUS_HEADER, CacheStatus, InterceptedRequest, InterceptedResponse};
pub use interceptor::{Interceptor, Phase};
pub use reqwest::header::HeaderMap;
pub use reqwest::{Method, StatusCode};
pub use storage::{CacheRecord, CacheStorage, Partition, StoredBody};
pub use strategy::{
    CacheStrategy, DEFAULT_NETWORK_TIMEOUT, DEFAULT_VERSION, InterceptorConfig, PartitionConfig,
    Route, RouteKind, RouteMatcher, StrategyKind, UrlPattern,
};
pub use upstream::{ReqwestUpstream, Upstream};
