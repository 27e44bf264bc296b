//! Telemetry metric name constants.
//!
//! Centralised metric names for muninn operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `muninn_`. Counters end in `_total`.
//!
//! # Common labels
//!
//! - `partition`: persistent cache partition (e.g. "graphql-cache-v1")
//! - `status`: "ok", "error" or "offline"

/// Fetch functions executed by the query store.
///
/// Labels: `status` ("ok" | "error" | "offline").
pub const QUERY_FETCHES_TOTAL: &str = "muninn_query_fetches_total";

/// Fetch calls that joined an in-flight fetch for the same key.
pub const QUERY_FETCHES_DEDUPED_TOTAL: &str = "muninn_query_fetches_deduped_total";

/// Fetch calls answered from in-memory data because the client is offline.
pub const QUERY_OFFLINE_SERVED_TOTAL: &str = "muninn_query_offline_served_total";

/// Persistent cache hits.
///
/// Labels: `partition`.
pub const HTTP_CACHE_HITS_TOTAL: &str = "muninn_http_cache_hits_total";

/// Persistent cache misses.
///
/// Labels: `partition`.
pub const HTTP_CACHE_MISSES_TOTAL: &str = "muninn_http_cache_misses_total";

/// Responses written to the persistent cache.
///
/// Labels: `partition`.
pub const HTTP_CACHE_STORES_TOTAL: &str = "muninn_http_cache_stores_total";

/// Entries evicted by count or age.
///
/// Labels: `partition`, `reason` ("count" | "age").
pub const HTTP_CACHE_EVICTIONS_TOTAL: &str = "muninn_http_cache_evictions_total";

/// Synthesized offline envelopes returned to callers.
///
/// Labels: `partition`.
pub const HTTP_OFFLINE_ENVELOPES_TOTAL: &str = "muninn_http_offline_envelopes_total";

/// Requests forwarded without any cache involvement (mutations, unmatched).
pub const HTTP_BYPASS_TOTAL: &str = "muninn_http_bypass_total";
