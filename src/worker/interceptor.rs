//! Request interceptor: the lifecycle and per-request cache strategies.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::http::{CACHE_STATUS_HEADER, CacheStatus, InterceptedRequest, InterceptedResponse};
use super::storage::{CacheRecord, CacheStorage, Partition};
use super::strategy::{CacheStrategy, InterceptorConfig, Route, RouteKind};
use super::upstream::Upstream;
use crate::key::{derive_request_key, is_mutation, resolve_operation_name};
use crate::subscription::lock;
use crate::telemetry;
use crate::transport::GraphQlRequest;

/// Lifecycle phase of an [`Interceptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Constructed; requests pass through.
    New,
    /// Partitions opened, waiting for activation; requests pass through.
    Installed,
    /// Serving from the cache.
    Active,
}

/// Persistent HTTP response cache sitting between a client and the network.
///
/// Call [`on_install()`](Self::on_install) (and [`on_activate()`](Self::on_activate)
/// unless `skip_waiting` is set), then route every outgoing request through
/// [`on_intercept()`](Self::on_intercept).
pub struct Interceptor {
    config: InterceptorConfig,
    storage: Arc<CacheStorage>,
    upstream: Arc<dyn Upstream>,
    phase: Mutex<Phase>,
}

impl Interceptor {
    pub fn new(
        config: InterceptorConfig,
        storage: Arc<CacheStorage>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            config,
            storage,
            upstream,
            phase: Mutex::new(Phase::New),
        }
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    /// Open every configured partition for the current version.
    ///
    /// With `skip_waiting` (the default) this activates right away.
    pub fn on_install(&self) {
        for route in &self.config.routes {
            let partition = &route.partition;
            self.storage.open_partition(
                &partition.versioned_name(&self.config.version),
                partition.max_entries,
                partition.max_age,
            );
        }
        info!(
            version = %self.config.version,
            partitions = ?self.config.partition_names(),
            "cache installed"
        );
        {
            let mut phase = lock(&self.phase);
            if *phase == Phase::New {
                *phase = Phase::Installed;
            }
        }
        if self.config.skip_waiting {
            self.on_activate();
        }
    }

    /// Delete every partition that doesn't belong to the current version,
    /// then start serving. Returns the deleted partition names.
    pub fn on_activate(&self) -> Vec<String> {
        let current = self.config.partition_names();
        let stale: Vec<String> = self
            .storage
            .keys()
            .into_iter()
            .filter(|name| !current.contains(name))
            .collect();
        for name in &stale {
            info!(partition = %name, "deleting cache partition from another version");
            self.storage.delete(name);
        }
        *lock(&self.phase) = Phase::Active;
        info!(version = %self.config.version, "cache active");
        stale
    }

    /// Purge expired records from every partition.
    pub fn sweep(&self) -> usize {
        let removed = self.storage.sweep();
        if removed > 0 {
            debug!(removed, "swept expired cache records");
        }
        removed
    }

    /// Answer a request from the cache, the network, or a synthesized
    /// fallback. Never fails.
    pub async fn on_intercept(&self, request: InterceptedRequest) -> InterceptedResponse {
        if self.phase() != Phase::Active {
            return self.forward(request, CacheStatus::Passthrough).await;
        }
        let Some(route) = self.config.route_for(&request) else {
            return self.forward(request, CacheStatus::Passthrough).await;
        };
        match route.kind {
            RouteKind::GraphQl { key_strategy } => {
                let operation = match GraphQlRequest::from_slice(&request.body) {
                    Ok(operation) => operation,
                    Err(e) => {
                        debug!(url = %request.url, error = %e, "undecodable GraphQL body, forwarding");
                        metrics::counter!(telemetry::HTTP_BYPASS_TOTAL).increment(1);
                        return self.forward(request, CacheStatus::Bypass).await;
                    }
                };
                if is_mutation(&operation.query) {
                    debug!(
                        operation = resolve_operation_name(&operation),
                        "mutation, bypassing cache"
                    );
                    metrics::counter!(telemetry::HTTP_BYPASS_TOTAL).increment(1);
                    return match self.upstream.send(request).await {
                        Ok(response) => response.with_cache_status(CacheStatus::Bypass),
                        Err(e) => {
                            warn!(error = %e, "mutation failed upstream");
                            self.unavailable(route, &e.to_string())
                        }
                    };
                }
                let key = derive_request_key(key_strategy, &operation);
                self.serve(route, key, request).await
            }
            RouteKind::Asset => {
                let key = format!("{} {}", request.method, request.url);
                self.serve(route, key, request).await
            }
        }
    }

    async fn forward(&self, request: InterceptedRequest, status: CacheStatus) -> InterceptedResponse {
        match self.upstream.send(request).await {
            Ok(response) => response.with_cache_status(status),
            Err(e) => {
                warn!(error = %e, "upstream request failed");
                InterceptedResponse::bad_gateway(&e.to_string()).with_cache_status(status)
            }
        }
    }

    fn partition_for(&self, route: &Route) -> Arc<Partition> {
        self.storage.open_partition(
            &route.partition.versioned_name(&self.config.version),
            route.partition.max_entries,
            route.partition.max_age,
        )
    }

    async fn serve(&self, route: &Route, key: String, request: InterceptedRequest) -> InterceptedResponse {
        let partition = self.partition_for(route);
        match route.strategy {
            CacheStrategy::CacheFirst => {
                if let Some(record) = lookup(&partition, &key) {
                    return record.to_response().with_cache_status(CacheStatus::Hit);
                }
                self.fetch_and_store(route, &partition, &key, request).await
            }
            CacheStrategy::NetworkFirst { timeout } => {
                let upstream = self.upstream.clone();
                let background = partition.clone();
                let kind = route.kind;
                let task_key = key.clone();
                // Not aborted on timeout: a late response still lands in the cache.
                let task = tokio::spawn(async move {
                    let response = upstream.send(request).await?;
                    store_if_cacheable(&background, kind, &task_key, &response);
                    Ok::<_, crate::MuninnError>(response)
                });
                let failure = match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(Ok(response))) => return response.with_cache_status(CacheStatus::Miss),
                    Ok(Ok(Err(e))) => e.to_string(),
                    Ok(Err(e)) => format!("upstream task failed: {e}"),
                    Err(_) => format!("no upstream response within {timeout:?}"),
                };
                debug!(partition = partition.name(), %failure, "network-first falling back to cache");
                match lookup(&partition, &key) {
                    Some(record) => record.to_response().with_cache_status(CacheStatus::Hit),
                    None => self.unavailable(route, &failure),
                }
            }
            CacheStrategy::StaleWhileRevalidate => {
                let Some(record) = lookup(&partition, &key) else {
                    return self.fetch_and_store(route, &partition, &key, request).await;
                };
                let upstream = self.upstream.clone();
                let background = partition.clone();
                let kind = route.kind;
                tokio::spawn(async move {
                    match upstream.send(request).await {
                        Ok(response) => {
                            store_if_cacheable(&background, kind, &key, &response);
                        }
                        Err(e) => debug!(%key, error = %e, "background revalidation failed"),
                    }
                });
                record.to_response().with_cache_status(CacheStatus::Stale)
            }
        }
    }

    async fn fetch_and_store(
        &self,
        route: &Route,
        partition: &Partition,
        key: &str,
        request: InterceptedRequest,
    ) -> InterceptedResponse {
        match self.upstream.send(request).await {
            Ok(response) => {
                store_if_cacheable(partition, route.kind, key, &response);
                response.with_cache_status(CacheStatus::Miss)
            }
            Err(e) => {
                warn!(partition = partition.name(), error = %e, "upstream failed with no cached response");
                self.unavailable(route, &e.to_string())
            }
        }
    }

    /// Response when neither the network nor the cache can answer.
    fn unavailable(&self, route: &Route, reason: &str) -> InterceptedResponse {
        match route.kind {
            RouteKind::GraphQl { .. } => {
                metrics::counter!(
                    telemetry::HTTP_OFFLINE_ENVELOPES_TOTAL,
                    "partition" => route.partition.versioned_name(&self.config.version)
                )
                .increment(1);
                InterceptedResponse::offline_envelope()
            }
            RouteKind::Asset => {
                InterceptedResponse::bad_gateway(reason).with_cache_status(CacheStatus::Offline)
            }
        }
    }
}

fn lookup(partition: &Partition, key: &str) -> Option<CacheRecord> {
    let record = partition.get(key);
    let name = partition.name().to_string();
    if record.is_some() {
        debug!(partition = %name, %key, "cache hit");
        metrics::counter!(telemetry::HTTP_CACHE_HITS_TOTAL, "partition" => name).increment(1);
    } else {
        debug!(partition = %name, %key, "cache miss");
        metrics::counter!(telemetry::HTTP_CACHE_MISSES_TOTAL, "partition" => name).increment(1);
    }
    record
}

/// Whether an upstream response may be stored for a route of `kind`.
///
/// Only success statuses; GraphQL bodies must be JSON without a non-null
/// `errors` member.
fn is_cacheable(kind: RouteKind, response: &InterceptedResponse) -> bool {
    if !response.status.is_success() {
        return false;
    }
    match kind {
        RouteKind::Asset => true,
        RouteKind::GraphQl { .. } => response
            .json_body()
            .is_some_and(|body| body.get("errors").is_none_or(Value::is_null)),
    }
}

fn store_if_cacheable(partition: &Partition, kind: RouteKind, key: &str, response: &InterceptedResponse) {
    if !is_cacheable(kind, response) {
        debug!(partition = partition.name(), %key, status = %response.status, "response not cacheable");
        return;
    }
    let mut record = CacheRecord::from_response(key, response);
    record
        .headers
        .retain(|(name, _)| !name.eq_ignore_ascii_case(CACHE_STATUS_HEADER));
    if let RouteKind::GraphQl { .. } = kind {
        record.set_header("content-type", "application/json");
        record.set_header(
            "cache-control",
            format!("max-age={}", partition.max_age().as_secs()),
        );
    }
    partition.put(record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyStrategy;
    use reqwest::StatusCode;
    use serde_json::json;

    fn graphql() -> RouteKind {
        RouteKind::GraphQl {
            key_strategy: KeyStrategy::OperationName,
        }
    }

    #[test]
    fn graphql_errors_are_not_cacheable() {
        let ok = InterceptedResponse::json(StatusCode::OK, &json!({"data": {"a": 1}}));
        let null_errors =
            InterceptedResponse::json(StatusCode::OK, &json!({"data": {"a": 1}, "errors": null}));
        let errors = InterceptedResponse::json(
            StatusCode::OK,
            &json!({"data": null, "errors": [{"message": "nope"}]}),
        );
        assert!(is_cacheable(graphql(), &ok));
        assert!(is_cacheable(graphql(), &null_errors));
        assert!(!is_cacheable(graphql(), &errors));
    }

    #[test]
    fn non_success_is_not_cacheable() {
        let response = InterceptedResponse::json(StatusCode::INTERNAL_SERVER_ERROR, &json!({}));
        assert!(!is_cacheable(RouteKind::Asset, &response));
        assert!(!is_cacheable(graphql(), &response));
    }

    #[test]
    fn non_json_graphql_body_is_not_cacheable() {
        let response = InterceptedResponse::new(
            StatusCode::OK,
            reqwest::header::HeaderMap::new(),
            b"<html>".to_vec(),
        );
        assert!(!is_cacheable(graphql(), &response));
        assert!(is_cacheable(RouteKind::Asset, &response));
    }
}
