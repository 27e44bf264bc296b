//! axum reverse proxy routing every request through an [`Interceptor`].

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::VIA;
use axum::http::{HeaderMap, HeaderValue, Method, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde_json::json;

use crate::worker::{InterceptedRequest, Interceptor, Phase};

/// Path of the daemon's own health endpoint. Not forwarded.
pub const HEALTH_PATH: &str = "/_muninn/health";

struct ProxyState {
    interceptor: Arc<Interceptor>,
    upstream_base: String,
}

/// Router that rewrites every request onto `upstream_base` and answers it
/// with [`Interceptor::on_intercept()`].
///
/// `upstream_base` is an origin such as `http://127.0.0.1:4000`; the
/// incoming path and query are appended unchanged.
pub fn router(interceptor: Arc<Interceptor>, upstream_base: impl Into<String>) -> Router {
    let upstream_base = upstream_base.into().trim_end_matches('/').to_string();
    let state = Arc::new(ProxyState {
        interceptor,
        upstream_base,
    });
    Router::new()
        .route(HEALTH_PATH, get(health))
        .fallback(proxy)
        .with_state(state)
}

async fn health(State(state): State<Arc<ProxyState>>) -> Json<serde_json::Value> {
    let phase = match state.interceptor.phase() {
        Phase::New => "new",
        Phase::Installed => "installed",
        Phase::Active => "active",
    };
    Json(json!({
        "status": "ok",
        "version": crate::version_string(),
        "cache_version": state.interceptor.config().version,
        "phase": phase,
    }))
}

async fn proxy(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let request = InterceptedRequest {
        method,
        url: format!("{}{path}", state.upstream_base),
        headers,
        body: body.to_vec(),
    };
    let intercepted = state.interceptor.on_intercept(request).await;

    let mut response = Body::from(intercepted.body).into_response();
    *response.status_mut() = intercepted.status;
    *response.headers_mut() = intercepted.headers;
    if let Ok(via) = HeaderValue::from_str(&crate::version::via_header()) {
        response.headers_mut().append(VIA, via);
    }
    response
}
