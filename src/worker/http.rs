//! Request and response values passed through the interceptor.

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::Value;

use crate::error::OFFLINE_NO_DATA_MESSAGE;

/// Response header reporting how the interceptor answered.
pub const CACHE_STATUS_HEADER: &str = "x-muninn-cache";

/// Value of [`CACHE_STATUS_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the cache without touching the network.
    Hit,
    /// Fetched from the network.
    Miss,
    /// Served from the cache while a background refresh runs.
    Stale,
    /// Matched a cache route but was forwarded without cache access.
    Bypass,
    /// Synthesized offline envelope or gateway error.
    Offline,
    /// No route matched, or the interceptor is not active yet.
    Passthrough,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Stale => "stale",
            CacheStatus::Bypass => "bypass",
            CacheStatus::Offline => "offline",
            CacheStatus::Passthrough => "passthrough",
        }
    }
}

/// An outgoing request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    /// Absolute URL of the upstream resource.
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl InterceptedRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// POST with a JSON body.
    pub fn post_json(url: impl Into<String>, body: &Value) -> Self {
        let mut request = Self::new(Method::POST, url);
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        request.body = body.to_string().into_bytes();
        request
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// URL without query string or fragment.
    pub fn path_part(&self) -> &str {
        let end = self.url.find(['?', '#']).unwrap_or(self.url.len());
        &self.url[..end]
    }
}

/// The answer handed back for an [`InterceptedRequest`].
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl InterceptedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// JSON response with `Content-Type: application/json`.
    pub fn json(status: StatusCode, body: &Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self::new(status, headers, body.to_string().into_bytes())
    }

    /// The synthesized GraphQL envelope returned when neither the network nor
    /// the cache can answer.
    pub fn offline_envelope() -> Self {
        Self::json(
            StatusCode::OK,
            &serde_json::json!({
                "data": null,
                "errors": [{"message": OFFLINE_NO_DATA_MESSAGE}],
            }),
        )
        .with_cache_status(CacheStatus::Offline)
    }

    /// 502 with a JSON error body, for upstream failures outside GraphQL routes.
    pub fn bad_gateway(message: &str) -> Self {
        Self::json(
            StatusCode::BAD_GATEWAY,
            &serde_json::json!({"error": message}),
        )
    }

    pub fn with_cache_status(mut self, status: CacheStatus) -> Self {
        self.headers.insert(
            CACHE_STATUS_HEADER,
            HeaderValue::from_static(status.as_str()),
        );
        self
    }

    pub fn cache_status(&self) -> Option<&str> {
        self.headers
            .get(CACHE_STATUS_HEADER)
            .and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Decode the body as JSON.
    pub fn json_body(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_envelope_shape() {
        let response = InterceptedResponse::offline_envelope();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.cache_status(), Some("offline"));
        assert_eq!(response.content_type(), Some("application/json"));
        let body = response.json_body().unwrap();
        assert!(body["data"].is_null());
        assert_eq!(
            body["errors"][0]["message"],
            "You are offline. No cached data available."
        );
    }

    #[test]
    fn path_part_strips_query_and_fragment() {
        let request = InterceptedRequest::get("http://x/app.js?v=3#top");
        assert_eq!(request.path_part(), "http://x/app.js");
        let request = InterceptedRequest::get("http://x/logo.png");
        assert_eq!(request.path_part(), "http://x/logo.png");
    }

    #[test]
    fn cache_status_header_replaced() {
        let response = InterceptedResponse::bad_gateway("down")
            .with_cache_status(CacheStatus::Miss)
            .with_cache_status(CacheStatus::Passthrough);
        assert_eq!(response.cache_status(), Some("passthrough"));
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    }
}
