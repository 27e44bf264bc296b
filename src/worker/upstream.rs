//! Network seam of the interceptor.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{CONNECTION, CONTENT_LENGTH, HOST, HeaderMap, TRANSFER_ENCODING};
use tracing::debug;

use super::http::{InterceptedRequest, InterceptedResponse};
use crate::{MuninnError, Result};

/// Sends intercepted requests to the real network.
///
/// Errors mean the request never produced a response (connection refused,
/// DNS failure, timeout). Any HTTP status, including 5xx, is `Ok`.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: InterceptedRequest) -> Result<InterceptedResponse>;
}

/// [`Upstream`] backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestUpstream {
    client: Client,
}

impl ReqwestUpstream {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MuninnError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// Drop hop-by-hop and framing headers; the client sets its own.
fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in [HOST, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING] {
        out.remove(name);
    }
    out
}

#[async_trait]
impl Upstream for ReqwestUpstream {
    async fn send(&self, request: InterceptedRequest) -> Result<InterceptedResponse> {
        debug!(method = %request.method, url = %request.url, "forwarding upstream");
        let response = self
            .client
            .request(request.method, &request.url)
            .headers(forwardable(&request.headers))
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let headers = forwardable(response.headers());
        let body = response.bytes().await?;
        Ok(InterceptedResponse::new(status, headers, body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{CONTENT_TYPE, HeaderValue};

    #[test]
    fn forwardable_strips_framing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("proxy.local"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let out = forwardable(&headers);
        assert!(out.get(HOST).is_none());
        assert!(out.get(CONTENT_LENGTH).is_none());
        assert_eq!(out.get(CONTENT_TYPE).unwrap(), "application/json");
    }
}
