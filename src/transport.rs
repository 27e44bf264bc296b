//! GraphQL-over-HTTP transport.
//!
//! A thin POST sender. It performs no caching of its own; when pointed at a
//! `muninnd` proxy, its requests transit the persistent cache layer. Its
//! success/failure signal is what the query store records on entries.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{MuninnError, Result};

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A GraphQL operation as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQlRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl GraphQlRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }

    pub fn variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Decode a request body. Fails on anything that isn't `{query, ...}`.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Location of a GraphQL error in the query text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLocation {
    pub line: u32,
    pub column: u32,
}

/// One entry of a GraphQL `errors` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<ErrorLocation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
}

impl GraphQlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: None,
            path: None,
        }
    }
}

/// The `{data, errors}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlResponse<T> {
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphQlError>>,
}

impl<T> GraphQlResponse<T> {
    /// Convert into the payload, turning an `errors` array into a failure.
    ///
    /// Any non-empty `errors` array wins over `data`, even when partial data
    /// is present.
    pub fn into_result(self) -> Result<T> {
        if let Some(errors) = self.errors.filter(|errors| !errors.is_empty()) {
            return Err(MuninnError::GraphQl {
                messages: errors.into_iter().map(|e| e.message).collect(),
            });
        }
        self.data.ok_or(MuninnError::EmptyResponse)
    }
}

/// HTTP client for a single GraphQL endpoint.
///
/// ```rust,no_run
/// # use muninn::GraphQlClient;
/// # use serde_json::json;
/// # async fn demo() -> muninn::Result<()> {
/// let client = GraphQlClient::new("http://127.0.0.1:9750/graphql")?;
/// let data: serde_json::Value = client
///     .request("query Landpads($limit: Int) { landpads(limit: $limit) { id } }",
///              json!({"limit": 3}))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GraphQlClient {
    http: Client,
    endpoint: String,
    timeout: Option<Duration>,
}

impl GraphQlClient {
    /// Create a client with the default timeout.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| MuninnError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_http_client(endpoint, http))
    }

    /// Create a client sharing an existing `reqwest::Client`.
    pub fn with_http_client(endpoint: impl Into<String>, http: Client) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            timeout: None,
        }
    }

    /// Per-request timeout, overriding the client's own.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST a request and decode the raw envelope.
    ///
    /// Only transport failures and non-success statuses are errors here; a
    /// GraphQL `errors` array is returned as part of the envelope.
    pub async fn post(&self, request: &GraphQlRequest) -> Result<GraphQlResponse<Value>> {
        debug!(endpoint = %self.endpoint, query = %request.query.trim(), "posting GraphQL request");
        let mut builder = self.http.post(&self.endpoint).json(request);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                MuninnError::Timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            } else {
                MuninnError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(MuninnError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| MuninnError::Http(e.to_string()))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Run an operation and decode its `data` into `T`.
    ///
    /// GraphQL `errors` become [`MuninnError::GraphQl`] with every message
    /// joined by a newline.
    pub async fn request<T, V>(&self, query: &str, variables: V) -> Result<T>
    where
        T: DeserializeOwned,
        V: Serialize,
    {
        let variables = serde_json::to_value(variables)?;
        let request = GraphQlRequest {
            query: query.to_string(),
            variables: (!variables.is_null()).then_some(variables),
            operation_name: None,
        };
        let data = self.post(&request).await?.into_result()?;
        Ok(serde_json::from_value(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_camel_case_and_skips_none() {
        let req = GraphQlRequest::new("query A { a }").operation_name("A");
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value, json!({"query": "query A { a }", "operationName": "A"}));
    }

    #[test]
    fn request_decodes_without_variables() {
        let req = GraphQlRequest::from_slice(br#"{"query":"{ a }"}"#).unwrap();
        assert_eq!(req.query, "{ a }");
        assert!(req.variables.is_none());
    }

    #[test]
    fn request_decode_rejects_missing_query() {
        assert!(GraphQlRequest::from_slice(br#"{"variables":{}}"#).is_err());
        assert!(GraphQlRequest::from_slice(b"not json").is_err());
    }

    #[test]
    fn errors_array_joins_messages() {
        let response: GraphQlResponse<Value> = serde_json::from_value(json!({
            "data": null,
            "errors": [{"message": "first"}, {"message": "second", "path": ["a", 0]}]
        }))
        .unwrap();
        let err = response.into_result().unwrap_err();
        assert_eq!(err.to_string(), "first\nsecond");
    }

    #[test]
    fn empty_errors_array_is_success() {
        let response: GraphQlResponse<Value> =
            serde_json::from_value(json!({"data": {"a": 1}, "errors": []})).unwrap();
        assert_eq!(response.into_result().unwrap(), json!({"a": 1}));
    }

    #[test]
    fn missing_data_is_empty_response() {
        let response: GraphQlResponse<Value> = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(
            response.into_result(),
            Err(MuninnError::EmptyResponse)
        ));
    }
}
