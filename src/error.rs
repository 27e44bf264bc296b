//! Muninn error types

use std::time::Duration;

/// Message carried by the offline envelope and by [`MuninnError::OfflineNoData`].
pub const OFFLINE_NO_DATA_MESSAGE: &str = "You are offline. No cached data available.";

/// Muninn error types
#[derive(Debug, thiserror::Error)]
pub enum MuninnError {
    // Transport errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The response carried a GraphQL `errors` array.
    ///
    /// Display joins every message with a newline.
    #[error("{}", .messages.join("\n"))]
    GraphQl { messages: Vec<String> },

    #[error("empty response: no data in GraphQL envelope")]
    EmptyResponse,

    #[error("fetch function panicked")]
    FetchPanicked,

    // Offline conditions
    #[error("You are offline. No cached data available.")]
    OfflineNoData,

    /// Network unavailable, the entry still holds its last good data.
    #[error("Offline - Using cached data")]
    OfflineWithCachedData,

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A query key was reused with a different value type.
    #[error("query key {key} holds a different value type")]
    TypeMismatch { key: String },

    // Cache storage errors
    #[error("cache error: {0}")]
    Cache(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl MuninnError {
    /// Whether this error represents the offline condition rather than a
    /// failure of the request itself.
    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            MuninnError::OfflineNoData | MuninnError::OfflineWithCachedData
        )
    }

    /// Whether a later retry of the same request could succeed.
    ///
    /// Network failures, timeouts and 5xx/429 responses are transient;
    /// GraphQL application errors and malformed data are not.
    pub fn is_transient(&self) -> bool {
        match self {
            MuninnError::Http(_) | MuninnError::Timeout(_) => true,
            MuninnError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => self.is_offline(),
        }
    }
}

impl From<reqwest::Error> for MuninnError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            MuninnError::InvalidRequest(err.to_string())
        } else {
            MuninnError::Http(err.to_string())
        }
    }
}

/// Result type alias for Muninn operations
pub type Result<T> = std::result::Result<T, MuninnError>;
