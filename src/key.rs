//! Cache key derivation for GraphQL operations.
//!
//! Both cache layers key on a canonical JSON rendering of the operation:
//! object keys are sorted at every depth, so `{limit, offset}` and
//! `{offset, limit}` produce the same key. Array order is preserved since
//! it is meaningful to GraphQL.
//!
//! The in-memory layer keys on operation name + variables ([`QueryKey`]).
//! The persistent layer chooses via [`KeyStrategy`]; the default matches the
//! in-memory layer so that both agree on which requests are "the same".

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;
use crate::transport::GraphQlRequest;

/// Operation name used when the query text carries none.
pub const ANONYMOUS_OPERATION: &str = "anonymous";

static OPERATION_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*query\s+([_A-Za-z][_0-9A-Za-z]*)").expect("operation name pattern is valid")
});

/// Serialize a JSON value with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a str cannot fail.
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Name from a leading `query <Name>` in the operation text.
pub fn operation_name(query: &str) -> Option<&str> {
    OPERATION_NAME
        .captures(query)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Operation name for keying: the explicit `operationName` field, then the
/// query text, then [`ANONYMOUS_OPERATION`].
pub fn resolve_operation_name(request: &GraphQlRequest) -> &str {
    named_operation(request).unwrap_or(ANONYMOUS_OPERATION)
}

fn named_operation(request: &GraphQlRequest) -> Option<&str> {
    request
        .operation_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .or_else(|| operation_name(&request.query))
}

/// Whether the operation text is a mutation.
pub fn is_mutation(query: &str) -> bool {
    query.trim().starts_with("mutation")
}

/// Collapse runs of whitespace so formatting changes don't split the cache.
fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Key of an entry in the in-memory query store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(String);

impl QueryKey {
    /// Key for `operation_name` with the given variables.
    ///
    /// ```rust
    /// # use muninn::QueryKey;
    /// # use serde_json::json;
    /// let a = QueryKey::new("Landpads", &json!({"limit": 3, "offset": 0})).unwrap();
    /// let b = QueryKey::new("Landpads", &json!({"offset": 0, "limit": 3})).unwrap();
    /// assert_eq!(a, b);
    /// ```
    pub fn new(operation_name: &str, variables: &impl Serialize) -> Result<Self> {
        let variables = serde_json::to_value(variables)?;
        Ok(Self::from_parts(operation_name, &variables))
    }

    /// Key for an operation without variables.
    pub fn operation(operation_name: &str) -> Self {
        Self::from_parts(operation_name, &Value::Null)
    }

    /// Key derived from a full request, as the transport would send it.
    ///
    /// Same key as [`derive_request_key()`] with the default strategy.
    pub fn from_request(request: &GraphQlRequest) -> Self {
        Self(derive_request_key(KeyStrategy::OperationName, request))
    }

    fn from_parts(operation_name: &str, variables: &Value) -> Self {
        let mut doc = serde_json::Map::new();
        doc.insert(
            "operationName".to_string(),
            Value::String(operation_name.to_string()),
        );
        doc.insert("variables".to_string(), variables.clone());
        Self(canonical_json(&Value::Object(doc)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for QueryKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// How the persistent layer identifies a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Operation name + variables. Requests for the same named operation
    /// with different field selections share an entry. Unnamed operations
    /// fall back to the query text.
    #[default]
    OperationName,
    /// Whitespace-normalized query text + variables.
    FullQuery,
}

/// Derive the persistent cache key for a GraphQL request.
pub fn derive_request_key(strategy: KeyStrategy, request: &GraphQlRequest) -> String {
    let variables = request.variables.clone().unwrap_or(Value::Null);
    let mut doc = serde_json::Map::new();
    match (strategy, named_operation(request)) {
        (KeyStrategy::OperationName, Some(name)) => {
            doc.insert(
                "operationName".to_string(),
                Value::String(name.to_string()),
            );
        }
        _ => {
            doc.insert(
                "query".to_string(),
                Value::String(normalize_query(&request.query)),
            );
        }
    }
    doc.insert("variables".to_string(), variables);
    canonical_json(&Value::Object(doc))
}
