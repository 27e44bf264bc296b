//! Muninn - offline-first caching core for GraphQL clients
//!
//! Two cooperating cache layers for a client talking to a single GraphQL
//! endpoint:
//!
//! - [`QueryStore`]: an in-memory, subscription-based query synchronizer.
//!   Fetches are deduplicated per key, entries go stale after a configurable
//!   time, and subscribers are notified after every state change. While
//!   offline, existing data is kept and flagged instead of refetched.
//! - [`worker::Interceptor`]: a persistent, request-level HTTP response
//!   cache. It intercepts POSTs to the GraphQL endpoint (and static assets),
//!   derives a stable key from query + variables, and answers from versioned
//!   partitions when the network is slow or gone. The `muninnd` daemon
//!   (feature `server`) runs it as a local reverse proxy.
//!
//! # Query Example
//!
//! ```rust,no_run
//! use muninn::{GraphQlClient, QueryKey, QueryOptions, QueryStore};
//! use serde_json::{Value, json};
//!
//! #[tokio::main]
//! async fn main() -> muninn::Result<()> {
//!     let client = GraphQlClient::new("http://127.0.0.1:9750/graphql")?;
//!     let store = QueryStore::new();
//!
//!     let variables = json!({"limit": 3, "offset": 0});
//!     let key = QueryKey::new("Landpads", &variables)?;
//!     let mut landpads = store.use_query(
//!         key,
//!         move || {
//!             let client = client.clone();
//!             let variables = variables.clone();
//!             async move {
//!                 client
//!                     .request::<Value, _>(
//!                         "query Landpads($limit: Int, $offset: Int) { landpads(limit: $limit, offset: $offset) { id } }",
//!                         variables,
//!                     )
//!                     .await
//!             }
//!         },
//!         QueryOptions::new(),
//!     )?;
//!
//!     while landpads.snapshot().data.is_none() && landpads.changed().await {}
//!     println!("{:?}", landpads.data());
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod connectivity;
pub mod error;
pub mod key;
pub mod query;
#[cfg(feature = "server")]
pub mod server;
mod subscription;
pub mod telemetry;
pub mod transport;
pub mod version;
pub mod worker;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use connectivity::{AlwaysOnline, ConnectivityProbe, ManualConnectivity};
pub use error::{MuninnError, Result};
pub use key::{KeyStrategy, QueryKey, derive_request_key};
pub use query::{
    CacheEntry, QueryHandle, QueryOptions, QueryResult, QuerySnapshot, QueryStore,
    QueryStoreBuilder,
};
pub use subscription::Subscription;
pub use transport::{GraphQlClient, GraphQlError, GraphQlRequest, GraphQlResponse};
pub use version::{PKG_VERSION, version_string};
