//! In-memory query synchronizer.
//!
//! A [`QueryStore`] maps [`QueryKey`](crate::QueryKey)s to [`CacheEntry`]
//! values. Consumers subscribe to keys and are notified after every state
//! change; fetches are single-flight per key and follow the store's
//! staleness and offline policy.

mod entry;
mod handle;
mod store;

pub use entry::{CacheEntry, ChangeCallback, QuerySnapshot};
pub use handle::{QueryHandle, QueryOptions, QueryResult};
pub use store::{DEFAULT_STALE_TIME, QueryStore, QueryStoreBuilder};
