//! `useQuery`-style binding for presentation code.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::entry::{CacheEntry, Fetcher, QuerySnapshot};
use super::store::QueryStore;
use crate::key::QueryKey;
use crate::subscription::Subscription;
use crate::Result;

/// What a handle exposes to its consumer on every read.
pub type QueryResult<T> = QuerySnapshot<T>;

/// Per-handle options for [`QueryStore::use_query()`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Poll period. Each tick refetches if online, stale and idle.
    pub refetch_interval: Option<Duration>,
    /// Stale time for a newly created entry (store default if `None`).
    pub stale_time: Option<Duration>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }
}

/// A live subscription to one query key.
///
/// Mounting registers the fetch function for the key, subscribes, and
/// starts a fetch if the entry needs one. Dropping the handle unsubscribes
/// and stops its refetch timer. Must be created inside a Tokio runtime.
pub struct QueryHandle<T> {
    store: QueryStore,
    entry: Arc<CacheEntry<T>>,
    fetcher: Fetcher<T>,
    changes: watch::Receiver<u64>,
    _subscription: Subscription,
    interval: Option<JoinHandle<()>>,
}

impl<T> QueryHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn mount(
        store: QueryStore,
        key: QueryKey,
        fetcher: Fetcher<T>,
        options: QueryOptions,
    ) -> Result<Self> {
        let stale_time = options
            .stale_time
            .unwrap_or_else(|| store.default_stale_time());
        let entry = store.get_or_create::<T>(&key, stale_time)?;
        entry.set_fetcher(fetcher.clone());

        let (tx, changes) = watch::channel(0u64);
        let subscription = entry.subscribe(Arc::new(move || {
            tx.send_modify(|version| *version = version.wrapping_add(1));
        }));

        let needs_fetch = !entry.has_data() || (store.is_online() && entry.is_stale(store.now()));
        if needs_fetch && !entry.is_loading() {
            debug!(%key, "initial fetch on mount");
            let initial = fetcher.clone();
            // Spawned inside fetch_entry; nothing to await here.
            drop(store.fetch_entry(entry.clone(), move || initial()));
        }

        let interval = options
            .refetch_interval
            .map(|period| spawn_interval(store.clone(), entry.clone(), fetcher.clone(), period));

        Ok(Self {
            store,
            entry,
            fetcher,
            changes,
            _subscription: subscription,
            interval,
        })
    }

    pub fn key(&self) -> &QueryKey {
        self.entry.key()
    }

    /// Current state of the entry.
    pub fn snapshot(&self) -> QueryResult<T> {
        self.entry.snapshot(self.store.now())
    }

    pub fn data(&self) -> Option<T> {
        self.entry.data()
    }

    /// Fetch now, joining a fetch already in flight.
    pub async fn refetch(&self) {
        let fetcher = self.fetcher.clone();
        self.store
            .fetch_entry(self.entry.clone(), move || fetcher())
            .await;
    }

    /// Mark stale and refetch. No-op while offline.
    pub async fn invalidate(&self) {
        self.store.invalidate(self.entry.key()).await;
    }

    pub fn set_data(&self, data: T) {
        self.store.set_entry_data(&self.entry, data);
    }

    /// Wait for the next change notification.
    ///
    /// Returns `false` if no further notifications can arrive.
    pub async fn changed(&mut self) -> bool {
        self.changes.changed().await.is_ok()
    }
}

impl<T> Drop for QueryHandle<T> {
    fn drop(&mut self) {
        if let Some(interval) = self.interval.take() {
            interval.abort();
        }
    }
}

fn spawn_interval<T>(
    store: QueryStore,
    entry: Arc<CacheEntry<T>>,
    fetcher: Fetcher<T>,
    period: Duration,
) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if entry.subscriber_count() == 0 {
                debug!(key = %entry.key(), "no subscribers left, stopping refetch interval");
                return;
            }
            if store.is_online() && entry.is_stale(store.now()) && !entry.is_loading() {
                let fetcher = fetcher.clone();
                drop(store.fetch_entry(entry.clone(), move || fetcher()));
            }
        }
    })
}
