//! Keyed store of [`CacheEntry`] values with single-flight fetching.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::entry::{CacheEntry, Fetcher, QuerySnapshot};
use crate::clock::{Clock, SystemClock};
use crate::connectivity::{AlwaysOnline, ConnectivityProbe};
use crate::key::QueryKey;
use crate::subscription::{Subscription, lock};
use crate::telemetry;
use crate::{MuninnError, Result};

/// Default freshness window for entries created without an explicit one.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(5 * 60);

/// Type-erased view of an entry, for store-wide passes (reconnect).
trait ErasedEntry: Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn subscriber_count(&self) -> usize;
    fn reset_timestamp(&self);
    /// Start a refetch with the registered fetcher, if there is one.
    fn refetch(self: Arc<Self>, store: &QueryStore) -> Option<BoxFuture<'static, ()>>;
    /// Start a refetch only if the entry is active, stale and idle.
    fn refetch_if_stale(self: Arc<Self>, store: &QueryStore) -> Option<BoxFuture<'static, ()>>;
}

impl<T> ErasedEntry for CacheEntry<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn subscriber_count(&self) -> usize {
        CacheEntry::subscriber_count(self)
    }

    fn reset_timestamp(&self) {
        self.update(|state| state.timestamp = 0);
    }

    fn refetch(self: Arc<Self>, store: &QueryStore) -> Option<BoxFuture<'static, ()>> {
        let fetcher = self.fetcher()?;
        Some(store.fetch_entry(self, move || fetcher()))
    }

    fn refetch_if_stale(self: Arc<Self>, store: &QueryStore) -> Option<BoxFuture<'static, ()>> {
        if CacheEntry::subscriber_count(&self) == 0
            || self.is_loading()
            || !self.is_stale(store.now())
        {
            return None;
        }
        self.refetch(store)
    }
}

struct StoreInner {
    entries: Mutex<HashMap<QueryKey, Arc<dyn ErasedEntry>>>,
    clock: Arc<dyn Clock>,
    connectivity: Arc<dyn ConnectivityProbe>,
    default_stale_time: Duration,
    reconnect: Mutex<Option<Subscription>>,
    /// Runtime for fetches started from connectivity callbacks, which may
    /// fire on threads outside it.
    runtime: OnceLock<Handle>,
}

/// In-memory query synchronizer.
///
/// One store per process or session; clones share the same entries.
/// Entries are created lazily and live as long as the store.
///
/// Fetches are spawned on the current Tokio runtime and always run to
/// completion, even if every caller stops waiting. Refetches triggered by a
/// reconnect run on the runtime given to the builder, else on the one the
/// store was built or first fetched on.
///
/// ```rust
/// # use muninn::{QueryKey, QueryStore};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> muninn::Result<()> {
/// let store = QueryStore::new();
/// let key = QueryKey::operation("Launches");
/// store.fetch(&key, || async { Ok(vec!["FalconSat".to_string()]) }).await?;
/// let snapshot = store.read::<Vec<String>>(&key)?.unwrap();
/// assert_eq!(snapshot.data.unwrap(), vec!["FalconSat"]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct QueryStore {
    inner: Arc<StoreInner>,
}

impl QueryStore {
    /// Store with the system clock, always-online connectivity and the
    /// default stale time.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> QueryStoreBuilder {
        QueryStoreBuilder::new()
    }

    fn from_builder(builder: QueryStoreBuilder) -> Self {
        let store = Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(HashMap::new()),
                clock: builder.clock,
                connectivity: builder.connectivity,
                default_stale_time: builder.default_stale_time,
                reconnect: Mutex::new(None),
                runtime: OnceLock::new(),
            }),
        };
        if let Some(runtime) = builder.runtime.or_else(|| Handle::try_current().ok()) {
            let _ = store.inner.runtime.set(runtime);
        }

        let weak = Arc::downgrade(&store.inner);
        let subscription = store
            .inner
            .connectivity
            .on_change(Arc::new(move |online| {
                if online {
                    on_reconnect(&weak);
                }
            }));
        *lock(&store.inner.reconnect) = Some(subscription);
        store
    }

    pub(crate) fn now(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    /// Whether the connectivity probe currently reports the network.
    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    pub fn default_stale_time(&self) -> Duration {
        self.inner.default_stale_time
    }

    /// Get the entry for `key`, creating it with `stale_time` if absent.
    ///
    /// An existing entry keeps its original stale time. Fails with
    /// [`MuninnError::TypeMismatch`] if the key holds another value type.
    pub fn get_or_create<T>(&self, key: &QueryKey, stale_time: Duration) -> Result<Arc<CacheEntry<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut entries = lock(&self.inner.entries);
        if let Some(existing) = entries.get(key) {
            return downcast(key, existing.clone());
        }
        debug!(%key, ?stale_time, "creating query entry");
        let entry = Arc::new(CacheEntry::<T>::new(key.clone(), stale_time));
        entries.insert(key.clone(), entry.clone());
        Ok(entry)
    }

    fn existing<T>(&self, key: &QueryKey) -> Result<Option<Arc<CacheEntry<T>>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let existing = lock(&self.inner.entries).get(key).cloned();
        existing.map(|entry| downcast(key, entry)).transpose()
    }

    /// Register a change callback for `key`, creating the entry if needed.
    pub fn subscribe<T>(
        &self,
        key: &QueryKey,
        on_change: impl Fn() + Send + Sync + 'static,
    ) -> Result<Subscription>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entry = self.get_or_create::<T>(key, self.inner.default_stale_time)?;
        Ok(entry.subscribe(Arc::new(on_change)))
    }

    /// Number of live subscriptions on `key` (0 for unknown keys).
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        lock(&self.inner.entries)
            .get(key)
            .map_or(0, |entry| entry.subscriber_count())
    }

    /// Current state of `key`, or `None` if nothing ever touched it.
    pub fn read<T>(&self, key: &QueryKey) -> Result<Option<QuerySnapshot<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let now = self.now();
        Ok(self.existing::<T>(key)?.map(|entry| entry.snapshot(now)))
    }

    /// Fetch `key` with `fetch_fn`, joining any fetch already in flight.
    ///
    /// Failures are recorded on the entry, not returned; the only error
    /// here is a key type mismatch.
    pub async fn fetch<T, F, Fut>(&self, key: &QueryKey, fetch_fn: F) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let entry = self.get_or_create::<T>(key, self.inner.default_stale_time)?;
        self.fetch_entry(entry, move || fetch_fn().boxed()).await;
        Ok(())
    }

    /// Force the next read of `key` to be stale and refetch it right away.
    ///
    /// Only refetches when a fetch function was registered for the key via
    /// [`use_query()`](Self::use_query). No-op while offline.
    pub async fn invalidate(&self, key: &QueryKey) {
        if !self.is_online() {
            debug!(%key, "offline, ignoring invalidate");
            return;
        }
        let Some(entry) = lock(&self.inner.entries).get(key).cloned() else {
            return;
        };
        entry.reset_timestamp();
        if let Some(refetch) = entry.refetch(self) {
            refetch.await;
        }
    }

    /// Overwrite the data for `key` without fetching.
    ///
    /// The entry becomes fresh (timestamp = now) and any recorded error is
    /// cleared; subscribers are notified.
    pub fn set_data<T>(&self, key: &QueryKey, data: T) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entry = self.get_or_create::<T>(key, self.inner.default_stale_time)?;
        self.set_entry_data(&entry, data);
        Ok(())
    }

    pub(crate) fn set_entry_data<T>(&self, entry: &CacheEntry<T>, data: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        let now = self.now();
        entry.update(|state| {
            state.data = Some(data);
            state.timestamp = now;
            state.error = None;
        });
        entry.notify();
    }

    /// Start (or join) a fetch for `entry`.
    ///
    /// `start` is only called when no fetch is in flight. The fetch is
    /// spawned immediately; the returned future resolves when it completes.
    pub(crate) fn fetch_entry<T>(
        &self,
        entry: Arc<CacheEntry<T>>,
        start: impl FnOnce() -> BoxFuture<'static, Result<T>>,
    ) -> BoxFuture<'static, ()>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut in_flight = lock(&entry.in_flight);
        if let Some(existing) = in_flight.as_ref() {
            metrics::counter!(telemetry::QUERY_FETCHES_DEDUPED_TOTAL).increment(1);
            debug!(key = %entry.key(), "joining in-flight fetch");
            return existing.clone().boxed();
        }

        if !self.is_online() && entry.has_data() {
            drop(in_flight);
            metrics::counter!(telemetry::QUERY_OFFLINE_SERVED_TOTAL).increment(1);
            debug!(key = %entry.key(), "offline, serving cached data");
            entry.update(|state| {
                state.is_loading = false;
                state.error = Some(Arc::new(MuninnError::OfflineWithCachedData));
            });
            entry.notify();
            return future::ready(()).boxed();
        }

        if self.inner.runtime.get().is_none()
            && let Ok(current) = Handle::try_current()
        {
            let _ = self.inner.runtime.set(current);
        }
        let task = tokio::spawn(run_fetch(self.clone(), entry.clone(), start()));
        let shared = async move {
            // run_fetch catches panics from the fetch function itself.
            let _ = task.await;
        }
        .boxed()
        .shared();
        *in_flight = Some(shared.clone());
        shared.boxed()
    }

    /// Subscribe through a [`QueryHandle`](super::QueryHandle), the
    /// `useQuery`-style binding for presentation code.
    pub fn use_query<T, F, Fut>(
        &self,
        key: QueryKey,
        fetch_fn: F,
        options: super::QueryOptions,
    ) -> Result<super::QueryHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let fetcher: Fetcher<T> = Arc::new(move || fetch_fn().boxed());
        super::QueryHandle::mount(self.clone(), key, fetcher, options)
    }
}

impl Default for QueryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn downcast<T>(key: &QueryKey, entry: Arc<dyn ErasedEntry>) -> Result<Arc<CacheEntry<T>>>
where
    T: Clone + Send + Sync + 'static,
{
    entry
        .into_any()
        .downcast::<CacheEntry<T>>()
        .map_err(|_| MuninnError::TypeMismatch {
            key: key.to_string(),
        })
}

/// Body of a spawned fetch. Mutates the entry in one step, then notifies.
async fn run_fetch<T>(
    store: QueryStore,
    entry: Arc<CacheEntry<T>>,
    fetch: BoxFuture<'static, Result<T>>,
) where
    T: Clone + Send + Sync + 'static,
{
    entry.update(|state| {
        state.is_loading = true;
        state.error = None;
    });
    entry.notify();

    let result = AssertUnwindSafe(fetch)
        .catch_unwind()
        .await
        .unwrap_or(Err(MuninnError::FetchPanicked));

    let online = store.is_online();
    let now = store.now();
    let status = match &result {
        Ok(_) => "ok",
        Err(_) if !online => "offline",
        Err(_) => "error",
    };
    metrics::counter!(telemetry::QUERY_FETCHES_TOTAL, "status" => status).increment(1);

    entry.update(|state| {
        match result {
            Ok(data) => {
                state.data = Some(data);
                state.timestamp = now;
                state.error = None;
            }
            Err(err) => {
                warn!(key = %entry.key(), error = %err, online, "query fetch failed");
                let err = if online {
                    err
                } else if state.data.is_some() {
                    MuninnError::OfflineWithCachedData
                } else {
                    MuninnError::OfflineNoData
                };
                state.error = Some(Arc::new(err));
            }
        }
        state.is_loading = false;
    });
    lock(&entry.in_flight).take();
    entry.notify();
}

/// Refetch every active, stale entry after connectivity returns.
fn on_reconnect(weak: &Weak<StoreInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let store = QueryStore { inner };
    let Some(runtime) = Handle::try_current()
        .ok()
        .or_else(|| store.inner.runtime.get().cloned())
    else {
        warn!("connectivity restored before any runtime was known, skipping refetch");
        return;
    };
    let _guard = runtime.enter();

    let entries: Vec<Arc<dyn ErasedEntry>> =
        lock(&store.inner.entries).values().cloned().collect();
    let mut started = 0usize;
    for entry in entries {
        // The fetch is already spawned; the returned future only observes it.
        if entry.refetch_if_stale(&store).is_some() {
            started += 1;
        }
    }
    debug!(started, "connectivity restored, refetching stale queries");
}

/// Builder for [`QueryStore`].
pub struct QueryStoreBuilder {
    clock: Arc<dyn Clock>,
    connectivity: Arc<dyn ConnectivityProbe>,
    default_stale_time: Duration,
    runtime: Option<Handle>,
}

impl QueryStoreBuilder {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            connectivity: Arc::new(AlwaysOnline),
            default_stale_time: DEFAULT_STALE_TIME,
            runtime: None,
        }
    }

    /// Time source for timestamps and staleness.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Online/offline signal.
    pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivityProbe>) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Stale time for entries created without one (default: 5 minutes).
    pub fn default_stale_time(mut self, stale_time: Duration) -> Self {
        self.default_stale_time = stale_time;
        self
    }

    /// Runtime for refetches started by connectivity changes. Defaults to
    /// the runtime current at `build()` or at the first fetch.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> QueryStore {
        QueryStore::from_builder(self)
    }
}

impl Default for QueryStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connectivity::ManualConnectivity;

    fn store_at(now: u64) -> (QueryStore, Arc<ManualClock>, Arc<ManualConnectivity>) {
        let clock = Arc::new(ManualClock::new(now));
        let net = Arc::new(ManualConnectivity::new(true));
        let store = QueryStore::builder()
            .clock(clock.clone())
            .connectivity(net.clone())
            .default_stale_time(Duration::from_millis(1_000))
            .build();
        (store, clock, net)
    }

    #[test]
    fn get_or_create_keeps_first_stale_time() {
        let (store, _, _) = store_at(1);
        let key = QueryKey::operation("A");
        let a = store
            .get_or_create::<u8>(&key, Duration::from_secs(1))
            .unwrap();
        let b = store
            .get_or_create::<u8>(&key, Duration::from_secs(9))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.stale_time(), Duration::from_secs(1));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let (store, _, _) = store_at(1);
        let key = QueryKey::operation("A");
        store.set_data(&key, 1u32).unwrap();
        let err = store.read::<String>(&key).unwrap_err();
        assert!(matches!(err, MuninnError::TypeMismatch { .. }));
    }

    #[test]
    fn read_unknown_key_is_none() {
        let (store, _, _) = store_at(1);
        assert!(
            store
                .read::<u8>(&QueryKey::operation("nope"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn set_data_is_fresh_and_readable() {
        let (store, clock, _) = store_at(5_000);
        let key = QueryKey::operation("A");
        store.set_data(&key, "v".to_string()).unwrap();
        let snap = store.read::<String>(&key).unwrap().unwrap();
        assert_eq!(snap.data.as_deref(), Some("v"));
        assert!(!snap.is_stale);
        assert_eq!(snap.updated_at, 5_000);

        clock.advance(Duration::from_millis(1_001));
        assert!(store.read::<String>(&key).unwrap().unwrap().is_stale);
    }

    #[tokio::test]
    async fn fetch_success_updates_entry() {
        let (store, _, _) = store_at(42);
        let key = QueryKey::operation("A");
        store.fetch(&key, || async { Ok(5u32) }).await.unwrap();
        let snap = store.read::<u32>(&key).unwrap().unwrap();
        assert_eq!(snap.data, Some(5));
        assert_eq!(snap.updated_at, 42);
        assert!(!snap.is_loading);
        assert!(snap.error.is_none());
    }

    #[tokio::test]
    async fn panicking_fetch_is_recorded() {
        let (store, _, _) = store_at(42);
        let key = QueryKey::operation("A");
        store
            .fetch::<u32, _, _>(&key, || async {
                if true {
                    panic!("boom");
                }
                Ok(0)
            })
            .await
            .unwrap();
        let snap = store.read::<u32>(&key).unwrap().unwrap();
        assert!(!snap.is_loading);
        assert!(matches!(
            snap.error.as_deref(),
            Some(MuninnError::FetchPanicked)
        ));

        // The key is usable again afterwards.
        store.fetch(&key, || async { Ok(1u32) }).await.unwrap();
        assert_eq!(store.read::<u32>(&key).unwrap().unwrap().data, Some(1));
    }

    #[tokio::test]
    async fn invalidate_without_fetcher_only_marks_stale() {
        let (store, _, _) = store_at(100);
        let key = QueryKey::operation("A");
        store.set_data(&key, 1u8).unwrap();
        store.invalidate(&key).await;
        let snap = store.read::<u8>(&key).unwrap().unwrap();
        assert!(snap.is_stale);
        assert_eq!(snap.data, Some(1));
    }

    #[tokio::test]
    async fn invalidate_is_noop_offline() {
        let (store, _, net) = store_at(100);
        let key = QueryKey::operation("A");
        store.set_data(&key, 1u8).unwrap();
        net.set_online(false);
        store.invalidate(&key).await;
        assert!(!store.read::<u8>(&key).unwrap().unwrap().is_stale);
    }
}
