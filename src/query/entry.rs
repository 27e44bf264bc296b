//! Per-key cache entry.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};

use crate::MuninnError;
use crate::key::QueryKey;
use crate::subscription::{Listeners, Subscription, lock};

/// Change-notification callback.
pub type ChangeCallback = dyn Fn() + Send + Sync;

/// Registered fetch function for a key, reused by refetch and reconnect.
pub(crate) type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, crate::Result<T>> + Send + Sync>;

/// Mutable part of an entry. Only touched inside [`CacheEntry::update`].
pub(crate) struct EntryState<T> {
    pub(crate) data: Option<T>,
    pub(crate) timestamp: u64,
    pub(crate) stale_time: Duration,
    pub(crate) is_loading: bool,
    pub(crate) error: Option<Arc<MuninnError>>,
}

impl<T> EntryState<T> {
    fn is_stale(&self, now: u64) -> bool {
        self.timestamp == 0
            || now.saturating_sub(self.timestamp) > self.stale_time.as_millis() as u64
    }
}

/// Point-in-time view of an entry.
#[derive(Debug, Clone)]
pub struct QuerySnapshot<T> {
    pub data: Option<T>,
    pub is_loading: bool,
    pub is_stale: bool,
    pub error: Option<Arc<MuninnError>>,
    /// Epoch millis of the last successful fetch or `set_data`, 0 if never.
    pub updated_at: u64,
}

/// Cached state for one query key.
///
/// Created lazily with no data and `timestamp == 0`, which always counts as
/// stale. Lives as long as the owning store.
pub struct CacheEntry<T> {
    key: QueryKey,
    state: Mutex<EntryState<T>>,
    subscribers: Listeners<ChangeCallback>,
    pub(crate) in_flight: Mutex<Option<Shared<BoxFuture<'static, ()>>>>,
    fetcher: Mutex<Option<Fetcher<T>>>,
}

impl<T> CacheEntry<T>
where
    T: Send + 'static,
{
    pub(crate) fn new(key: QueryKey, stale_time: Duration) -> Self {
        Self {
            key,
            state: Mutex::new(EntryState {
                data: None,
                timestamp: 0,
                stale_time,
                is_loading: false,
                error: None,
            }),
            subscribers: Listeners::new(),
            in_flight: Mutex::new(None),
            fetcher: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Register a change callback. Dropping the guard unsubscribes.
    pub fn subscribe(&self, on_change: Arc<ChangeCallback>) -> Subscription {
        self.subscribers.add(on_change)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Invoke every current subscriber.
    ///
    /// Iterates a snapshot, so callbacks may unsubscribe or read the entry.
    pub fn notify(&self) {
        for subscriber in self.subscribers.snapshot() {
            subscriber();
        }
    }

    pub fn is_stale(&self, now: u64) -> bool {
        lock(&self.state).is_stale(now)
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.state).is_loading
    }

    pub fn has_data(&self) -> bool {
        lock(&self.state).data.is_some()
    }

    pub fn timestamp(&self) -> u64 {
        lock(&self.state).timestamp
    }

    pub fn stale_time(&self) -> Duration {
        lock(&self.state).stale_time
    }

    pub fn error(&self) -> Option<Arc<MuninnError>> {
        lock(&self.state).error.clone()
    }

    /// Apply a group of field mutations atomically.
    ///
    /// Callers notify afterwards, once the lock is released.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut EntryState<T>) -> R) -> R {
        f(&mut lock(&self.state))
    }

    pub(crate) fn set_fetcher(&self, fetcher: Fetcher<T>) {
        *lock(&self.fetcher) = Some(fetcher);
    }

    pub(crate) fn fetcher(&self) -> Option<Fetcher<T>> {
        lock(&self.fetcher).clone()
    }
}

impl<T> CacheEntry<T>
where
    T: Clone + Send + 'static,
{
    pub fn data(&self) -> Option<T> {
        lock(&self.state).data.clone()
    }

    pub fn snapshot(&self, now: u64) -> QuerySnapshot<T> {
        let state = lock(&self.state);
        QuerySnapshot {
            data: state.data.clone(),
            is_loading: state.is_loading,
            is_stale: state.is_stale(now),
            error: state.error.clone(),
            updated_at: state.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(stale_ms: u64) -> CacheEntry<u32> {
        CacheEntry::new(QueryKey::operation("Test"), Duration::from_millis(stale_ms))
    }

    #[test]
    fn new_entry_is_stale_and_empty() {
        let e = entry(60_000);
        assert!(e.is_stale(1));
        assert!(!e.has_data());
        assert!(!e.is_loading());
        assert_eq!(e.timestamp(), 0);
    }

    #[test]
    fn staleness_boundary() {
        let e = entry(1_000);
        e.update(|s| {
            s.data = Some(1);
            s.timestamp = 10_000;
        });
        assert!(!e.is_stale(10_999));
        assert!(!e.is_stale(11_000));
        assert!(e.is_stale(11_001));
    }

    #[test]
    fn notify_reaches_all_subscribers() {
        let e = entry(1_000);
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let c2 = calls.clone();
        let _a = e.subscribe(Arc::new(move || {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        let _b = e.subscribe(Arc::new(move || {
            c2.fetch_add(1, Ordering::SeqCst);
        }));
        e.notify();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(e.subscriber_count(), 2);
    }

    #[test]
    fn snapshot_reflects_state() {
        let e = entry(1_000);
        e.update(|s| {
            s.data = Some(7);
            s.timestamp = 500;
            s.error = Some(Arc::new(MuninnError::OfflineWithCachedData));
        });
        let snap = e.snapshot(600);
        assert_eq!(snap.data, Some(7));
        assert!(!snap.is_stale);
        assert_eq!(snap.updated_at, 500);
        assert!(snap.error.unwrap().is_offline());
    }
}
