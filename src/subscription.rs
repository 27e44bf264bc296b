//! Listener sets with RAII unsubscribe guards.
//!
//! Used by cache entries (change notifications) and connectivity probes
//! (online/offline transitions). Notification always iterates a snapshot
//! taken under the lock and invokes callbacks after releasing it, so a
//! callback may subscribe, unsubscribe or read the notifying object.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// All state guarded in this crate stays consistent between statements,
/// so a poisoned lock carries no partial update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by every `subscribe`-style call.
///
/// Dropping it unsubscribes. Call [`detach()`](Self::detach) to keep the
/// listener registered for the lifetime of its owner instead.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the listener registered after this handle is dropped.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

struct ListenerSet<F: ?Sized> {
    next_id: u64,
    entries: BTreeMap<u64, Arc<F>>,
}

/// Ordered set of callbacks of type `F` (e.g. `dyn Fn() + Send + Sync`).
pub(crate) struct Listeners<F: ?Sized> {
    inner: Arc<Mutex<ListenerSet<F>>>,
}

impl<F: ?Sized + Send + Sync + 'static> Listeners<F> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerSet {
                next_id: 0,
                entries: BTreeMap::new(),
            })),
        }
    }

    /// Register a callback; it stays registered until the guard drops.
    pub(crate) fn add(&self, listener: Arc<F>) -> Subscription {
        let id = {
            let mut set = lock(&self.inner);
            let id = set.next_id;
            set.next_id += 1;
            set.entries.insert(id, listener);
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).entries.remove(&id);
            }
        })
    }

    /// Callbacks registered right now, in registration order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        lock(&self.inner).entries.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }
}

impl<F: ?Sized + Send + Sync + 'static> Default for Listeners<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Callback = dyn Fn() + Send + Sync;

    #[test]
    fn drop_unsubscribes() {
        let listeners: Listeners<Callback> = Listeners::new();
        let sub = listeners.add(Arc::new(|| {}));
        assert_eq!(listeners.len(), 1);
        drop(sub);
        assert_eq!(listeners.len(), 0);
    }

    #[test]
    fn detach_keeps_listener() {
        let listeners: Listeners<Callback> = Listeners::new();
        listeners.add(Arc::new(|| {})).detach();
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn snapshot_survives_unsubscribe_during_iteration() {
        let listeners: Listeners<Callback> = Listeners::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_in_cb = slot.clone();
        let calls_a = calls.clone();
        let sub = listeners.add(Arc::new(move || {
            calls_a.fetch_add(1, Ordering::SeqCst);
            // Unsubscribe ourselves mid-notification.
            drop(lock(&slot_in_cb).take());
        }));
        *lock(&slot) = Some(sub);

        let calls_b = calls.clone();
        let _keep = listeners.add(Arc::new(move || {
            calls_b.fetch_add(1, Ordering::SeqCst);
        }));

        for cb in listeners.snapshot() {
            cb();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn unsubscribe_after_owner_dropped_is_harmless() {
        let listeners: Listeners<Callback> = Listeners::new();
        let sub = listeners.add(Arc::new(|| {}));
        drop(listeners);
        sub.unsubscribe();
    }
}
