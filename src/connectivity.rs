//! Network connectivity signal.
//!
//! The query store never inspects the network itself; it asks an injected
//! [`ConnectivityProbe`]. Hosts wire their platform's online/offline signal
//! into [`ManualConnectivity::set_online()`], tests flip it directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::subscription::{Listeners, Subscription};

/// Callback invoked with the new online state after every transition.
pub type ConnectivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Source of the "is the network reachable" signal.
pub trait ConnectivityProbe: Send + Sync {
    /// Whether the environment currently reports connectivity.
    fn is_online(&self) -> bool;

    /// Register for online/offline transitions.
    fn on_change(&self, callback: ConnectivityCallback) -> Subscription;
}

/// Probe that always reports connectivity and never changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl ConnectivityProbe for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }

    fn on_change(&self, _callback: ConnectivityCallback) -> Subscription {
        Subscription::noop()
    }
}

/// Probe whose state is set explicitly.
///
/// Listeners are only notified on an actual transition; setting the
/// current state again is a no-op.
pub struct ManualConnectivity {
    online: AtomicBool,
    listeners: Listeners<dyn Fn(bool) + Send + Sync>,
}

impl ManualConnectivity {
    /// Create a probe starting in the given state.
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            listeners: Listeners::new(),
        }
    }

    /// Report a new connectivity state.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }
        debug!(online, "connectivity changed");
        for listener in self.listeners.snapshot() {
            listener(online);
        }
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityProbe for ManualConnectivity {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn on_change(&self, callback: ConnectivityCallback) -> Subscription {
        self.listeners.add(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn notifies_only_on_transition() {
        let probe = ManualConnectivity::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let _sub = probe.on_change(Arc::new(move |online| {
            seen_cb.lock().unwrap().push(online);
        }));

        probe.set_online(true);
        probe.set_online(false);
        probe.set_online(false);
        probe.set_online(true);

        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
        assert!(probe.is_online());
    }

    #[test]
    fn dropped_subscription_stops_notifications() {
        let probe = ManualConnectivity::new(false);
        let seen = Arc::new(Mutex::new(0));
        let seen_cb = seen.clone();
        let sub = probe.on_change(Arc::new(move |_| {
            *seen_cb.lock().unwrap() += 1;
        }));
        drop(sub);
        probe.set_online(true);
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn always_online() {
        assert!(AlwaysOnline.is_online());
    }
}
