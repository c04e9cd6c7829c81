//! Indexed callback registries
//!
//! Subscribers get an opaque handle back; removal goes through the handle,
//! so unsubscribing is O(1) and a stale or repeated unsubscribe cannot
//! disturb other subscribers.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque subscription handle returned by [`CallbackList::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

/// A set of callbacks invoked in registration order.
pub struct CallbackList<T: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, Arc<T>>>,
}

impl<T: ?Sized> CallbackList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add(&self, callback: Arc<T>) -> CallbackHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, callback);
        CallbackHandle(id)
    }

    /// Removes the callback behind `handle`. Returns whether anything was
    /// removed; removing twice is a no-op.
    pub fn remove(&self, handle: CallbackHandle) -> bool {
        self.entries.lock().remove(&handle.0).is_some()
    }

    /// Snapshot of the registered callbacks, in registration order. The lock
    /// is released before the caller invokes anything, so callbacks are free
    /// to subscribe or unsubscribe re-entrantly.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T: ?Sized> Default for CallbackList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Counter = dyn Fn() + Send + Sync;

    #[test]
    fn add_and_invoke() {
        let list: CallbackList<Counter> = CallbackList::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = Arc::clone(&hits);
        list.add(Arc::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        for callback in list.snapshot() {
            callback();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let list: CallbackList<Counter> = CallbackList::new();
        let first = list.add(Arc::new(|| {}));
        let second = list.add(Arc::new(|| {}));

        assert!(list.remove(first));
        assert_eq!(list.len(), 1);
        // A second remove with the same handle must not touch the survivor.
        assert!(!list.remove(first));
        assert_eq!(list.len(), 1);
        assert!(list.remove(second));
        assert!(list.is_empty());
    }

    #[test]
    fn handles_survive_earlier_removal() {
        let list: CallbackList<Counter> = CallbackList::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let a = list.add(Arc::new(|| {}));
        let hits2 = Arc::clone(&hits);
        let b = list.add(Arc::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        // Removing an earlier entry must not shift the later handle.
        assert!(list.remove(a));
        for callback in list.snapshot() {
            callback();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(list.remove(b));
    }
}
