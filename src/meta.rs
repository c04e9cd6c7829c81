//! Room metadata
//!
//! A concurrent key/value map with change notifications. Values are
//! arbitrary JSON so callers can store whatever their signaling protocol
//! needs without the SFU interpreting it.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::callback::{CallbackHandle, CallbackList};
use crate::error::{Error, Result};

type OnChangedFn = dyn Fn(&str, Option<&Value>) + Send + Sync;

/// Concurrent metadata map with subscribe-on-change.
pub struct Metadata {
    entries: DashMap<String, Value>,
    on_changed: Arc<CallbackList<OnChangedFn>>,
}

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            on_changed: Arc::new(CallbackList::new()),
        }
    }

    /// Sets `key` to `value` and notifies subscribers.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.entries.insert(key.clone(), value.clone());
        self.notify(&key, Some(&value));
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Value> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or(Error::MetaNotFound)
    }

    /// Removes `key` and notifies subscribers with an empty value.
    pub fn delete(&self, key: &str) -> Result<()> {
        if self.entries.remove(key).is_none() {
            return Err(Error::MetaNotFound);
        }
        self.notify(key, None);
        Ok(())
    }

    /// Calls `f` for every entry. The iteration order is unspecified.
    pub fn for_each(&self, mut f: impl FnMut(&str, &Value)) {
        for entry in self.entries.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// Registers a change callback. Call
    /// [`MetaSubscription::unsubscribe`] once the callback is no longer
    /// needed.
    pub fn on_changed(
        &self,
        callback: impl Fn(&str, Option<&Value>) + Send + Sync + 'static,
    ) -> MetaSubscription {
        let handle = self.on_changed.add(Arc::new(callback));
        MetaSubscription {
            list: Arc::clone(&self.on_changed),
            handle,
        }
    }

    fn notify(&self, key: &str, value: Option<&Value>) {
        for callback in self.on_changed.snapshot() {
            callback(key, value);
        }
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a metadata change subscription.
pub struct MetaSubscription {
    list: Arc<CallbackList<OnChangedFn>>,
    handle: CallbackHandle,
}

impl MetaSubscription {
    /// Removes the callback. Unsubscribing twice is a no-op.
    pub fn unsubscribe(&self) {
        self.list.remove(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn set_then_get() {
        let meta = Metadata::new();
        meta.set("name", json!("studio"));
        assert_eq!(meta.get("name").unwrap(), json!("studio"));
    }

    #[test]
    fn get_missing_fails() {
        let meta = Metadata::new();
        assert!(matches!(meta.get("nope"), Err(Error::MetaNotFound)));
    }

    #[test]
    fn delete_twice_fails_the_second_time() {
        let meta = Metadata::new();
        meta.set("k", json!(1));
        assert!(meta.delete("k").is_ok());
        assert!(matches!(meta.delete("k"), Err(Error::MetaNotFound)));
    }

    #[test]
    fn for_each_sees_all_entries() {
        let meta = Metadata::new();
        meta.set("a", json!(1));
        meta.set("b", json!(2));
        let mut seen = Vec::new();
        meta.for_each(|key, _| seen.push(key.to_string()));
        seen.sort();
        assert_eq!(seen, ["a", "b"]);
    }

    #[test]
    fn subscription_lifecycle() {
        let meta = Metadata::new();
        let events: Arc<Mutex<Vec<(String, Option<Value>)>>> = Arc::new(Mutex::new(Vec::new()));

        let events2 = Arc::clone(&events);
        let sub = meta.on_changed(move |key, value| {
            events2.lock().push((key.to_string(), value.cloned()));
        });

        meta.set("k", json!(1));
        sub.unsubscribe();
        meta.set("k", json!(2));
        let _ = meta.delete("k");

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], ("k".to_string(), Some(json!(1))));
    }

    #[test]
    fn double_unsubscribe_leaves_other_subscribers_alone() {
        let meta = Metadata::new();
        let hits = Arc::new(Mutex::new(0u32));

        let stale = meta.on_changed(|_, _| {});
        let hits2 = Arc::clone(&hits);
        let _live = meta.on_changed(move |_, _| {
            *hits2.lock() += 1;
        });

        stale.unsubscribe();
        stale.unsubscribe();

        meta.set("k", json!(true));
        assert_eq!(*hits.lock(), 1);
    }
}
