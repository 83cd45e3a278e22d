//! Process-lifetime key/value state with per-key subscribers.
//!
//! Every `set` is a full replacement of the key's value followed by a
//! synchronous fan-out to the key's subscribers, in subscription order. No
//! lock is held while callbacks run, so callbacks may read, write, subscribe
//! and unsubscribe freely.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::warn;

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct StoreInner {
    values: HashMap<String, Value>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    next_id: u64,
}

fn lock(inner: &Mutex<StoreInner>) -> MutexGuard<'_, StoreInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable handle; clones share the same state.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Mutex<StoreInner>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("Store")
            .field("keys", &inner.values.len())
            .field("subscribed_keys", &inner.subscribers.len())
            .finish()
    }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, or `None` if the key was never written.
    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.inner).values.get(key).cloned()
    }

    /// String value of a key; `null` and empty strings read as absent.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::String(value)) if !value.trim().is_empty() => Some(value),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some(Value::Bool(true)))
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        let callbacks: Vec<Callback> = {
            let mut inner = lock(&self.inner);
            inner.values.insert(key.to_string(), value.clone());
            inner
                .subscribers
                .get(key)
                .map(|subs| subs.iter().map(|sub| sub.callback.clone()).collect())
                .unwrap_or_default()
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&value))).is_err() {
                warn!("store_subscriber_panic: key={key}");
            }
        }
    }

    /// Registers `callback` for `key`. Dropping the returned handle keeps the
    /// callback registered; call [`Subscription::unsubscribe`] to remove it.
    pub fn on<F>(&self, key: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .subscribers
            .entry(key.to_string())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        Subscription {
            store: Arc::downgrade(&self.inner),
            key: key.to_string(),
            id,
        }
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        lock(&self.inner)
            .subscribers
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct Subscription {
    store: Weak<Mutex<StoreInner>>,
    key: String,
    id: u64,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Removes the callback. Safe to call more than once, and from inside a
    /// fan-out: callbacks already collected for that fan-out still run.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };
        let mut inner = lock(&inner);
        if let Some(subs) = inner.subscribers.get_mut(&self.key) {
            subs.retain(|sub| sub.id != self.id);
            if subs.is_empty() {
                inner.subscribers.remove(&self.key);
            }
        }
    }
}
