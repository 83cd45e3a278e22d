use crate::keys;
use crate::store::{Store, Subscription};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use pc_core::clients::{PreflightRequest, ReadinessClient};
use pc_core::ServiceError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_PREFLIGHT_CAPACITY: usize = 128;
pub const DEFAULT_PREFLIGHT_TTL: Duration = Duration::from_secs(300);

pub type PreflightResult = Result<Arc<Value>, ServiceError>;
type PendingCompute = Shared<BoxFuture<'static, PreflightResult>>;

enum Entry {
    Pending {
        generation: u64,
        compute: PendingCompute,
    },
    Ready {
        value: Arc<Value>,
        computed_at: Instant,
        touched: u64,
    },
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_generation: u64,
    tick: u64,
}

impl Inner {
    fn evict_over(&mut self, capacity: usize) {
        while self.entries.len() > capacity.max(1) {
            let victim = self
                .entries
                .iter()
                .filter_map(|(id, entry)| match entry {
                    Entry::Ready { touched, .. } => Some((id, *touched)),
                    Entry::Pending { .. } => None,
                })
                .min_by_key(|(_, touched)| *touched)
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }
}

/// Shot id to last preflight result. Concurrent misses for one shot share a
/// single service call; failures are never cached.
pub struct PreflightCache {
    store: Store,
    client: ReadinessClient,
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl PreflightCache {
    pub fn new(store: Store, client: ReadinessClient, capacity: usize, ttl: Duration) -> Self {
        Self {
            store,
            client,
            capacity,
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn get_or_compute(&self, request: &PreflightRequest) -> PreflightResult {
        let shot_id = request.shot_id.trim().to_string();
        if shot_id.is_empty() {
            return Err(ServiceError::invalid_input("shotId is required"));
        }

        let (generation, compute) = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            inner.tick += 1;
            let tick = inner.tick;
            match inner.entries.get_mut(&shot_id) {
                Some(Entry::Ready {
                    value,
                    computed_at,
                    touched,
                }) if computed_at.elapsed() < self.ttl => {
                    *touched = tick;
                    return Ok(value.clone());
                }
                Some(Entry::Pending {
                    generation,
                    compute,
                }) => (*generation, compute.clone()),
                _ => {
                    inner.next_generation += 1;
                    let generation = inner.next_generation;
                    let client = self.client.clone();
                    let request = PreflightRequest {
                        shot_id: shot_id.clone(),
                        ..request.clone()
                    };
                    let compute = async move {
                        client.load_shot_preflight(&request).await.map(Arc::new)
                    }
                    .boxed()
                    .shared();
                    inner.entries.insert(
                        shot_id.clone(),
                        Entry::Pending {
                            generation,
                            compute: compute.clone(),
                        },
                    );
                    debug!("preflight_compute_start: shot={shot_id}");
                    (generation, compute)
                }
            }
        };

        let result = compute.await;

        let publish = {
            let mut inner = self.lock();
            let still_pending = matches!(
                inner.entries.get(&shot_id),
                Some(Entry::Pending { generation: current, .. }) if *current == generation
            );
            if !still_pending {
                None
            } else {
                match &result {
                    Ok(value) => {
                        inner.tick += 1;
                        let touched = inner.tick;
                        inner.entries.insert(
                            shot_id.clone(),
                            Entry::Ready {
                                value: value.clone(),
                                computed_at: Instant::now(),
                                touched,
                            },
                        );
                        inner.evict_over(self.capacity);
                        Some(value.clone())
                    }
                    Err(err) => {
                        warn!("preflight_compute_error: shot={shot_id} code={} {}", err.code, err.message);
                        inner.entries.remove(&shot_id);
                        None
                    }
                }
            }
        };

        if let Some(value) = publish {
            self.store
                .set(&keys::shot_preflight(&shot_id), value.as_ref().clone());
            self.store
                .set(keys::LAST_SHOT_PREFLIGHT, value.as_ref().clone());
        }
        result
    }

    /// Drops the entry for `shot_id`, pending or ready. A computation already
    /// running still answers its callers but is not stored.
    pub fn invalidate(&self, shot_id: &str) -> bool {
        let removed = self.lock().entries.remove(shot_id.trim()).is_some();
        if removed {
            debug!("preflight_invalidated: shot={shot_id}");
        }
        removed
    }

    pub fn cached(&self, shot_id: &str) -> Option<Arc<Value>> {
        match self.lock().entries.get(shot_id) {
            Some(Entry::Ready {
                value, computed_at, ..
            }) if computed_at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invalidates a shot's entry whenever `lastSavedShotId` is written.
    pub fn watch_saves(self: &Arc<Self>) -> Subscription {
        let cache: Weak<PreflightCache> = Arc::downgrade(self);
        self.store.on(keys::LAST_SAVED_SHOT_ID, move |value| {
            let (Some(cache), Some(shot_id)) = (cache.upgrade(), value.as_str()) else {
                return;
            };
            cache.invalidate(shot_id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pc_core::{ServiceAdapter, ServiceFuture, ServiceReply, ServiceRequest};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct GatedAdapter {
        calls: AtomicUsize,
        gate: Arc<Notify>,
        gated: bool,
    }

    impl GatedAdapter {
        fn new(gated: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Arc::new(Notify::new()),
                gated,
            })
        }
    }

    impl ServiceAdapter for GatedAdapter {
        fn request(&self, path: &str, _request: ServiceRequest) -> ServiceFuture {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let gate = self.gate.clone();
            let gated = self.gated;
            let failing = path.contains("shotId=bad");
            Box::pin(async move {
                if gated {
                    gate.notified().await;
                }
                if failing {
                    return Ok(ServiceReply::failed(
                        500,
                        json!({"success": false, "error": "preflight crashed"}),
                    ));
                }
                Ok(ServiceReply::ok(json!({"success": true, "ready": true, "call": call})))
            })
        }
    }

    fn cache_with(adapter: Arc<GatedAdapter>, store: Store) -> Arc<PreflightCache> {
        Arc::new(PreflightCache::new(
            store,
            ReadinessClient::new(adapter),
            DEFAULT_PREFLIGHT_CAPACITY,
            DEFAULT_PREFLIGHT_TTL,
        ))
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_call() {
        let adapter = GatedAdapter::new(true);
        let store = Store::new();
        let cache = cache_with(adapter.clone(), store.clone());
        let request = PreflightRequest::new("demo", "shot-1");

        let first = tokio::spawn({
            let cache = cache.clone();
            let request = request.clone();
            async move { cache.get_or_compute(&request).await }
        });
        let second = tokio::spawn({
            let cache = cache.clone();
            let request = request.clone();
            async move { cache.get_or_compute(&request).await }
        });
        tokio::task::yield_now().await;
        while adapter.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        adapter.gate.notify_one();

        let a = first.await.expect("join").expect("first result");
        let b = second.await.expect("join").expect("second result");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("shotPreflight:shot-1"), Some(a.as_ref().clone()));
        assert_eq!(store.get(keys::LAST_SHOT_PREFLIGHT), Some(a.as_ref().clone()));
    }

    #[tokio::test]
    async fn hits_reuse_and_invalidate_recomputes() {
        let adapter = GatedAdapter::new(false);
        let cache = cache_with(adapter.clone(), Store::new());
        let request = PreflightRequest::new("demo", "shot-7");

        let first = cache.get_or_compute(&request).await.expect("first");
        let again = cache.get_or_compute(&request).await.expect("hit");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);

        assert!(cache.invalidate("shot-7"));
        let fresh = cache.get_or_compute(&request).await.expect("recompute");
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fresh["call"], json!(2));
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let adapter = GatedAdapter::new(false);
        let cache = cache_with(adapter.clone(), Store::new());
        let request = PreflightRequest::new("demo", "bad");

        let err = cache.get_or_compute(&request).await.expect_err("failure");
        assert_eq!(err.message, "preflight crashed");
        assert!(cache.is_empty());
        cache.get_or_compute(&request).await.expect_err("failure again");
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidated_pending_compute_never_repopulates() {
        let adapter = GatedAdapter::new(true);
        let store = Store::new();
        let cache = cache_with(adapter.clone(), store.clone());
        let request = PreflightRequest::new("demo", "shot-2");

        let stale = tokio::spawn({
            let cache = cache.clone();
            let request = request.clone();
            async move { cache.get_or_compute(&request).await }
        });
        while adapter.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(cache.invalidate("shot-2"));
        adapter.gate.notify_one();

        stale.await.expect("join").expect("stale caller still answered");
        assert!(cache.cached("shot-2").is_none());
        assert_eq!(store.get("shotPreflight:shot-2"), None);
    }

    #[tokio::test]
    async fn saving_a_shot_invalidates_its_entry() {
        let adapter = GatedAdapter::new(false);
        let store = Store::new();
        let cache = cache_with(adapter.clone(), store.clone());
        let _saves = cache.watch_saves();
        let request = PreflightRequest::new("demo", "shot-3");

        cache.get_or_compute(&request).await.expect("first");
        store.set(keys::LAST_SAVED_SHOT_ID, "shot-3");
        assert!(cache.cached("shot-3").is_none());
        cache.get_or_compute(&request).await.expect("second");
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_recomputed() {
        let adapter = GatedAdapter::new(false);
        let store = Store::new();
        let cache = Arc::new(PreflightCache::new(
            store,
            ReadinessClient::new(adapter.clone()),
            4,
            Duration::from_secs(10),
        ));
        let request = PreflightRequest::new("demo", "shot-9");
        cache.get_or_compute(&request).await.expect("first");
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.get_or_compute(&request).await.expect("second");
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }
}
