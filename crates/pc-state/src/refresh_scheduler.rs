//! Debounced and interval driven reconciliation of the generation history
//! cache with the service.
//!
//! At most one refresh is pending or in flight at any time. Requests that
//! arrive meanwhile are coalesced into it, and interval ticks that find a
//! refresh running are skipped.

use crate::history_cache::HistoryCache;
use crate::job_stream::live_job_in_store;
use crate::keys;
use crate::store::Store;
use pc_core::clients::{GenerationJobsClient, HistoryQuery};
use pc_core::{record_is_terminal, JobClass};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Pending,
    InFlight,
}

struct AutoRefresh {
    task: JoinHandle<()>,
    stop: Arc<Notify>,
}

struct SchedulerState {
    phase: RefreshPhase,
    /// Debounce timer, and the refresh it starts once it fires.
    task: Option<JoinHandle<()>>,
    auto: Option<AutoRefresh>,
    auto_requested: bool,
    visible: bool,
    query: HistoryQuery,
    shut_down: bool,
}

struct Inner {
    store: Store,
    cache: Arc<HistoryCache>,
    client: GenerationJobsClient,
    debounce: Duration,
    period: Duration,
    state: Mutex<SchedulerState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Debounce timer expiry. The task handle stays registered until the
    /// refresh is done so that `shutdown` can cancel it.
    async fn fire(self: Arc<Self>) {
        let query = {
            let mut state = self.lock();
            if state.shut_down || state.phase != RefreshPhase::Pending {
                return;
            }
            state.phase = RefreshPhase::InFlight;
            state.query.clone()
        };
        self.refresh(query).await;
        let mut state = self.lock();
        if !state.shut_down {
            state.phase = RefreshPhase::Idle;
            state.task = None;
        }
    }

    async fn tick(self: &Arc<Self>) {
        let query = {
            let mut state = self.lock();
            if state.shut_down || state.phase != RefreshPhase::Idle {
                debug!("history_refresh_tick_skipped: phase={:?}", state.phase);
                return;
            }
            state.phase = RefreshPhase::InFlight;
            state.query.clone()
        };
        self.refresh(query).await;
        let mut state = self.lock();
        if !state.shut_down {
            state.phase = RefreshPhase::Idle;
        }
    }

    fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Runs one refresh. The caller owns the phase transitions.
    async fn refresh(&self, query: HistoryQuery) {
        self.store.set(keys::GENERATION_HISTORY_REFRESH_IN_FLIGHT, true);
        let listed = self.client.list_jobs(&query).await;
        if self.is_shut_down() {
            debug!("history_refresh_discarded: scheduler shut down");
            return;
        }
        let succeeded = match listed {
            Ok(jobs) => {
                let live = live_job_in_store(&self.store, JobClass::Generation);
                let written = self.cache.replace_batch(&jobs, live.as_deref());
                debug!("history_refresh_applied: jobs={} written={written}", jobs.len());
                if !matches!(
                    self.store.get(keys::GENERATION_HISTORY_ERROR),
                    None | Some(Value::Null)
                ) {
                    self.store.set(keys::GENERATION_HISTORY_ERROR, Value::Null);
                }
                self.clear_finished_active();
                true
            }
            Err(err) => {
                warn!("history_refresh_error: code={} {}", err.code, err.message);
                let classified = err.classified();
                self.store.set(
                    keys::GENERATION_HISTORY_ERROR,
                    json!({"code": classified.code, "message": classified.user_message()}),
                );
                false
            }
        };
        self.store
            .set(keys::GENERATION_HISTORY_REFRESH_IN_FLIGHT, false);

        if succeeded {
            let metrics = self
                .client
                .get_metrics(query.metrics_project(), query.limit)
                .await
                .unwrap_or_else(|err| {
                    debug!("history_metrics_error: code={} {}", err.code, err.message);
                    Value::Null
                });
            if !self.is_shut_down() {
                self.store.set(keys::GENERATION_METRICS_CACHE, metrics);
            }
        }
    }

    /// Clears the active generation id once its job is known to be finished
    /// and no stream is following it.
    fn clear_finished_active(&self) {
        let Some(active) = self.store.get_str(keys::ACTIVE_GENERATION_JOB_ID) else {
            return;
        };
        if live_job_in_store(&self.store, JobClass::Generation).as_deref() == Some(active.as_str()) {
            return;
        }
        let finished = self
            .cache
            .get(&active)
            .map(|record| record_is_terminal(&record))
            .unwrap_or(false);
        if finished {
            info!("history_refresh_cleared_active: job={active}");
            self.store.set(keys::ACTIVE_GENERATION_JOB_ID, Value::Null);
        }
    }
}

pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

impl RefreshScheduler {
    pub fn new(
        store: Store,
        cache: Arc<HistoryCache>,
        client: GenerationJobsClient,
        query: HistoryQuery,
        debounce: Duration,
        period: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                cache,
                client,
                debounce,
                period,
                state: Mutex::new(SchedulerState {
                    phase: RefreshPhase::Idle,
                    task: None,
                    auto: None,
                    auto_requested: false,
                    visible: true,
                    query,
                    shut_down: false,
                }),
            }),
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        self.inner.lock().phase
    }

    pub fn query(&self) -> HistoryQuery {
        self.inner.lock().query.clone()
    }

    pub fn set_query(&self, query: HistoryQuery) {
        self.inner.lock().query = query;
    }

    pub fn is_auto_refreshing(&self) -> bool {
        self.inner.lock().auto.is_some()
    }

    /// Requests a refresh after the debounce window. Ignored while one is
    /// already pending or in flight.
    pub fn schedule_refresh(&self) {
        let mut state = self.inner.lock();
        if state.shut_down {
            return;
        }
        if state.phase != RefreshPhase::Idle {
            debug!("history_refresh_coalesced: phase={:?}", state.phase);
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("history_refresh_no_runtime");
            return;
        };
        state.phase = RefreshPhase::Pending;
        let inner = self.inner.clone();
        let debounce = inner.debounce;
        state.task = Some(handle.spawn(async move {
            sleep(debounce).await;
            inner.fire().await;
        }));
    }

    pub fn set_auto_refresh(&self, enabled: bool) {
        let mut state = self.inner.lock();
        state.auto_requested = enabled;
        if enabled && state.visible && !state.shut_down {
            self.start_auto(&mut state);
        } else {
            stop_auto(&mut state);
        }
    }

    /// Hiding pauses the auto refresh interval; showing resumes it if it was
    /// requested.
    pub fn set_visible(&self, visible: bool) {
        let mut state = self.inner.lock();
        state.visible = visible;
        if !visible {
            stop_auto(&mut state);
        } else if state.auto_requested && !state.shut_down {
            self.start_auto(&mut state);
        }
    }

    fn start_auto(&self, state: &mut SchedulerState) {
        if state.auto.is_some() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("history_auto_refresh_no_runtime");
            return;
        };
        let inner = self.inner.clone();
        let stop = Arc::new(Notify::new());
        let stop_signal = stop.clone();
        let period = inner.period;
        let task = handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_signal.notified() => break,
                    _ = ticker.tick() => inner.tick().await,
                }
            }
        });
        state.auto = Some(AutoRefresh { task, stop });
    }

    /// Cancels the pending timer, the interval and any refresh they started.
    /// Nothing is written to the cache or the store afterwards.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        state.shut_down = true;
        if let Some(task) = state.task.take() {
            task.abort();
        }
        if let Some(auto) = state.auto.take() {
            auto.task.abort();
        }
        let was_in_flight = state.phase == RefreshPhase::InFlight;
        state.phase = RefreshPhase::Idle;
        drop(state);
        if was_in_flight {
            self.inner
                .store
                .set(keys::GENERATION_HISTORY_REFRESH_IN_FLIGHT, false);
        }
    }
}

fn stop_auto(state: &mut SchedulerState) {
    if let Some(auto) = state.auto.take() {
        auto.stop.notify_one();
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pc_core::{ServiceAdapter, ServiceFuture, ServiceReply, ServiceRequest, TransportError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct HistoryAdapter {
        list_calls: AtomicUsize,
        metrics_calls: AtomicUsize,
        failing: AtomicBool,
        jobs: Mutex<Value>,
        gate: Mutex<Option<Arc<Notify>>>,
    }

    impl HistoryAdapter {
        fn new(jobs: Value) -> Arc<Self> {
            Arc::new(Self {
                list_calls: AtomicUsize::new(0),
                metrics_calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                jobs: Mutex::new(jobs),
                gate: Mutex::new(None),
            })
        }

        /// Holds every list call until the returned gate is notified.
        fn gated(jobs: Value) -> (Arc<Self>, Arc<Notify>) {
            let adapter = Self::new(jobs);
            let gate = Arc::new(Notify::new());
            *adapter.gate.lock().expect("gate lock") = Some(gate.clone());
            (adapter, gate)
        }
    }

    impl ServiceAdapter for HistoryAdapter {
        fn request(&self, path: &str, _request: ServiceRequest) -> ServiceFuture {
            let reply = if path.starts_with("/api/generation-jobs/metrics") {
                self.metrics_calls.fetch_add(1, Ordering::SeqCst);
                Ok(ServiceReply::ok(json!({"success": true, "metrics": {"total": 1}})))
            } else if self.failing.load(Ordering::SeqCst) {
                self.list_calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Connection("Failed to fetch".to_string()))
            } else {
                self.list_calls.fetch_add(1, Ordering::SeqCst);
                let jobs = self.jobs.lock().expect("jobs lock").clone();
                Ok(ServiceReply::ok(json!({"success": true, "jobs": jobs})))
            };
            let gate = if path.starts_with("/api/generation-jobs?") {
                self.gate.lock().expect("gate lock").clone()
            } else {
                None
            };
            Box::pin(async move {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                reply
            })
        }
    }

    fn scheduler(adapter: Arc<HistoryAdapter>) -> (Store, Arc<HistoryCache>, RefreshScheduler) {
        let store = Store::new();
        let cache = Arc::new(HistoryCache::new(JobClass::Generation, store.clone(), 50));
        let scheduler = RefreshScheduler::new(
            store.clone(),
            cache.clone(),
            GenerationJobsClient::new(adapter),
            HistoryQuery::for_project("demo"),
            Duration::from_millis(250),
            Duration::from_secs(4),
        );
        (store, cache, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_requests_coalesce_into_one_fetch() {
        let adapter = HistoryAdapter::new(json!([{"jobId": "gen-1", "status": "completed"}]));
        let (store, cache, scheduler) = scheduler(adapter.clone());

        for _ in 0..5 {
            scheduler.schedule_refresh();
        }
        assert_eq!(scheduler.phase(), RefreshPhase::Pending);
        sleep(Duration::from_millis(300)).await;

        assert_eq!(adapter.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.metrics_calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.phase(), RefreshPhase::Idle);
        assert!(cache.get("gen-1").is_some());
        assert_eq!(store.get(keys::GENERATION_HISTORY_REFRESH_IN_FLIGHT), Some(json!(false)));
        assert_eq!(store.get(keys::GENERATION_METRICS_CACHE), Some(json!({"total": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_entries_and_sets_error() {
        let adapter = HistoryAdapter::new(json!([{"jobId": "gen-1", "status": "running"}]));
        let (store, cache, scheduler) = scheduler(adapter.clone());
        scheduler.schedule_refresh();
        sleep(Duration::from_millis(300)).await;
        let before = cache.snapshot();

        adapter.failing.store(true, Ordering::SeqCst);
        scheduler.schedule_refresh();
        sleep(Duration::from_millis(300)).await;

        assert_eq!(cache.snapshot(), before);
        let error = store.get(keys::GENERATION_HISTORY_ERROR).expect("error set");
        assert_eq!(error["code"], json!("NETWORK_ERROR"));
        assert_eq!(store.get(keys::GENERATION_HISTORY_REFRESH_IN_FLIGHT), Some(json!(false)));
        assert_eq!(adapter.list_calls.load(Ordering::SeqCst), 2);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(adapter.list_calls.load(Ordering::SeqCst), 2);

        adapter.failing.store(false, Ordering::SeqCst);
        scheduler.schedule_refresh();
        sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get(keys::GENERATION_HISTORY_ERROR), Some(Value::Null));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_clears_finished_active_job() {
        let adapter = HistoryAdapter::new(json!([{"jobId": "gen-9", "status": "failed"}]));
        let (store, _cache, scheduler) = scheduler(adapter);
        store.set(keys::ACTIVE_GENERATION_JOB_ID, "gen-9");
        store.set(keys::GENERATION_JOB_STREAM_STATE, "closed");

        scheduler.schedule_refresh();
        sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get(keys::ACTIVE_GENERATION_JOB_ID), Some(Value::Null));
    }

    #[tokio::test(start_paused = true)]
    async fn live_job_is_left_to_its_stream() {
        let adapter = HistoryAdapter::new(json!([{"jobId": "gen-2", "status": "completed"}]));
        let (store, cache, scheduler) = scheduler(adapter);
        store.set(keys::ACTIVE_GENERATION_JOB_ID, "gen-2");
        store.set(keys::GENERATION_JOB_STREAM_STATE, "streaming");
        cache.merge_event("gen-2", json!({"progress": 40}).as_object().expect("patch"));

        scheduler.schedule_refresh();
        sleep(Duration::from_millis(300)).await;
        assert_eq!(cache.get("gen-2").expect("record")["progress"], json!(40));
        assert_eq!(store.get_str(keys::ACTIVE_GENERATION_JOB_ID).as_deref(), Some("gen-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_refresh_ticks_and_pauses_while_hidden() {
        let adapter = HistoryAdapter::new(json!([]));
        let (_store, _cache, scheduler) = scheduler(adapter.clone());

        scheduler.set_auto_refresh(true);
        sleep(Duration::from_millis(8_100)).await;
        assert_eq!(adapter.list_calls.load(Ordering::SeqCst), 2);

        scheduler.set_visible(false);
        assert!(!scheduler.is_auto_refreshing());
        sleep(Duration::from_secs(20)).await;
        assert_eq!(adapter.list_calls.load(Ordering::SeqCst), 2);

        scheduler.set_visible(true);
        assert!(scheduler.is_auto_refreshing());
        sleep(Duration::from_millis(4_100)).await;
        assert_eq!(adapter.list_calls.load(Ordering::SeqCst), 3);

        scheduler.set_auto_refresh(false);
        sleep(Duration::from_secs(20)).await;
        assert_eq!(adapter.list_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timer() {
        let adapter = HistoryAdapter::new(json!([]));
        let (_store, _cache, scheduler) = scheduler(adapter.clone());
        scheduler.schedule_refresh();
        scheduler.shutdown();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(adapter.list_calls.load(Ordering::SeqCst), 0);
        scheduler.schedule_refresh();
        assert_eq!(scheduler.phase(), RefreshPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_and_ticks_during_a_slow_refresh_are_dropped() {
        let (adapter, gate) = HistoryAdapter::gated(json!([{"jobId": "gen-1"}]));
        let (_store, cache, scheduler) = scheduler(adapter.clone());
        scheduler.set_auto_refresh(true);

        scheduler.schedule_refresh();
        sleep(Duration::from_millis(300)).await;
        assert_eq!(scheduler.phase(), RefreshPhase::InFlight);

        for _ in 0..5 {
            scheduler.schedule_refresh();
            assert_eq!(scheduler.phase(), RefreshPhase::InFlight);
        }
        // Two interval ticks elapse while the list call is held.
        sleep(Duration::from_secs(9)).await;
        assert_eq!(adapter.list_calls.load(Ordering::SeqCst), 1);

        gate.notify_one();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.phase(), RefreshPhase::Idle);
        assert_eq!(adapter.list_calls.load(Ordering::SeqCst), 1);
        assert!(cache.get("gen-1").is_some());
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_refresh_discards_the_result() {
        let (adapter, gate) = HistoryAdapter::gated(json!([{"jobId": "late", "status": "completed"}]));
        let (store, cache, scheduler) = scheduler(adapter.clone());

        scheduler.schedule_refresh();
        sleep(Duration::from_millis(300)).await;
        assert_eq!(scheduler.phase(), RefreshPhase::InFlight);
        assert_eq!(store.get(keys::GENERATION_HISTORY_REFRESH_IN_FLIGHT), Some(json!(true)));

        scheduler.shutdown();
        gate.notify_one();
        sleep(Duration::from_secs(1)).await;

        assert!(cache.get("late").is_none());
        assert_eq!(adapter.metrics_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get(keys::GENERATION_METRICS_CACHE), None);
        assert_eq!(store.get(keys::GENERATION_HISTORY_REFRESH_IN_FLIGHT), Some(json!(false)));
        assert_eq!(scheduler.phase(), RefreshPhase::Idle);
    }

    #[test]
    fn schedule_outside_runtime_is_ignored() {
        let adapter = HistoryAdapter::new(json!([]));
        let (_store, _cache, scheduler) = scheduler(adapter);
        scheduler.schedule_refresh();
        assert_eq!(scheduler.phase(), RefreshPhase::Idle);
    }
}
