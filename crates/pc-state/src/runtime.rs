use crate::config::RuntimeConfig;
use crate::history_cache::HistoryCache;
use crate::job_stream::{JobStreamCoordinator, StreamState};
use crate::keys;
use crate::preflight_cache::{PreflightCache, PreflightResult};
use crate::refresh_scheduler::RefreshScheduler;
use crate::store::{Store, Subscription};
use crate::transport::JobTransport;
use pc_core::clients::{
    AgentRuntimeClient, GenerationJobsClient, HistoryQuery, PreflightRequest, ReadinessClient,
    StartedJob,
};
use pc_core::{JobClass, ServiceAdapter, ServiceError};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Owns one store and every component that reads or writes it, with the
/// subscriptions between them.
pub struct PcRuntime {
    store: Store,
    config: RuntimeConfig,
    preflight: Arc<PreflightCache>,
    generation: Arc<JobStreamCoordinator>,
    agent: JobStreamCoordinator,
    scheduler: Arc<RefreshScheduler>,
    generation_client: GenerationJobsClient,
    agent_client: AgentRuntimeClient,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl PcRuntime {
    pub fn new(
        config: RuntimeConfig,
        adapter: Arc<dyn ServiceAdapter>,
        transport: Arc<dyn JobTransport>,
        query: HistoryQuery,
    ) -> Self {
        let store = Store::new();
        let generation_cache = Arc::new(HistoryCache::new(
            JobClass::Generation,
            store.clone(),
            config.history_capacity,
        ));
        let agent_cache = Arc::new(HistoryCache::new(
            JobClass::Agent,
            store.clone(),
            config.history_capacity,
        ));
        let generation_client = GenerationJobsClient::new(adapter.clone());
        let agent_client = AgentRuntimeClient::new(adapter.clone());

        let preflight = Arc::new(PreflightCache::new(
            store.clone(),
            ReadinessClient::new(adapter.clone()),
            config.preflight_capacity,
            config.preflight_ttl,
        ));
        let generation = Arc::new(JobStreamCoordinator::new(
            JobClass::Generation,
            store.clone(),
            generation_cache.clone(),
            transport.clone(),
            adapter.clone(),
        ));
        let agent = JobStreamCoordinator::new(
            JobClass::Agent,
            store.clone(),
            agent_cache,
            transport,
            adapter,
        );

        let query = HistoryQuery {
            limit: query.limit.or(Some(config.history_limit)),
            ..query
        };
        let scheduler = Arc::new(RefreshScheduler::new(
            store.clone(),
            generation_cache,
            generation_client.clone(),
            query,
            config.debounce,
            config.auto_refresh_interval,
        ));

        store.set(keys::ACTIVE_GENERATION_JOB_ID, Value::Null);
        store.set(keys::AGENT_ACTIVE_RUN_ID, Value::Null);
        store.set(keys::GENERATION_HISTORY_REFRESH_IN_FLIGHT, false);
        store.set(keys::GENERATION_HISTORY_ERROR, Value::Null);

        let mut subscriptions = vec![preflight.watch_saves()];
        // A replaced stream closes on the way to the next job; only the
        // closes that end tracking reconcile the history.
        let on_close = Arc::downgrade(&scheduler);
        let closing = Arc::downgrade(&generation);
        subscriptions.push(store.on(keys::GENERATION_JOB_STREAM_STATE, move |value| {
            if value.as_str() != Some(StreamState::Closed.as_str()) {
                return;
            }
            if closing.upgrade().is_some_and(|coordinator| coordinator.is_replacing()) {
                return;
            }
            if let Some(scheduler) = on_close.upgrade() {
                scheduler.schedule_refresh();
            }
        }));

        if config.auto_refresh {
            scheduler.set_auto_refresh(true);
        }

        Self {
            store,
            config,
            preflight,
            generation,
            agent,
            scheduler,
            generation_client,
            agent_client,
            subscriptions: Mutex::new(subscriptions),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn coordinator(&self, class: JobClass) -> &JobStreamCoordinator {
        match class {
            JobClass::Agent => &self.agent,
            JobClass::Generation => self.generation.as_ref(),
        }
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    pub fn preflight(&self) -> &PreflightCache {
        &self.preflight
    }

    pub async fn run_generation_job(&self, payload: Value) -> Result<StartedJob, ServiceError> {
        self.generation.run(payload).await
    }

    pub async fn run_agent(&self, payload: Value) -> Result<StartedJob, ServiceError> {
        self.agent.run(payload).await
    }

    /// Tracks an existing job or run without starting it.
    pub async fn track(&self, class: JobClass, job_id: &str) -> StreamState {
        self.coordinator(class).start(job_id).await
    }

    /// Requests cancellation; the stream reports the final state.
    pub async fn cancel_generation_job(&self, job_id: &str) -> Result<Value, ServiceError> {
        self.generation_client.cancel_job(job_id).await
    }

    pub async fn retry_generation_job(
        &self,
        job_id: &str,
        payload: Value,
    ) -> Result<StartedJob, ServiceError> {
        let started = self.generation_client.retry_job(job_id, payload).await?;
        self.generation.start(&started.id).await;
        Ok(started)
    }

    pub async fn cancel_agent_run(&self, run_id: &str) -> Result<Value, ServiceError> {
        self.agent_client.cancel_run(run_id).await
    }

    pub async fn revert_agent_run(&self, run_id: &str) -> Result<Value, ServiceError> {
        self.agent_client.revert_run(run_id).await
    }

    pub async fn load_shot_preflight(&self, request: &PreflightRequest) -> PreflightResult {
        self.preflight.get_or_compute(request).await
    }

    /// Records a shot save; its preflight entry is invalidated.
    pub fn mark_shot_saved(&self, shot_id: &str) {
        self.store.set(keys::LAST_SAVED_SHOT_ID, shot_id);
    }

    pub async fn shutdown(&self) {
        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
        self.scheduler.shutdown();
        self.generation.shutdown().await;
        self.agent.shutdown().await;
        info!("runtime_shutdown");
    }
}
