//! One live event stream per job class.
//!
//! Starting a job replaces the class's previous connection: the old pump task
//! is aborted and joined before the new subscription is opened, so no event
//! of the replaced job is applied after the new job starts. A replaced stream
//! that was still live publishes `closed` before the new `connecting`, with
//! [`JobStreamCoordinator::is_replacing`] set while that transition fans out.

use crate::history_cache::HistoryCache;
use crate::keys;
use crate::store::Store;
use crate::transport::{JobTransport, LiveConnection, TransportEvent};
use pc_core::clients::{AgentRuntimeClient, GenerationJobsClient, StartedJob};
use pc_core::frames::parse_event;
use pc_core::{
    is_terminal_event, record_is_terminal, ErrorCode, JobClass, ServiceAdapter,
    ServiceError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    Closed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Connecting => "connecting",
            StreamState::Streaming => "streaming",
            StreamState::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(StreamState::Idle),
            "connecting" => Some(StreamState::Connecting),
            "streaming" => Some(StreamState::Streaming),
            "closed" => Some(StreamState::Closed),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, StreamState::Connecting | StreamState::Streaming)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live job id of `class` as published in the store: the active id, while
/// the class's stream is connecting or streaming.
pub fn live_job_in_store(store: &Store, class: JobClass) -> Option<String> {
    let live = store
        .get(keys::stream_state(class))
        .and_then(|value| value.as_str().and_then(StreamState::parse))
        .map(|state| state.is_live())
        .unwrap_or(false);
    if live {
        store.get_str(keys::active_id(class))
    } else {
        None
    }
}

struct Shared {
    class: JobClass,
    store: Store,
    cache: Arc<HistoryCache>,
    seq: AtomicU64,
    replacing: AtomicBool,
    state: Mutex<StreamState>,
}

impl Shared {
    fn state_lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: StreamState) {
        *self.state_lock() = next;
        self.store.set(keys::stream_state(self.class), next.as_str());
    }

    fn is_current(&self, seq: u64) -> bool {
        self.seq.load(Ordering::SeqCst) == seq
    }

    fn publish_job_error(&self, job_id: &str, code: ErrorCode, message: &str) {
        self.store.set(
            &keys::job_error(job_id),
            json!({
                "code": code.as_str(),
                "message": message,
                "class": self.class.as_str(),
            }),
        );
    }
}

enum Applied {
    Skipped,
    Merged,
    Terminal,
}

struct Pump {
    shared: Arc<Shared>,
    job_id: String,
    seq: u64,
}

impl Pump {
    async fn run(self, mut conn: LiveConnection) {
        let mut streaming = false;
        let mut finished = false;
        while let Some(event) = conn.next().await {
            if !self.shared.is_current(self.seq) {
                break;
            }
            if !streaming {
                streaming = true;
                self.shared.set_state(StreamState::Streaming);
            }
            match event {
                TransportEvent::Message(text) => {
                    if let Applied::Terminal = self.apply(&text) {
                        finished = true;
                        break;
                    }
                }
                TransportEvent::Error(message) => {
                    self.fail(&message);
                    finished = true;
                    break;
                }
            }
        }
        if !finished && self.shared.is_current(self.seq) {
            self.fail("event stream ended before the job finished");
        }
        conn.close();
    }

    fn apply(&self, text: &str) -> Applied {
        let class = self.shared.class;
        let patch = match parse_event(text) {
            Ok(patch) => patch,
            Err(err) => {
                warn!("job_stream_invalid_event: class={class} job={} {err}", self.job_id);
                self.shared
                    .publish_job_error(&self.job_id, ErrorCode::InvalidInput, &err.to_string());
                return Applied::Skipped;
            }
        };

        let event = patch
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if event == "stream_open" {
            debug!("job_stream_open_ack: class={class} job={}", self.job_id);
            return Applied::Skipped;
        }

        if let Some(event_id) = patch.get(class.id_field()).and_then(Value::as_str) {
            if event_id.trim() != self.job_id {
                let message = format!("event for {event_id} on stream of {}", self.job_id);
                warn!("job_stream_mismatched_event: class={class} {message}");
                self.shared
                    .publish_job_error(&self.job_id, ErrorCode::InvalidInput, &message);
                return Applied::Skipped;
            }
        }

        let merged = self.shared.cache.merge_event(&self.job_id, &patch);
        if is_terminal_event(&event) || record_is_terminal(&merged) {
            info!("job_stream_terminal: class={class} job={} event={event}", self.job_id);
            self.shared.set_state(StreamState::Closed);
            self.shared.store.set(keys::active_id(class), Value::Null);
            return Applied::Terminal;
        }
        Applied::Merged
    }

    fn fail(&self, message: &str) {
        warn!(
            "job_stream_transport_error: class={} job={} {message}",
            self.shared.class, self.job_id
        );
        self.shared.set_state(StreamState::Closed);
        self.shared
            .publish_job_error(&self.job_id, ErrorCode::NetworkError, message);
    }
}

struct LiveStream {
    job_id: String,
    pump: JoinHandle<()>,
}

pub struct JobStreamCoordinator {
    shared: Arc<Shared>,
    transport: Arc<dyn JobTransport>,
    adapter: Arc<dyn ServiceAdapter>,
    live: tokio::sync::Mutex<Option<LiveStream>>,
}

impl JobStreamCoordinator {
    pub fn new(
        class: JobClass,
        store: Store,
        cache: Arc<HistoryCache>,
        transport: Arc<dyn JobTransport>,
        adapter: Arc<dyn ServiceAdapter>,
    ) -> Self {
        store.set(keys::stream_state(class), StreamState::Idle.as_str());
        Self {
            shared: Arc::new(Shared {
                class,
                store,
                cache,
                seq: AtomicU64::new(0),
                replacing: AtomicBool::new(false),
                state: Mutex::new(StreamState::Idle),
            }),
            transport,
            adapter,
            live: tokio::sync::Mutex::new(None),
        }
    }

    pub fn class(&self) -> JobClass {
        self.shared.class
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state_lock()
    }

    pub fn active_job_id(&self) -> Option<String> {
        self.shared.store.get_str(keys::active_id(self.shared.class))
    }

    pub fn cache(&self) -> &Arc<HistoryCache> {
        &self.shared.cache
    }

    /// True while the `closed` of a replaced stream is being published.
    pub fn is_replacing(&self) -> bool {
        self.shared.replacing.load(Ordering::SeqCst)
    }

    /// Tracks `job_id`, replacing any connection the class already has.
    /// Subscription failures end in `Closed` with the error published under
    /// the job's error key.
    pub async fn start(&self, job_id: &str) -> StreamState {
        let job_id = job_id.trim();
        let class = self.shared.class;
        if job_id.is_empty() {
            warn!("job_stream_start_ignored: class={class} empty job id");
            return self.state();
        }

        let mut live = self.live.lock().await;
        if let Some(previous) = live.take() {
            info!(
                "job_stream_replaced: class={class} previous={} next={job_id}",
                previous.job_id
            );
            self.shared.seq.fetch_add(1, Ordering::SeqCst);
            previous.pump.abort();
            let _ = previous.pump.await;
            if self.state().is_live() {
                self.shared.replacing.store(true, Ordering::SeqCst);
                self.shared.set_state(StreamState::Closed);
                self.shared.replacing.store(false, Ordering::SeqCst);
            }
        }
        let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst) + 1;

        let error_key = keys::job_error(job_id);
        if self.shared.store.get(&error_key).is_some() {
            self.shared.store.set(&error_key, Value::Null);
        }
        self.shared.set_state(StreamState::Connecting);
        self.shared.store.set(keys::active_id(class), job_id);

        match self.transport.subscribe(class, job_id).await {
            Ok(conn) => {
                info!("job_stream_open: class={class} job={job_id}");
                let pump = Pump {
                    shared: self.shared.clone(),
                    job_id: job_id.to_string(),
                    seq,
                };
                *live = Some(LiveStream {
                    job_id: job_id.to_string(),
                    pump: tokio::spawn(pump.run(conn)),
                });
                StreamState::Connecting
            }
            Err(err) => {
                warn!("job_stream_subscribe_error: class={class} job={job_id} {err}");
                self.shared.set_state(StreamState::Closed);
                self.shared
                    .publish_job_error(job_id, ErrorCode::NetworkError, &err.to_string());
                StreamState::Closed
            }
        }
    }

    /// Starts a job or run through the service and tracks it. A lock conflict
    /// that names the active owner tracks that job instead.
    pub async fn run(&self, payload: Value) -> Result<StartedJob, ServiceError> {
        let started = match self.shared.class {
            JobClass::Generation => {
                GenerationJobsClient::new(self.adapter.clone())
                    .start_job(payload)
                    .await?
            }
            JobClass::Agent => {
                AgentRuntimeClient::new(self.adapter.clone())
                    .start_run(payload)
                    .await?
            }
        };
        if started.reused {
            info!(
                "job_stream_reuse_active: class={} job={} trace={}",
                started.class, started.id, started.trace_id
            );
        }
        self.start(&started.id).await;
        Ok(started)
    }

    /// Closes the live connection, if any. The active id is kept.
    pub async fn shutdown(&self) {
        let mut live = self.live.lock().await;
        self.shared.seq.fetch_add(1, Ordering::SeqCst);
        if let Some(previous) = live.take() {
            previous.pump.abort();
            let _ = previous.pump.await;
            if self.state().is_live() {
                self.shared.set_state(StreamState::Closed);
            }
            debug!(
                "job_stream_shutdown: class={} job={}",
                self.shared.class, previous.job_id
            );
        }
    }
}
