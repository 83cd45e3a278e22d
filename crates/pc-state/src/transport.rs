//! Live job event transport.
//!
//! A subscription yields the job's pushed events in order as a
//! [`LiveConnection`]. The connection runs its close hook exactly once, either
//! through [`LiveConnection::close`] or when it is dropped.

use futures_util::future::BoxFuture;
use pc_core::{JobClass, JobHandle, TransportError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

pub const LIVE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Error(String),
}

pub type SubscribeFuture = BoxFuture<'static, Result<LiveConnection, TransportError>>;

pub trait JobTransport: Send + Sync {
    fn subscribe(&self, class: JobClass, job_id: &str) -> SubscribeFuture;
}

impl<T: JobTransport + ?Sized> JobTransport for Arc<T> {
    fn subscribe(&self, class: JobClass, job_id: &str) -> SubscribeFuture {
        (**self).subscribe(class, job_id)
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

pub struct LiveConnection {
    events: mpsc::Receiver<TransportEvent>,
    close_hook: Option<CloseHook>,
}

impl std::fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnection")
            .field("open", &self.close_hook.is_some())
            .finish()
    }
}

impl LiveConnection {
    pub fn new<F>(events: mpsc::Receiver<TransportEvent>, close_hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            events,
            close_hook: Some(Box::new(close_hook)),
        }
    }

    pub async fn next(&mut self) -> Option<TransportEvent> {
        if self.close_hook.is_none() {
            return None;
        }
        self.events.recv().await
    }

    pub fn is_open(&self) -> bool {
        self.close_hook.is_some()
    }

    pub fn close(&mut self) {
        self.events.close();
        if let Some(hook) = self.close_hook.take() {
            hook();
        }
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportLogEntry {
    Opened(JobHandle),
    Closed(JobHandle),
}

#[derive(Default)]
struct MemoryInner {
    senders: HashMap<(JobClass, String), mpsc::Sender<TransportEvent>>,
    log: Vec<TransportLogEntry>,
    refuse: HashSet<String>,
}

/// In-process transport: events are pushed by the caller. Records every
/// subscription and close for inspection.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next subscriptions for `job_id` fail.
    pub fn refuse(&self, job_id: &str) {
        self.lock().refuse.insert(job_id.to_string());
    }

    pub fn is_open(&self, class: JobClass, job_id: &str) -> bool {
        self.lock()
            .senders
            .contains_key(&(class, job_id.to_string()))
    }

    /// Opens and closes in the order they happened.
    pub fn log(&self) -> Vec<TransportLogEntry> {
        self.lock().log.clone()
    }

    pub fn opened(&self) -> Vec<JobHandle> {
        self.log()
            .into_iter()
            .filter_map(|entry| match entry {
                TransportLogEntry::Opened(handle) => Some(handle),
                TransportLogEntry::Closed(_) => None,
            })
            .collect()
    }

    pub fn closed(&self) -> Vec<JobHandle> {
        self.log()
            .into_iter()
            .filter_map(|entry| match entry {
                TransportLogEntry::Closed(handle) => Some(handle),
                TransportLogEntry::Opened(_) => None,
            })
            .collect()
    }

    /// Sends one event to the open subscription. Returns false when nothing
    /// is listening for the job.
    pub async fn push(&self, class: JobClass, job_id: &str, event: TransportEvent) -> bool {
        let sender = self.lock().senders.get(&(class, job_id.to_string())).cloned();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn push_message(&self, class: JobClass, job_id: &str, text: impl Into<String>) -> bool {
        self.push(class, job_id, TransportEvent::Message(text.into()))
            .await
    }
}

impl JobTransport for MemoryTransport {
    fn subscribe(&self, class: JobClass, job_id: &str) -> SubscribeFuture {
        let job_id = job_id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if guard.refuse.contains(&job_id) {
                return Err(TransportError::Connection(format!(
                    "subscription refused for {job_id}"
                )));
            }
            let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
            guard.senders.insert((class, job_id.clone()), tx);
            guard
                .log
                .push(TransportLogEntry::Opened(JobHandle::new(class, job_id.clone())));
            drop(guard);

            let hook_inner = inner.clone();
            Ok(LiveConnection::new(rx, move || {
                let mut guard = hook_inner
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                guard.senders.remove(&(class, job_id.clone()));
                guard
                    .log
                    .push(TransportLogEntry::Closed(JobHandle::new(class, job_id)));
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_hook_runs_once() {
        let transport = MemoryTransport::new();
        let mut conn = transport
            .subscribe(JobClass::Generation, "gen-1")
            .await
            .expect("subscribe");
        assert!(transport.is_open(JobClass::Generation, "gen-1"));
        assert!(
            transport
                .push_message(JobClass::Generation, "gen-1", "{\"progress\":1}")
                .await
        );
        assert_eq!(
            conn.next().await,
            Some(TransportEvent::Message("{\"progress\":1}".to_string()))
        );

        conn.close();
        conn.close();
        drop(conn);
        assert_eq!(transport.closed().len(), 1);
        assert!(!transport.is_open(JobClass::Generation, "gen-1"));
        assert!(
            !transport
                .push_message(JobClass::Generation, "gen-1", "{}")
                .await
        );
    }

    #[tokio::test]
    async fn dropping_connection_closes_it() {
        let transport = MemoryTransport::new();
        let conn = transport
            .subscribe(JobClass::Agent, "run-1")
            .await
            .expect("subscribe");
        drop(conn);
        assert_eq!(transport.closed(), vec![JobHandle::new(JobClass::Agent, "run-1")]);
    }

    #[tokio::test]
    async fn refused_subscription_fails() {
        let transport = MemoryTransport::new();
        transport.refuse("gen-9");
        let err = transport
            .subscribe(JobClass::Generation, "gen-9")
            .await
            .expect_err("refused");
        assert!(matches!(err, TransportError::Connection(_)));
        assert!(transport.opened().is_empty());
    }
}
