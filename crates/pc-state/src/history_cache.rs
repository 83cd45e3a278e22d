use crate::keys;
use crate::store::Store;
use pc_core::{merge_record, record_id, JobClass};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub const DEFAULT_HISTORY_CAPACITY: usize = 200;

struct CachedRecord {
    record: Map<String, Value>,
    touched: u64,
}

#[derive(Default)]
struct CacheInner {
    records: HashMap<String, CachedRecord>,
    tick: u64,
}

impl CacheInner {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn snapshot(&self) -> Value {
        let mut out = Map::new();
        for (id, cached) in &self.records {
            out.insert(id.clone(), Value::Object(cached.record.clone()));
        }
        Value::Object(out)
    }

    /// Drops least recently updated entries until the bound holds. `keep` is
    /// never evicted.
    fn evict_over(&mut self, capacity: usize, keep: Option<&str>) -> usize {
        let mut evicted = 0;
        while self.records.len() > capacity.max(1) {
            let victim = self
                .records
                .iter()
                .filter(|(id, _)| Some(id.as_str()) != keep)
                .min_by_key(|(_, cached)| cached.touched)
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    self.records.remove(&id);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

/// Job id to last known record for one job class. Every mutation publishes
/// a full snapshot under the class's cache key.
///
/// Mutations are serialised with their publish, so the published snapshot is
/// always the one taken after the latest mutation. Subscribers of the cache
/// key may read the cache but must not mutate it.
pub struct HistoryCache {
    class: JobClass,
    store: Store,
    capacity: usize,
    inner: Mutex<CacheInner>,
    publish: Mutex<()>,
}

impl HistoryCache {
    pub fn new(class: JobClass, store: Store, capacity: usize) -> Self {
        Self {
            class,
            store,
            capacity,
            inner: Mutex::new(CacheInner::default()),
            publish: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publishing(&self) -> MutexGuard<'_, ()> {
        self.publish.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn class(&self) -> JobClass {
        self.class
    }

    pub fn get(&self, job_id: &str) -> Option<Value> {
        self.lock()
            .records
            .get(job_id)
            .map(|cached| Value::Object(cached.record.clone()))
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Value {
        self.lock().snapshot()
    }

    /// Merges one pushed event into the job's record and publishes. Returns
    /// the merged record.
    pub fn merge_event(&self, job_id: &str, patch: &Map<String, Value>) -> Value {
        let _publishing = self.publishing();
        let (merged, snapshot) = {
            let mut inner = self.lock();
            let touched = inner.touch();
            let id_field = self.class.id_field();
            let cached = inner
                .records
                .entry(job_id.to_string())
                .or_insert_with(|| CachedRecord {
                    record: Map::new(),
                    touched,
                });
            cached.touched = touched;
            merge_record(&mut cached.record, patch);
            cached
                .record
                .insert(id_field.to_string(), Value::String(job_id.to_string()));
            let merged = Value::Object(cached.record.clone());
            inner.evict_over(self.capacity, Some(job_id));
            (merged, inner.snapshot())
        };
        self.store.set(keys::record_cache(self.class), snapshot);
        merged
    }

    /// Replaces the entries named by a polled batch in one step and publishes
    /// once. Records without an id are skipped, as is `skip_id` (a job whose
    /// record is owned by a live stream). Returns the number of entries
    /// written.
    pub fn replace_batch(&self, records: &[Value], skip_id: Option<&str>) -> usize {
        let _publishing = self.publishing();
        let (written, snapshot) = {
            let mut inner = self.lock();
            let mut written = 0;
            for record in records {
                let (Some(id), Some(map)) = (record_id(record), record.as_object()) else {
                    continue;
                };
                if Some(id.as_str()) == skip_id {
                    continue;
                }
                let touched = inner.touch();
                inner.records.insert(
                    id,
                    CachedRecord {
                        record: map.clone(),
                        touched,
                    },
                );
                written += 1;
            }
            let evicted = inner.evict_over(self.capacity, skip_id);
            if evicted > 0 {
                debug!("history_cache_evicted: class={} count={evicted}", self.class);
            }
            (written, inner.snapshot())
        };
        self.store.set(keys::record_cache(self.class), snapshot);
        written
    }
}
