//! Window cache of content units over a [`RecordStore`]
//!
//! Units are keyed by `(collection id, sequence)`. A reading cursor drives
//! the window: [`ChapterWindowCache::prefetch`] evicts every entry outside the
//! window and fills `current..=current + window` from a [`ContentSource`].
//!
//! The store is treated as slow and fallible. Store failures are logged and
//! become cache misses; they never reach the caller.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use folio_core::ClientError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::key::{cache_key, collection_prefix};
use crate::store::{CHAPTERS, FsStore, RecordStore, SCHEMA, StoreError};

/// One cached unit as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub cache_key: String,
    pub collection_id: String,
    pub sequence: u32,
    pub payload: T,
}

impl<T> CacheEntry<T> {
    pub fn new(collection_id: &str, sequence: u32, payload: T) -> Self {
        Self {
            cache_key: cache_key(collection_id, sequence),
            collection_id: collection_id.to_string(),
            sequence,
            payload,
        }
    }
}

/// Where cache misses are fetched from.
#[async_trait]
pub trait ContentSource<T>: Send + Sync {
    async fn fetch_unit(&self, collection_id: &str, sequence: u32) -> Result<T, ClientError>;
}

/// What a [`ChapterWindowCache::prefetch`] pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    /// Entries outside the window that were deleted.
    pub evicted: usize,
    /// Missing entries fetched and persisted.
    pub fetched: usize,
    /// Entries in the window that were already persisted.
    pub resident: usize,
    /// Window entries that could not be fetched or persisted.
    pub failed: usize,
}

/// Stand-in used when the persistent store could not be opened.
struct UnavailableStore {
    reason: String,
}

#[async_trait]
impl RecordStore for UnavailableStore {
    async fn get(&self, _: &str, _: &str) -> Result<Option<Value>, StoreError> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }

    async fn put(&self, _: &str, _: &str, _: &Value) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }

    async fn delete(&self, _: &str, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }

    async fn scan_prefix(&self, _: &str, _: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }
}

pub struct ChapterWindowCache<T> {
    store: Arc<dyn RecordStore>,
    source: Arc<dyn ContentSource<T>>,
    partition: &'static str,
    cached_entries: watch::Sender<Vec<CacheEntry<T>>>,
}

impl<T> ChapterWindowCache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Cache over the `chapters` partition of `store`.
    pub fn new(store: Arc<dyn RecordStore>, source: Arc<dyn ContentSource<T>>) -> Self {
        Self::with_partition(store, source, CHAPTERS)
    }

    pub fn with_partition(
        store: Arc<dyn RecordStore>,
        source: Arc<dyn ContentSource<T>>,
        partition: &'static str,
    ) -> Self {
        let (cached_entries, _rx) = watch::channel(Vec::new());
        Self {
            store,
            source,
            partition,
            cached_entries,
        }
    }

    /// Open the filesystem store at `dir` and build a cache over it.
    ///
    /// If the store cannot be opened the cache still works, with every
    /// lookup a miss and nothing persisted.
    pub async fn open(dir: &Path, source: Arc<dyn ContentSource<T>>) -> Self {
        let store: Arc<dyn RecordStore> = match FsStore::open(dir, &SCHEMA).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                log::warn!("cache disabled: {e}");
                Arc::new(UnavailableStore {
                    reason: e.to_string(),
                })
            }
        };
        Self::new(store, source)
    }

    /// Point lookup in the persistent store.
    pub async fn get(&self, collection_id: &str, sequence: u32) -> Option<CacheEntry<T>> {
        let key = cache_key(collection_id, sequence);
        match self.store.get(self.partition, &key).await {
            Ok(Some(value)) => self.decode(&key, value),
            Ok(None) => None,
            Err(e) => {
                log::warn!("cache read {key}: {e}");
                None
            }
        }
    }

    /// Every persisted entry of `collection_id`, unordered.
    pub async fn get_window(&self, collection_id: &str) -> Vec<CacheEntry<T>> {
        let prefix = collection_prefix(collection_id);
        match self.store.scan_prefix(self.partition, &prefix).await {
            Ok(records) => records
                .into_iter()
                .filter_map(|(key, value)| self.decode(&key, value))
                .collect(),
            Err(e) => {
                log::warn!("cache scan {prefix}: {e}");
                Vec::new()
            }
        }
    }

    /// Evict entries outside `current..=current + window`, then fill it.
    ///
    /// Each entry is best effort: a failed fetch or write is logged and the
    /// pass moves on to the next sequence.
    pub async fn prefetch(&self, collection_id: &str, current: u32, window: u32) -> PrefetchReport {
        let mut report = PrefetchReport::default();
        let last = current.saturating_add(window);

        for entry in self.get_window(collection_id).await {
            if (current..=last).contains(&entry.sequence) {
                continue;
            }
            match self.store.delete(self.partition, &entry.cache_key).await {
                Ok(true) => report.evicted += 1,
                Ok(false) => {}
                Err(e) => log::warn!("cache evict {}: {e}", entry.cache_key),
            }
        }

        for sequence in current..=last {
            if self.get(collection_id, sequence).await.is_some() {
                report.resident += 1;
                continue;
            }
            let payload = match self.source.fetch_unit(collection_id, sequence).await {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("fetch {collection_id}:{sequence} failed: {e}");
                    report.failed += 1;
                    continue;
                }
            };
            if self.persist(CacheEntry::new(collection_id, sequence, payload)).await {
                report.fetched += 1;
            } else {
                report.failed += 1;
            }
        }

        self.refresh_mirror(collection_id).await;
        log::info!(
            "{collection_id} @ {current}: {} resident, {} fetched, {} evicted, {} failed",
            report.resident,
            report.fetched,
            report.evicted,
            report.failed
        );
        report
    }

    /// Delete every entry of `collection_id`. Returns how many were removed.
    pub async fn clear(&self, collection_id: &str) -> usize {
        let mut removed = 0;
        for entry in self.get_window(collection_id).await {
            match self.store.delete(self.partition, &entry.cache_key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => log::warn!("cache delete {}: {e}", entry.cache_key),
            }
        }
        self.cached_entries
            .send_modify(|entries| entries.retain(|e| e.collection_id != collection_id));
        removed
    }

    /// Watch the in-memory mirror of the last prefetched window.
    pub fn subscribe(&self) -> watch::Receiver<Vec<CacheEntry<T>>> {
        self.cached_entries.subscribe()
    }

    /// Mirror of the last prefetched window, ordered by sequence.
    pub fn cached_entries(&self) -> Vec<CacheEntry<T>> {
        self.cached_entries.borrow().clone()
    }

    async fn persist(&self, entry: CacheEntry<T>) -> bool {
        let value = match serde_json::to_value(&entry) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("cache encode {}: {e}", entry.cache_key);
                return false;
            }
        };
        match self.store.put(self.partition, &entry.cache_key, &value).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("cache write {}: {e}", entry.cache_key);
                false
            }
        }
    }

    async fn refresh_mirror(&self, collection_id: &str) {
        let mut entries = self.get_window(collection_id).await;
        entries.sort_by_key(|e| e.sequence);
        self.cached_entries.send_replace(entries);
    }

    fn decode(&self, key: &str, value: Value) -> Option<CacheEntry<T>> {
        match serde_json::from_value(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("cache entry {key} unreadable: {e}");
                None
            }
        }
    }
}

/// Percentage `current / total`, rounded to two decimals.
///
/// `0.0` when either operand is missing or `total` is zero.
pub fn derived_progress(current: Option<f64>, total: Option<f64>) -> f64 {
    match (current, total) {
        (Some(current), Some(total)) if total != 0.0 => {
            (current / total * 100.0 * 100.0).round() / 100.0
        }
        _ => 0.0,
    }
}
