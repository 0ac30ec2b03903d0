//! Partitioned key/value record store on the local filesystem
//!
//! Directory layout:
//! ```text
//! {base}/
//! ├── store.json              # schema version + partitions
//! ├── chapters/
//! │   ├── {encoded-key}.json  # one record per key
//! │   └── {encoded-key}.{pid}-{n}.json.tmp
//! ├── bookmarks/
//! └── recentlyVisitedNovels/
//! ```
//!
//! Writes go to a `.tmp` sibling first and are renamed into place, so a
//! reader never observes a half-written record.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use folio_core::ClientError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::{decode_file_stem, encode_file_stem};

pub const CHAPTERS: &str = "chapters";
pub const BOOKMARKS: &str = "bookmarks";
pub const RECENTLY_VISITED: &str = "recentlyVisitedNovels";

const META_FILE: &str = "store.json";
const RECORD_EXT: &str = ".json";
const TMP_EXT: &str = ".json.tmp";

/// Schema the store is opened with: a version and the partitions it needs.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub version: u32,
    pub partitions: &'static [&'static str],
}

/// Current on-disk schema.
pub const SCHEMA: Schema = Schema {
    version: 4,
    partitions: &[BOOKMARKS, CHAPTERS, RECENTLY_VISITED],
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt record {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown partition: {0}")]
    UnknownPartition(String),
    #[error("store schema version {found} is newer than supported version {supported}")]
    Schema { found: u32, supported: u32 },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        ClientError::resource(e.to_string())
    }
}

/// Async key/value store with named partitions.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, partition: &str, key: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&self, partition: &str, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Returns `false` if the key was not present.
    async fn delete(&self, partition: &str, key: &str) -> Result<bool, StoreError>;

    /// All records whose key starts with `prefix`, in no particular order.
    async fn scan_prefix(
        &self,
        partition: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Value)>, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreMeta {
    schema_version: u32,
    partitions: Vec<String>,
    upgraded_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    value: Value,
    written_at: chrono::DateTime<chrono::Utc>,
}

/// Filesystem-backed [`RecordStore`].
#[derive(Debug)]
pub struct FsStore {
    base: PathBuf,
    partitions: BTreeSet<String>,
}

impl FsStore {
    /// Open (or create) a store at `base`, upgrading it to `schema`.
    ///
    /// Upgrading creates missing partitions and records the new version.
    /// A store written by a newer schema is refused.
    pub async fn open(base: &Path, schema: &Schema) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(base)
            .await
            .map_err(|e| StoreError::io(base, e))?;

        let meta_path = base.join(META_FILE);
        let found = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => match serde_json::from_slice::<StoreMeta>(&bytes) {
                Ok(meta) => meta.schema_version,
                Err(e) => {
                    log::warn!("{}: unreadable ({e}), rebuilding", meta_path.display());
                    0
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(StoreError::io(&meta_path, e)),
        };

        if found > schema.version {
            return Err(StoreError::Schema {
                found,
                supported: schema.version,
            });
        }

        for partition in schema.partitions {
            let dir = base.join(partition);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(&dir, e))?;
        }

        if found < schema.version {
            log::info!(
                "store {}: schema {found} -> {}",
                base.display(),
                schema.version
            );
            let meta = StoreMeta {
                schema_version: schema.version,
                partitions: schema.partitions.iter().map(|p| p.to_string()).collect(),
                upgraded_at: chrono::Utc::now(),
            };
            let json = serde_json::to_vec_pretty(&meta).map_err(|e| StoreError::Corrupt {
                key: META_FILE.to_string(),
                source: e,
            })?;
            write_atomic(&meta_path, &json).await?;
        }

        Ok(Self {
            base: base.to_path_buf(),
            partitions: schema.partitions.iter().map(|p| p.to_string()).collect(),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn partition_dir(&self, partition: &str) -> Result<PathBuf, StoreError> {
        if !self.partitions.contains(partition) {
            return Err(StoreError::UnknownPartition(partition.to_string()));
        }
        Ok(self.base.join(partition))
    }

    fn record_path(&self, partition: &str, key: &str) -> Result<PathBuf, StoreError> {
        let stem = encode_file_stem(key);
        Ok(self.partition_dir(partition)?.join(format!("{stem}{RECORD_EXT}")))
    }
}

/// Write `bytes` to `path` via a `.tmp` sibling and rename.
///
/// Every write gets its own tmp name, so concurrent writes to one key never
/// rename each other's file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    static WRITES: AtomicU64 = AtomicU64::new(0);
    let n = WRITES.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("{}-{n}{TMP_EXT}", std::process::id()));
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

async fn read_record(path: &Path, key: &str) -> Result<Option<Value>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let record: StoredRecord = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        source: e,
    })?;
    Ok(Some(record.value))
}

#[async_trait]
impl RecordStore for FsStore {
    async fn get(&self, partition: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.record_path(partition, key)?;
        read_record(&path, key).await
    }

    async fn put(&self, partition: &str, key: &str, value: &Value) -> Result<(), StoreError> {
        let path = self.record_path(partition, key)?;
        let record = StoredRecord {
            key: key.to_string(),
            value: value.clone(),
            written_at: chrono::Utc::now(),
        };
        let json = serde_json::to_vec(&record).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            source: e,
        })?;
        write_atomic(&path, &json).await
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<bool, StoreError> {
        let path = self.record_path(partition, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn scan_prefix(
        &self,
        partition: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let dir = self.partition_dir(partition)?;
        let encoded_prefix = encode_file_stem(prefix);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Skip in-flight writes
            if name.ends_with(TMP_EXT) {
                continue;
            }
            let Some(stem) = name.strip_suffix(RECORD_EXT) else {
                continue;
            };
            if !stem.starts_with(&encoded_prefix) {
                continue;
            }
            let Some(key) = decode_file_stem(stem) else {
                log::warn!("{partition}: skipping unrecognized file {name}");
                continue;
            };
            match read_record(&entry.path(), &key).await {
                Ok(Some(value)) => records.push((key, value)),
                // Deleted between listing and reading
                Ok(None) => {}
                Err(e) => log::warn!("{partition}: skipping {key}: {e}"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_store(dir: &Path) -> FsStore {
        FsStore::open(dir, &SCHEMA).await.unwrap()
    }

    #[tokio::test]
    async fn open_creates_partitions_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let _store = open_store(dir.path()).await;

        for partition in SCHEMA.partitions {
            assert!(dir.path().join(partition).is_dir());
        }
        let meta: StoreMeta =
            serde_json::from_slice(&std::fs::read(dir.path().join(META_FILE)).unwrap()).unwrap();
        assert_eq!(meta.schema_version, SCHEMA.version);
    }

    #[tokio::test]
    async fn open_upgrades_older_schema() {
        let dir = tempfile::tempdir().unwrap();
        let old = Schema {
            version: 2,
            partitions: &[BOOKMARKS],
        };
        FsStore::open(dir.path(), &old).await.unwrap();
        assert!(!dir.path().join(CHAPTERS).exists());

        let store = open_store(dir.path()).await;
        assert!(dir.path().join(CHAPTERS).is_dir());
        store.put(CHAPTERS, "a:1", &json!(1)).await.unwrap();
    }

    #[tokio::test]
    async fn open_refuses_newer_schema() {
        let dir = tempfile::tempdir().unwrap();
        let newer = Schema {
            version: SCHEMA.version + 1,
            partitions: SCHEMA.partitions,
        };
        FsStore::open(dir.path(), &newer).await.unwrap();

        let err = FsStore::open(dir.path(), &SCHEMA).await.unwrap_err();
        assert!(matches!(err, StoreError::Schema { found: 5, supported: 4 }));
    }

    #[tokio::test]
    async fn open_rebuilds_corrupt_meta() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(META_FILE), b"not json").unwrap();
        let _store = open_store(dir.path()).await;
        let meta: StoreMeta =
            serde_json::from_slice(&std::fs::read(dir.path().join(META_FILE)).unwrap()).unwrap();
        assert_eq!(meta.schema_version, SCHEMA.version);
    }

    #[tokio::test]
    async fn put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        assert_eq!(store.get(CHAPTERS, "n:1").await.unwrap(), None);
        store
            .put(CHAPTERS, "n:1", &json!({"title": "One"}))
            .await
            .unwrap();
        assert_eq!(
            store.get(CHAPTERS, "n:1").await.unwrap(),
            Some(json!({"title": "One"}))
        );
        assert_eq!(tmp_files(&dir.path().join(CHAPTERS)), 0);

        assert!(store.delete(CHAPTERS, "n:1").await.unwrap());
        assert!(!store.delete(CHAPTERS, "n:1").await.unwrap());
        assert_eq!(store.get(CHAPTERS, "n:1").await.unwrap(), None);
    }

    fn tmp_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(TMP_EXT)
            })
            .count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_to_one_key_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(open_store(dir.path()).await);

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.spawn(async move { store.put(CHAPTERS, "n:1", &json!(i)).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let value = store.get(CHAPTERS, "n:1").await.unwrap().unwrap();
        assert!((0..16).contains(&value.as_i64().unwrap()));
        assert_eq!(tmp_files(&dir.path().join(CHAPTERS)), 0);
    }

    #[tokio::test]
    async fn put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.put(BOOKMARKS, "k", &json!(1)).await.unwrap();
        store.put(BOOKMARKS, "k", &json!(2)).await.unwrap();
        assert_eq!(store.get(BOOKMARKS, "k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn scan_prefix_matches_only_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.put(CHAPTERS, "12:1", &json!("a")).await.unwrap();
        store.put(CHAPTERS, "12:2", &json!("b")).await.unwrap();
        store.put(CHAPTERS, "123:1", &json!("c")).await.unwrap();

        let mut keys: Vec<String> = store
            .scan_prefix(CHAPTERS, "12:")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["12:1", "12:2"]);
    }

    #[tokio::test]
    async fn scan_skips_tmp_and_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.put(CHAPTERS, "n:1", &json!(1)).await.unwrap();

        let part = dir.path().join(CHAPTERS);
        std::fs::write(part.join("n%3A2.json.tmp"), b"partial").unwrap();
        std::fs::write(part.join("n%3A3.json"), b"{broken").unwrap();

        let records = store.scan_prefix(CHAPTERS, "n:").await.unwrap();
        assert_eq!(records, vec![("n:1".to_string(), json!(1))]);

        let err = store.get(CHAPTERS, "n:3").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn unknown_partition_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let err = store.get("novels", "k").await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownPartition(_)));

        let client: ClientError = err.into();
        assert!(matches!(client, ClientError::Resource { .. }));
    }
}
