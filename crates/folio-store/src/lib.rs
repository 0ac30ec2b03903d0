//! folio-store: persistent local cache for content units
//!
//! A partitioned key/value store on the filesystem and the chapter window
//! cache built on top of it. The cache treats the store as slow and
//! fallible: every store failure degrades to a cache miss.

pub mod cache;
pub mod key;
pub mod store;

pub use cache::{CacheEntry, ChapterWindowCache, ContentSource, PrefetchReport, derived_progress};
pub use key::{cache_key, collection_prefix, parse_cache_key};
pub use store::{FsStore, RecordStore, SCHEMA, Schema, StoreError};
