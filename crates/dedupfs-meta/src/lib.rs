#![warn(missing_docs)]

//! DedupFS block store: content-addressed block tables, read/write block cache,
//! reference-counting garbage collector
//!
//! Write path: Engine::write → BlockCache (dirty) → sweep → HashStore (dedup, compress) → Tables
//! Read path:  Engine::read → BlockCache → HashStore (decompress per recorded codec) → Tables

pub mod attr_cache;
pub mod block_cache;
pub mod block_index;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod gc;
pub mod hash_store;
pub mod kvstore;
pub mod logging;
pub mod metrics;
pub mod namespace;
pub mod tables;
pub mod types;
pub mod usage;

pub use attr_cache::{AttrCache, AttrCacheConfig, AttrCacheStats};
pub use block_cache::{BlockCache, CacheConfig, CacheStats, Category, DirtyBlock};
pub use block_index::BlockIndex;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{MetaError, MetaResult};
pub use gc::{GarbageCollector, GcConfig, GcPhase, GcReport};
pub use hash_store::{HashStore, StoreConfig, WriteOutcome};
pub use kvstore::{BatchOp, KvPair, KvStore, MemoryKvStore};
pub use logging::LoggingConfig;
pub use metrics::{MetricsSnapshot, StoreMetrics};
pub use namespace::{Namespace, Unlinked};
pub use tables::{Table, Tables};
pub use types::{
    BlockRef, HashId, Inode, InodeId, NameId, StorageLayout, Subvolume, SubvolumeId, SubvolumeUsage,
    Timestamp, TreeEntry, TreeId,
};
pub use usage::compute_usage;
