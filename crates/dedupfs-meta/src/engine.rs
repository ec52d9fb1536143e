//! File I/O bridge between the filesystem dispatch layer and the block store.
//!
//! Reads and writes are served from the block cache; dirty blocks reach the
//! hash store when a sweep releases them. Every released batch is written in
//! one transaction, and a failed batch goes back into the cache as dirty.
//! Sweeps and timed garbage collection run from [`Engine::end_of_call`].

use std::sync::Arc;

use bytes::Bytes;
use dedupfs_reduce::{CodecRegistry, CompressionPool, CompressionSelector, DigestAlgorithm};
use tracing::{debug, error, info, instrument};

use crate::attr_cache::{AttrCache, AttrCacheStats};
use crate::block_cache::{BlockCache, CacheStats, DirtyBlock};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{MetaError, MetaResult};
use crate::gc::{GarbageCollector, GcReport};
use crate::hash_store::HashStore;
use crate::kvstore::KvStore;
use crate::logging;
use crate::metrics::{MetricsSnapshot, StoreMetrics};
use crate::namespace::{Namespace, Unlinked};
use crate::tables::Tables;
use crate::types::{Inode, InodeId, Subvolume, SubvolumeUsage, TreeEntry, TreeId};
use crate::usage::compute_usage;

/// One mounted subvolume
pub struct Engine {
    config: EngineConfig,
    tables: Tables,
    store: HashStore,
    cache: BlockCache,
    attrs: AttrCache,
    namespace: Namespace,
    gc: GarbageCollector,
    clock: Arc<dyn Clock>,
    metrics: Arc<StoreMetrics>,
    subvolume: Subvolume,
    digest: DigestAlgorithm,
    read_only: bool,
}

impl Engine {
    /// Open the configured subvolume, creating it on a writable mount.
    /// Installs the global log subscriber first when `logging.install` is set.
    pub fn open(kv: Arc<dyn KvStore>, config: EngineConfig, clock: Arc<dyn Clock>) -> MetaResult<Self> {
        config.validate()?;
        if config.logging.install && !logging::init(&config.logging)? {
            debug!("log subscriber already installed, keeping it");
        }
        let digest: DigestAlgorithm = config
            .store
            .digest
            .parse()
            .map_err(|e| MetaError::Config(format!("{}", e)))?;
        let tables = Tables::new(kv, config.store.layout);
        let now = clock.now_ms();

        let name = config.store.subvolume.as_str();
        let subvolume = match Namespace::find_subvolume(&tables, name, digest)? {
            Some(found) => found,
            None if config.store.read_only => {
                return Err(MetaError::not_found(format!("subvolume {}", name)));
            }
            None => tables.in_transaction(|| Namespace::create_subvolume(&tables, name, digest, clock.now()))?,
        };
        let read_only = config.store.read_only || subvolume.read_only;

        let registry = Arc::new(CodecRegistry::new());
        let selector = CompressionSelector::new(config.compression.clone(), registry);
        let pool = CompressionPool::from_config(&config.pool, &selector)?;
        let metrics = Arc::new(StoreMetrics::new());
        let store = HashStore::new(
            tables.clone(),
            &config.store,
            selector,
            pool,
            subvolume.id,
            metrics.clone(),
        )?;
        let block_size = store.block_size();

        info!(
            subvolume = %subvolume.id,
            name,
            block_size,
            layout = ?config.store.layout,
            method = %config.compression.method,
            read_only,
            "opened block store"
        );

        Ok(Self {
            cache: BlockCache::new(config.cache.clone(), block_size),
            attrs: AttrCache::new(config.attr_cache.clone(), now),
            namespace: Namespace::new(tables.clone(), subvolume.id),
            gc: GarbageCollector::new(
                tables.clone(),
                config.gc.clone(),
                block_size,
                read_only,
                metrics.clone(),
                now,
            ),
            config,
            tables,
            store,
            clock,
            metrics,
            subvolume,
            digest,
            read_only,
        })
    }

    /// Configuration the engine was opened with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The mounted subvolume row, as read at open time
    pub fn subvolume(&self) -> &Subvolume {
        &self.subvolume
    }

    /// The underlying tables
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Nominal block size
    pub fn block_size(&self) -> usize {
        self.store.block_size()
    }

    /// True when writes are refused
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Store counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Block cache counters
    pub fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    /// Attribute cache counters
    pub fn attr_stats(&self) -> AttrCacheStats {
        self.attrs.stats()
    }

    fn writable(&self) -> MetaResult<()> {
        if self.read_only {
            return Err(MetaError::ReadOnly);
        }
        Ok(())
    }

    // ---- file I/O ---------------------------------------------------------

    /// Inode attributes
    pub fn getattr(&mut self, inode: InodeId) -> MetaResult<Inode> {
        if let Some(row) = self.attrs.get_inode(inode) {
            return Ok(row);
        }
        let row = self.namespace.inode(inode)?;
        self.attrs.insert_inode(row.clone());
        Ok(row)
    }

    fn put_inode(&mut self, inode: Inode) -> MetaResult<()> {
        self.namespace.put_inode(&inode)?;
        self.attrs.insert_inode(inode);
        Ok(())
    }

    /// Content of one block, from the cache or else the store
    fn block(&mut self, inode: InodeId, block: u64, now: u64) -> MetaResult<Bytes> {
        if let Some(data) = self.cache.get(inode, block, now) {
            return Ok(data);
        }
        let data = self.store.read(inode, block)?;
        self.cache.set(inode, block, data.clone(), false, now);
        Ok(data)
    }

    /// Read up to `size` bytes at `offset`. Short at end of file; holes and
    /// short blocks read as zeros.
    pub fn read(&mut self, inode: InodeId, offset: u64, size: usize) -> MetaResult<Vec<u8>> {
        let row = self.getattr(inode)?;
        if offset >= row.size || size == 0 {
            return Ok(Vec::new());
        }
        let end = row.size.min(offset.saturating_add(size as u64));
        let bs = self.block_size() as u64;
        let now = self.clock.now_ms();

        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let block = pos / bs;
            let start = (pos % bs) as usize;
            let take = (bs - pos % bs).min(end - pos) as usize;
            let data = self.block(inode, block, now)?;
            let available = data.len().saturating_sub(start).min(take);
            if available > 0 {
                out.extend_from_slice(&data[start..start + available]);
            }
            out.resize(out.len() + (take - available), 0);
            pos += take as u64;
        }
        Ok(out)
    }

    /// Write `buf` at `offset`, extending the file as needed. Blocks are
    /// merged in the cache and stored on write-back. The merged blocks enter
    /// the cache only once the new inode row is saved, so a failed call
    /// leaves no dirty data behind.
    pub fn write(&mut self, inode: InodeId, offset: u64, buf: &[u8]) -> MetaResult<usize> {
        self.writable()?;
        let mut row = self.getattr(inode)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len() as u64;
        let end = offset
            .checked_add(len)
            .ok_or(MetaError::FileTooLarge { offset, len })?;
        let bs = self.block_size() as u64;
        let now = self.clock.now_ms();
        let new_size = row.size.max(end);

        let mut merged = Vec::new();
        let mut pos = offset;
        let mut consumed = 0usize;
        while consumed < buf.len() {
            let block = pos / bs;
            let block_start = block * bs;
            let start = (pos - block_start) as usize;
            let take = ((bs - start as u64) as usize).min(buf.len() - consumed);
            let block_len = (new_size - block_start).min(bs) as usize;

            let mut data = if (start == 0 && take == block_len) || block_start >= row.size {
                Vec::with_capacity(block_len)
            } else {
                let mut existing = self.block(inode, block, now)?.to_vec();
                existing.truncate((row.size - block_start).min(bs) as usize);
                existing
            };
            data.resize(block_len, 0);
            data[start..start + take].copy_from_slice(&buf[consumed..consumed + take]);
            merged.push((block, Bytes::from(data)));

            consumed += take;
            pos += take as u64;
        }

        let stamp = self.clock.now();
        row.size = new_size;
        row.mtime = stamp;
        row.ctime = stamp;
        self.put_inode(row)?;
        for (block, data) in merged {
            self.cache.set(inode, block, data, true, now);
        }
        debug!(%inode, offset, len = buf.len(), size = new_size, "write cached");
        Ok(buf.len())
    }

    /// Set the file size. Blocks past the new end are dropped from the cache
    /// and the block index; a partial last block is cut in the cache. The
    /// cache is only changed after the index and inode updates commit.
    pub fn truncate(&mut self, inode: InodeId, size: u64) -> MetaResult<()> {
        self.writable()?;
        let mut row = self.getattr(inode)?;
        if row.size == size {
            return Ok(());
        }
        let bs = self.block_size() as u64;
        let now = self.clock.now_ms();
        let block_count = size.div_ceil(bs);

        let cut = if size < row.size && size % bs != 0 {
            let last = size / bs;
            let mut data = self.block(inode, last, now)?.to_vec();
            data.truncate((size % bs) as usize);
            Some((last, Bytes::from(data)))
        } else {
            None
        };

        let stamp = self.clock.now();
        row.size = size;
        row.mtime = stamp;
        row.ctime = stamp;
        let subvol = self.subvolume.id;
        let removed = self.tables.in_transaction(|| {
            let removed = self.store.index().remove_from(subvol, inode, block_count)?;
            self.namespace.put_inode(&row)?;
            Ok(removed)
        })?;
        if let Some((last, data)) = cut {
            self.cache.set(inode, last, data, true, now);
        }
        self.cache.truncate(inode, block_count);
        self.gc.mark_changed(subvol);
        self.attrs.insert_inode(row);
        debug!(%inode, size, removed, "truncated");
        Ok(())
    }

    // ---- hooks ------------------------------------------------------------

    /// Write back every dirty block of `inode`
    pub fn flush(&mut self, inode: InodeId) -> MetaResult<()> {
        self.cache.flush(inode);
        let dirty = self.cache.sweep(self.clock.now_ms(), false);
        self.write_back(dirty)
    }

    /// Flush `inode` and make its blocks the first to be evicted
    pub fn release(&mut self, inode: InodeId) -> MetaResult<()> {
        self.flush(inode)?;
        self.cache.expire(inode);
        Ok(())
    }

    /// The dispatch layer dropped its last reference to `inode`
    pub fn forget(&mut self, inode: InodeId) {
        self.cache.forget(inode);
        self.attrs.invalidate_inode(inode);
    }

    /// Called after every filesystem operation: clears the attribute cache
    /// when due, sweeps the block cache, and runs timed garbage collection.
    pub fn end_of_call(&mut self) -> MetaResult<Option<GcReport>> {
        let now = self.clock.now_ms();
        self.attrs.maybe_clear(now);
        let dirty = self.cache.sweep(now, false);
        self.write_back(dirty)?;
        Ok(self.gc.maybe_collect(now))
    }

    /// Unmount: write back everything, then collect once more if configured
    pub fn destroy(&mut self) -> MetaResult<Option<GcReport>> {
        let dirty = self.cache.clear();
        self.write_back(dirty)?;
        let now = self.clock.now_ms();
        self.attrs.clear(now);
        if self.read_only || !self.gc.config().run_on_destroy {
            return Ok(None);
        }
        Ok(Some(self.gc.collect(now)))
    }

    /// Store released dirty blocks in one transaction. On failure the batch is
    /// rolled back and the blocks return to the cache as dirty.
    #[instrument(level = "debug", skip(self, blocks), fields(blocks = blocks.len()))]
    fn write_back(&mut self, blocks: Vec<DirtyBlock>) -> MetaResult<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let batch: Vec<_> = blocks
            .iter()
            .map(|b| (b.inode, b.block, b.data.clone()))
            .collect();
        let store = &self.store;
        match self.tables.in_transaction(|| store.write_batch(batch)) {
            Ok(outcomes) => {
                debug!(count = outcomes.len(), "wrote back dirty blocks");
                self.gc.mark_changed(self.subvolume.id);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, count = blocks.len(), "write-back failed, keeping blocks dirty");
                self.metrics.record_write_back_failure();
                self.cache.restore(blocks, self.clock.now_ms());
                Err(e)
            }
        }
    }

    // ---- namespace --------------------------------------------------------

    /// Root directory entry
    pub fn root(&self) -> MetaResult<TreeEntry> {
        self.namespace.root()
    }

    /// Find `name` in directory `parent`
    pub fn lookup(&mut self, parent: TreeId, name: &[u8]) -> MetaResult<Option<TreeEntry>> {
        if let Some(entry) = self.attrs.get_lookup(parent, name) {
            return Ok(Some(entry));
        }
        let found = self.namespace.lookup(parent, name)?;
        if let Some(entry) = &found {
            self.attrs.insert_lookup(parent, name, entry.clone());
        }
        Ok(found)
    }

    fn created(&mut self, parent: TreeId, name: &[u8], (entry, inode): (TreeEntry, Inode)) -> (TreeEntry, Inode) {
        self.attrs.insert_lookup(parent, name, entry.clone());
        self.attrs.insert_inode(inode.clone());
        (entry, inode)
    }

    /// Create an empty regular file
    pub fn create_file(&mut self, parent: TreeId, name: &[u8], perm: u32, uid: u32, gid: u32) -> MetaResult<(TreeEntry, Inode)> {
        self.writable()?;
        let now = self.clock.now();
        let ns = &self.namespace;
        let made = self
            .tables
            .in_transaction(|| ns.create_file(parent, name, perm, uid, gid, now))?;
        Ok(self.created(parent, name, made))
    }

    /// Create an empty directory
    pub fn mkdir(&mut self, parent: TreeId, name: &[u8], perm: u32, uid: u32, gid: u32) -> MetaResult<(TreeEntry, Inode)> {
        self.writable()?;
        let now = self.clock.now();
        let ns = &self.namespace;
        let made = self
            .tables
            .in_transaction(|| ns.mkdir(parent, name, perm, uid, gid, now))?;
        Ok(self.created(parent, name, made))
    }

    /// Create a symlink
    pub fn symlink(&mut self, parent: TreeId, name: &[u8], target: &[u8], uid: u32, gid: u32) -> MetaResult<(TreeEntry, Inode)> {
        self.writable()?;
        let now = self.clock.now();
        let ns = &self.namespace;
        let made = self
            .tables
            .in_transaction(|| ns.symlink(parent, name, target, uid, gid, now))?;
        Ok(self.created(parent, name, made))
    }

    /// Symlink target
    pub fn readlink(&self, inode: InodeId) -> MetaResult<Vec<u8>> {
        self.namespace.readlink(inode)
    }

    /// Add a hard link
    pub fn link(&mut self, inode: InodeId, parent: TreeId, name: &[u8]) -> MetaResult<TreeEntry> {
        self.writable()?;
        let now = self.clock.now();
        let ns = &self.namespace;
        let entry = self.tables.in_transaction(|| ns.link(inode, parent, name, now))?;
        self.attrs.invalidate_inode(inode);
        self.attrs.insert_lookup(parent, name, entry.clone());
        Ok(entry)
    }

    /// Remove a directory entry. Cached blocks of an inode losing its last
    /// link are dropped, dirty ones included.
    pub fn unlink(&mut self, parent: TreeId, name: &[u8]) -> MetaResult<Unlinked> {
        self.writable()?;
        let now = self.clock.now();
        let ns = &self.namespace;
        let result = self.tables.in_transaction(|| ns.unlink(parent, name, now))?;
        self.attrs.invalidate_lookup(parent, name);
        self.attrs.invalidate_inode(result.inode);
        if result.removed {
            self.cache.truncate(result.inode, 0);
        }
        Ok(result)
    }

    /// Set an extended attribute
    pub fn set_xattr(&mut self, inode: InodeId, name: &[u8], value: &[u8]) -> MetaResult<()> {
        self.writable()?;
        self.namespace.set_xattr(inode, name, value)
    }

    /// Extended attribute value
    pub fn get_xattr(&self, inode: InodeId, name: &[u8]) -> MetaResult<Option<Vec<u8>>> {
        self.namespace.get_xattr(inode, name)
    }

    /// Create another subvolume in the same store
    pub fn create_subvolume(&self, name: &str) -> MetaResult<Subvolume> {
        self.writable()?;
        let now = self.clock.now();
        let tables = &self.tables;
        tables.in_transaction(|| Namespace::create_subvolume(tables, name, self.digest, now))
    }

    // ---- maintenance ------------------------------------------------------

    /// Run a full garbage collection pass now
    pub fn collect_garbage(&mut self) -> GcReport {
        self.gc.collect(self.clock.now_ms())
    }

    /// Compact the backend; see [`GarbageCollector::vacuum`]
    pub fn vacuum(&mut self, force: bool) -> MetaResult<Option<u64>> {
        self.gc.vacuum(self.clock.now_ms(), force)
    }

    /// Current usage of the mounted subvolume, computed from the tables
    pub fn usage(&self) -> MetaResult<SubvolumeUsage> {
        compute_usage(
            &self.tables,
            self.subvolume.id,
            self.config.gc.page_size,
            self.clock.now(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kvstore::MemoryKvStore;
    use crate::tables::Table;
    use crate::types::StorageLayout;
    use dedupfs_reduce::{CodecKind, CompressionMethod};

    const BS: usize = 4096;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.store.block_size = BS;
        config.compression.method = CompressionMethod::Codec(CodecKind::Zlib);
        config
    }

    fn open(config: EngineConfig) -> (Engine, ManualClock, Arc<MemoryKvStore>) {
        let kv = Arc::new(MemoryKvStore::new());
        let clock = ManualClock::new(1_000);
        let engine = Engine::open(kv.clone(), config, Arc::new(clock.clone())).unwrap();
        (engine, clock, kv)
    }

    fn file(engine: &mut Engine, name: &[u8]) -> InodeId {
        let root = engine.root().unwrap().id;
        engine.create_file(root, name, 0o644, 0, 0).unwrap().1.id
    }

    #[test]
    fn test_open_installs_logging_when_asked() {
        let mut config = config();
        config.logging.install = true;
        let (engine, clock, kv) = open(config.clone());
        drop(engine);
        // a second open finds the subscriber in place and still succeeds
        assert!(Engine::open(kv.clone(), config.clone(), Arc::new(clock.clone())).is_ok());

        config.logging.filter = "dedupfs=loud".to_string();
        let err = Engine::open(kv, config, Arc::new(clock)).err().unwrap();
        assert!(matches!(err, MetaError::Config(_)));
    }

    #[test]
    fn test_open_creates_subvolume_once() {
        let (engine, clock, kv) = open(config());
        let id = engine.subvolume().id;
        drop(engine);
        let again = Engine::open(kv, config(), Arc::new(clock)).unwrap();
        assert_eq!(again.subvolume().id, id);
        assert_eq!(again.tables().list_subvolumes().unwrap().len(), 1);
    }

    #[test]
    fn test_read_only_open_needs_existing_subvolume() {
        let mut cfg = config();
        cfg.store.read_only = true;
        let kv = Arc::new(MemoryKvStore::new());
        let err = Engine::open(kv, cfg, Arc::new(ManualClock::new(0))).err().unwrap();
        assert!(matches!(err, MetaError::NotFound { .. }));
    }

    #[test]
    fn test_write_read_through_cache_and_store() {
        let (mut engine, _, _) = open(config());
        let f = file(&mut engine, b"a");
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(engine.write(f, 0, &payload).unwrap(), payload.len());
        assert_eq!(engine.read(f, 0, 20_000).unwrap(), payload);

        // nothing stored until the blocks are flushed
        assert_eq!(engine.tables().row_count(Table::Hash).unwrap(), 0);
        engine.flush(f).unwrap();
        assert_eq!(engine.tables().row_count(Table::Hash).unwrap(), 3);

        engine.forget(f);
        engine.destroy().unwrap();
        assert_eq!(engine.read(f, 0, 20_000).unwrap(), payload);
        assert_eq!(engine.read(f, 4090, 10).unwrap(), payload[4090..4100].to_vec());
    }

    #[test]
    fn test_read_past_end_is_empty_and_holes_are_zero() {
        let (mut engine, _, _) = open(config());
        let f = file(&mut engine, b"sparse");
        engine.write(f, 3 * BS as u64, b"tail").unwrap();
        engine.destroy().unwrap();
        assert!(engine.read(f, 10 * BS as u64, 1).unwrap().is_empty());
        let head = engine.read(f, 0, BS).unwrap();
        assert_eq!(head, vec![0u8; BS]);
        assert_eq!(engine.read(f, 3 * BS as u64, 100).unwrap(), b"tail".to_vec());
        // only the written block has an index row
        assert_eq!(engine.usage().unwrap().block_count, 1);
    }

    #[test]
    fn test_overwrite_inside_block_keeps_neighbours() {
        let (mut engine, _, _) = open(config());
        let f = file(&mut engine, b"f");
        engine.write(f, 0, &[b'a'; 100]).unwrap();
        engine.destroy().unwrap();
        engine.write(f, 10, b"XYZ").unwrap();
        engine.destroy().unwrap();
        let data = engine.read(f, 0, 100).unwrap();
        assert_eq!(&data[..10], &[b'a'; 10]);
        assert_eq!(&data[10..13], b"XYZ");
        assert_eq!(&data[13..], &[b'a'; 87]);
        assert_eq!(engine.getattr(f).unwrap().size, 100);
    }

    #[test]
    fn test_extending_a_short_block_reads_zeros_between() {
        let (mut engine, _, _) = open(config());
        let f = file(&mut engine, b"f");
        engine.write(f, 0, b"abc").unwrap();
        engine.destroy().unwrap();
        engine.write(f, 10, b"z").unwrap();
        assert_eq!(engine.read(f, 0, 11).unwrap(), b"abc\0\0\0\0\0\0\0z".to_vec());
    }

    #[test]
    fn test_truncate_shrinks_and_prunes_index() {
        let (mut engine, _, _) = open(config());
        let f = file(&mut engine, b"f");
        engine.write(f, 0, &vec![7u8; 3 * BS]).unwrap();
        engine.destroy().unwrap();
        engine.truncate(f, BS as u64 + 10).unwrap();
        assert_eq!(engine.read(f, 0, 4 * BS).unwrap().len(), BS + 10);
        engine.destroy().unwrap();
        assert_eq!(engine.usage().unwrap().block_count, 2);
        assert_eq!(engine.read(f, BS as u64, BS).unwrap(), vec![7u8; 10]);

        engine.truncate(f, 2 * BS as u64).unwrap();
        let grown = engine.read(f, BS as u64, BS).unwrap();
        assert_eq!(&grown[..10], &[7u8; 10]);
        assert!(grown[10..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_end_of_call_writes_back_after_ttl() {
        let (mut engine, clock, _) = open(config());
        let f = file(&mut engine, b"f");
        engine.write(f, 0, b"hello").unwrap();
        engine.end_of_call().unwrap();
        assert_eq!(engine.tables().row_count(Table::Hash).unwrap(), 0);
        clock.advance(engine.config().cache.max_write_ttl_ms + 1_000);
        engine.end_of_call().unwrap();
        assert_eq!(engine.tables().row_count(Table::Hash).unwrap(), 1);
        assert_eq!(engine.cache_stats().write_backs, 1);
    }

    #[test]
    fn test_timed_gc_from_end_of_call() {
        let (mut engine, clock, _) = open(config());
        let root = engine.root().unwrap().id;
        let f = file(&mut engine, b"f");
        engine.write(f, 0, b"gone soon").unwrap();
        engine.flush(f).unwrap();
        engine.unlink(root, b"f").unwrap();
        assert_eq!(engine.end_of_call().unwrap(), None);
        clock.advance(engine.config().gc.interval_ms);
        let report = engine.end_of_call().unwrap().unwrap();
        assert_eq!(report.hashes_removed, 1);
        assert_eq!(engine.tables().row_count(Table::Hash).unwrap(), 0);
    }

    #[test]
    fn test_unlink_drops_dirty_blocks_of_removed_inode() {
        let (mut engine, _, _) = open(config());
        let root = engine.root().unwrap().id;
        let f = file(&mut engine, b"f");
        engine.write(f, 0, b"never stored").unwrap();
        let unlinked = engine.unlink(root, b"f").unwrap();
        assert!(unlinked.removed);
        engine.destroy().unwrap();
        assert_eq!(engine.tables().row_count(Table::Hash).unwrap(), 0);
        assert!(engine.lookup(root, b"f").unwrap().is_none());
    }

    #[test]
    fn test_read_only_mount_refuses_writes() {
        let (mut engine, clock, kv) = open(config());
        let f = file(&mut engine, b"f");
        engine.write(f, 0, b"data").unwrap();
        engine.destroy().unwrap();

        let mut cfg = config();
        cfg.store.read_only = true;
        let mut ro = Engine::open(kv, cfg, Arc::new(clock)).unwrap();
        assert!(ro.is_read_only());
        assert!(matches!(ro.write(f, 0, b"x"), Err(MetaError::ReadOnly)));
        assert!(matches!(ro.truncate(f, 0), Err(MetaError::ReadOnly)));
        assert_eq!(ro.read(f, 0, 4).unwrap(), b"data".to_vec());
        assert_eq!(ro.destroy().unwrap(), None);
    }

    #[test]
    fn test_lookup_uses_attr_cache() {
        let (mut engine, _, _) = open(config());
        let root = engine.root().unwrap().id;
        file(&mut engine, b"cached");
        assert!(engine.lookup(root, b"cached").unwrap().is_some());
        assert!(engine.attr_stats().hits >= 1);
    }

    #[test]
    fn test_symlink_link_and_xattr() {
        let (mut engine, _, _) = open(config());
        let root = engine.root().unwrap().id;
        let (_, link) = engine.symlink(root, b"l", b"/target", 0, 0).unwrap();
        assert_eq!(engine.readlink(link.id).unwrap(), b"/target".to_vec());

        let f = file(&mut engine, b"f");
        engine.link(f, root, b"g").unwrap();
        assert_eq!(engine.getattr(f).unwrap().nlinks, 2);
        assert!(!engine.unlink(root, b"f").unwrap().removed);

        engine.set_xattr(f, b"user.k", b"v").unwrap();
        assert_eq!(engine.get_xattr(f, b"user.k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_clustered_engine_round_trip() {
        let mut cfg = config();
        cfg.store.layout = StorageLayout::Clustered;
        let (mut engine, _, _) = open(cfg);
        let f = file(&mut engine, b"f");
        engine.write(f, 0, &vec![1u8; 2 * BS]).unwrap();
        engine.destroy().unwrap();
        assert_eq!(engine.tables().row_count(Table::Hash).unwrap(), 1);
        assert_eq!(engine.tables().row_count(Table::HashCount).unwrap(), 1);
        assert_eq!(engine.read(f, 0, 2 * BS).unwrap(), vec![1u8; 2 * BS]);
    }
}
