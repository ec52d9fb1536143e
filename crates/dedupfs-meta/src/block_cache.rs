//! Read/write block cache between file I/O and the hash store.
//!
//! Entries are grouped per inode in block order. Each entry is either written
//! (dirty, must reach the hash store) or read (clean, dropped freely). Sweeps
//! evict by idle time and by aggregate size per category, and hand back every
//! dirty entry they release so the caller can write it exactly once.

use std::collections::{BTreeMap, BinaryHeap, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MetaError;
use crate::types::InodeId;

/// Configuration for the block cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Idle time after which a written entry is written back and dropped (ms)
    pub max_write_ttl_ms: u64,
    /// Idle time after which a read entry is dropped (ms)
    pub max_read_ttl_ms: u64,
    /// Byte bound for written entries
    pub max_write_size: u64,
    /// Byte bound for read entries
    pub max_read_size: u64,
    /// Headroom over a bound before a size sweep starts, in percent
    pub size_tolerance_pct: u64,
    /// Minimum time between TTL sweeps of written entries (ms)
    pub write_ttl_check_ms: u64,
    /// Minimum time between TTL sweeps of read entries (ms)
    pub read_ttl_check_ms: u64,
    /// Minimum time between size sweeps of written entries (ms)
    pub write_size_check_ms: u64,
    /// Minimum time between size sweeps of read entries (ms)
    pub read_size_check_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_write_ttl_ms: 5_000,
            max_read_ttl_ms: 30_000,
            max_write_size: 64 * 1024 * 1024,
            max_read_size: 256 * 1024 * 1024,
            size_tolerance_pct: 10,
            write_ttl_check_ms: 1_000,
            read_ttl_check_ms: 5_000,
            write_size_check_ms: 250,
            read_size_check_ms: 1_000,
        }
    }
}

impl CacheConfig {
    /// Size at which a sweep of `category` starts evicting
    pub fn limit(&self, category: Category) -> u64 {
        let max = self.max_size(category);
        max + max * self.size_tolerance_pct / 100
    }

    /// Nominal bound a size sweep evicts down to
    pub fn max_size(&self, category: Category) -> u64 {
        match category {
            Category::Written => self.max_write_size,
            Category::Read => self.max_read_size,
        }
    }

    fn ttl(&self, category: Category) -> u64 {
        match category {
            Category::Written => self.max_write_ttl_ms,
            Category::Read => self.max_read_ttl_ms,
        }
    }
}

/// Entry category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Dirty entries awaiting write-back
    Written,
    /// Clean entries
    Read,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    last_access: u64,
    data: Bytes,
    size: u64,
    written: bool,
    to_flush: bool,
}

impl CacheEntry {
    fn category(&self) -> Category {
        if self.written {
            Category::Written
        } else {
            Category::Read
        }
    }
}

/// A dirty block released by the cache; must be written to the hash store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyBlock {
    /// Owning inode
    pub inode: InodeId,
    /// Block number within the inode
    pub block: u64,
    /// Full block content
    pub data: Bytes,
}

/// Statistics tracking for the block cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries inserted.
    pub insertions: u64,
    /// Number of entries evicted by TTL or size sweeps.
    pub evictions: u64,
    /// Number of dirty entries handed back for write-back.
    pub write_backs: u64,
}

impl CacheStats {
    /// Calculates the cache hit rate as a ratio of hits to total accesses.
    ///
    /// Returns 0.0 if there have been no cache accesses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct LastSweep {
    write_ttl: u64,
    read_ttl: u64,
    write_size: u64,
    read_size: u64,
}

fn due(last: &mut u64, interval: u64, now: u64, force: bool) -> bool {
    if force || now.saturating_sub(*last) >= interval {
        *last = now;
        true
    } else {
        false
    }
}

/// Block cache keyed by inode and block number.
pub struct BlockCache {
    config: CacheConfig,
    block_size: u64,
    entries: HashMap<InodeId, BTreeMap<u64, CacheEntry>>,
    write_bytes: u64,
    read_bytes: u64,
    last_sweep: LastSweep,
    stats: CacheStats,
}

impl BlockCache {
    /// Creates an empty cache for blocks of `block_size` bytes.
    pub fn new(config: CacheConfig, block_size: usize) -> Self {
        debug!(
            max_write_size = config.max_write_size,
            max_read_size = config.max_read_size,
            block_size,
            "created block cache"
        );
        Self {
            config,
            block_size: block_size.max(1) as u64,
            entries: HashMap::new(),
            write_bytes: 0,
            read_bytes: 0,
            last_sweep: LastSweep::default(),
            stats: CacheStats::default(),
        }
    }

    /// Cached bytes of one category
    pub fn bytes(&self, category: Category) -> u64 {
        match category {
            Category::Written => self.write_bytes,
            Category::Read => self.read_bytes,
        }
    }

    /// Number of cached blocks
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when `inode` has written or to-flush entries
    pub fn is_dirty(&self, inode: InodeId) -> bool {
        self.entries
            .get(&inode)
            .is_some_and(|blocks| blocks.values().any(|e| e.written || e.to_flush))
    }

    /// Counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn account_add(&mut self, category: Category, size: u64) {
        match category {
            Category::Written => self.write_bytes += size,
            Category::Read => self.read_bytes += size,
        }
    }

    fn account_sub(&mut self, category: Category, size: u64) {
        match category {
            Category::Written => self.write_bytes = self.write_bytes.saturating_sub(size),
            Category::Read => self.read_bytes = self.read_bytes.saturating_sub(size),
        }
    }

    /// Cached content of a block, refreshing its last access
    pub fn get(&mut self, inode: InodeId, block: u64, now: u64) -> Option<Bytes> {
        match self.entries.get_mut(&inode).and_then(|b| b.get_mut(&block)) {
            Some(entry) => {
                entry.last_access = now;
                self.stats.hits += 1;
                Some(entry.data.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Insert or replace a block. A written entry stays written until it is
    /// handed back by a sweep.
    pub fn set(&mut self, inode: InodeId, block: u64, data: Bytes, written: bool, now: u64) {
        let size = data.len() as u64;
        let blocks = self.entries.entry(inode).or_default();
        let previous = blocks.get(&block).map(|e| (e.category(), e.size, e.written, e.to_flush));
        let (was_written, to_flush) = previous.map_or((false, false), |(_, _, w, f)| (w, f));
        let entry = CacheEntry {
            last_access: now,
            data,
            size,
            written: written || was_written,
            to_flush,
        };
        let category = entry.category();
        blocks.insert(block, entry);
        match previous {
            Some((old_category, old_size, _, _)) => self.account_sub(old_category, old_size),
            None => self.stats.insertions += 1,
        }
        self.account_add(category, size);
    }

    /// Mark every written block of `inode` for write-back on the next sweep
    pub fn flush(&mut self, inode: InodeId) {
        if let Some(blocks) = self.entries.get_mut(&inode) {
            for entry in blocks.values_mut().filter(|e| e.written) {
                entry.to_flush = true;
            }
        }
    }

    /// Make every block of `inode` the oldest in the cache
    pub fn expire(&mut self, inode: InodeId) {
        if let Some(blocks) = self.entries.get_mut(&inode) {
            for entry in blocks.values_mut() {
                entry.last_access = 0;
            }
        }
    }

    /// Drop `inode` if it holds nothing dirty; otherwise expire it.
    /// Returns true when entries were removed.
    pub fn forget(&mut self, inode: InodeId) -> bool {
        if self.is_dirty(inode) {
            self.expire(inode);
            return false;
        }
        match self.entries.remove(&inode) {
            Some(blocks) => {
                for entry in blocks.values() {
                    self.account_sub(entry.category(), entry.size);
                }
                true
            }
            None => false,
        }
    }

    /// Drop cached blocks at or past `block_count`, dirty ones included
    pub fn truncate(&mut self, inode: InodeId, block_count: u64) {
        let Some(blocks) = self.entries.get_mut(&inode) else {
            return;
        };
        let dropped = blocks.split_off(&block_count);
        let empty = blocks.is_empty();
        for entry in dropped.values() {
            self.account_sub(entry.category(), entry.size);
        }
        if empty {
            self.entries.remove(&inode);
        }
    }

    /// Empty the cache, returning every dirty block
    pub fn clear(&mut self) -> Vec<DirtyBlock> {
        let mut dirty = Vec::new();
        for (inode, blocks) in self.entries.drain() {
            for (block, entry) in blocks {
                if entry.written {
                    dirty.push(DirtyBlock {
                        inode,
                        block,
                        data: entry.data,
                    });
                }
            }
        }
        dirty.sort_by_key(|d| (d.inode, d.block));
        self.write_bytes = 0;
        self.read_bytes = 0;
        self.stats.write_backs += dirty.len() as u64;
        dirty
    }

    /// Run the to-flush pass, then each TTL and size pass that is due (all of
    /// them when `force`). Returns the dirty blocks released, each exactly once.
    pub fn sweep(&mut self, now: u64, force: bool) -> Vec<DirtyBlock> {
        let mut dirty = self.take_to_flush();
        if due(&mut self.last_sweep.write_ttl, self.config.write_ttl_check_ms, now, force) {
            dirty.extend(self.evict_idle(Category::Written, now));
        }
        if due(&mut self.last_sweep.read_ttl, self.config.read_ttl_check_ms, now, force) {
            self.evict_idle(Category::Read, now);
        }
        if due(&mut self.last_sweep.write_size, self.config.write_size_check_ms, now, force) {
            dirty.extend(self.evict_oversize(Category::Written, now));
        }
        if due(&mut self.last_sweep.read_size, self.config.read_size_check_ms, now, force) {
            self.evict_oversize(Category::Read, now);
        }
        self.stats.write_backs += dirty.len() as u64;
        dirty
    }

    /// Put blocks back as written after a failed write-back
    pub fn restore(&mut self, blocks: Vec<DirtyBlock>, now: u64) {
        for b in blocks {
            self.set(b.inode, b.block, b.data, true, now);
        }
    }

    fn take_to_flush(&mut self) -> Vec<DirtyBlock> {
        let mut out = Vec::new();
        let mut moved = 0u64;
        for (inode, blocks) in self.entries.iter_mut() {
            for (block, entry) in blocks.iter_mut().filter(|(_, e)| e.to_flush) {
                entry.to_flush = false;
                if entry.written {
                    entry.written = false;
                    moved += entry.size;
                    out.push(DirtyBlock {
                        inode: *inode,
                        block: *block,
                        data: entry.data.clone(),
                    });
                }
            }
        }
        self.account_sub(Category::Written, moved);
        self.account_add(Category::Read, moved);
        out.sort_by_key(|d| (d.inode, d.block));
        out
    }

    fn remove_entries(&mut self, keys: &[(InodeId, u64)]) -> Vec<DirtyBlock> {
        let mut dirty = Vec::new();
        for (inode, block) in keys {
            let Some(blocks) = self.entries.get_mut(inode) else {
                continue;
            };
            let Some(entry) = blocks.remove(block) else {
                continue;
            };
            if blocks.is_empty() {
                self.entries.remove(inode);
            }
            self.account_sub(entry.category(), entry.size);
            self.stats.evictions += 1;
            if entry.written {
                dirty.push(DirtyBlock {
                    inode: *inode,
                    block: *block,
                    data: entry.data,
                });
            }
        }
        dirty
    }

    fn evict_idle(&mut self, category: Category, now: u64) -> Vec<DirtyBlock> {
        let ttl = self.config.ttl(category);
        let mut expired: Vec<(InodeId, u64)> = self
            .entries
            .iter()
            .flat_map(|(inode, blocks)| {
                blocks
                    .iter()
                    .filter(move |(_, e)| e.category() == category && now.saturating_sub(e.last_access) > ttl)
                    .map(move |(block, _)| (*inode, *block))
            })
            .collect();
        expired.sort();
        if !expired.is_empty() {
            debug!(?category, count = expired.len(), "evicting idle cache entries");
        }
        self.remove_entries(&expired)
    }

    fn evict_oversize(&mut self, category: Category, now: u64) -> Vec<DirtyBlock> {
        let limit = self.config.limit(category);
        let target = self.config.max_size(category);
        let mut dirty = Vec::new();
        if self.bytes(category) <= limit {
            return dirty;
        }
        debug!(
            error = %MetaError::Capacity { used: self.bytes(category), limit },
            ?category,
            "evicting longest idle cache entries"
        );
        while self.bytes(category) > target {
            let overflow = self.bytes(category) - target;
            let count = overflow.div_ceil(self.block_size) as usize;
            let mut heap: BinaryHeap<(u64, InodeId, u64)> = self
                .entries
                .iter()
                .flat_map(|(inode, blocks)| {
                    blocks
                        .iter()
                        .filter(move |(_, e)| e.category() == category)
                        .map(move |(block, e)| (now.saturating_sub(e.last_access), *inode, *block))
                })
                .collect();
            if heap.is_empty() {
                break;
            }
            let mut victims = Vec::with_capacity(count);
            while victims.len() < count {
                match heap.pop() {
                    Some((_, inode, block)) => victims.push((inode, block)),
                    None => break,
                }
            }
            dirty.extend(self.remove_entries(&victims));
        }
        dirty
    }
}
