//! Decoded inode rows and directory lookups, dropped wholesale on a timer.

#![allow(missing_docs)]

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{Inode, InodeId, TreeEntry, TreeId};

/// Attribute cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttrCacheConfig {
    /// Cache inode rows and lookups at all
    pub enabled: bool,
    /// Lifetime of the whole cache before it is cleared (ms)
    pub ttl_ms: u64,
}

impl Default for AttrCacheConfig {
    fn default() -> Self {
        AttrCacheConfig {
            enabled: true,
            ttl_ms: 1_000,
        }
    }
}

/// Hit/miss counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AttrCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub clears: u64,
}

/// TTL-only cache of inode rows and `(parent, name) → entry` lookups
pub struct AttrCache {
    inodes: HashMap<InodeId, Inode>,
    lookups: HashMap<(TreeId, Vec<u8>), TreeEntry>,
    config: AttrCacheConfig,
    cleared_at: u64,
    stats: AttrCacheStats,
}

impl AttrCache {
    pub fn new(config: AttrCacheConfig, now: u64) -> Self {
        AttrCache {
            inodes: HashMap::new(),
            lookups: HashMap::new(),
            config,
            cleared_at: now,
            stats: AttrCacheStats::default(),
        }
    }

    pub fn get_inode(&mut self, id: InodeId) -> Option<Inode> {
        match self.inodes.get(&id) {
            Some(inode) => {
                self.stats.hits += 1;
                Some(inode.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert_inode(&mut self, inode: Inode) {
        if self.config.enabled {
            self.inodes.insert(inode.id, inode);
        }
    }

    pub fn invalidate_inode(&mut self, id: InodeId) {
        self.inodes.remove(&id);
    }

    pub fn get_lookup(&mut self, parent: TreeId, name: &[u8]) -> Option<TreeEntry> {
        match self.lookups.get(&(parent, name.to_vec())) {
            Some(entry) => {
                self.stats.hits += 1;
                Some(entry.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert_lookup(&mut self, parent: TreeId, name: &[u8], entry: TreeEntry) {
        if self.config.enabled {
            self.lookups.insert((parent, name.to_vec()), entry);
        }
    }

    pub fn invalidate_lookup(&mut self, parent: TreeId, name: &[u8]) {
        self.lookups.remove(&(parent, name.to_vec()));
    }

    /// Clear everything once the TTL has passed since the last clear.
    /// Returns true when the cache was cleared.
    pub fn maybe_clear(&mut self, now: u64) -> bool {
        if now.saturating_sub(self.cleared_at) < self.config.ttl_ms {
            return false;
        }
        self.clear(now);
        true
    }

    pub fn clear(&mut self, now: u64) {
        self.inodes.clear();
        self.lookups.clear();
        self.cleared_at = now;
        self.stats.clears += 1;
    }

    pub fn len(&self) -> usize {
        self.inodes.len() + self.lookups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> AttrCacheStats {
        self.stats.clone()
    }
}
