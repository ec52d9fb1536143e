//! Block store counters.
//!
//! Lock-free counters updated on the write, read and GC paths, readable as a
//! consistent-enough snapshot for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters shared by the hash store, engine and garbage collector.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    dedup_blocks: AtomicU64,
    dedup_bytes: AtomicU64,
    inserted_blocks: AtomicU64,
    updated_blocks: AtomicU64,
    logical_bytes_written: AtomicU64,
    stored_bytes_written: AtomicU64,
    blocks_read: AtomicU64,
    sparse_reads: AtomicU64,
    write_back_failures: AtomicU64,
    gc_runs: AtomicU64,
    gc_phase_failures: AtomicU64,
    gc_hashes_removed: AtomicU64,
    gc_bytes_reclaimed: AtomicU64,
}

/// Point-in-time copy of [`StoreMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Writes resolved to an existing hash
    pub dedup_blocks: u64,
    /// Bytes those writes did not have to store
    pub dedup_bytes: u64,
    /// New hash quads inserted
    pub inserted_blocks: u64,
    /// Hash quads rewritten in place by their sole owner
    pub updated_blocks: u64,
    /// Uncompressed bytes of inserted or updated blocks
    pub logical_bytes_written: u64,
    /// Stored bytes of inserted or updated blocks
    pub stored_bytes_written: u64,
    /// Blocks read from the store
    pub blocks_read: u64,
    /// Reads of blocks with no index row
    pub sparse_reads: u64,
    /// Cache write-back batches that were rolled back
    pub write_back_failures: u64,
    /// Completed garbage collection runs
    pub gc_runs: u64,
    /// GC phases that failed and were rolled back
    pub gc_phase_failures: u64,
    /// Hash quads removed by GC
    pub gc_hashes_removed: u64,
    /// Stored bytes released by GC
    pub gc_bytes_reclaimed: u64,
}

impl MetricsSnapshot {
    /// Stored bytes over logical bytes for everything written so far; 1.0 when idle
    pub fn compression_ratio(&self) -> f64 {
        if self.logical_bytes_written == 0 {
            1.0
        } else {
            self.stored_bytes_written as f64 / self.logical_bytes_written as f64
        }
    }
}

impl StoreMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a write that resolved to an existing hash.
    pub fn record_dedup(&self, bytes: u64) {
        self.dedup_blocks.fetch_add(1, Ordering::Relaxed);
        self.dedup_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a newly inserted quad.
    pub fn record_insert(&self, logical: u64, stored: u64) {
        self.inserted_blocks.fetch_add(1, Ordering::Relaxed);
        self.logical_bytes_written.fetch_add(logical, Ordering::Relaxed);
        self.stored_bytes_written.fetch_add(stored, Ordering::Relaxed);
    }

    /// Record a quad rewritten in place.
    pub fn record_update(&self, logical: u64, stored: u64) {
        self.updated_blocks.fetch_add(1, Ordering::Relaxed);
        self.logical_bytes_written.fetch_add(logical, Ordering::Relaxed);
        self.stored_bytes_written.fetch_add(stored, Ordering::Relaxed);
    }

    /// Record a block read; `sparse` when no index row existed.
    pub fn record_read(&self, sparse: bool) {
        if sparse {
            self.sparse_reads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.blocks_read.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a rolled back write-back batch.
    pub fn record_write_back_failure(&self) {
        self.write_back_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one GC run.
    pub fn record_gc(&self, failed_phases: u64, hashes_removed: u64, bytes_reclaimed: u64) {
        self.gc_runs.fetch_add(1, Ordering::Relaxed);
        self.gc_phase_failures.fetch_add(failed_phases, Ordering::Relaxed);
        self.gc_hashes_removed.fetch_add(hashes_removed, Ordering::Relaxed);
        self.gc_bytes_reclaimed.fetch_add(bytes_reclaimed, Ordering::Relaxed);
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dedup_blocks: self.dedup_blocks.load(Ordering::Relaxed),
            dedup_bytes: self.dedup_bytes.load(Ordering::Relaxed),
            inserted_blocks: self.inserted_blocks.load(Ordering::Relaxed),
            updated_blocks: self.updated_blocks.load(Ordering::Relaxed),
            logical_bytes_written: self.logical_bytes_written.load(Ordering::Relaxed),
            stored_bytes_written: self.stored_bytes_written.load(Ordering::Relaxed),
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            sparse_reads: self.sparse_reads.load(Ordering::Relaxed),
            write_back_failures: self.write_back_failures.load(Ordering::Relaxed),
            gc_runs: self.gc_runs.load(Ordering::Relaxed),
            gc_phase_failures: self.gc_phase_failures.load(Ordering::Relaxed),
            gc_hashes_removed: self.gc_hashes_removed.load(Ordering::Relaxed),
            gc_bytes_reclaimed: self.gc_bytes_reclaimed.load(Ordering::Relaxed),
        }
    }
}
