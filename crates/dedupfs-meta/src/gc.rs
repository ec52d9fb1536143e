//! Reference-counting garbage collector.
//!
//! A collection pass runs six phases in order, each inside its own
//! transaction. Every phase pages its candidate ids, builds the set of ids
//! still reachable, and deletes the difference. A failed phase is rolled back
//! and logged; later phases still run, since leaving garbage behind is always
//! safe.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::block_index::BlockIndex;
use crate::error::MetaResult;
use crate::metrics::StoreMetrics;
use crate::tables::Tables;
use crate::types::{BlockRef, HashId, Inode, InodeId, NameId, StorageLayout, SubvolumeId, Timestamp, TreeEntry};
use crate::usage::compute_usage;

/// Garbage collector configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Run collection from the end-of-call hook
    pub enabled: bool,
    /// Minimum time between timed passes (ms)
    pub interval_ms: u64,
    /// Rows fetched per page while scanning tables
    pub page_size: usize,
    /// Collect once more when the filesystem is destroyed
    pub run_on_destroy: bool,
    /// Allow full compaction of the backend
    pub vacuum_enabled: bool,
    /// Minimum time between compactions (ms)
    pub vacuum_min_interval_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
            page_size: 1024,
            run_on_destroy: true,
            vacuum_enabled: false,
            vacuum_min_interval_ms: 86_400_000,
        }
    }
}

/// Collection phases in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcPhase {
    /// Names no tree row uses
    Names,
    /// Inodes no tree row points at
    Inodes,
    /// Xattrs and link targets of vanished inodes
    XattrsAndLinks,
    /// Block index rows of vanished inodes or past end of file
    BlockIndex,
    /// Hash quads with no block index row
    Hashes,
    /// Subvolume usage statistics
    Usage,
}

impl GcPhase {
    /// Every phase, in order
    pub const ALL: [GcPhase; 6] = [
        GcPhase::Names,
        GcPhase::Inodes,
        GcPhase::XattrsAndLinks,
        GcPhase::BlockIndex,
        GcPhase::Hashes,
        GcPhase::Usage,
    ];

    /// Name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            GcPhase::Names => "names",
            GcPhase::Inodes => "inodes",
            GcPhase::XattrsAndLinks => "xattrs_and_links",
            GcPhase::BlockIndex => "block_index",
            GcPhase::Hashes => "hashes",
            GcPhase::Usage => "usage",
        }
    }
}

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    /// The pass did not run (read-only mount)
    pub skipped: bool,
    /// Name rows deleted
    pub names_removed: u64,
    /// Inode rows deleted
    pub inodes_removed: u64,
    /// Xattr rows deleted
    pub xattrs_removed: u64,
    /// Link rows deleted
    pub links_removed: u64,
    /// Block index rows deleted
    pub block_refs_removed: u64,
    /// Hash quads deleted
    pub hashes_removed: u64,
    /// Stored bytes released with those quads
    pub bytes_reclaimed: u64,
    /// Subvolumes whose usage was recomputed
    pub subvolumes_refreshed: u64,
    /// Phases that failed and were rolled back
    pub failed_phases: Vec<GcPhase>,
}

impl GcReport {
    /// Total rows deleted across all tables
    pub fn rows_removed(&self) -> u64 {
        self.names_removed
            + self.inodes_removed
            + self.xattrs_removed
            + self.links_removed
            + self.block_refs_removed
            + self.hashes_removed
    }

    /// True when nothing was deleted, rewritten or failed
    pub fn is_noop(&self) -> bool {
        self.rows_removed() == 0 && self.subvolumes_refreshed == 0 && self.failed_phases.is_empty()
    }
}

/// Fetch every row of a paged table
fn drain_pages<T, C>(
    page_size: usize,
    mut fetch: impl FnMut(Option<C>, usize) -> MetaResult<Vec<T>>,
    cursor: impl Fn(&T) -> C,
) -> MetaResult<Vec<T>> {
    let page_size = page_size.max(1);
    let mut all = Vec::new();
    let mut after = None;
    loop {
        let page = fetch(after.take(), page_size)?;
        let full = page.len() == page_size;
        if let Some(last) = page.last() {
            after = Some(cursor(last));
        }
        all.extend(page);
        if !full {
            return Ok(all);
        }
    }
}

/// Garbage collector over every subvolume of a store
pub struct GarbageCollector {
    tables: Tables,
    index: BlockIndex,
    config: GcConfig,
    block_size: usize,
    read_only: bool,
    last_run: u64,
    last_vacuum: Option<u64>,
    changed: HashSet<SubvolumeId>,
    metrics: Arc<StoreMetrics>,
}

impl GarbageCollector {
    /// Collector whose first timed pass is one interval after `now`
    pub fn new(
        tables: Tables,
        config: GcConfig,
        block_size: usize,
        read_only: bool,
        metrics: Arc<StoreMetrics>,
        now: u64,
    ) -> Self {
        Self {
            index: BlockIndex::new(tables.clone()),
            tables,
            config,
            block_size: block_size.max(1),
            read_only,
            last_run: now,
            last_vacuum: None,
            changed: HashSet::new(),
            metrics,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Note that `subvol` gained or lost blocks, so its usage is recomputed
    /// on the next pass
    pub fn mark_changed(&mut self, subvol: SubvolumeId) {
        self.changed.insert(subvol);
    }

    /// Run a pass if collection is enabled and the interval has elapsed
    pub fn maybe_collect(&mut self, now: u64) -> Option<GcReport> {
        if !self.config.enabled || self.read_only {
            return None;
        }
        if now.saturating_sub(self.last_run) < self.config.interval_ms {
            return None;
        }
        Some(self.collect(now))
    }

    /// Run every phase now
    pub fn collect(&mut self, now: u64) -> GcReport {
        let mut report = GcReport::default();
        if self.read_only {
            debug!("read-only mount, skipping garbage collection");
            report.skipped = true;
            return report;
        }
        let mut touched = HashSet::new();
        for phase in GcPhase::ALL {
            let before = report.clone();
            let result = self.tables.in_transaction(|| match phase {
                GcPhase::Names => self.unused_names(&mut report),
                GcPhase::Inodes => self.unused_inodes(&mut report, &mut touched),
                GcPhase::XattrsAndLinks => self.unused_xattrs_and_links(&mut report),
                GcPhase::BlockIndex => self.unused_block_refs(&mut report, &mut touched),
                GcPhase::Hashes => self.unused_hashes(&mut report),
                GcPhase::Usage => self.refresh_usage(&mut report, &touched, now),
            });
            if let Err(e) = result {
                error!(phase = phase.name(), error = %e, "garbage collection phase failed");
                report = before;
                report.failed_phases.push(phase);
            }
        }
        if !report.failed_phases.contains(&GcPhase::Usage) {
            self.changed.clear();
        }
        if report.hashes_removed > 0 {
            if let Err(e) = self.tables.reclaim() {
                warn!(error = %e, "backend space reclamation failed");
            }
        }
        self.last_run = now;
        self.metrics.record_gc(
            report.failed_phases.len() as u64,
            report.hashes_removed,
            report.bytes_reclaimed,
        );
        info!(
            names = report.names_removed,
            inodes = report.inodes_removed,
            xattrs = report.xattrs_removed,
            links = report.links_removed,
            block_refs = report.block_refs_removed,
            hashes = report.hashes_removed,
            bytes = report.bytes_reclaimed,
            failed = report.failed_phases.len(),
            "garbage collection finished"
        );
        report
    }

    /// Compact the backend when enabled and not done within the minimum
    /// interval, or unconditionally with `force`. Returns the bytes released,
    /// or `None` when the pass was not due.
    pub fn vacuum(&mut self, now: u64, force: bool) -> MetaResult<Option<u64>> {
        if self.read_only {
            return Ok(None);
        }
        if !force {
            if !self.config.vacuum_enabled {
                return Ok(None);
            }
            if let Some(last) = self.last_vacuum {
                if now.saturating_sub(last) < self.config.vacuum_min_interval_ms {
                    return Ok(None);
                }
            }
        }
        let released = self.tables.vacuum()?;
        self.last_vacuum = Some(now);
        info!(released, "vacuum finished");
        Ok(Some(released))
    }

    fn subvolumes(&self) -> MetaResult<Vec<SubvolumeId>> {
        Ok(self.tables.list_subvolumes()?.into_iter().map(|s| s.id).collect())
    }

    fn all_inodes(&self, subvol: SubvolumeId) -> MetaResult<Vec<Inode>> {
        drain_pages(
            self.config.page_size,
            |after, limit| self.tables.page_inodes(subvol, after, limit),
            |inode| inode.id,
        )
    }

    fn all_trees(&self, subvol: SubvolumeId) -> MetaResult<Vec<TreeEntry>> {
        drain_pages(
            self.config.page_size,
            |after, limit| self.tables.page_trees(subvol, after, limit),
            |entry| entry.id,
        )
    }

    fn all_block_refs(&self, subvol: SubvolumeId) -> MetaResult<Vec<(InodeId, u64, BlockRef)>> {
        drain_pages(
            self.config.page_size,
            |after, limit| self.tables.page_block_refs(subvol, after, limit),
            |(inode, block, _)| (*inode, *block),
        )
    }

    fn unused_names(&self, report: &mut GcReport) -> MetaResult<()> {
        let mut reachable: HashSet<NameId> = HashSet::new();
        for subvol in self.subvolumes()? {
            reachable.extend(self.all_trees(subvol)?.into_iter().map(|t| t.name_id));
        }
        let unused: Vec<NameId> = drain_pages(
            self.config.page_size,
            |after, limit| self.tables.page_name_ids(after, limit),
            |id| *id,
        )?
        .into_iter()
        .filter(|id| !reachable.contains(id))
        .collect();
        self.tables.remove_names(&unused)?;
        report.names_removed += unused.len() as u64;
        Ok(())
    }

    fn unused_inodes(&self, report: &mut GcReport, touched: &mut HashSet<SubvolumeId>) -> MetaResult<()> {
        for subvol in self.subvolumes()? {
            let mut reachable: HashSet<InodeId> =
                self.all_trees(subvol)?.into_iter().map(|t| t.inode_id).collect();
            reachable.insert(InodeId::ROOT);
            let unused: Vec<InodeId> = self
                .all_inodes(subvol)?
                .into_iter()
                .map(|i| i.id)
                .filter(|id| !reachable.contains(id))
                .collect();
            if !unused.is_empty() {
                self.tables.remove_inodes(subvol, &unused)?;
                touched.insert(subvol);
                report.inodes_removed += unused.len() as u64;
            }
        }
        Ok(())
    }

    fn unused_xattrs_and_links(&self, report: &mut GcReport) -> MetaResult<()> {
        for subvol in self.subvolumes()? {
            let live: HashSet<InodeId> = self.all_inodes(subvol)?.into_iter().map(|i| i.id).collect();

            let xattrs: Vec<(InodeId, Vec<u8>)> = drain_pages(
                self.config.page_size,
                |after, limit| self.tables.page_xattr_keys(subvol, after, limit),
                |key| key.clone(),
            )?
            .into_iter()
            .filter(|(inode, _)| !live.contains(inode))
            .collect();
            self.tables.remove_xattrs(subvol, &xattrs)?;
            report.xattrs_removed += xattrs.len() as u64;

            let links: Vec<InodeId> = drain_pages(
                self.config.page_size,
                |after, limit| self.tables.page_link_inodes(subvol, after, limit),
                |id| *id,
            )?
            .into_iter()
            .filter(|inode| !live.contains(inode))
            .collect();
            self.tables.remove_links(subvol, &links)?;
            report.links_removed += links.len() as u64;
        }
        Ok(())
    }

    fn unused_block_refs(&self, report: &mut GcReport, touched: &mut HashSet<SubvolumeId>) -> MetaResult<()> {
        for subvol in self.subvolumes()? {
            let block_counts: HashMap<InodeId, u64> = self
                .all_inodes(subvol)?
                .into_iter()
                .map(|i| (i.id, i.block_count(self.block_size)))
                .collect();
            let doomed: Vec<_> = self
                .all_block_refs(subvol)?
                .into_iter()
                .filter(|(inode, block, _)| block_counts.get(inode).map_or(true, |count| block >= count))
                .collect();
            if !doomed.is_empty() {
                self.index.remove(subvol, &doomed)?;
                touched.insert(subvol);
                report.block_refs_removed += doomed.len() as u64;
            }
        }
        Ok(())
    }

    fn unused_hashes(&self, report: &mut GcReport) -> MetaResult<()> {
        let orphans: Vec<HashId> = match self.tables.layout() {
            StorageLayout::Split => {
                let mut reachable: HashSet<HashId> = HashSet::new();
                for subvol in self.subvolumes()? {
                    reachable.extend(self.all_block_refs(subvol)?.into_iter().map(|(_, _, r)| r.hash_id));
                }
                drain_pages(
                    self.config.page_size,
                    |after, limit| self.tables.page_hash_ids(after, limit),
                    |id| *id,
                )?
                .into_iter()
                .filter(|id| !reachable.contains(id))
                .collect()
            }
            StorageLayout::Clustered => drain_pages(
                self.config.page_size,
                |after, limit| self.tables.page_hash_counts(after, limit),
                |(id, _)| *id,
            )?
            .into_iter()
            .filter(|(_, count)| *count == 0)
            .map(|(id, _)| id)
            .collect(),
        };
        if orphans.is_empty() {
            return Ok(());
        }
        let released = self.tables.remove_quads(&orphans)?;
        debug!(count = orphans.len(), released, "removed orphan hashes");
        report.hashes_removed += orphans.len() as u64;
        report.bytes_reclaimed += released;
        Ok(())
    }

    fn refresh_usage(&self, report: &mut GcReport, touched: &HashSet<SubvolumeId>, now: u64) -> MetaResult<()> {
        let hashes_changed = report.hashes_removed > 0;
        for mut subvol in self.tables.list_subvolumes()? {
            let affected = subvol.usage.is_none()
                || touched.contains(&subvol.id)
                || self.changed.contains(&subvol.id)
                || hashes_changed;
            if !affected {
                continue;
            }
            subvol.usage = Some(compute_usage(
                &self.tables,
                subvol.id,
                self.config.page_size,
                Timestamp::from_millis(now),
            )?);
            self.tables.put_subvolume(&subvol)?;
            report.subvolumes_refreshed += 1;
        }
        Ok(())
    }
}
