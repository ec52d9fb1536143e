//! Per-subvolume space accounting.

use std::collections::HashSet;

use crate::error::MetaResult;
use crate::tables::Tables;
use crate::types::{SubvolumeId, SubvolumeUsage, Timestamp};

/// Recompute usage of one subvolume by paging its inode and block index rows
pub fn compute_usage(
    tables: &Tables,
    subvol: SubvolumeId,
    page_size: usize,
    now: Timestamp,
) -> MetaResult<SubvolumeUsage> {
    let page_size = page_size.max(1);
    let mut usage = SubvolumeUsage {
        refreshed_at: now,
        ..Default::default()
    };

    let mut after = None;
    loop {
        let page = tables.page_inodes(subvol, after, page_size)?;
        for inode in page.iter().filter(|i| i.is_file()) {
            usage.apparent_size += inode.size;
        }
        match page.last() {
            Some(last) if page.len() == page_size => after = Some(last.id),
            _ => break,
        }
    }

    let mut hashes = HashSet::new();
    let mut after = None;
    loop {
        let page = tables.page_block_refs(subvol, after, page_size)?;
        for (_, _, r) in &page {
            usage.stored_size += r.real_size;
            usage.block_count += 1;
            hashes.insert(r.hash_id);
        }
        match page.last() {
            Some((inode, block, _)) if page.len() == page_size => after = Some((*inode, *block)),
            _ => break,
        }
    }

    for hash in hashes {
        if let Some(sizes) = tables.get_hash_sizes(hash)? {
            usage.unique_size += sizes.real_size;
            usage.compressed_size += sizes.compressed_size;
        }
    }
    usage.dedup_size = usage.stored_size.saturating_sub(usage.unique_size);
    usage.sparse_size = usage.apparent_size.saturating_sub(usage.stored_size);
    Ok(usage)
}
