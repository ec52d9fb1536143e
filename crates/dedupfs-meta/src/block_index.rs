//! The inode → hash block index and its reference accounting.
//!
//! Every change to an InodeHashBlock row goes through [`BlockIndex`], which
//! keeps the reverse index current and, under the clustered layout, the
//! HashCount and HashOwner rows as well.

use tracing::trace;

use crate::error::MetaResult;
use crate::tables::Tables;
use crate::types::{BlockRef, HashId, InodeId, StorageLayout, SubvolumeId};

/// Reference-counted access to InodeHashBlock rows
#[derive(Clone)]
pub struct BlockIndex {
    tables: Tables,
}

impl BlockIndex {
    /// Index over the given tables
    pub fn new(tables: Tables) -> Self {
        Self { tables }
    }

    fn clustered(&self) -> bool {
        self.tables.layout() == StorageLayout::Clustered
    }

    /// Row for one block, if the block is not sparse
    pub fn get(&self, subvol: SubvolumeId, inode: InodeId, block: u64) -> MetaResult<Option<BlockRef>> {
        self.tables.get_block_ref(subvol, inode, block)
    }

    /// Point a block at `new`. Returns the row it replaced.
    pub fn set(
        &self,
        subvol: SubvolumeId,
        inode: InodeId,
        block: u64,
        new: BlockRef,
    ) -> MetaResult<Option<BlockRef>> {
        let old = self.tables.get_block_ref(subvol, inode, block)?;
        if old == Some(new) {
            return Ok(old);
        }
        self.tables
            .put_block_ref(subvol, inode, block, &new, old.as_ref())?;
        if self.clustered() && old.map(|o| o.hash_id) != Some(new.hash_id) {
            self.add_reference(new.hash_id, subvol)?;
            if let Some(old) = old {
                self.drop_reference(old.hash_id, subvol)?;
            }
        }
        trace!(%subvol, %inode, block, hash = %new.hash_id, "block index updated");
        Ok(old)
    }

    /// Delete rows, keeping counts in step
    pub fn remove(&self, subvol: SubvolumeId, rows: &[(InodeId, u64, BlockRef)]) -> MetaResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.tables.remove_block_refs(subvol, rows)?;
        if self.clustered() {
            for (_, _, r) in rows {
                self.drop_reference(r.hash_id, subvol)?;
            }
        }
        Ok(())
    }

    /// Delete every row of `inode` at or past `first_block`. Returns the number removed.
    pub fn remove_from(&self, subvol: SubvolumeId, inode: InodeId, first_block: u64) -> MetaResult<usize> {
        let doomed: Vec<_> = self
            .tables
            .block_refs_of_inode(subvol, inode)?
            .into_iter()
            .filter(|(bn, _)| *bn >= first_block)
            .map(|(bn, r)| (inode, bn, r))
            .collect();
        self.remove(subvol, &doomed)?;
        Ok(doomed.len())
    }

    /// Number of rows referencing `hash` across all subvolumes, read from the
    /// store on every call.
    pub fn reference_count(&self, hash: HashId) -> MetaResult<u64> {
        if self.clustered() {
            Ok(self.tables.hash_count(hash)?.unwrap_or(0))
        } else {
            self.tables.count_hash_refs(hash)
        }
    }

    fn add_reference(&self, hash: HashId, subvol: SubvolumeId) -> MetaResult<()> {
        let count = self.tables.hash_count(hash)?.unwrap_or(0);
        self.tables.put_hash_count(hash, count + 1)?;
        let mut owners = self.tables.hash_owners(hash)?;
        if owners.insert(subvol) {
            self.tables.put_hash_owners(hash, &owners)?;
        }
        Ok(())
    }

    fn drop_reference(&self, hash: HashId, subvol: SubvolumeId) -> MetaResult<()> {
        let count = self.tables.hash_count(hash)?.unwrap_or(0);
        self.tables.put_hash_count(hash, count.saturating_sub(1))?;
        if self.tables.count_hash_refs_in(hash, subvol)? == 0 {
            let mut owners = self.tables.hash_owners(hash)?;
            if owners.remove(&subvol) {
                self.tables.put_hash_owners(hash, &owners)?;
            }
        }
        Ok(())
    }
}
