//! Typed tables over a [`KvStore`].
//!
//! Every logical table lives under a one-byte tag. Global tables are keyed by
//! `[tag][id]`, per-subvolume tables by `[tag][subvol][id...]`, with all ids
//! big-endian so key order matches id order and ranges page cleanly. Rows are
//! bincode-encoded at this boundary; nothing above it sees raw bytes.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MetaError, MetaResult};
use crate::kvstore::{BatchOp, KvPair, KvStore};
use crate::types::{
    BlockRef, HashId, HashRow, HashSizes, Inode, InodeId, NameId, StorageLayout, StoredBlock,
    Subvolume, SubvolumeId, Timestamp, TreeEntry, TreeId,
};

/// Key layout shared by every table
pub mod keys {
    /// Per-table id sequences
    pub const SEQUENCE: u8 = 0x01;
    /// hash_id → digest
    pub const HASH: u8 = 0x10;
    /// digest → hash_id
    pub const HASH_DIGEST: u8 = 0x11;
    /// hash_id → stored bytes
    pub const BLOCK: u8 = 0x12;
    /// hash_id → codec id
    pub const COMPRESSION_TYPE: u8 = 0x13;
    /// hash_id → sizes
    pub const HASH_SIZES: u8 = 0x14;
    /// hash_id → live reference count (clustered layout)
    pub const HASH_COUNT: u8 = 0x15;
    /// hash_id → owning subvolumes (clustered layout)
    pub const HASH_OWNER: u8 = 0x16;
    /// (hash_id, subvol, inode, block) → () reverse index of inode_hash_block
    pub const HASH_REFS: u8 = 0x17;
    /// name_id → value
    pub const NAME: u8 = 0x20;
    /// value → name_id
    pub const NAME_VALUE: u8 = 0x21;
    /// subvol_id → subvolume row
    pub const SUBVOLUME: u8 = 0x30;
    /// name digest → subvol_id
    pub const SUBVOLUME_NAME: u8 = 0x31;
    /// (subvol, inode) → inode row
    pub const INODE: u8 = 0x40;
    /// (subvol, tree_id) → tree row
    pub const TREE: u8 = 0x41;
    /// (subvol, parent tree, name_id) → tree_id
    pub const TREE_NAME: u8 = 0x42;
    /// (subvol, inode) → symlink target
    pub const LINK: u8 = 0x43;
    /// (subvol, inode, name) → value
    pub const XATTR: u8 = 0x44;
    /// (subvol, inode, block) → block ref
    pub const INODE_HASH_BLOCK: u8 = 0x45;

    /// `[tag][part...]` with big-endian parts
    pub fn key(tag: u8, parts: &[u64]) -> Vec<u8> {
        let mut k = Vec::with_capacity(1 + parts.len() * 8);
        k.push(tag);
        for part in parts {
            k.extend_from_slice(&part.to_be_bytes());
        }
        k
    }

    /// `[tag][part...][tail]`
    pub fn key_with_tail(tag: u8, parts: &[u64], tail: &[u8]) -> Vec<u8> {
        let mut k = key(tag, parts);
        k.extend_from_slice(tail);
        k
    }

    /// Smallest key greater than every key starting with `prefix`
    pub fn upper_bound(prefix: &[u8]) -> Vec<u8> {
        let mut end = prefix.to_vec();
        while let Some(last) = end.pop() {
            if last < u8::MAX {
                end.push(last + 1);
                return end;
            }
        }
        vec![u8::MAX; prefix.len() + 1]
    }
}

/// Logical tables, for row counting and diagnostics
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Table {
    /// Hash rows
    Hash,
    /// Block rows
    Block,
    /// CompressionType rows
    CompressionType,
    /// HashSizes rows
    HashSizes,
    /// HashCount rows
    HashCount,
    /// HashOwner rows
    HashOwner,
    /// Interned names
    Name,
    /// Subvolumes
    Subvolume,
    /// Inodes, all subvolumes
    Inode,
    /// Tree rows, all subvolumes
    Tree,
    /// Symlink targets, all subvolumes
    Link,
    /// Extended attributes, all subvolumes
    Xattr,
    /// InodeHashBlock rows, all subvolumes
    InodeHashBlock,
}

impl Table {
    fn tag(&self) -> u8 {
        match self {
            Table::Hash => keys::HASH,
            Table::Block => keys::BLOCK,
            Table::CompressionType => keys::COMPRESSION_TYPE,
            Table::HashSizes => keys::HASH_SIZES,
            Table::HashCount => keys::HASH_COUNT,
            Table::HashOwner => keys::HASH_OWNER,
            Table::Name => keys::NAME,
            Table::Subvolume => keys::SUBVOLUME,
            Table::Inode => keys::INODE,
            Table::Tree => keys::TREE,
            Table::Link => keys::LINK,
            Table::Xattr => keys::XATTR,
            Table::InodeHashBlock => keys::INODE_HASH_BLOCK,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> MetaResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> MetaResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn read_u64(bytes: &[u8], at: usize) -> MetaResult<u64> {
    bytes
        .get(at..at + 8)
        .and_then(|s| <[u8; 8]>::try_from(s).ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| MetaError::Serialization(format!("short key or value at offset {}", at)))
}

/// Typed access to every table. Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct Tables {
    kv: Arc<dyn KvStore>,
    layout: StorageLayout,
}

impl Tables {
    /// Wrap a KV backend
    pub fn new(kv: Arc<dyn KvStore>, layout: StorageLayout) -> Self {
        Self { kv, layout }
    }

    /// Physical layout of the hash tables
    pub fn layout(&self) -> StorageLayout {
        self.layout
    }

    /// The underlying backend
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    // ---- transactions ---------------------------------------------------

    /// Open a coarse transaction
    pub fn begin(&self) -> MetaResult<()> {
        self.kv.begin()
    }

    /// Commit the current transaction level
    pub fn commit(&self) -> MetaResult<()> {
        self.kv.commit()
    }

    /// Roll the whole transaction back
    pub fn rollback(&self) -> MetaResult<()> {
        self.kv.rollback()
    }

    /// Backend space reclamation after bulk deletes
    pub fn reclaim(&self) -> MetaResult<()> {
        self.kv.reclaim()
    }

    /// Full compaction
    pub fn vacuum(&self) -> MetaResult<u64> {
        self.kv.vacuum()
    }

    /// Run `f` inside a transaction, rolling back if it fails
    pub fn in_transaction<T>(&self, f: impl FnOnce() -> MetaResult<T>) -> MetaResult<T> {
        self.begin()?;
        match f() {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = self.rollback() {
                    tracing::error!(error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }

    // ---- generic helpers ------------------------------------------------

    fn get_row<T: DeserializeOwned>(&self, key: &[u8]) -> MetaResult<Option<T>> {
        self.kv.get(key)?.map(|v| decode(&v)).transpose()
    }

    fn get_u64(&self, key: &[u8]) -> MetaResult<Option<u64>> {
        self.kv.get(key)?.map(|v| read_u64(&v, 0)).transpose()
    }

    fn page(&self, prefix: &[u8], after: Option<Vec<u8>>, limit: usize) -> MetaResult<Vec<KvPair>> {
        let start = match after {
            Some(mut k) => {
                k.push(0);
                k
            }
            None => prefix.to_vec(),
        };
        self.kv.scan_range(&start, &keys::upper_bound(prefix), limit)
    }

    fn next_id(&self, seq_key: Vec<u8>) -> MetaResult<u64> {
        let next = self.get_u64(&seq_key)?.unwrap_or(1);
        self.kv.put(seq_key, (next + 1).to_be_bytes().to_vec())?;
        Ok(next)
    }

    fn bump_sequence(&self, seq_key: Vec<u8>, used: u64) -> MetaResult<()> {
        let next = self.get_u64(&seq_key)?.unwrap_or(1);
        if used >= next {
            self.kv.put(seq_key, (used + 1).to_be_bytes().to_vec())?;
        }
        Ok(())
    }

    /// Number of rows in a table, across all subvolumes
    pub fn row_count(&self, table: Table) -> MetaResult<usize> {
        Ok(self.kv.scan_prefix(&[table.tag()])?.len())
    }

    // ---- hash / block / compression_type / hash_sizes -----------------

    /// Hash id for a digest, if that content is already stored
    pub fn find_hash(&self, digest: &[u8]) -> MetaResult<Option<HashId>> {
        Ok(self
            .get_u64(&keys::key_with_tail(keys::HASH_DIGEST, &[], digest))?
            .map(HashId::new))
    }

    /// Hash row by id
    pub fn get_hash(&self, id: HashId) -> MetaResult<Option<HashRow>> {
        self.get_row(&keys::key(keys::HASH, &[id.as_u64()]))
    }

    /// Block row by id
    pub fn get_block(&self, id: HashId) -> MetaResult<Option<Vec<u8>>> {
        self.kv.get(&keys::key(keys::BLOCK, &[id.as_u64()]))
    }

    /// CompressionType row by id
    pub fn get_compression_type(&self, id: HashId) -> MetaResult<Option<u8>> {
        Ok(self
            .kv
            .get(&keys::key(keys::COMPRESSION_TYPE, &[id.as_u64()]))?
            .and_then(|v| v.first().copied()))
    }

    /// HashSizes row by id
    pub fn get_hash_sizes(&self, id: HashId) -> MetaResult<Option<HashSizes>> {
        self.get_row(&keys::key(keys::HASH_SIZES, &[id.as_u64()]))
    }

    fn quad_ops(&self, id: HashId, block: &StoredBlock) -> MetaResult<Vec<BatchOp>> {
        let raw = id.as_u64();
        let sizes = HashSizes {
            real_size: block.real_size,
            compressed_size: block.data.len() as u64,
        };
        Ok(vec![
            BatchOp::Put {
                key: keys::key(keys::HASH, &[raw]),
                value: encode(&HashRow {
                    digest: block.digest.clone(),
                })?,
            },
            BatchOp::Put {
                key: keys::key_with_tail(keys::HASH_DIGEST, &[], &block.digest),
                value: raw.to_be_bytes().to_vec(),
            },
            BatchOp::Put {
                key: keys::key(keys::BLOCK, &[raw]),
                value: block.data.clone(),
            },
            BatchOp::Put {
                key: keys::key(keys::COMPRESSION_TYPE, &[raw]),
                value: vec![block.codec],
            },
            BatchOp::Put {
                key: keys::key(keys::HASH_SIZES, &[raw]),
                value: encode(&sizes)?,
            },
        ])
    }

    /// Insert a new Hash/Block/CompressionType/HashSizes quad in one batch.
    ///
    /// Under the clustered layout the HashCount row is created with count 0.
    pub fn insert_quad(&self, block: &StoredBlock) -> MetaResult<HashId> {
        let id = HashId::new(self.next_id(keys::key(keys::SEQUENCE, &[keys::HASH as u64]))?);
        let mut ops = self.quad_ops(id, block)?;
        if self.layout == StorageLayout::Clustered {
            ops.push(BatchOp::Put {
                key: keys::key(keys::HASH_COUNT, &[id.as_u64()]),
                value: 0u64.to_be_bytes().to_vec(),
            });
        }
        self.kv.write_batch(ops)?;
        Ok(id)
    }

    /// Overwrite an existing quad with new content, moving its digest index entry
    pub fn update_quad(&self, id: HashId, block: &StoredBlock) -> MetaResult<()> {
        let old = self
            .get_hash(id)?
            .ok_or_else(|| MetaError::not_found(format!("hash {}", id)))?;
        let mut ops = vec![BatchOp::Delete {
            key: keys::key_with_tail(keys::HASH_DIGEST, &[], &old.digest),
        }];
        ops.extend(self.quad_ops(id, block)?);
        self.kv.write_batch(ops)
    }

    /// Delete whole quads (plus HashCount/HashOwner rows) in one batch.
    /// Returns the stored bytes released.
    pub fn remove_quads(&self, ids: &[HashId]) -> MetaResult<u64> {
        let mut ops = Vec::with_capacity(ids.len() * 7);
        let mut released = 0u64;
        for id in ids {
            let raw = id.as_u64();
            if let Some(row) = self.get_hash(*id)? {
                ops.push(BatchOp::Delete {
                    key: keys::key_with_tail(keys::HASH_DIGEST, &[], &row.digest),
                });
            }
            if let Some(sizes) = self.get_hash_sizes(*id)? {
                released += sizes.compressed_size;
            }
            for tag in [
                keys::HASH,
                keys::BLOCK,
                keys::COMPRESSION_TYPE,
                keys::HASH_SIZES,
                keys::HASH_COUNT,
                keys::HASH_OWNER,
            ] {
                ops.push(BatchOp::Delete {
                    key: keys::key(tag, &[raw]),
                });
            }
        }
        self.kv.write_batch(ops)?;
        Ok(released)
    }

    /// Page through hash ids in ascending order
    pub fn page_hash_ids(&self, after: Option<HashId>, limit: usize) -> MetaResult<Vec<HashId>> {
        let after = after.map(|id| keys::key(keys::HASH, &[id.as_u64()]));
        self.page(&[keys::HASH], after, limit)?
            .iter()
            .map(|(k, _)| read_u64(k, 1).map(HashId::new))
            .collect()
    }

    // ---- hash_count / hash_owner --------------------------------------

    /// HashCount row
    pub fn hash_count(&self, id: HashId) -> MetaResult<Option<u64>> {
        self.get_u64(&keys::key(keys::HASH_COUNT, &[id.as_u64()]))
    }

    /// Write a HashCount row
    pub fn put_hash_count(&self, id: HashId, count: u64) -> MetaResult<()> {
        self.kv.put(
            keys::key(keys::HASH_COUNT, &[id.as_u64()]),
            count.to_be_bytes().to_vec(),
        )
    }

    /// Page through HashCount rows in hash id order
    pub fn page_hash_counts(&self, after: Option<HashId>, limit: usize) -> MetaResult<Vec<(HashId, u64)>> {
        let after = after.map(|id| keys::key(keys::HASH_COUNT, &[id.as_u64()]));
        self.page(&[keys::HASH_COUNT], after, limit)?
            .iter()
            .map(|(k, v)| Ok((HashId::new(read_u64(k, 1)?), read_u64(v, 0)?)))
            .collect()
    }

    /// HashOwner row
    pub fn hash_owners(&self, id: HashId) -> MetaResult<BTreeSet<SubvolumeId>> {
        Ok(self
            .get_row(&keys::key(keys::HASH_OWNER, &[id.as_u64()]))?
            .unwrap_or_default())
    }

    /// Write a HashOwner row; an empty set deletes it
    pub fn put_hash_owners(&self, id: HashId, owners: &BTreeSet<SubvolumeId>) -> MetaResult<()> {
        let key = keys::key(keys::HASH_OWNER, &[id.as_u64()]);
        if owners.is_empty() {
            self.kv.delete(&key)
        } else {
            self.kv.put(key, encode(owners)?)
        }
    }

    // ---- inode_hash_block + reverse index -------------------------------

    /// InodeHashBlock row
    pub fn get_block_ref(&self, subvol: SubvolumeId, inode: InodeId, block: u64) -> MetaResult<Option<BlockRef>> {
        self.get_row(&keys::key(
            keys::INODE_HASH_BLOCK,
            &[subvol.as_u64(), inode.as_u64(), block],
        ))
    }

    fn ref_key(hash: HashId, subvol: SubvolumeId, inode: InodeId, block: u64) -> Vec<u8> {
        keys::key(
            keys::HASH_REFS,
            &[hash.as_u64(), subvol.as_u64(), inode.as_u64(), block],
        )
    }

    /// Write an InodeHashBlock row and keep the reverse index in step
    pub fn put_block_ref(
        &self,
        subvol: SubvolumeId,
        inode: InodeId,
        block: u64,
        new: &BlockRef,
        old: Option<&BlockRef>,
    ) -> MetaResult<()> {
        let mut ops = Vec::with_capacity(3);
        if let Some(old) = old.filter(|o| o.hash_id != new.hash_id) {
            ops.push(BatchOp::Delete {
                key: Self::ref_key(old.hash_id, subvol, inode, block),
            });
        }
        ops.push(BatchOp::Put {
            key: Self::ref_key(new.hash_id, subvol, inode, block),
            value: Vec::new(),
        });
        ops.push(BatchOp::Put {
            key: keys::key(
                keys::INODE_HASH_BLOCK,
                &[subvol.as_u64(), inode.as_u64(), block],
            ),
            value: encode(new)?,
        });
        self.kv.write_batch(ops)
    }

    /// Delete InodeHashBlock rows and their reverse index entries in one batch
    pub fn remove_block_refs(&self, subvol: SubvolumeId, rows: &[(InodeId, u64, BlockRef)]) -> MetaResult<()> {
        let mut ops = Vec::with_capacity(rows.len() * 2);
        for (inode, block, r) in rows {
            ops.push(BatchOp::Delete {
                key: Self::ref_key(r.hash_id, subvol, *inode, *block),
            });
            ops.push(BatchOp::Delete {
                key: keys::key(
                    keys::INODE_HASH_BLOCK,
                    &[subvol.as_u64(), inode.as_u64(), *block],
                ),
            });
        }
        self.kv.write_batch(ops)
    }

    /// All InodeHashBlock rows of one inode, in block order
    pub fn block_refs_of_inode(&self, subvol: SubvolumeId, inode: InodeId) -> MetaResult<Vec<(u64, BlockRef)>> {
        self.kv
            .scan_prefix(&keys::key(
                keys::INODE_HASH_BLOCK,
                &[subvol.as_u64(), inode.as_u64()],
            ))?
            .iter()
            .map(|(k, v)| Ok((read_u64(k, 17)?, decode(v)?)))
            .collect()
    }

    /// Page through InodeHashBlock rows of one subvolume in (inode, block) order
    pub fn page_block_refs(
        &self,
        subvol: SubvolumeId,
        after: Option<(InodeId, u64)>,
        limit: usize,
    ) -> MetaResult<Vec<(InodeId, u64, BlockRef)>> {
        let prefix = keys::key(keys::INODE_HASH_BLOCK, &[subvol.as_u64()]);
        let after = after.map(|(inode, block)| {
            keys::key(
                keys::INODE_HASH_BLOCK,
                &[subvol.as_u64(), inode.as_u64(), block],
            )
        });
        self.page(&prefix, after, limit)?
            .iter()
            .map(|(k, v)| Ok((InodeId::new(read_u64(k, 9)?), read_u64(k, 17)?, decode(v)?)))
            .collect()
    }

    /// InodeHashBlock rows referencing `hash`, across all subvolumes, read fresh
    pub fn count_hash_refs(&self, hash: HashId) -> MetaResult<u64> {
        Ok(self
            .kv
            .scan_prefix(&keys::key(keys::HASH_REFS, &[hash.as_u64()]))?
            .len() as u64)
    }

    /// InodeHashBlock rows referencing `hash` within one subvolume
    pub fn count_hash_refs_in(&self, hash: HashId, subvol: SubvolumeId) -> MetaResult<u64> {
        Ok(self
            .kv
            .scan_prefix(&keys::key(
                keys::HASH_REFS,
                &[hash.as_u64(), subvol.as_u64()],
            ))?
            .len() as u64)
    }

    // ---- inode ----------------------------------------------------------

    /// Inode row
    pub fn get_inode(&self, subvol: SubvolumeId, id: InodeId) -> MetaResult<Option<Inode>> {
        self.get_row(&keys::key(keys::INODE, &[subvol.as_u64(), id.as_u64()]))
    }

    /// Insert or replace an inode row. Explicit ids advance the inode sequence.
    pub fn put_inode(&self, subvol: SubvolumeId, inode: &Inode) -> MetaResult<()> {
        self.bump_sequence(
            keys::key(keys::SEQUENCE, &[keys::INODE as u64, subvol.as_u64()]),
            inode.id.as_u64(),
        )?;
        self.kv.put(
            keys::key(keys::INODE, &[subvol.as_u64(), inode.id.as_u64()]),
            encode(inode)?,
        )
    }

    /// Allocate a fresh inode number in a subvolume
    pub fn allocate_inode_id(&self, subvol: SubvolumeId) -> MetaResult<InodeId> {
        self.next_id(keys::key(keys::SEQUENCE, &[keys::INODE as u64, subvol.as_u64()]))
            .map(InodeId::new)
    }

    /// Delete inode rows
    pub fn remove_inodes(&self, subvol: SubvolumeId, ids: &[InodeId]) -> MetaResult<()> {
        self.kv.write_batch(
            ids.iter()
                .map(|id| BatchOp::Delete {
                    key: keys::key(keys::INODE, &[subvol.as_u64(), id.as_u64()]),
                })
                .collect(),
        )
    }

    /// Page through inode rows of one subvolume
    pub fn page_inodes(&self, subvol: SubvolumeId, after: Option<InodeId>, limit: usize) -> MetaResult<Vec<Inode>> {
        let prefix = keys::key(keys::INODE, &[subvol.as_u64()]);
        let after = after.map(|id| keys::key(keys::INODE, &[subvol.as_u64(), id.as_u64()]));
        self.page(&prefix, after, limit)?
            .iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    // ---- name -----------------------------------------------------------

    /// Name id for a value, if interned
    pub fn find_name(&self, value: &[u8]) -> MetaResult<Option<NameId>> {
        Ok(self
            .get_u64(&keys::key_with_tail(keys::NAME_VALUE, &[], value))?
            .map(NameId::new))
    }

    /// Intern a name, returning the existing id when the value is known
    pub fn intern_name(&self, value: &[u8]) -> MetaResult<NameId> {
        if let Some(id) = self.find_name(value)? {
            return Ok(id);
        }
        let id = self.next_id(keys::key(keys::SEQUENCE, &[keys::NAME as u64]))?;
        self.kv.write_batch(vec![
            BatchOp::Put {
                key: keys::key(keys::NAME, &[id]),
                value: value.to_vec(),
            },
            BatchOp::Put {
                key: keys::key_with_tail(keys::NAME_VALUE, &[], value),
                value: id.to_be_bytes().to_vec(),
            },
        ])?;
        Ok(NameId::new(id))
    }

    /// Name value by id
    pub fn get_name(&self, id: NameId) -> MetaResult<Option<Vec<u8>>> {
        self.kv.get(&keys::key(keys::NAME, &[id.as_u64()]))
    }

    /// Delete names and their value index entries
    pub fn remove_names(&self, ids: &[NameId]) -> MetaResult<()> {
        let mut ops = Vec::with_capacity(ids.len() * 2);
        for id in ids {
            if let Some(value) = self.get_name(*id)? {
                ops.push(BatchOp::Delete {
                    key: keys::key_with_tail(keys::NAME_VALUE, &[], &value),
                });
            }
            ops.push(BatchOp::Delete {
                key: keys::key(keys::NAME, &[id.as_u64()]),
            });
        }
        self.kv.write_batch(ops)
    }

    /// Page through name ids
    pub fn page_name_ids(&self, after: Option<NameId>, limit: usize) -> MetaResult<Vec<NameId>> {
        let after = after.map(|id| keys::key(keys::NAME, &[id.as_u64()]));
        self.page(&[keys::NAME], after, limit)?
            .iter()
            .map(|(k, _)| read_u64(k, 1).map(NameId::new))
            .collect()
    }

    // ---- tree -----------------------------------------------------------

    fn tree_name_key(subvol: SubvolumeId, parent: Option<TreeId>, name: NameId) -> Vec<u8> {
        keys::key(
            keys::TREE_NAME,
            &[
                subvol.as_u64(),
                parent.map_or(0, |p| p.as_u64()),
                name.as_u64(),
            ],
        )
    }

    /// Insert a tree row; (subvol, parent, name) must be free
    pub fn insert_tree(
        &self,
        subvol: SubvolumeId,
        parent: Option<TreeId>,
        name_id: NameId,
        inode_id: InodeId,
    ) -> MetaResult<TreeEntry> {
        let unique = Self::tree_name_key(subvol, parent, name_id);
        if self.kv.contains_key(&unique)? {
            return Err(MetaError::Exists {
                what: format!("tree entry {} under {:?} in subvolume {}", name_id, parent, subvol),
            });
        }
        let id = TreeId::new(self.next_id(keys::key(keys::SEQUENCE, &[keys::TREE as u64]))?);
        let entry = TreeEntry {
            id,
            subvol_id: subvol,
            parent_id: parent,
            name_id,
            inode_id,
        };
        self.kv.write_batch(vec![
            BatchOp::Put {
                key: keys::key(keys::TREE, &[subvol.as_u64(), id.as_u64()]),
                value: encode(&entry)?,
            },
            BatchOp::Put {
                key: unique,
                value: id.as_u64().to_be_bytes().to_vec(),
            },
        ])?;
        Ok(entry)
    }

    /// Tree row by id
    pub fn get_tree(&self, subvol: SubvolumeId, id: TreeId) -> MetaResult<Option<TreeEntry>> {
        self.get_row(&keys::key(keys::TREE, &[subvol.as_u64(), id.as_u64()]))
    }

    /// Tree row by (parent, name)
    pub fn lookup_tree(
        &self,
        subvol: SubvolumeId,
        parent: Option<TreeId>,
        name_id: NameId,
    ) -> MetaResult<Option<TreeEntry>> {
        match self.get_u64(&Self::tree_name_key(subvol, parent, name_id))? {
            Some(id) => self.get_tree(subvol, TreeId::new(id)),
            None => Ok(None),
        }
    }

    /// True when some tree row has `parent` as its parent
    pub fn has_children(&self, subvol: SubvolumeId, parent: TreeId) -> MetaResult<bool> {
        let prefix = keys::key(keys::TREE_NAME, &[subvol.as_u64(), parent.as_u64()]);
        Ok(!self.page(&prefix, None, 1)?.is_empty())
    }

    /// Delete a tree row and its uniqueness index entry
    pub fn remove_tree(&self, entry: &TreeEntry) -> MetaResult<()> {
        self.kv.write_batch(vec![
            BatchOp::Delete {
                key: keys::key(keys::TREE, &[entry.subvol_id.as_u64(), entry.id.as_u64()]),
            },
            BatchOp::Delete {
                key: Self::tree_name_key(entry.subvol_id, entry.parent_id, entry.name_id),
            },
        ])
    }

    /// Page through tree rows of one subvolume
    pub fn page_trees(&self, subvol: SubvolumeId, after: Option<TreeId>, limit: usize) -> MetaResult<Vec<TreeEntry>> {
        let prefix = keys::key(keys::TREE, &[subvol.as_u64()]);
        let after = after.map(|id| keys::key(keys::TREE, &[subvol.as_u64(), id.as_u64()]));
        self.page(&prefix, after, limit)?
            .iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    // ---- link / xattr -------------------------------------------------

    /// Store a symlink target
    pub fn put_link(&self, subvol: SubvolumeId, inode: InodeId, target: &[u8]) -> MetaResult<()> {
        self.kv.put(
            keys::key(keys::LINK, &[subvol.as_u64(), inode.as_u64()]),
            target.to_vec(),
        )
    }

    /// Symlink target
    pub fn get_link(&self, subvol: SubvolumeId, inode: InodeId) -> MetaResult<Option<Vec<u8>>> {
        self.kv
            .get(&keys::key(keys::LINK, &[subvol.as_u64(), inode.as_u64()]))
    }

    /// Page through inode ids owning a link row
    pub fn page_link_inodes(&self, subvol: SubvolumeId, after: Option<InodeId>, limit: usize) -> MetaResult<Vec<InodeId>> {
        let prefix = keys::key(keys::LINK, &[subvol.as_u64()]);
        let after = after.map(|id| keys::key(keys::LINK, &[subvol.as_u64(), id.as_u64()]));
        self.page(&prefix, after, limit)?
            .iter()
            .map(|(k, _)| read_u64(k, 9).map(InodeId::new))
            .collect()
    }

    /// Delete link rows
    pub fn remove_links(&self, subvol: SubvolumeId, inodes: &[InodeId]) -> MetaResult<()> {
        self.kv.write_batch(
            inodes
                .iter()
                .map(|id| BatchOp::Delete {
                    key: keys::key(keys::LINK, &[subvol.as_u64(), id.as_u64()]),
                })
                .collect(),
        )
    }

    /// Set an extended attribute
    pub fn set_xattr(&self, subvol: SubvolumeId, inode: InodeId, name: &[u8], value: &[u8]) -> MetaResult<()> {
        self.kv.put(
            keys::key_with_tail(keys::XATTR, &[subvol.as_u64(), inode.as_u64()], name),
            value.to_vec(),
        )
    }

    /// Extended attribute value
    pub fn get_xattr(&self, subvol: SubvolumeId, inode: InodeId, name: &[u8]) -> MetaResult<Option<Vec<u8>>> {
        self.kv.get(&keys::key_with_tail(
            keys::XATTR,
            &[subvol.as_u64(), inode.as_u64()],
            name,
        ))
    }

    /// Page through (inode, attribute name) keys of one subvolume
    pub fn page_xattr_keys(
        &self,
        subvol: SubvolumeId,
        after: Option<(InodeId, Vec<u8>)>,
        limit: usize,
    ) -> MetaResult<Vec<(InodeId, Vec<u8>)>> {
        let prefix = keys::key(keys::XATTR, &[subvol.as_u64()]);
        let after = after.map(|(inode, name)| {
            keys::key_with_tail(keys::XATTR, &[subvol.as_u64(), inode.as_u64()], &name)
        });
        self.page(&prefix, after, limit)?
            .iter()
            .map(|(k, _)| Ok((InodeId::new(read_u64(k, 9)?), k[17..].to_vec())))
            .collect()
    }

    /// Delete extended attributes
    pub fn remove_xattrs(&self, subvol: SubvolumeId, attrs: &[(InodeId, Vec<u8>)]) -> MetaResult<()> {
        self.kv.write_batch(
            attrs
                .iter()
                .map(|(inode, name)| BatchOp::Delete {
                    key: keys::key_with_tail(keys::XATTR, &[subvol.as_u64(), inode.as_u64()], name),
                })
                .collect(),
        )
    }

    // ---- subvolume ----------------------------------------------------

    /// Create a subvolume row
    pub fn create_subvolume(&self, name: &str, name_digest: Vec<u8>, now: Timestamp) -> MetaResult<Subvolume> {
        let index = keys::key_with_tail(keys::SUBVOLUME_NAME, &[], &name_digest);
        if self.kv.contains_key(&index)? {
            return Err(MetaError::Exists {
                what: format!("subvolume {}", name),
            });
        }
        let id = SubvolumeId::new(self.next_id(keys::key(keys::SEQUENCE, &[keys::SUBVOLUME as u64]))?);
        let row = Subvolume {
            id,
            name: name.to_string(),
            name_digest,
            read_only: false,
            created_at: now,
            updated_at: now,
            usage: None,
        };
        self.kv.write_batch(vec![
            BatchOp::Put {
                key: keys::key(keys::SUBVOLUME, &[id.as_u64()]),
                value: encode(&row)?,
            },
            BatchOp::Put {
                key: index,
                value: id.as_u64().to_be_bytes().to_vec(),
            },
        ])?;
        Ok(row)
    }

    /// Subvolume row by id
    pub fn get_subvolume(&self, id: SubvolumeId) -> MetaResult<Option<Subvolume>> {
        self.get_row(&keys::key(keys::SUBVOLUME, &[id.as_u64()]))
    }

    /// Subvolume row by name digest
    pub fn find_subvolume(&self, name_digest: &[u8]) -> MetaResult<Option<Subvolume>> {
        match self.get_u64(&keys::key_with_tail(keys::SUBVOLUME_NAME, &[], name_digest))? {
            Some(id) => self.get_subvolume(SubvolumeId::new(id)),
            None => Ok(None),
        }
    }

    /// Replace a subvolume row
    pub fn put_subvolume(&self, row: &Subvolume) -> MetaResult<()> {
        self.kv
            .put(keys::key(keys::SUBVOLUME, &[row.id.as_u64()]), encode(row)?)
    }

    /// Every subvolume
    pub fn list_subvolumes(&self) -> MetaResult<Vec<Subvolume>> {
        self.kv
            .scan_prefix(&[keys::SUBVOLUME])?
            .iter()
            .map(|(_, v)| decode(v))
            .collect()
    }
}
