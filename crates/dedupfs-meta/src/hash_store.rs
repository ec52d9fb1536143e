//! Content-addressed block storage with deduplication.
//!
//! A block is digested; known content only gains an index row pointing at the
//! existing hash. Novel content is compressed and stored as a new quad, or
//! rewrites the previous quad of that block in place when this block was its
//! only reference.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use dedupfs_reduce::{BlockDigest, Compressed, CompressionPool, CompressionSelector, DigestAlgorithm};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::block_index::BlockIndex;
use crate::error::{MetaError, MetaResult};
use crate::metrics::StoreMetrics;
use crate::tables::Tables;
use crate::types::{BlockRef, HashId, InodeId, StorageLayout, StoredBlock, SubvolumeId};

/// Store-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Nominal block size in bytes
    pub block_size: usize,
    /// Digest function name: blake3, sha256 or sha512
    pub digest: String,
    /// Physical layout of the hash tables
    pub layout: StorageLayout,
    /// Read back and re-digest every stored quad
    pub verify_writes: bool,
    /// Refuse writes and skip garbage collection
    pub read_only: bool,
    /// Subvolume to mount
    pub subvolume: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: 128 * 1024,
            digest: "blake3".to_string(),
            layout: StorageLayout::Split,
            verify_writes: false,
            read_only: false,
            subvolume: "@root".to_string(),
        }
    }
}

/// How a block write was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Content already stored; only the index row changed
    Duplicate(HashId),
    /// A new quad was inserted
    Inserted(HashId),
    /// The block's previous quad was rewritten in place
    Updated(HashId),
}

impl WriteOutcome {
    /// The hash the block now points at
    pub fn hash_id(&self) -> HashId {
        match self {
            WriteOutcome::Duplicate(id) | WriteOutcome::Inserted(id) | WriteOutcome::Updated(id) => *id,
        }
    }
}

/// Dedup write path and decompressing read path for one subvolume
pub struct HashStore {
    tables: Tables,
    index: BlockIndex,
    selector: CompressionSelector,
    pool: Option<CompressionPool>,
    digest: DigestAlgorithm,
    block_size: usize,
    verify_writes: bool,
    subvol: SubvolumeId,
    metrics: Arc<StoreMetrics>,
}

impl HashStore {
    /// Build a store. An unknown digest name is a configuration error.
    pub fn new(
        tables: Tables,
        config: &StoreConfig,
        selector: CompressionSelector,
        pool: Option<CompressionPool>,
        subvol: SubvolumeId,
        metrics: Arc<StoreMetrics>,
    ) -> MetaResult<Self> {
        let digest: DigestAlgorithm = config
            .digest
            .parse()
            .map_err(|e| MetaError::Config(format!("{}", e)))?;
        if config.block_size == 0 {
            return Err(MetaError::Config("block_size must be positive".to_string()));
        }
        Ok(Self {
            index: BlockIndex::new(tables.clone()),
            tables,
            selector,
            pool,
            digest,
            block_size: config.block_size,
            verify_writes: config.verify_writes,
            subvol,
            metrics,
        })
    }

    /// Nominal block size
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Subvolume this store writes into
    pub fn subvolume(&self) -> SubvolumeId {
        self.subvol
    }

    /// Digest function in use
    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.digest
    }

    /// The block index
    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    /// Store one block
    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub fn write(&self, inode: InodeId, block: u64, data: &[u8]) -> MetaResult<WriteOutcome> {
        let digest = self.digest.digest(data);
        if let Some(hash_id) = self.tables.find_hash(digest.as_bytes())? {
            return self.link_duplicate(inode, block, hash_id, data.len() as u64);
        }
        let compressed = self.selector.select(data)?;
        self.store_novel(inode, block, digest, data, compressed)
    }

    /// Store several blocks, compressing novel content as one batch.
    ///
    /// Writes are applied in order, so content first stored by an earlier
    /// entry of the batch is a duplicate for later ones.
    #[instrument(level = "debug", skip(self, blocks), fields(blocks = blocks.len()))]
    pub fn write_batch(&self, blocks: Vec<(InodeId, u64, Bytes)>) -> MetaResult<Vec<WriteOutcome>> {
        let digests: Vec<BlockDigest> = blocks.iter().map(|(_, _, d)| self.digest.digest(d)).collect();

        let mut seen = HashSet::new();
        let mut novel = Vec::new();
        for (slot, digest) in digests.iter().enumerate() {
            if seen.insert(digest.as_bytes()) && self.tables.find_hash(digest.as_bytes())?.is_none() {
                novel.push((slot, blocks[slot].2.clone()));
            }
        }
        let mut compressed: HashMap<usize, Compressed> = match &self.pool {
            Some(pool) => pool.compress_batch(novel)?,
            None => self.selector.select_batch(novel)?.into_iter().collect(),
        };

        let mut outcomes = Vec::with_capacity(blocks.len());
        for (slot, ((inode, block, data), digest)) in blocks.into_iter().zip(digests).enumerate() {
            let outcome = match self.tables.find_hash(digest.as_bytes())? {
                Some(hash_id) => self.link_duplicate(inode, block, hash_id, data.len() as u64)?,
                None => {
                    // An in-place update earlier in the batch can retire a digest
                    // that was known during the scan.
                    let c = match compressed.remove(&slot) {
                        Some(c) => c,
                        None => self.selector.select(&data)?,
                    };
                    self.store_novel(inode, block, digest, &data, c)?
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Read one block. Sparse blocks come back as a full block of zeros.
    pub fn read(&self, inode: InodeId, block: u64) -> MetaResult<Bytes> {
        let Some(r) = self.index.get(self.subvol, inode, block)? else {
            self.metrics.record_read(true);
            return Ok(Bytes::from(vec![0u8; self.block_size]));
        };
        let mut plain = self.load(r.hash_id)?;
        plain.truncate(r.real_size as usize);
        self.metrics.record_read(false);
        Ok(Bytes::from(plain))
    }

    /// Decompressed content of a hash, using the codec recorded for it
    pub fn load(&self, hash_id: HashId) -> MetaResult<Vec<u8>> {
        let data = self.tables.get_block(hash_id)?.ok_or_else(|| MetaError::Corruption {
            hash_id: hash_id.as_u64(),
            reason: "block row missing".to_string(),
        })?;
        let codec = self
            .tables
            .get_compression_type(hash_id)?
            .ok_or_else(|| MetaError::Corruption {
                hash_id: hash_id.as_u64(),
                reason: "compression type missing".to_string(),
            })?;
        Ok(self.selector.registry().decompress(codec, &data)?)
    }

    fn link_duplicate(&self, inode: InodeId, block: u64, hash_id: HashId, len: u64) -> MetaResult<WriteOutcome> {
        self.index.set(
            self.subvol,
            inode,
            block,
            BlockRef {
                hash_id,
                real_size: len,
            },
        )?;
        self.metrics.record_dedup(len);
        debug!(%inode, block, hash = %hash_id, "duplicate block");
        Ok(WriteOutcome::Duplicate(hash_id))
    }

    fn store_novel(
        &self,
        inode: InodeId,
        block: u64,
        digest: BlockDigest,
        data: &[u8],
        compressed: Compressed,
    ) -> MetaResult<WriteOutcome> {
        let real_size = data.len() as u64;
        let stored = StoredBlock {
            digest: digest.0,
            codec: compressed.codec.id(),
            data: compressed.data,
            real_size,
        };
        let stored_len = stored.data.len() as u64;

        let previous = self.index.get(self.subvol, inode, block)?;
        let outcome = match previous {
            Some(prev) if self.index.reference_count(prev.hash_id)? == 1 => {
                self.tables.update_quad(prev.hash_id, &stored)?;
                self.metrics.record_update(real_size, stored_len);
                WriteOutcome::Updated(prev.hash_id)
            }
            _ => {
                let id = self.tables.insert_quad(&stored)?;
                self.metrics.record_insert(real_size, stored_len);
                WriteOutcome::Inserted(id)
            }
        };
        let hash_id = outcome.hash_id();
        if self.verify_writes {
            self.verify(hash_id, &stored.digest)?;
        }
        self.index
            .set(self.subvol, inode, block, BlockRef { hash_id, real_size })?;
        debug!(
            %inode,
            block,
            hash = %hash_id,
            codec = %compressed.codec,
            real_size,
            stored_len,
            "stored block"
        );
        Ok(outcome)
    }

    fn verify(&self, hash_id: HashId, expected: &[u8]) -> MetaResult<()> {
        let plain = self.load(hash_id)?;
        let actual = self.digest.digest(&plain);
        if actual.as_bytes() != expected {
            warn!(hash = %hash_id, "post-write verification failed");
            return Err(MetaError::Corruption {
                hash_id: hash_id.as_u64(),
                reason: format!(
                    "digest mismatch after write: expected {}, read back {}",
                    BlockDigest(expected.to_vec()),
                    actual
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::{KvStore, MemoryKvStore};
    use crate::tables::{keys, Table};
    use dedupfs_reduce::{CodecKind, CodecRegistry, CompressionConfig, CompressionMethod, PoolConfig};

    const BS: usize = 64 * 1024;

    fn selector(method: CompressionMethod) -> CompressionSelector {
        CompressionSelector::new(
            CompressionConfig {
                method,
                ..Default::default()
            },
            Arc::new(CodecRegistry::new()),
        )
    }

    fn store_with(layout: StorageLayout, pool: bool) -> (Tables, HashStore, Arc<StoreMetrics>) {
        let tables = Tables::new(Arc::new(MemoryKvStore::new()), layout);
        let config = StoreConfig {
            block_size: BS,
            layout,
            verify_writes: true,
            ..Default::default()
        };
        let sel = selector(CompressionMethod::Codec(CodecKind::Zlib));
        let pool = if pool {
            CompressionPool::from_config(
                &PoolConfig {
                    enabled: true,
                    max_workers: 2,
                },
                &sel,
            )
            .unwrap()
        } else {
            None
        };
        let metrics = Arc::new(StoreMetrics::new());
        let store = HashStore::new(tables.clone(), &config, sel, pool, SubvolumeId::new(1), metrics.clone()).unwrap();
        (tables, store, metrics)
    }

    fn content(seed: u8) -> Vec<u8> {
        (0..BS).map(|i| ((i / 64) as u8).wrapping_mul(seed)).collect()
    }

    #[test]
    fn test_duplicate_shares_quad() {
        let (tables, store, metrics) = store_with(StorageLayout::Split, false);
        let data = content(3);
        let first = store.write(InodeId::new(10), 0, &data).unwrap();
        let second = store.write(InodeId::new(11), 0, &data).unwrap();
        assert!(matches!(first, WriteOutcome::Inserted(_)));
        assert_eq!(second, WriteOutcome::Duplicate(first.hash_id()));
        assert_eq!(tables.row_count(Table::Hash).unwrap(), 1);
        assert_eq!(metrics.snapshot().dedup_bytes, BS as u64);
        assert_eq!(store.read(InodeId::new(11), 0).unwrap().as_ref(), &data[..]);
    }

    #[test]
    fn test_sole_owner_updates_in_place() {
        let (tables, store, metrics) = store_with(StorageLayout::Split, false);
        let first = store.write(InodeId::new(10), 0, &content(3)).unwrap();
        let second = store.write(InodeId::new(10), 0, &content(5)).unwrap();
        assert_eq!(second, WriteOutcome::Updated(first.hash_id()));
        assert_eq!(tables.row_count(Table::Hash).unwrap(), 1);
        assert_eq!(metrics.snapshot().updated_blocks, 1);
        assert_eq!(store.read(InodeId::new(10), 0).unwrap().as_ref(), &content(5)[..]);
        let digest = store.digest_algorithm().digest(&content(3));
        assert_eq!(tables.find_hash(digest.as_bytes()).unwrap(), None);
    }

    #[test]
    fn test_shared_hash_is_never_rewritten() {
        for layout in [StorageLayout::Split, StorageLayout::Clustered] {
            let (tables, store, _) = store_with(layout, false);
            let shared = store.write(InodeId::new(10), 0, &content(3)).unwrap().hash_id();
            store.write(InodeId::new(11), 0, &content(3)).unwrap();
            let next = store.write(InodeId::new(10), 0, &content(7)).unwrap();
            assert!(matches!(next, WriteOutcome::Inserted(id) if id != shared));
            assert_eq!(tables.row_count(Table::Hash).unwrap(), 2);
            assert_eq!(store.read(InodeId::new(11), 0).unwrap().as_ref(), &content(3)[..]);
            assert_eq!(store.index().reference_count(shared).unwrap(), 1);
        }
    }

    #[test]
    fn test_sparse_read_is_zeros() {
        let (_, store, metrics) = store_with(StorageLayout::Split, false);
        let block = store.read(InodeId::new(99), 4).unwrap();
        assert_eq!(block.len(), BS);
        assert!(block.iter().all(|b| *b == 0));
        assert_eq!(metrics.snapshot().sparse_reads, 1);
    }

    #[test]
    fn test_short_block_round_trip() {
        let (_, store, _) = store_with(StorageLayout::Split, false);
        store.write(InodeId::new(2), 0, b"tail").unwrap();
        assert_eq!(store.read(InodeId::new(2), 0).unwrap().as_ref(), b"tail");
    }

    #[test]
    fn test_batch_dedups_within_itself() {
        for pool in [false, true] {
            let (tables, store, _) = store_with(StorageLayout::Split, pool);
            let batch = vec![
                (InodeId::new(1), 0, Bytes::from(content(2))),
                (InodeId::new(1), 1, Bytes::from(content(4))),
                (InodeId::new(2), 0, Bytes::from(content(2))),
            ];
            let out = store.write_batch(batch).unwrap();
            assert!(matches!(out[0], WriteOutcome::Inserted(_)));
            assert!(matches!(out[1], WriteOutcome::Inserted(_)));
            assert_eq!(out[2], WriteOutcome::Duplicate(out[0].hash_id()));
            assert_eq!(tables.row_count(Table::Block).unwrap(), 2);
            assert_eq!(store.read(InodeId::new(1), 1).unwrap().as_ref(), &content(4)[..]);
        }
    }

    #[test]
    fn test_codec_is_read_per_block() {
        let (tables, store, _) = store_with(StorageLayout::Split, false);
        let zlib = store.write(InodeId::new(1), 0, &content(9)).unwrap().hash_id();
        assert_eq!(tables.get_compression_type(zlib).unwrap(), Some(CodecKind::Zlib.id()));

        let other = HashStore::new(
            tables.clone(),
            &StoreConfig {
                block_size: BS,
                ..Default::default()
            },
            selector(CompressionMethod::Codec(CodecKind::Zstd)),
            None,
            SubvolumeId::new(1),
            Arc::new(StoreMetrics::new()),
        )
        .unwrap();
        assert_eq!(other.read(InodeId::new(1), 0).unwrap().as_ref(), &content(9)[..]);
    }

    #[test]
    fn test_missing_block_row_is_corruption() {
        let (tables, store, _) = store_with(StorageLayout::Split, false);
        let id = store.write(InodeId::new(1), 0, &content(1)).unwrap().hash_id();
        tables.kv().delete(&keys::key(keys::BLOCK, &[id.as_u64()])).unwrap();
        let err = store.read(InodeId::new(1), 0).unwrap_err();
        assert!(matches!(err, MetaError::Corruption { .. }));
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn test_unknown_digest_is_fatal() {
        let tables = Tables::new(Arc::new(MemoryKvStore::new()), StorageLayout::Split);
        let result = HashStore::new(
            tables,
            &StoreConfig {
                digest: "md5".to_string(),
                ..Default::default()
            },
            selector(CompressionMethod::None),
            None,
            SubvolumeId::new(1),
            Arc::new(StoreMetrics::new()),
        );
        assert!(matches!(result, Err(MetaError::Config(_))));
    }
}
