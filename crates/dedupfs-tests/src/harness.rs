//! Test Harness - engines over an in-memory store with a manual clock

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dedupfs_meta::{
    BatchOp, Clock, Engine, EngineConfig, HashId, KvPair, KvStore, ManualClock, MemoryKvStore, MetaError,
    MetaResult, StorageLayout, Tables,
};
use dedupfs_reduce::{CodecKind, CompressionMethod};
use rand::{rngs::StdRng, RngCore, SeedableRng};

/// In-memory store whose mutations fail on demand
#[derive(Default)]
pub struct FaultyKvStore {
    inner: MemoryKvStore,
    fail_writes: AtomicBool,
}

impl FaultyKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put, delete and batch fail until switched off
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> MetaResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MetaError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl KvStore for FaultyKvStore {
    fn get(&self, key: &[u8]) -> MetaResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> MetaResult<()> {
        self.check()?;
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> MetaResult<()> {
        self.check()?;
        self.inner.delete(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> MetaResult<Vec<KvPair>> {
        self.inner.scan_prefix(prefix)
    }

    fn scan_range(&self, start: &[u8], end: &[u8], limit: usize) -> MetaResult<Vec<KvPair>> {
        self.inner.scan_range(start, end, limit)
    }

    fn contains_key(&self, key: &[u8]) -> MetaResult<bool> {
        self.inner.contains_key(key)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> MetaResult<()> {
        self.check()?;
        self.inner.write_batch(ops)
    }

    fn begin(&self) -> MetaResult<()> {
        self.inner.begin()
    }

    fn commit(&self) -> MetaResult<()> {
        self.inner.commit()
    }

    fn rollback(&self) -> MetaResult<()> {
        self.inner.rollback()
    }

    fn vacuum(&self) -> MetaResult<u64> {
        self.inner.vacuum()
    }
}

/// A shared store and clock that engines can be opened on
pub struct TestEnv {
    pub kv: Arc<FaultyKvStore>,
    pub clock: ManualClock,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            kv: Arc::new(FaultyKvStore::new()),
            clock: ManualClock::new(1_000),
        }
    }

    /// Open an engine on this env's store
    pub fn open(&self, config: EngineConfig) -> Engine {
        let clock: Arc<dyn Clock> = Arc::new(self.clock.clone());
        Engine::open(self.kv.clone(), config, clock).expect("failed to open engine")
    }

    /// Open the named subvolume with an otherwise default test config
    pub fn open_subvolume(&self, name: &str, block_size: usize) -> Engine {
        let mut config = test_config(block_size);
        config.store.subvolume = name.to_string();
        self.open(config)
    }

    /// Tables over the same store, for inspecting rows directly
    pub fn tables(&self, layout: StorageLayout) -> Tables {
        Tables::new(self.kv.clone(), layout)
    }
}

/// zlib for every block, default thresholds
pub fn test_config(block_size: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.store.block_size = block_size;
    config.compression.method = CompressionMethod::Codec(CodecKind::Zlib);
    config
}

/// Text-like block that every codec shrinks
pub fn compressible_block(seed: u8, len: usize) -> Vec<u8> {
    let line = format!("block {:03} of the dedup test corpus; ", seed);
    line.bytes().cycle().take(len).collect()
}

/// Deterministic noise that no codec shrinks
pub fn random_block(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

/// Every hash id in the store
pub fn all_hash_ids(tables: &Tables) -> Vec<HashId> {
    tables
        .page_hash_ids(None, usize::MAX)
        .expect("failed to page hash ids")
}

/// Under the clustered layout, HashCount must equal the number of index rows
/// pointing at each hash; under either layout every HashOwner set must name
/// exactly the subvolumes holding such rows.
pub fn check_reference_counts(tables: &Tables) -> Result<(), String> {
    for hash in all_hash_ids(tables) {
        let refs = tables.count_hash_refs(hash).map_err(|e| e.to_string())?;
        if tables.layout() != StorageLayout::Clustered {
            continue;
        }
        let count = tables
            .hash_count(hash)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("hash {} has no count row", hash))?;
        if count != refs {
            return Err(format!("hash {}: count {} but {} index rows", hash, count, refs));
        }
        let owners = tables.hash_owners(hash).map_err(|e| e.to_string())?;
        for subvol in tables.list_subvolumes().map_err(|e| e.to_string())? {
            let held = tables
                .count_hash_refs_in(hash, subvol.id)
                .map_err(|e| e.to_string())?
                > 0;
            if held != owners.contains(&subvol.id) {
                return Err(format!(
                    "hash {}: owner set {:?} disagrees with subvolume {}",
                    hash, owners, subvol.id
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_faulty_store_fails_on_demand() {
        let kv = FaultyKvStore::new();
        kv.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        kv.fail_writes(true);
        assert!(kv.put(b"b".to_vec(), b"2".to_vec()).is_err());
        assert!(kv.write_batch(vec![BatchOp::Delete { key: b"a".to_vec() }]).is_err());
        assert_eq!(kv.get(b"a").unwrap(), Some(b"1".to_vec()));
        kv.fail_writes(false);
        kv.delete(b"a").unwrap();
        assert!(kv.get(b"a").unwrap().is_none());
    }

    #[test]
    fn test_blocks() {
        assert_eq!(compressible_block(1, 1000).len(), 1000);
        assert_ne!(compressible_block(1, 100), compressible_block(2, 100));
        assert_eq!(random_block(7, 64), random_block(7, 64));
        assert_ne!(random_block(7, 64), random_block(8, 64));
    }
}
