//! End-to-end scenarios: dedup, compression, write-back and reopen

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use crate::harness::{check_reference_counts, compressible_block, random_block, test_config, TestEnv};
    use dedupfs_meta::{
        EngineConfig, HashStore, InodeId, MemoryKvStore, MetaError, StorageLayout, StoreConfig, StoreMetrics,
        SubvolumeId, Table, Tables, WriteOutcome,
    };
    use dedupfs_reduce::{CodecKind, CodecRegistry, CompressionConfig, CompressionMethod, CompressionSelector};
    use tempfile::NamedTempFile;

    const KIB128: usize = 128 * 1024;

    #[test]
    fn test_identical_128k_blocks_share_one_quad() {
        let tables = Tables::new(Arc::new(MemoryKvStore::new()), StorageLayout::Split);
        let metrics = Arc::new(StoreMetrics::new());
        let selector = CompressionSelector::new(
            CompressionConfig {
                method: CompressionMethod::Codec(CodecKind::Zlib),
                minimal_size: 1024,
                ..Default::default()
            },
            Arc::new(CodecRegistry::new()),
        );
        let store = HashStore::new(
            tables.clone(),
            &StoreConfig::default(),
            selector,
            None,
            SubvolumeId::new(1),
            metrics.clone(),
        )
        .unwrap();
        let block = compressible_block(1, KIB128);

        let first = store.write(InodeId::new(10), 0, &block).unwrap();
        let hash = match first {
            WriteOutcome::Inserted(id) => id,
            other => panic!("expected insert, got {:?}", other),
        };
        assert_eq!(tables.get_compression_type(hash).unwrap(), Some(CodecKind::Zlib.id()));
        let rows_before = tables.kv().scan_prefix(&[]).unwrap().len();
        let dedup_before = metrics.snapshot().dedup_bytes;

        let second = store.write(InodeId::new(11), 0, &block).unwrap();
        assert_eq!(second, WriteOutcome::Duplicate(hash));
        for table in [Table::Hash, Table::Block, Table::CompressionType, Table::HashSizes] {
            assert_eq!(tables.row_count(table).unwrap(), 1, "{:?}", table);
        }
        // only the new index row and its reverse entry
        assert_eq!(tables.kv().scan_prefix(&[]).unwrap().len(), rows_before + 2);
        assert_eq!(metrics.snapshot().dedup_bytes - dedup_before, KIB128 as u64);
        assert_eq!(store.read(InodeId::new(11), 0).unwrap().as_ref(), block.as_slice());
    }

    #[test]
    fn test_dedup_across_files_through_engine() {
        let env = TestEnv::new();
        let mut engine = env.open(test_config(KIB128));
        let root = engine.root().unwrap().id;
        let block = compressible_block(2, KIB128);
        let mut files = Vec::new();
        for name in [b"a".as_slice(), b"b", b"c"] {
            let (_, inode) = engine.create_file(root, name, 0o644, 0, 0).unwrap();
            engine.write(inode.id, 0, &block).unwrap();
            files.push(inode.id);
        }
        engine.destroy().unwrap();

        assert_eq!(engine.tables().row_count(Table::Hash).unwrap(), 1);
        let snapshot = engine.metrics();
        assert_eq!(snapshot.inserted_blocks, 1);
        assert_eq!(snapshot.dedup_blocks, 2);
        assert!(snapshot.compression_ratio() < 0.1);

        let usage = engine.usage().unwrap();
        assert_eq!(usage.stored_size, 3 * KIB128 as u64);
        assert_eq!(usage.unique_size, KIB128 as u64);
        assert_eq!(usage.dedup_size, 2 * KIB128 as u64);
        for f in files {
            assert_eq!(engine.read(f, 0, KIB128).unwrap(), block);
        }
    }

    #[test]
    fn test_incompressible_block_stored_raw() {
        let env = TestEnv::new();
        let mut engine = env.open(test_config(4096));
        let root = engine.root().unwrap().id;
        let (_, f) = engine.create_file(root, b"noise", 0o644, 0, 0).unwrap();
        let noise = random_block(42, 4096);
        engine.write(f.id, 0, &noise).unwrap();
        engine.destroy().unwrap();

        let tables = engine.tables();
        let hash = tables.page_hash_ids(None, 1).unwrap()[0];
        assert_eq!(tables.get_compression_type(hash).unwrap(), Some(CodecKind::None.id()));
        assert_eq!(engine.read(f.id, 0, 4096).unwrap(), noise);
    }

    #[test]
    fn test_sole_owner_rewrites_in_place() {
        let env = TestEnv::new();
        let mut engine = env.open(test_config(4096));
        let root = engine.root().unwrap().id;
        let (_, f) = engine.create_file(root, b"f", 0o644, 0, 0).unwrap();
        engine.write(f.id, 0, &compressible_block(1, 4096)).unwrap();
        engine.flush(f.id).unwrap();
        engine.write(f.id, 0, &compressible_block(2, 4096)).unwrap();
        engine.flush(f.id).unwrap();

        assert_eq!(engine.tables().row_count(Table::Hash).unwrap(), 1);
        assert_eq!(engine.metrics().updated_blocks, 1);
        assert_eq!(engine.read(f.id, 0, 4096).unwrap(), compressible_block(2, 4096));
    }

    #[test]
    fn test_shared_block_is_not_rewritten() {
        let env = TestEnv::new();
        let mut engine = env.open(test_config(4096));
        let root = engine.root().unwrap().id;
        let (_, a) = engine.create_file(root, b"a", 0o644, 0, 0).unwrap();
        let (_, b) = engine.create_file(root, b"b", 0o644, 0, 0).unwrap();
        engine.write(a.id, 0, &compressible_block(1, 4096)).unwrap();
        engine.write(b.id, 0, &compressible_block(1, 4096)).unwrap();
        engine.destroy().unwrap();

        engine.write(a.id, 0, &compressible_block(9, 4096)).unwrap();
        engine.destroy().unwrap();
        assert_eq!(engine.tables().row_count(Table::Hash).unwrap(), 2);
        assert_eq!(engine.read(b.id, 0, 4096).unwrap(), compressible_block(1, 4096));
        assert_eq!(engine.read(a.id, 0, 4096).unwrap(), compressible_block(9, 4096));
    }

    #[test]
    fn test_failed_write_back_keeps_blocks_dirty() {
        let env = TestEnv::new();
        let mut engine = env.open(test_config(4096));
        let root = engine.root().unwrap().id;
        let (_, f) = engine.create_file(root, b"f", 0o644, 0, 0).unwrap();
        let data = compressible_block(3, 6000);
        engine.write(f.id, 0, &data).unwrap();

        env.kv.fail_writes(true);
        let err = engine.flush(f.id).unwrap_err();
        assert!(matches!(err, MetaError::Storage(_)));
        assert_eq!(err.to_errno(), 5);
        assert_eq!(engine.metrics().write_back_failures, 1);
        assert_eq!(engine.tables().row_count(Table::Hash).unwrap(), 0);
        assert_eq!(engine.tables().row_count(Table::InodeHashBlock).unwrap(), 0);
        // still served from the cache
        assert_eq!(engine.read(f.id, 0, 6000).unwrap(), data);

        env.kv.fail_writes(false);
        engine.flush(f.id).unwrap();
        assert_eq!(engine.tables().row_count(Table::Hash).unwrap(), 2);
        engine.destroy().unwrap();
        assert_eq!(engine.read(f.id, 0, 6000).unwrap(), data);
    }

    #[test]
    fn test_rejected_write_leaves_no_dirty_data() {
        let env = TestEnv::new();
        let mut engine = env.open(test_config(4096));
        let root = engine.root().unwrap().id;
        let (_, f) = engine.create_file(root, b"f", 0o644, 0, 0).unwrap();
        let original = vec![b'a'; 4096];
        engine.write(f.id, 0, &original).unwrap();
        engine.flush(f.id).unwrap();

        env.kv.fail_writes(true);
        let err = engine.write(f.id, 0, b"XXXX").unwrap_err();
        assert_eq!(err.to_errno(), 5);
        assert!(engine.write(f.id, 4096, b"tail").is_err());
        env.kv.fail_writes(false);

        assert_eq!(engine.getattr(f.id).unwrap().size, 4096);
        assert_eq!(engine.read(f.id, 0, 8192).unwrap(), original);
        engine.destroy().unwrap();
        drop(engine);

        let mut reopened = env.open(test_config(4096));
        assert_eq!(reopened.getattr(f.id).unwrap().size, 4096);
        assert_eq!(reopened.read(f.id, 0, 8192).unwrap(), original);
    }

    #[test]
    fn test_rejected_truncate_keeps_blocks() {
        let env = TestEnv::new();
        let mut engine = env.open(test_config(4096));
        let root = engine.root().unwrap().id;
        let (_, f) = engine.create_file(root, b"f", 0o644, 0, 0).unwrap();
        let data: Vec<u8> = (0..2).flat_map(|i| compressible_block(i, 4096)).collect();
        engine.write(f.id, 0, &data).unwrap();
        engine.flush(f.id).unwrap();

        env.kv.fail_writes(true);
        assert!(engine.truncate(f.id, 100).is_err());
        env.kv.fail_writes(false);

        engine.destroy().unwrap();
        assert_eq!(engine.getattr(f.id).unwrap().size, 8192);
        assert_eq!(engine.read(f.id, 0, 8192).unwrap(), data);
        assert_eq!(engine.tables().row_count(Table::InodeHashBlock).unwrap(), 2);
    }

    #[test]
    fn test_write_ending_past_max_offset_is_refused() {
        let env = TestEnv::new();
        let mut engine = env.open(test_config(4096));
        let root = engine.root().unwrap().id;
        let (_, f) = engine.create_file(root, b"f", 0o644, 0, 0).unwrap();
        let err = engine.write(f.id, u64::MAX - 1, b"abc").unwrap_err();
        assert!(matches!(err, MetaError::FileTooLarge { len: 3, .. }));
        assert_eq!(engine.getattr(f.id).unwrap().size, 0);
        assert_eq!(engine.cache_stats().insertions, 0);
    }

    #[test]
    fn test_codec_is_read_per_block_after_policy_change() {
        let env = TestEnv::new();
        let mut config = test_config(4096);
        config.compression.method = CompressionMethod::Codec(CodecKind::Zstd);
        let mut engine = env.open(config);
        let root = engine.root().unwrap().id;
        let (_, f) = engine.create_file(root, b"f", 0o644, 0, 0).unwrap();
        engine.write(f.id, 0, &compressible_block(4, 4096)).unwrap();
        engine.destroy().unwrap();
        drop(engine);

        let mut config = test_config(4096);
        config.compression.method = CompressionMethod::Codec(CodecKind::Lz4);
        let mut engine = env.open(config);
        engine.write(f.id, 4096, &compressible_block(5, 4096)).unwrap();
        engine.destroy().unwrap();

        let tables = engine.tables();
        let codecs: Vec<_> = tables
            .page_hash_ids(None, 10)
            .unwrap()
            .into_iter()
            .map(|h| tables.get_compression_type(h).unwrap().unwrap())
            .collect();
        assert_eq!(codecs, vec![CodecKind::Zstd.id(), CodecKind::Lz4.id()]);
        assert_eq!(engine.read(f.id, 0, 4096).unwrap(), compressible_block(4, 4096));
        assert_eq!(engine.read(f.id, 4096, 4096).unwrap(), compressible_block(5, 4096));
    }

    #[test]
    fn test_pool_and_verify_writes_give_same_content() {
        for (pool, verify) in [(false, false), (true, false), (true, true)] {
            let env = TestEnv::new();
            let mut config = test_config(4096);
            config.compression.method = CompressionMethod::Best;
            config.pool.enabled = pool;
            config.pool.max_workers = 2;
            config.store.verify_writes = verify;
            let mut engine = env.open(config);
            let root = engine.root().unwrap().id;
            let (_, f) = engine.create_file(root, b"f", 0o644, 0, 0).unwrap();
            let mut data = Vec::new();
            for i in 0..8u8 {
                data.extend(compressible_block(i % 3, 4096));
            }
            engine.write(f.id, 0, &data).unwrap();
            engine.destroy().unwrap();
            assert_eq!(engine.tables().row_count(Table::Hash).unwrap(), 3);
            assert_eq!(engine.read(f.id, 0, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn test_cross_subvolume_dedup_and_reference_counts() {
        for layout in [StorageLayout::Split, StorageLayout::Clustered] {
            let env = TestEnv::new();
            let mut config = test_config(4096);
            config.store.layout = layout;
            config.store.subvolume = "@a".to_string();
            let mut a = env.open(config.clone());
            config.store.subvolume = "@b".to_string();
            let mut b = env.open(config);

            let block = compressible_block(6, 4096);
            for engine in [&mut a, &mut b] {
                let root = engine.root().unwrap().id;
                let (_, f) = engine.create_file(root, b"shared", 0o644, 0, 0).unwrap();
                engine.write(f.id, 0, &block).unwrap();
                engine.destroy().unwrap();
            }
            let tables = env.tables(layout);
            assert_eq!(tables.row_count(Table::Hash).unwrap(), 1);
            check_reference_counts(&tables).unwrap();
        }
    }

    #[test]
    fn test_read_only_reopen_serves_data() {
        let env = TestEnv::new();
        let mut engine = env.open(test_config(4096));
        let root = engine.root().unwrap().id;
        let (_, f) = engine.create_file(root, b"f", 0o644, 0, 0).unwrap();
        engine.write(f.id, 0, b"persisted").unwrap();
        engine.destroy().unwrap();
        drop(engine);

        let mut config = test_config(4096);
        config.store.read_only = true;
        let mut ro = env.open(config);
        let root = ro.root().unwrap().id;
        let entry = ro.lookup(root, b"f").unwrap().unwrap();
        assert_eq!(ro.read(entry.inode_id, 0, 100).unwrap(), b"persisted".to_vec());
        assert!(matches!(
            ro.create_file(root, b"g", 0o644, 0, 0),
            Err(MetaError::ReadOnly)
        ));
        assert!(ro.collect_garbage().skipped);
    }

    #[test]
    fn test_engine_from_config_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[store]
block_size = 8192
layout = "clustered"

[compression]
method = "custom:lz4,zstd"

[cache]
max_write_size = 16384
"#
        )
        .unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        let env = TestEnv::new();
        let mut engine = env.open(config);
        assert_eq!(engine.block_size(), 8192);
        let root = engine.root().unwrap().id;
        let (_, f) = engine.create_file(root, b"f", 0o644, 0, 0).unwrap();
        let data: Vec<u8> = (0..8).flat_map(|i| compressible_block(i, 8192)).collect();
        engine.write(f.id, 0, &data).unwrap();
        // the written category is over its bound; a size sweep writes some back
        env.clock.advance(1_000);
        engine.end_of_call().unwrap();
        assert!(engine.tables().row_count(Table::Hash).unwrap() > 0);
        engine.destroy().unwrap();
        assert_eq!(engine.read(f.id, 0, data.len()).unwrap(), data);
        check_reference_counts(engine.tables()).unwrap();
    }

    #[test]
    fn test_unknown_digest_is_fatal_at_open() {
        let mut config = test_config(4096);
        config.store.digest = "crc32".to_string();
        let kv = Arc::new(MemoryKvStore::new());
        let clock = Arc::new(dedupfs_meta::ManualClock::new(0));
        let err = dedupfs_meta::Engine::open(kv, config, clock).err().unwrap();
        assert!(matches!(err, MetaError::Config(_)));
    }

    #[test]
    fn test_default_store_config_is_engine_default() {
        assert_eq!(EngineConfig::default().store, StoreConfig::default());
    }
}
