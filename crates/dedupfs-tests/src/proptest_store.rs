//! Property-Based Tests for the block store - engine I/O against a byte model

use proptest::prelude::*;

use crate::harness::compressible_block;

/// Block size used by the property tests
pub const PROP_BLOCK_SIZE: usize = 1024;

/// One file-level operation
#[derive(Debug, Clone)]
pub enum FileOp {
    /// Write bytes at an offset
    Write { offset: u64, data: Vec<u8> },
    /// Set the file size
    Truncate { size: u64 },
    /// Flush dirty blocks of the file
    Flush,
    /// Move the clock and run the end-of-call hook
    Tick { ms: u64 },
}

/// Writes drawn from a small alphabet of block patterns, so that dedup hits
/// are common, mixed with arbitrary short writes
pub fn arb_write() -> impl Strategy<Value = FileOp> {
    prop_oneof![
        (0u64..8, 0u8..4).prop_map(|(bn, seed)| FileOp::Write {
            offset: bn * PROP_BLOCK_SIZE as u64,
            data: compressible_block(seed, PROP_BLOCK_SIZE),
        }),
        (0u64..(8 * PROP_BLOCK_SIZE as u64), prop::collection::vec(any::<u8>(), 1..600))
            .prop_map(|(offset, data)| FileOp::Write { offset, data }),
    ]
}

/// Any file operation
pub fn arb_file_op() -> impl Strategy<Value = FileOp> {
    prop_oneof![
        6 => arb_write(),
        1 => (0u64..(9 * PROP_BLOCK_SIZE as u64)).prop_map(|size| FileOp::Truncate { size }),
        1 => Just(FileOp::Flush),
        2 => (0u64..10_000).prop_map(|ms| FileOp::Tick { ms }),
    ]
}

/// Apply an operation to a plain byte vector
pub fn apply_to_model(model: &mut Vec<u8>, op: &FileOp) {
    match op {
        FileOp::Write { offset, data } => {
            let start = *offset as usize;
            let end = start + data.len();
            if model.len() < end {
                model.resize(end, 0);
            }
            model[start..end].copy_from_slice(data);
        }
        FileOp::Truncate { size } => model.resize(*size as usize, 0),
        FileOp::Flush | FileOp::Tick { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{all_hash_ids, check_reference_counts, test_config, TestEnv};
    use dedupfs_meta::{Engine, InodeId, StorageLayout};

    fn apply(engine: &mut Engine, env: &TestEnv, inode: InodeId, op: &FileOp) {
        match op {
            FileOp::Write { offset, data } => {
                assert_eq!(engine.write(inode, *offset, data).unwrap(), data.len());
            }
            FileOp::Truncate { size } => engine.truncate(inode, *size).unwrap(),
            FileOp::Flush => engine.flush(inode).unwrap(),
            FileOp::Tick { ms } => {
                env.clock.advance(*ms);
                engine.end_of_call().unwrap();
            }
        }
    }

    fn small_cache_config(layout: StorageLayout) -> dedupfs_meta::EngineConfig {
        let mut config = test_config(PROP_BLOCK_SIZE);
        config.store.layout = layout;
        config.cache.max_write_size = 4 * PROP_BLOCK_SIZE as u64;
        config.cache.max_read_size = 4 * PROP_BLOCK_SIZE as u64;
        config.gc.interval_ms = 20_000;
        config
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_engine_matches_byte_model(
            ops in prop::collection::vec(arb_file_op(), 1..40),
            clustered in any::<bool>(),
        ) {
            let layout = if clustered { StorageLayout::Clustered } else { StorageLayout::Split };
            let env = TestEnv::new();
            let mut engine = env.open(small_cache_config(layout));
            let root = engine.root().unwrap().id;
            let (_, f) = engine.create_file(root, b"model", 0o644, 0, 0).unwrap();

            let mut model = Vec::new();
            for op in &ops {
                apply(&mut engine, &env, f.id, op);
                apply_to_model(&mut model, op);
                prop_assert_eq!(engine.getattr(f.id).unwrap().size, model.len() as u64);
            }
            prop_assert_eq!(engine.read(f.id, 0, model.len() + 10).unwrap(), model.clone());

            engine.destroy().unwrap();
            drop(engine);
            let mut reopened = env.open(small_cache_config(layout));
            prop_assert_eq!(reopened.read(f.id, 0, model.len() + 10).unwrap(), model);
        }

        #[test]
        fn prop_reference_counts_and_gc_safety(
            writes in prop::collection::vec((0usize..3, arb_write()), 1..30),
            unlink in prop::option::of(0usize..3),
        ) {
            let env = TestEnv::new();
            let mut engine = env.open(small_cache_config(StorageLayout::Clustered));
            let root = engine.root().unwrap().id;
            let mut files = Vec::new();
            for n in 0..3u8 {
                let name = vec![b'f', b'0' + n];
                let (_, f) = engine.create_file(root, &name, 0o644, 0, 0).unwrap();
                files.push((name, f.id, Vec::new()));
            }
            for (slot, op) in &writes {
                let (_, inode, model) = &mut files[*slot];
                apply(&mut engine, &env, *inode, op);
                apply_to_model(model, op);
            }
            if let Some(slot) = unlink {
                engine.unlink(root, &files[slot].0).unwrap();
            }
            engine.destroy().unwrap();

            prop_assert!(check_reference_counts(engine.tables()).is_ok());
            let tables = engine.tables().clone();
            for hash in all_hash_ids(&tables) {
                prop_assert!(tables.count_hash_refs(hash).unwrap() > 0);
            }
            for (slot, (_, inode, model)) in files.iter().enumerate() {
                if unlink == Some(slot) {
                    continue;
                }
                prop_assert_eq!(&engine.read(*inode, 0, model.len()).unwrap(), model);
            }
        }
    }

    #[test]
    fn test_model_write_and_truncate() {
        let mut model = Vec::new();
        apply_to_model(&mut model, &FileOp::Write { offset: 4, data: vec![1, 2] });
        assert_eq!(model, vec![0, 0, 0, 0, 1, 2]);
        apply_to_model(&mut model, &FileOp::Truncate { size: 5 });
        assert_eq!(model, vec![0, 0, 0, 0, 1]);
    }
}
