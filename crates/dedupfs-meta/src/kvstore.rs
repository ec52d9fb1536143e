//! Embedded key-value store backing every table.
//!
//! The in-memory implementation keeps a `BTreeMap`. While a transaction is
//! open every touched key has its prior value recorded once in an undo log,
//! which `rollback` replays. Nested `begin` calls are counted and only the
//! outermost `commit` or any `rollback` ends the transaction.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::error::{MetaError, MetaResult};

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Key-value store trait for table persistence.
///
/// Abstracts over the backend so the block store is agnostic to embedded vs.
/// client/server storage.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> MetaResult<Option<Value>>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> MetaResult<()>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> MetaResult<()>;

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> MetaResult<Vec<KvPair>>;

    /// Scan a range of keys [start, end), returning at most `limit` pairs in sorted order.
    fn scan_range(&self, start: &[u8], end: &[u8], limit: usize) -> MetaResult<Vec<KvPair>>;

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> MetaResult<bool>;

    /// Atomically write a batch of operations (puts and deletes).
    fn write_batch(&self, ops: Vec<BatchOp>) -> MetaResult<()>;

    /// Open (or nest into) a transaction.
    fn begin(&self) -> MetaResult<()>;

    /// Commit the current transaction level.
    fn commit(&self) -> MetaResult<()>;

    /// Abandon the whole transaction, restoring the state at the outermost `begin`.
    fn rollback(&self) -> MetaResult<()>;

    /// Cheap space reclamation after bulk deletes, where the backend supports it.
    fn reclaim(&self) -> MetaResult<()> {
        Ok(())
    }

    /// Compact the store. Returns the number of bytes given back.
    fn vacuum(&self) -> MetaResult<u64>;
}

/// A single operation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

/// Prior values of the keys touched by the open transaction
struct UndoLog {
    prior: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    dead_bytes: u64,
}

#[derive(Default)]
struct MemoryState {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    undo: Option<UndoLog>,
    depth: usize,
    dead_bytes: u64,
}

impl MemoryState {
    fn record(&mut self, key: &[u8]) {
        if let Some(undo) = self.undo.as_mut() {
            if !undo.prior.contains_key(key) {
                undo.prior.insert(key.to_vec(), self.data.get(key).cloned());
            }
        }
    }

    fn remove(&mut self, key: &[u8]) {
        self.record(key);
        if let Some(old) = self.data.remove(key) {
            self.dead_bytes += (key.len() + old.len()) as u64;
        }
    }

    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.record(&key);
        let key_len = key.len();
        if let Some(old) = self.data.insert(key, value) {
            self.dead_bytes += (key_len + old.len()) as u64;
        }
    }
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Data does not survive a restart; it serves tests and embedded use.
#[derive(Default)]
pub struct MemoryKvStore {
    state: RwLock<MemoryState>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.data.len()).unwrap_or(0)
    }

    /// True when no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.state.read().map(|s| s.depth > 0).unwrap_or(false)
    }

    fn read(&self) -> MetaResult<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|e| MetaError::Storage(e.to_string()))
    }

    fn write(&self) -> MetaResult<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|e| MetaError::Storage(e.to_string()))
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> MetaResult<Option<Vec<u8>>> {
        Ok(self.read()?.data.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> MetaResult<()> {
        self.write()?.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> MetaResult<()> {
        self.write()?.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> MetaResult<Vec<KvPair>> {
        let state = self.read()?;
        let mut result = Vec::new();
        for (k, v) in state.data.range::<Vec<u8>, _>(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            result.push((k.clone(), v.clone()));
        }
        Ok(result)
    }

    fn scan_range(&self, start: &[u8], end: &[u8], limit: usize) -> MetaResult<Vec<KvPair>> {
        let state = self.read()?;
        let result: Vec<_> = state
            .data
            .range::<Vec<u8>, _>((
                Bound::Included(start.to_vec()),
                Bound::Excluded(end.to_vec()),
            ))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(result)
    }

    fn contains_key(&self, key: &[u8]) -> MetaResult<bool> {
        Ok(self.read()?.data.contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> MetaResult<()> {
        let mut state = self.write()?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => state.insert(key, value),
                BatchOp::Delete { key } => state.remove(&key),
            }
        }
        Ok(())
    }

    fn begin(&self) -> MetaResult<()> {
        let mut state = self.write()?;
        if state.depth == 0 {
            state.undo = Some(UndoLog {
                prior: BTreeMap::new(),
                dead_bytes: state.dead_bytes,
            });
        }
        state.depth += 1;
        Ok(())
    }

    fn commit(&self) -> MetaResult<()> {
        let mut state = self.write()?;
        match state.depth {
            0 => Err(MetaError::Storage("commit without transaction".to_string())),
            1 => {
                state.depth = 0;
                state.undo = None;
                Ok(())
            }
            _ => {
                state.depth -= 1;
                Ok(())
            }
        }
    }

    fn rollback(&self) -> MetaResult<()> {
        let mut state = self.write()?;
        if let Some(undo) = state.undo.take() {
            for (key, prior) in undo.prior {
                match prior {
                    Some(value) => state.data.insert(key, value),
                    None => state.data.remove(&key),
                };
            }
            state.dead_bytes = undo.dead_bytes;
        }
        state.depth = 0;
        Ok(())
    }

    fn vacuum(&self) -> MetaResult<u64> {
        let mut state = self.write()?;
        if state.depth > 0 {
            return Err(MetaError::Storage("vacuum inside a transaction".to_string()));
        }
        Ok(std::mem::take(&mut state.dead_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let store = MemoryKvStore::new();
        store.put(b"key1".to_vec(), b"value1".to_vec()).unwrap();
        assert_eq!(store.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(store.get(b"key2").unwrap(), None);
    }

    #[test]
    fn test_delete() {
        let store = MemoryKvStore::new();
        store.put(b"key1".to_vec(), b"value1".to_vec()).unwrap();
        store.delete(b"key1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix() {
        let store = MemoryKvStore::new();
        store.put(b"dir/a".to_vec(), b"1".to_vec()).unwrap();
        store.put(b"dir/b".to_vec(), b"2".to_vec()).unwrap();
        store.put(b"dir/c".to_vec(), b"3".to_vec()).unwrap();
        store.put(b"other/x".to_vec(), b"4".to_vec()).unwrap();

        let result = store.scan_prefix(b"dir/").unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].0, b"dir/a");
        assert_eq!(result[2].0, b"dir/c");
    }

    #[test]
    fn test_scan_range_with_limit() {
        let store = MemoryKvStore::new();
        for k in [b"a", b"b", b"c", b"d"] {
            store.put(k.to_vec(), b"v".to_vec()).unwrap();
        }

        let result = store.scan_range(b"b", b"d", 10).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0, b"b");
        assert_eq!(result[1].0, b"c");

        let limited = store.scan_range(b"a", b"z", 3).unwrap();
        assert_eq!(limited.len(), 3);
    }

    #[test]
    fn test_write_batch() {
        let store = MemoryKvStore::new();
        store.put(b"existing".to_vec(), b"old".to_vec()).unwrap();

        store
            .write_batch(vec![
                BatchOp::Put {
                    key: b"new1".to_vec(),
                    value: b"v1".to_vec(),
                },
                BatchOp::Delete {
                    key: b"existing".to_vec(),
                },
            ])
            .unwrap();

        assert_eq!(store.get(b"new1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.get(b"existing").unwrap(), None);
    }

    #[test]
    fn test_rollback_restores_state() {
        let store = MemoryKvStore::new();
        store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        store.begin().unwrap();
        store.put(b"a".to_vec(), b"2".to_vec()).unwrap();
        store.put(b"b".to_vec(), b"3".to_vec()).unwrap();
        store.rollback().unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), None);
        assert!(!store.in_transaction());
    }

    #[test]
    fn test_rollback_undoes_each_key_to_its_first_prior_value() {
        let store = MemoryKvStore::new();
        store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        store.put(b"c".to_vec(), b"keep".to_vec()).unwrap();
        store.delete(b"c").unwrap();
        store.begin().unwrap();
        store.put(b"a".to_vec(), b"2".to_vec()).unwrap();
        store.delete(b"a").unwrap();
        store.put(b"a".to_vec(), b"3".to_vec()).unwrap();
        store
            .write_batch(vec![
                BatchOp::Put { key: b"b".to_vec(), value: b"x".to_vec() },
                BatchOp::Delete { key: b"b".to_vec() },
                BatchOp::Put { key: b"c".to_vec(), value: b"new".to_vec() },
            ])
            .unwrap();
        store.rollback().unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), None);
        assert_eq!(store.get(b"c").unwrap(), None);
        assert_eq!(store.len(), 1);
        assert_eq!(store.vacuum().unwrap(), 5);
    }

    #[test]
    fn test_committed_changes_are_not_undone_later() {
        let store = MemoryKvStore::new();
        store.begin().unwrap();
        store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        store.commit().unwrap();
        store.begin().unwrap();
        store.put(b"a".to_vec(), b"2".to_vec()).unwrap();
        store.rollback().unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_nested_commit_keeps_outer_open() {
        let store = MemoryKvStore::new();
        store.begin().unwrap();
        store.begin().unwrap();
        store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        store.commit().unwrap();
        assert!(store.in_transaction());
        store.rollback().unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_commit_without_begin_fails() {
        let store = MemoryKvStore::new();
        assert!(store.commit().is_err());
    }

    #[test]
    fn test_vacuum_reports_dead_bytes() {
        let store = MemoryKvStore::new();
        store.put(b"key".to_vec(), vec![0u8; 100]).unwrap();
        store.delete(b"key").unwrap();
        assert_eq!(store.vacuum().unwrap(), 103);
        assert_eq!(store.vacuum().unwrap(), 0);
    }

    #[test]
    fn test_vacuum_refused_inside_transaction() {
        let store = MemoryKvStore::new();
        store.begin().unwrap();
        assert!(store.vacuum().is_err());
        store.commit().unwrap();
    }
}
