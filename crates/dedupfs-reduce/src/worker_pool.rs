//! Fixed-size thread pool that compresses a batch of blocks in parallel.
//!
//! The caller submits a whole batch and blocks until every block has a
//! result. Workers only see bytes; they never touch caches or tables.

use crate::error::ReduceError;
use crate::selector::{Compressed, CompressionSelector};
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Compress batches on worker threads instead of the caller thread
    pub enabled: bool,
    /// Upper bound on worker threads; the pool never exceeds the CPU count
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_workers: 4,
        }
    }
}

impl PoolConfig {
    /// Number of workers to spawn on this machine
    pub fn worker_count(&self) -> usize {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        cpus.min(self.max_workers).max(1)
    }
}

struct Task {
    slot: usize,
    data: Bytes,
}

type TaskResult = (usize, Result<Compressed, ReduceError>);

/// Thread pool running [`CompressionSelector::select`] on submitted blocks
pub struct CompressionPool {
    tasks: Option<Sender<Task>>,
    results: Receiver<TaskResult>,
    workers: Vec<JoinHandle<()>>,
}

impl CompressionPool {
    /// Spawn `workers` threads, each with its own clone of the selector
    pub fn new(selector: CompressionSelector, workers: usize) -> Result<Self, ReduceError> {
        let (task_tx, task_rx) = channel::unbounded::<Task>();
        let (result_tx, result_rx) = channel::unbounded::<TaskResult>();
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers.max(1) {
            let rx = task_rx.clone();
            let tx = result_tx.clone();
            let selector = selector.clone();
            let handle = thread::Builder::new()
                .name(format!("dedupfs-compress-{}", id))
                .spawn(move || worker_loop(selector, rx, tx))
                .map_err(|e| ReduceError::WorkerPool(e.to_string()))?;
            handles.push(handle);
        }
        debug!(workers = handles.len(), "compression pool started");
        Ok(Self {
            tasks: Some(task_tx),
            results: result_rx,
            workers: handles,
        })
    }

    /// Build a pool from configuration, or `None` when disabled
    pub fn from_config(
        config: &PoolConfig,
        selector: &CompressionSelector,
    ) -> Result<Option<Self>, ReduceError> {
        if !config.enabled {
            return Ok(None);
        }
        Self::new(selector.clone(), config.worker_count()).map(Some)
    }

    /// Number of worker threads
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Compress every block of the batch and wait for all results.
    ///
    /// Results arrive in completion order; the returned map is keyed by the
    /// caller's keys. The first worker error is returned after the whole
    /// batch has drained.
    pub fn compress_batch<K>(&self, batch: Vec<(K, Bytes)>) -> Result<HashMap<K, Compressed>, ReduceError>
    where
        K: Eq + Hash,
    {
        let tasks = self
            .tasks
            .as_ref()
            .ok_or_else(|| ReduceError::WorkerPool("pool shut down".to_string()))?;
        let mut keys = Vec::with_capacity(batch.len());
        for (slot, (key, data)) in batch.into_iter().enumerate() {
            keys.push(Some(key));
            if tasks.send(Task { slot, data }).is_err() {
                self.discard_results(slot);
                return Err(ReduceError::WorkerPool("all workers exited".to_string()));
            }
        }

        let mut out = HashMap::with_capacity(keys.len());
        let mut first_err = None;
        for _ in 0..keys.len() {
            let (slot, result) = self
                .results
                .recv()
                .map_err(|_| ReduceError::WorkerPool("result channel closed".to_string()))?;
            match result {
                Ok(compressed) => {
                    if let Some(key) = keys[slot].take() {
                        out.insert(key, compressed);
                    }
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

impl CompressionPool {
    /// Receive and drop the results of `count` tasks already sent, so that a
    /// later batch never sees them
    fn discard_results(&self, count: usize) {
        for _ in 0..count {
            if self.results.recv().is_err() {
                break;
            }
        }
    }
}

impl Drop for CompressionPool {
    fn drop(&mut self) {
        // Closing the task channel ends every worker loop.
        self.tasks.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("compression worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(selector: CompressionSelector, tasks: Receiver<Task>, results: Sender<TaskResult>) {
    while let Ok(task) = tasks.recv() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| selector.select(&task.data)))
            .unwrap_or_else(|_| Err(ReduceError::WorkerPool("worker panicked".to_string())));
        if results.send((task.slot, outcome)).is_err() {
            break;
        }
    }
}
