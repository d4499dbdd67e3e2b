//! Host RAM tier.

use std::collections::{HashMap, VecDeque};

use candle_core::Tensor;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cache::hasher::CacheEngineKey;
use crate::storage::{tensor_bytes, BackendStats, StorageBackend, StorageError, Tier};

struct Inner {
    chunks: HashMap<CacheEngineKey, Tensor>,
    /// Insertion order, oldest first.
    order: VecDeque<CacheEngineKey>,
    bytes_used: usize,
    closed: bool,
}

/// In-memory chunk store with a byte budget.
///
/// Existing keys are never overwritten. When an insert would exceed the
/// budget, the oldest chunks are dropped until it fits.
pub struct LocalMemoryBackend {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl LocalMemoryBackend {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                chunks: HashMap::new(),
                order: VecDeque::new(),
                bytes_used: 0,
                closed: false,
            }),
            capacity,
        }
    }

    /// Insert one chunk; returns false if it was already present or too large.
    pub fn insert(&self, key: CacheEngineKey, chunk: Tensor) -> Result<bool, StorageError> {
        let size = tensor_bytes(&chunk);
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        if inner.chunks.contains_key(&key) {
            return Ok(false);
        }
        if size > self.capacity {
            warn!(key = %key, size, capacity = self.capacity, "Chunk exceeds RAM budget, skipping");
            return Ok(false);
        }

        while inner.bytes_used + size > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(dropped) = inner.chunks.remove(&oldest) {
                inner.bytes_used -= tensor_bytes(&dropped);
                debug!(key = %oldest, "Dropped chunk from RAM tier");
            }
        }

        inner.bytes_used += size;
        inner.order.push_back(key.clone());
        inner.chunks.insert(key, chunk);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.inner.read().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for LocalMemoryBackend {
    fn contains(&self, key: &CacheEngineKey) -> Result<bool, StorageError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        Ok(inner.chunks.contains_key(key))
    }

    fn get(&self, key: &CacheEngineKey) -> Result<Option<Tensor>, StorageError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        // Tensor clones share storage.
        Ok(inner.chunks.get(key).cloned())
    }

    fn batched_put(
        &self,
        entries: Vec<(CacheEngineKey, Tensor)>,
        _blocking: bool,
    ) -> Result<usize, StorageError> {
        let count = entries.len();
        for (key, chunk) in entries {
            self.insert(key, chunk)?;
        }
        Ok(count)
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        inner.closed = true;
        inner.chunks.clear();
        inner.order.clear();
        inner.bytes_used = 0;
        Ok(())
    }

    fn stats(&self) -> Vec<BackendStats> {
        let inner = self.inner.read();
        vec![BackendStats {
            tier: Tier::Ram,
            chunk_count: inner.chunks.len(),
            bytes_used: inner.bytes_used,
            capacity: self.capacity,
        }]
    }
}
