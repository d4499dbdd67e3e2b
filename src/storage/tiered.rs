//! RAM tier stacked over the disk tier.

use candle_core::Tensor;
use tracing::{debug, warn};

use crate::cache::hasher::CacheEngineKey;
use crate::storage::{
    BackendStats, LocalDiskBackend, LocalMemoryBackend, StorageBackend, StorageError,
};

/// Reads check RAM first and promote disk hits into RAM. Writes go to both.
pub struct TieredBackend {
    memory: LocalMemoryBackend,
    disk: LocalDiskBackend,
}

impl TieredBackend {
    pub fn new(memory: LocalMemoryBackend, disk: LocalDiskBackend) -> Self {
        Self { memory, disk }
    }
}

impl StorageBackend for TieredBackend {
    fn contains(&self, key: &CacheEngineKey) -> Result<bool, StorageError> {
        Ok(self.memory.contains(key)? || self.disk.contains(key)?)
    }

    fn get(&self, key: &CacheEngineKey) -> Result<Option<Tensor>, StorageError> {
        if let Some(chunk) = self.memory.get(key)? {
            return Ok(Some(chunk));
        }
        let Some(chunk) = self.disk.get(key)? else {
            return Ok(None);
        };
        debug!(key = %key, "Promoting chunk from disk to RAM");
        self.memory.insert(key.clone(), chunk.clone())?;
        Ok(Some(chunk))
    }

    fn batched_put(
        &self,
        entries: Vec<(CacheEngineKey, Tensor)>,
        blocking: bool,
    ) -> Result<usize, StorageError> {
        self.memory.batched_put(entries.clone(), blocking)?;
        self.disk.batched_put(entries, blocking)
    }

    fn close(&self) -> Result<(), StorageError> {
        let memory = self.memory.close();
        let disk = self.disk.close();
        if let Err(e) = &memory {
            warn!(error = %e, "Closing RAM tier failed");
        }
        memory.and(disk)
    }

    fn stats(&self) -> Vec<BackendStats> {
        let mut stats = self.memory.stats();
        stats.extend(self.disk.stats());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::KvLayout;
    use crate::cache::hasher::ChunkHash;
    use crate::storage::Tier;
    use candle_core::{DType, Device};
    use tempfile::TempDir;

    fn key(tag: &[u32]) -> CacheEngineKey {
        CacheEngineKey {
            fmt: KvLayout::Vllm,
            model_name: "tiered".into(),
            world_size: 2,
            worker_id: 1,
            chunk_hash: ChunkHash::root().chain(tag),
        }
    }

    fn chunk() -> Tensor {
        Tensor::ones((1, 2, 4, 2, 2), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_writes_reach_both_tiers() {
        let tmp = TempDir::new().unwrap();
        let backend = TieredBackend::new(
            LocalMemoryBackend::new(1 << 20),
            LocalDiskBackend::open(tmp.path().to_path_buf(), 1 << 20, 1).unwrap(),
        );
        backend.batched_put(vec![(key(&[1]), chunk())], true).unwrap();
        assert!(backend.memory.contains(&key(&[1])).unwrap());
        assert!(backend.disk.contains(&key(&[1])).unwrap());

        let stats = backend.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].tier, Tier::Ram);
        assert_eq!(stats[1].tier, Tier::LocalDisk);
    }

    #[test]
    fn test_disk_hit_promotes_to_ram() {
        let tmp = TempDir::new().unwrap();
        let backend = TieredBackend::new(
            LocalMemoryBackend::new(1 << 20),
            LocalDiskBackend::open(tmp.path().to_path_buf(), 1 << 20, 1).unwrap(),
        );
        backend.disk.batched_put(vec![(key(&[7]), chunk())], true).unwrap();
        assert!(!backend.memory.contains(&key(&[7])).unwrap());

        assert!(backend.get(&key(&[7])).unwrap().is_some());
        assert!(backend.memory.contains(&key(&[7])).unwrap());
        assert!(backend.get(&key(&[8])).unwrap().is_none());
    }
}
