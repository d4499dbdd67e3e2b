//! Storage backends for stacked KV chunks.
//!
//! - [`memory`]: host RAM tier
//! - [`disk`]: local disk tier with a background writer
//! - [`tiered`]: RAM over disk with promotion on read
//! - [`encoding`]: binary chunk encoding used by the disk tier

pub mod disk;
pub mod encoding;
pub mod memory;
pub mod tiered;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use candle_core::Tensor;
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::hasher::CacheEngineKey;
use crate::config::EngineConfig;

pub use disk::LocalDiskBackend;
pub use memory::LocalMemoryBackend;
pub use tiered::TieredBackend;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("chunk codec error: {0}")]
    Codec(String),

    #[error("unsupported storage backend: {0}")]
    Unsupported(String),

    #[error("storage backend is closed")]
    Closed,
}

/// Lazily evaluated results of [`StorageBackend::batched_get`].
pub type BatchedGet<'a> = Box<dyn Iterator<Item = Result<Option<Tensor>, StorageError>> + 'a>;

/// Content-addressed chunk store consumed by the cache engine.
///
/// Implementations must be safe to share between threads. Writes of one
/// batch are not atomic: a concurrent reader may observe a prefix of it.
pub trait StorageBackend: Send + Sync {
    fn contains(&self, key: &CacheEngineKey) -> Result<bool, StorageError>;

    fn get(&self, key: &CacheEngineKey) -> Result<Option<Tensor>, StorageError>;

    /// Store all entries and return how many were submitted.
    ///
    /// With `blocking = false` the call may return before the data is durable.
    fn batched_put(
        &self,
        entries: Vec<(CacheEngineKey, Tensor)>,
        blocking: bool,
    ) -> Result<usize, StorageError>;

    /// One result per key, in input order. Consumers may stop early; keys not
    /// yet pulled are never fetched.
    fn batched_get<'a>(
        &'a self,
        keys: Box<dyn Iterator<Item = CacheEngineKey> + 'a>,
    ) -> BatchedGet<'a> {
        Box::new(keys.map(move |key| self.get(&key)))
    }

    fn close(&self) -> Result<(), StorageError>;

    /// Occupancy snapshot per tier, if the backend tracks it.
    fn stats(&self) -> Vec<BackendStats> {
        Vec::new()
    }
}

/// Identifies a storage tier in statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Host RAM.
    Ram,
    /// Local disk.
    LocalDisk,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Ram => write!(f, "RAM"),
            Tier::LocalDisk => write!(f, "DISK"),
        }
    }
}

/// Per-tier usage statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendStats {
    pub tier: Tier,
    /// Number of chunks resident in this tier.
    pub chunk_count: usize,
    /// Total bytes used in this tier.
    pub bytes_used: usize,
    /// Capacity budget in bytes.
    pub capacity: usize,
}

impl BackendStats {
    /// Usage as a fraction of capacity (0.0 - 1.0).
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.bytes_used as f64 / self.capacity as f64
    }
}

/// Size of a tensor's elements in bytes.
pub(crate) fn tensor_bytes(tensor: &Tensor) -> usize {
    tensor.elem_count() * tensor.dtype().size_in_bytes()
}

/// Build the backend selected by `config`.
pub fn create_backend(config: &EngineConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let has_local = config.local_cpu || config.local_disk.is_some();
    if let Some(url) = &config.remote_url {
        if !has_local {
            return Err(StorageError::Unsupported(format!("remote store {url}")));
        }
        warn!(url = %url, "Remote store not supported, using local tiers only");
    }

    let memory = || LocalMemoryBackend::new(config.local_cpu_budget_bytes());
    let disk = |path: PathBuf| {
        LocalDiskBackend::open(path, config.local_disk_budget_bytes(), config.disk_zstd_level)
    };

    let backend: Arc<dyn StorageBackend> = match (config.local_cpu, &config.local_disk) {
        (true, Some(path)) => Arc::new(TieredBackend::new(memory(), disk(path.clone())?)),
        (true, None) => Arc::new(memory()),
        (false, Some(path)) => Arc::new(disk(path.clone())?),
        (false, None) => {
            return Err(StorageError::Unsupported(
                "no storage tier configured".to_string(),
            ))
        }
    };

    info!(
        local_cpu = config.local_cpu,
        local_disk = ?config.local_disk,
        "Storage backend created"
    );
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_only_is_unsupported() {
        let config = EngineConfig {
            local_cpu: false,
            remote_url: Some("redis://localhost:6379".into()),
            ..EngineConfig::default()
        };
        assert!(matches!(
            create_backend(&config),
            Err(StorageError::Unsupported(_))
        ));
    }

    #[test]
    fn test_no_tier_is_unsupported() {
        let config = EngineConfig {
            local_cpu: false,
            ..EngineConfig::default()
        };
        assert!(create_backend(&config).is_err());
    }

    #[test]
    fn test_usage_fraction() {
        let stats = BackendStats {
            tier: Tier::Ram,
            chunk_count: 2,
            bytes_used: 250,
            capacity: 1000,
        };
        assert!((stats.usage_fraction() - 0.25).abs() < 1e-12);
    }
}
