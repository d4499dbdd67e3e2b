//! Local disk tier.
//!
//! One file per chunk, sharded by model and the first two hex digits of the
//! chunk hash:
//!
//! ```text
//! <root>/<model>/<hash[..2]>/<fmt>-<world_size>-<worker_id>-<hash>.kvchunk
//! ```
//!
//! Non-blocking puts are queued to a dedicated writer thread. Queued chunks
//! stay readable from memory until the writer has persisted them.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use candle_core::{Device, Tensor};
use parking_lot::{Mutex, RwLock};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::hasher::CacheEngineKey;
use crate::storage::encoding::ChunkEncoder;
use crate::storage::{BackendStats, StorageBackend, StorageError, Tier};

const CHUNK_EXTENSION: &str = "kvchunk";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiskIoStats {
    pub total_writes: u64,
    pub total_reads: u64,
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
}

type WriteJob = (CacheEngineKey, Tensor);

struct Shared {
    root: PathBuf,
    capacity: usize,
    encoder: ChunkEncoder,
    /// Chunks queued for the writer but not yet on disk.
    pending: RwLock<HashMap<CacheEngineKey, Tensor>>,
    bytes_used: AtomicUsize,
    chunk_count: AtomicUsize,
    io: Mutex<DiskIoStats>,
}

impl Shared {
    fn chunk_path(&self, key: &CacheEngineKey) -> PathBuf {
        let hash = key.chunk_hash.as_str();
        let shard = hash.get(..2).unwrap_or("00");
        self.root
            .join(sanitize(&key.model_name))
            .join(shard)
            .join(format!(
                "{}-{}-{}-{hash}.{CHUNK_EXTENSION}",
                key.fmt, key.world_size, key.worker_id
            ))
    }

    /// Persist one chunk. Returns false if it already existed or did not fit.
    ///
    /// Concurrent writers of one key are safe: exactly one of them creates the
    /// file and only that one is counted.
    fn write_chunk(&self, key: &CacheEngineKey, chunk: &Tensor) -> Result<bool, StorageError> {
        let path = self.chunk_path(key);
        if path.exists() {
            return Ok(false);
        }

        let data = self.encoder.encode(chunk)?;
        let size = data.len();
        if !self.reserve(size) {
            warn!(
                key = %key,
                size,
                used = self.bytes_used.load(Ordering::Relaxed),
                capacity = self.capacity,
                "Disk budget exhausted, skipping chunk"
            );
            return Ok(false);
        }

        match persist_new(&path, &data) {
            Ok(true) => {}
            Ok(false) => {
                self.bytes_used.fetch_sub(size, Ordering::AcqRel);
                debug!(path = %path.display(), "Chunk already written by another writer");
                return Ok(false);
            }
            Err(e) => {
                self.bytes_used.fetch_sub(size, Ordering::AcqRel);
                return Err(e);
            }
        }

        debug!(path = %path.display(), size, "Wrote chunk to disk");

        self.chunk_count.fetch_add(1, Ordering::Relaxed);
        let mut io = self.io.lock();
        io.total_writes += 1;
        io.total_bytes_written += size as u64;
        Ok(true)
    }

    /// Claim `size` bytes of the budget, or fail without claiming any.
    fn reserve(&self, size: usize) -> bool {
        self.bytes_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used + size <= self.capacity).then_some(used + size)
            })
            .is_ok()
    }

    fn read_chunk(&self, key: &CacheEngineKey) -> Result<Option<Tensor>, StorageError> {
        let path = self.chunk_path(key);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), size = data.len(), "Read chunk from disk");
        {
            let mut io = self.io.lock();
            io.total_reads += 1;
            io.total_bytes_read += data.len() as u64;
        }
        Ok(Some(self.encoder.decode(&data, &Device::Cpu)?))
    }
}

struct Writer {
    tx: mpsc::UnboundedSender<WriteJob>,
    handle: JoinHandle<()>,
}

/// Chunk store backed by files under a local directory.
pub struct LocalDiskBackend {
    shared: Arc<Shared>,
    writer: Mutex<Option<Writer>>,
    closed: AtomicBool,
}

impl LocalDiskBackend {
    /// Open (or create) a disk tier rooted at `root`. Existing chunk files
    /// are kept and counted against `capacity`.
    pub fn open(root: PathBuf, capacity: usize, zstd_level: i32) -> Result<Self, StorageError> {
        fs::create_dir_all(&root)?;
        let (bytes_used, chunk_count) = disk_usage(&root)?;

        let shared = Arc::new(Shared {
            root,
            capacity,
            encoder: ChunkEncoder::new(Some(zstd_level)),
            pending: RwLock::new(HashMap::new()),
            bytes_used: AtomicUsize::new(bytes_used),
            chunk_count: AtomicUsize::new(chunk_count),
            io: Mutex::new(DiskIoStats::default()),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("kv-disk-writer".into())
            .spawn(move || {
                while let Some((key, chunk)) = rx.blocking_recv() {
                    if let Err(e) = worker.write_chunk(&key, &chunk) {
                        warn!(key = %key, error = %e, "Background chunk write failed");
                    }
                    worker.pending.write().remove(&key);
                }
                debug!("Disk writer drained");
            })?;

        info!(
            root = %shared.root.display(),
            capacity,
            bytes_used,
            chunk_count,
            "Disk tier opened"
        );

        Ok(Self {
            shared,
            writer: Mutex::new(Some(Writer { tx, handle })),
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn io_stats(&self) -> DiskIoStats {
        self.shared.io.lock().clone()
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl StorageBackend for LocalDiskBackend {
    fn contains(&self, key: &CacheEngineKey) -> Result<bool, StorageError> {
        self.ensure_open()?;
        if self.shared.pending.read().contains_key(key) {
            return Ok(true);
        }
        Ok(self.shared.chunk_path(key).exists())
    }

    fn get(&self, key: &CacheEngineKey) -> Result<Option<Tensor>, StorageError> {
        self.ensure_open()?;
        if let Some(chunk) = self.shared.pending.read().get(key) {
            return Ok(Some(chunk.clone()));
        }
        self.shared.read_chunk(key)
    }

    fn batched_put(
        &self,
        entries: Vec<(CacheEngineKey, Tensor)>,
        blocking: bool,
    ) -> Result<usize, StorageError> {
        self.ensure_open()?;
        let count = entries.len();

        if blocking {
            for (key, chunk) in &entries {
                self.shared.write_chunk(key, chunk)?;
            }
            return Ok(count);
        }

        let writer = self.writer.lock();
        let Some(writer) = writer.as_ref() else {
            return Err(StorageError::Closed);
        };
        for (key, chunk) in entries {
            self.shared.pending.write().insert(key.clone(), chunk.clone());
            if writer.tx.send((key, chunk)).is_err() {
                return Err(StorageError::Closed);
            }
        }
        Ok(count)
    }

    /// Waits for queued writes to land, then stops the writer.
    fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(Writer { tx, handle }) = self.writer.lock().take() {
            drop(tx);
            if handle.join().is_err() {
                warn!("Disk writer thread panicked");
            }
        }
        let io = self.io_stats();
        info!(
            writes = io.total_writes,
            reads = io.total_reads,
            bytes_written = io.total_bytes_written,
            "Disk tier closed"
        );
        Ok(())
    }

    fn stats(&self) -> Vec<BackendStats> {
        vec![BackendStats {
            tier: Tier::LocalDisk,
            chunk_count: self.shared.chunk_count.load(Ordering::Relaxed),
            bytes_used: self.shared.bytes_used.load(Ordering::Relaxed),
            capacity: self.shared.capacity,
        }]
    }
}

impl Drop for LocalDiskBackend {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Closing disk tier on drop failed");
        }
    }
}

/// Write `data` to `path` unless it exists. Returns false if another writer
/// created `path` first.
///
/// Each call writes its own temp file in the target directory and links it
/// into place without overwriting, so readers never observe a partial chunk.
fn persist_new(path: &Path, data: &[u8]) -> Result<bool, StorageError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error.into()),
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// Total size and number of chunk files below `root`.
fn disk_usage(root: &Path) -> Result<(usize, usize), StorageError> {
    let mut bytes = 0usize;
    let mut files = 0usize;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file()
                && entry.path().extension().is_some_and(|e| e == CHUNK_EXTENSION)
            {
                bytes += meta.len() as usize;
                files += 1;
            }
        }
    }
    Ok((bytes, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::KvLayout;
    use crate::cache::hasher::ChunkHash;
    use candle_core::DType;
    use tempfile::TempDir;

    fn key(model: &str, tag: &[u32]) -> CacheEngineKey {
        CacheEngineKey {
            fmt: KvLayout::HuggingFace,
            model_name: model.into(),
            world_size: 1,
            worker_id: 0,
            chunk_hash: ChunkHash::root().chain(tag),
        }
    }

    fn chunk() -> Tensor {
        Tensor::arange(0f32, 64f32, &Device::Cpu)
            .unwrap()
            .reshape((2, 2, 2, 4, 2))
            .unwrap()
    }

    #[test]
    fn test_blocking_put_and_get() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalDiskBackend::open(tmp.path().join("disk"), 1 << 20, 3).unwrap();

        let k = key("org/model", &[1, 2, 3]);
        assert_eq!(backend.batched_put(vec![(k.clone(), chunk())], true).unwrap(), 1);
        assert!(backend.contains(&k).unwrap());

        let path = backend.shared.chunk_path(&k);
        assert!(path.exists());
        assert!(path.starts_with(tmp.path().join("disk").join("org_model")));

        let got = backend.get(&k).unwrap().unwrap();
        assert_eq!(got.dims(), &[2, 2, 2, 4, 2]);
        assert_eq!(got.dtype(), DType::F32);
        assert_eq!(backend.io_stats().total_writes, 1);
        assert_eq!(backend.io_stats().total_reads, 1);
    }

    #[test]
    fn test_background_writes_persist_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("disk");
        let keys: Vec<CacheEngineKey> = (0..4).map(|i| key("m", &[i])).collect();

        let backend = LocalDiskBackend::open(root.clone(), 1 << 20, 3).unwrap();
        let entries = keys.iter().map(|k| (k.clone(), chunk())).collect();
        assert_eq!(backend.batched_put(entries, false).unwrap(), 4);
        // Visible immediately, whether or not the writer has finished.
        assert!(keys.iter().all(|k| backend.contains(k).unwrap()));
        backend.close().unwrap();

        let reopened = LocalDiskBackend::open(root, 1 << 20, 3).unwrap();
        assert_eq!(reopened.stats()[0].chunk_count, 4);
        assert!(reopened.stats()[0].bytes_used > 0);
        for k in &keys {
            assert!(reopened.get(k).unwrap().is_some());
        }
    }

    #[test]
    fn test_budget_skips_writes() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalDiskBackend::open(tmp.path().to_path_buf(), 16, 3).unwrap();
        let k = key("m", &[9]);
        backend.batched_put(vec![(k.clone(), chunk())], true).unwrap();
        assert!(!backend.contains(&k).unwrap());
        assert_eq!(backend.stats()[0].bytes_used, 0);
    }

    #[test]
    fn test_concurrent_writers_of_same_key() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("disk");
        let backend = LocalDiskBackend::open(root.clone(), 1 << 26, 3).unwrap();
        let keys: Vec<CacheEngineKey> = (0..50).map(|i| key("m", &[i])).collect();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for k in &keys {
                        let stored = backend.batched_put(vec![(k.clone(), chunk())], true);
                        assert_eq!(stored.unwrap(), 1);
                    }
                });
            }
        });
        // Queued writes racing blocking ones for the same keys.
        let entries = keys.iter().map(|k| (k.clone(), chunk())).collect();
        backend.batched_put(entries, false).unwrap();
        let entries = keys.iter().map(|k| (k.clone(), chunk())).collect();
        backend.batched_put(entries, true).unwrap();
        backend.close().unwrap();

        let (bytes_on_disk, files_on_disk) = disk_usage(&root).unwrap();
        let stats = &backend.stats()[0];
        assert_eq!(files_on_disk, keys.len());
        assert_eq!(stats.chunk_count, keys.len());
        assert_eq!(stats.bytes_used, bytes_on_disk);
        assert_eq!(backend.io_stats().total_writes, keys.len() as u64);
    }

    #[test]
    fn test_close_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalDiskBackend::open(tmp.path().to_path_buf(), 1 << 20, 3).unwrap();
        backend.close().unwrap();
        backend.close().unwrap();
        assert!(matches!(backend.get(&key("m", &[1])), Err(StorageError::Closed)));
    }
}
