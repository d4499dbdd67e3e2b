//! Chunked prefix cache engine.
//!
//! The engine hashes token sequences into a prefix hash chain, slices the KV
//! state into chunk-aligned blobs and moves them to and from a
//! [`StorageBackend`]. Retrieval is prefix-only: it stops at the first missing
//! chunk.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use candle_core::Tensor;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::codec::{ChunkCodec, KvTensors};
use crate::cache::hasher::{CacheEngineKey, ChunkHash, TokenHasher, TokenId};
use crate::config::{EngineConfig, EngineMetadata};
use crate::error::{CacheError, Result};
use crate::storage::{create_backend, BackendStats, StorageBackend};

/// Retrieved KV state in the requested representation.
#[derive(Debug, Clone)]
pub enum RetrievedKv {
    /// One `(key, value)` pair per layer.
    Nested(KvTensors),
    /// `[num_layers, 2, ...]` blob.
    Stacked(Tensor),
}

impl RetrievedKv {
    pub fn into_nested(self, codec: &ChunkCodec) -> Result<KvTensors> {
        match self {
            RetrievedKv::Nested(kv) => Ok(kv),
            RetrievedKv::Stacked(blob) => codec.stacked_to_nested(&blob),
        }
    }

    pub fn into_stacked(self, codec: &ChunkCodec) -> Result<Tensor> {
        match self {
            RetrievedKv::Nested(kv) => codec.nested_to_stacked(&kv),
            RetrievedKv::Stacked(blob) => Ok(blob),
        }
    }
}

/// Result of [`CacheEngine::retrieve`].
#[derive(Debug, Clone)]
pub struct Retrieval {
    /// Absent when no chunk was hit.
    pub kv: Option<RetrievedKv>,
    /// One entry per input token: true iff its KV was retrieved.
    pub ret_mask: Vec<bool>,
}

impl Retrieval {
    pub fn num_hit_tokens(&self) -> usize {
        self.ret_mask.iter().filter(|hit| **hit).count()
    }
}

/// Snapshot of the hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EngineStats {
    pub hit_tokens: u64,
    pub miss_tokens: u64,
    /// `hit_tokens / (hit_tokens + miss_tokens)`, 0 before any retrieval.
    pub hit_rate: f64,
}

/// Prefix-aware KV cache over a storage backend.
pub struct CacheEngine {
    config: EngineConfig,
    metadata: EngineMetadata,
    hasher: TokenHasher,
    codec: ChunkCodec,
    backend: Arc<dyn StorageBackend>,
    hit_tokens: AtomicU64,
    miss_tokens: AtomicU64,
    closed: AtomicBool,
}

impl CacheEngine {
    pub fn new(
        config: EngineConfig,
        metadata: EngineMetadata,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let hasher = TokenHasher::new(config.chunk_size)?;
        let codec = ChunkCodec::new(metadata.fmt, config.chunk_size);

        info!(
            model = %metadata.model_name,
            world_size = metadata.world_size,
            worker_id = metadata.worker_id,
            fmt = %metadata.fmt,
            chunk_size = config.chunk_size,
            "Cache engine created"
        );

        Ok(Self {
            config,
            metadata,
            hasher,
            codec,
            backend,
            hit_tokens: AtomicU64::new(0),
            miss_tokens: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Build the engine together with the backend selected by `config`.
    pub fn from_config(config: EngineConfig, metadata: EngineMetadata) -> Result<Self> {
        let backend = create_backend(&config)?;
        Self::new(config, metadata, backend)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metadata(&self) -> &EngineMetadata {
        &self.metadata
    }

    pub fn codec(&self) -> &ChunkCodec {
        &self.codec
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Whether KV produced while decoding should be stored by the host.
    pub fn save_decode_cache(&self) -> bool {
        self.config.save_decode_cache
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn make_key(&self, chunk_hash: ChunkHash) -> CacheEngineKey {
        CacheEngineKey {
            fmt: self.metadata.fmt,
            model_name: self.metadata.model_name.clone(),
            world_size: self.metadata.world_size,
            worker_id: self.metadata.worker_id,
            chunk_hash,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CacheError::InvalidState("cache engine is closed".into()));
        }
        Ok(())
    }

    /// Store the KV of `tokens`.
    ///
    /// `mask` must be a suffix mask whose leading `false` run is a multiple of
    /// the chunk size; `kv` then holds only the masked-in tokens. Returns the
    /// number of chunks submitted to the backend.
    pub fn store(
        &self,
        tokens: &[TokenId],
        kv: &[(Tensor, Tensor)],
        mask: Option<&[bool]>,
        skip_existing: bool,
        blocking: bool,
    ) -> Result<usize> {
        self.ensure_open()?;
        let start = Instant::now();
        let chunk_size = self.chunk_size();

        let num_skip_tok = suffix_mask_skip(tokens.len(), mask)?;
        if num_skip_tok % chunk_size != 0 {
            return Err(CacheError::InvalidArgument(format!(
                "store mask skips {num_skip_tok} tokens, not a multiple of chunk size {chunk_size}"
            )));
        }
        let num_skip_chunk = num_skip_tok / chunk_size;

        let num_kv_tokens = self.codec.num_tokens_nested(kv)?;
        if num_kv_tokens + num_skip_tok != tokens.len() {
            return Err(CacheError::InvalidArgument(format!(
                "KV holds {num_kv_tokens} tokens but {} tokens are masked in",
                tokens.len() - num_skip_tok
            )));
        }
        if num_kv_tokens == 0 {
            return Ok(0);
        }

        let blob = self.codec.nested_to_stacked(kv)?;
        let hashes: Vec<ChunkHash> = self
            .hasher
            .prefix_hashes(tokens)
            .skip(num_skip_chunk)
            .collect();

        let start_chunk = if skip_existing {
            let mut first_absent = None;
            for (idx, hash) in hashes.iter().enumerate() {
                if !self.backend.contains(&self.make_key(hash.clone()))? {
                    first_absent = Some(idx);
                    break;
                }
            }
            match first_absent {
                Some(idx) => idx,
                None => {
                    debug!(chunks = hashes.len(), "All chunks already stored");
                    return Ok(0);
                }
            }
        } else {
            0
        };

        let slices = self.codec.slice_at(&blob, start_chunk * chunk_size)?;
        let entries: Vec<(CacheEngineKey, Tensor)> = hashes
            .into_iter()
            .skip(start_chunk)
            .zip(slices)
            .map(|(hash, chunk)| (self.make_key(hash), chunk))
            .collect();
        let make_chunks = start.elapsed();

        let stored = self.backend.batched_put(entries, blocking)?;

        info!(
            chunks = stored,
            skipped_existing = start_chunk,
            blocking,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            make_chunks_ms = make_chunks.as_secs_f64() * 1000.0,
            "Stored chunks"
        );
        Ok(stored)
    }

    /// Retrieve the longest cached prefix of `tokens`.
    ///
    /// Tokens excluded by the suffix `mask` are neither fetched nor marked.
    /// With `return_tuple` the KV comes back nested, otherwise stacked.
    pub fn retrieve(
        &self,
        tokens: &[TokenId],
        mask: Option<&[bool]>,
        return_tuple: bool,
    ) -> Result<Retrieval> {
        self.ensure_open()?;
        let start = Instant::now();
        let chunk_size = self.chunk_size();

        let num_skip_tok = suffix_mask_skip(tokens.len(), mask)?;
        let num_skip_chunk = num_skip_tok / chunk_size;
        let mut ret_mask = vec![false; tokens.len()];
        let requested = (tokens.len() - num_skip_tok) as u64;
        if requested == 0 {
            return Ok(Retrieval { kv: None, ret_mask });
        }

        let keys = self
            .hasher
            .prefix_hashes(tokens)
            .skip(num_skip_chunk)
            .map(|hash| self.make_key(hash));

        let mut chunks = Vec::new();
        for chunk in self.backend.batched_get(Box::new(keys)) {
            match chunk? {
                Some(chunk) => chunks.push(chunk),
                None => break,
            }
        }

        if chunks.is_empty() {
            self.miss_tokens.fetch_add(requested, Ordering::Relaxed);
            debug!(tokens = tokens.len(), "Retrieved 0 chunks");
            return Ok(Retrieval { kv: None, ret_mask });
        }

        let extra = num_skip_tok - num_skip_chunk * chunk_size;
        chunks[0] = self.codec.trim_front(&chunks[0], extra)?;
        let num_chunks = chunks.len();
        let blob = if num_chunks == 1 {
            chunks.swap_remove(0)
        } else {
            self.codec.concat(&chunks)?
        };
        let retrieved = self.codec.num_tokens_stacked(&blob)?;

        self.hit_tokens.fetch_add(retrieved as u64, Ordering::Relaxed);
        self.miss_tokens
            .fetch_add(requested - retrieved as u64, Ordering::Relaxed);
        ret_mask[num_skip_tok..num_skip_tok + retrieved].fill(true);

        let kv = if return_tuple {
            RetrievedKv::Nested(self.codec.stacked_to_nested(&blob)?)
        } else {
            RetrievedKv::Stacked(blob)
        };

        info!(
            chunks = num_chunks,
            tokens = retrieved,
            hit_rate = %format!("{:.2}%", self.stats().hit_rate * 100.0),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Retrieved chunks"
        );
        Ok(Retrieval {
            kv: Some(kv),
            ret_mask,
        })
    }

    /// Number of leading tokens whose chunks are all present in the backend.
    pub fn lookup(&self, tokens: &[TokenId]) -> Result<usize> {
        self.ensure_open()?;
        let mut cached = 0;
        for hash in self.hasher.prefix_hashes(tokens) {
            if !self.backend.contains(&self.make_key(hash))? {
                break;
            }
            cached = (cached + self.chunk_size()).min(tokens.len());
        }
        Ok(cached)
    }

    pub fn stats(&self) -> EngineStats {
        let hit_tokens = self.hit_tokens.load(Ordering::Relaxed);
        let miss_tokens = self.miss_tokens.load(Ordering::Relaxed);
        let total = hit_tokens + miss_tokens;
        EngineStats {
            hit_tokens,
            miss_tokens,
            hit_rate: if total == 0 {
                0.0
            } else {
                hit_tokens as f64 / total as f64
            },
        }
    }

    pub fn backend_stats(&self) -> Vec<BackendStats> {
        self.backend.stats()
    }

    /// Close the backend. Later operations fail with `InvalidState`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            warn!(model = %self.metadata.model_name, "Cache engine already closed");
            return Ok(());
        }
        self.backend.close()?;
        info!(model = %self.metadata.model_name, "Cache engine closed");
        Ok(())
    }
}

/// Length of the leading `false` run of a suffix mask.
fn suffix_mask_skip(num_tokens: usize, mask: Option<&[bool]>) -> Result<usize> {
    let Some(mask) = mask else {
        return Ok(0);
    };
    if mask.len() != num_tokens {
        return Err(CacheError::InvalidArgument(format!(
            "mask length {} does not match {num_tokens} tokens",
            mask.len()
        )));
    }
    let skip = mask.iter().take_while(|m| !**m).count();
    if mask[skip..].iter().any(|m| !*m) {
        return Err(CacheError::InvalidArgument(
            "only suffix masks are supported".into(),
        ));
    }
    Ok(skip)
}
