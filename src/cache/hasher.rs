//! Content addressing of token chunks.
//!
//! Each chunk is hashed together with the hash of everything before it,
//! forming a prefix hash chain: two token sequences share the hash at chunk
//! `i` iff chunks `0..=i` are identical.

use std::fmt;
use std::slice::Chunks;

use sha2::{Digest, Sha256};

use crate::cache::codec::KvLayout;
use crate::error::{CacheError, Result};

/// Token id as produced by the host tokenizer.
pub type TokenId = u32;

/// Hex-encoded SHA-256 chain hash of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHash(String);

impl ChunkHash {
    /// Hash preceding the first chunk.
    pub fn root() -> Self {
        ChunkHash(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Chain `tokens` onto this hash.
    pub fn chain(&self, tokens: &[TokenId]) -> ChunkHash {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        for token in tokens {
            hasher.update(token.to_le_bytes());
        }
        ChunkHash(hex::encode(hasher.finalize()))
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Splits token sequences into fixed-size chunks and hashes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenHasher {
    chunk_size: usize,
}

impl TokenHasher {
    pub fn new(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(CacheError::Config("chunk_size must be positive".into()));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Chunks partitioning `tokens` left to right; the last may be shorter.
    pub fn chunks<'a>(&self, tokens: &'a [TokenId]) -> Chunks<'a, TokenId> {
        tokens.chunks(self.chunk_size)
    }

    /// Lazily computed hash chain over `tokens`, one item per chunk.
    pub fn prefix_hashes<'a>(&self, tokens: &'a [TokenId]) -> PrefixHashes<'a> {
        PrefixHashes {
            chunks: self.chunks(tokens),
            prev: ChunkHash::root(),
        }
    }

    /// Number of chunks covering `num_tokens` tokens.
    pub fn num_chunks(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.chunk_size)
    }
}

/// Single-pass iterator over the prefix hash chain of a token sequence.
///
/// Restart by calling [`TokenHasher::prefix_hashes`] again.
#[derive(Debug, Clone)]
pub struct PrefixHashes<'a> {
    chunks: Chunks<'a, TokenId>,
    prev: ChunkHash,
}

impl Iterator for PrefixHashes<'_> {
    type Item = ChunkHash;

    fn next(&mut self) -> Option<ChunkHash> {
        let chunk = self.chunks.next()?;
        self.prev = self.prev.chain(chunk);
        Some(self.prev.clone())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for PrefixHashes<'_> {}

/// Identifies one chunk's KV state for one model and parallel rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheEngineKey {
    pub fmt: KvLayout,
    pub model_name: String,
    pub world_size: usize,
    pub worker_id: usize,
    pub chunk_hash: ChunkHash,
}

impl fmt::Display for CacheEngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}@{}@{}@{}",
            self.fmt, self.model_name, self.world_size, self.worker_id, self.chunk_hash
        )
    }
}
