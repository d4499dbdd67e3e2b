//! Chunked KV cache.
//!
//! - [`hasher`]: token chunking and the prefix hash chain
//! - [`codec`]: nested/stacked KV conversion and token-axis slicing
//! - [`engine`]: store / retrieve / lookup against a storage backend
//! - [`registry`]: engine instances keyed by id

pub mod codec;
pub mod engine;
pub mod hasher;
pub mod registry;

pub use codec::{ChunkCodec, KvLayout, KvTensors};
pub use engine::{CacheEngine, EngineStats, Retrieval, RetrievedKv};
pub use hasher::{CacheEngineKey, ChunkHash, TokenHasher, TokenId};
pub use registry::CacheEngineRegistry;
