//! kv-blend-cache: chunked KV-cache store with cross-context cache blending.
//!
//! Stores per-token attention state keyed by a prefix hash chain over token
//! chunks, so repeated prompt prefixes need not be recomputed, and splices
//! together state cached for separate segments of a composite prompt while
//! recomputing a bounded subset of positions per layer.

pub mod blend;
pub mod cache;
pub mod config;
pub mod error;
pub mod server;
pub mod storage;
pub mod usage;

pub use cache::{CacheEngine, CacheEngineRegistry, KvLayout};
pub use config::{EngineConfig, EngineMetadata};
pub use error::{CacheError, Result};
