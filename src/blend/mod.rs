//! Cache blending: reuse KV cached for separate segments inside one prompt,
//! recomputing a bounded subset of positions layer by layer.
//!
//! - [`retriever`]: separator splitting and per-segment retrieval
//! - [`executor`]: per-layer selection and merge state machine
//! - [`importance`]: scoring of reused positions
//! - [`positional`]: re-encoding of cached keys at their new positions

pub mod executor;
pub mod importance;
pub mod positional;
pub mod retriever;

pub use executor::{BlendExecutor, BlendInput, BlendOutput};
pub use importance::{ImportanceScorer, KeyDeviationScorer};
pub use positional::{NoPositionalEncoding, PositionalEncoder, RotaryReencoder};
pub use retriever::{BlendRetrieverResult, LayerRetrievalResult, SegmentRetriever};
