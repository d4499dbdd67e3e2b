//! Conversions between the per-layer (nested) KV representation and the
//! stacked blob moved to and from storage, plus token-aligned slicing.
//!
//! Per-layer tensor shapes:
//! - vllm:        `[num_tokens, num_kv_heads, head_size]`
//! - huggingface: `[num_kv_heads, num_tokens, head_size]`
//!
//! The stacked blob prepends a layer axis and a key/value axis:
//! `[num_layers, 2, ...per-layer shape]`.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Nested KV: one `(key, value)` pair per model layer.
pub type KvTensors = Vec<(Tensor, Tensor)>;

/// Axes prepended to a per-layer tensor in the stacked blob.
const STACKED_PREFIX_DIMS: usize = 2;

/// Tensor layout of per-layer KV state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvLayout {
    /// Tokens then heads.
    Vllm,
    /// Heads then tokens.
    HuggingFace,
}

impl KvLayout {
    /// Token axis of a per-layer key or value tensor.
    pub fn token_dim(&self) -> usize {
        match self {
            KvLayout::Vllm => 0,
            KvLayout::HuggingFace => 1,
        }
    }

    /// Token axis of a stacked blob.
    pub fn stacked_token_dim(&self) -> usize {
        self.token_dim() + STACKED_PREFIX_DIMS
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KvLayout::Vllm => "vllm",
            KvLayout::HuggingFace => "huggingface",
        }
    }
}

impl fmt::Display for KvLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KvLayout {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vllm" => Ok(KvLayout::Vllm),
            "huggingface" => Ok(KvLayout::HuggingFace),
            other => Err(CacheError::InvalidFormat(other.to_string())),
        }
    }
}

/// Stateless codec for one layout and chunk size.
///
/// Built once from the engine metadata; every operation uses the layout fixed
/// at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCodec {
    layout: KvLayout,
    chunk_size: usize,
}

impl ChunkCodec {
    pub fn new(layout: KvLayout, chunk_size: usize) -> Self {
        Self { layout, chunk_size }
    }

    pub fn layout(&self) -> KvLayout {
        self.layout
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of tokens held by a nested KV (0 for an empty one).
    pub fn num_tokens_nested(&self, kv: &[(Tensor, Tensor)]) -> Result<usize> {
        match kv.first() {
            Some((k, _)) => Ok(k.dim(self.layout.token_dim())?),
            None => Ok(0),
        }
    }

    /// Number of tokens held by a stacked blob.
    pub fn num_tokens_stacked(&self, blob: &Tensor) -> Result<usize> {
        Ok(blob.dim(self.layout.stacked_token_dim())?)
    }

    /// Stack per-layer pairs into `[num_layers, 2, ...]`.
    pub fn nested_to_stacked(&self, kv: &[(Tensor, Tensor)]) -> Result<Tensor> {
        if kv.is_empty() {
            return Err(CacheError::InvalidArgument("KV has no layers".into()));
        }
        let token_dim = self.layout.token_dim();
        let expected = kv[0].0.dims().to_vec();
        for (layer, (k, v)) in kv.iter().enumerate() {
            if k.dims() != expected.as_slice() || v.dims() != expected.as_slice() {
                return Err(CacheError::InvalidArgument(format!(
                    "layer {layer} has shapes {:?}/{:?}, expected {expected:?}",
                    k.dims(),
                    v.dims()
                )));
            }
        }
        if expected.len() <= token_dim {
            return Err(CacheError::InvalidArgument(format!(
                "per-layer tensor of rank {} has no token axis for layout {}",
                expected.len(),
                self.layout
            )));
        }

        let keys: Vec<&Tensor> = kv.iter().map(|(k, _)| k).collect();
        let values: Vec<&Tensor> = kv.iter().map(|(_, v)| v).collect();
        let keys = Tensor::stack(&keys, 0)?;
        let values = Tensor::stack(&values, 0)?;
        Ok(Tensor::stack(&[&keys, &values], 1)?)
    }

    /// Split `[num_layers, 2, ...]` back into per-layer pairs.
    pub fn stacked_to_nested(&self, blob: &Tensor) -> Result<KvTensors> {
        if blob.rank() < STACKED_PREFIX_DIMS + 1 || blob.dim(1)? != 2 {
            return Err(CacheError::InvalidArgument(format!(
                "stacked KV must be [num_layers, 2, ...], got {:?}",
                blob.dims()
            )));
        }
        let num_layers = blob.dim(0)?;
        let mut kv = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let pair = blob.get(layer)?;
            kv.push((pair.get(0)?, pair.get(1)?));
        }
        Ok(kv)
    }

    /// Contiguous slices of `blob` along the token axis starting at `start`,
    /// each `chunk_size` wide except possibly the last.
    pub fn slice_at(&self, blob: &Tensor, start: usize) -> Result<Vec<Tensor>> {
        let dim = self.layout.stacked_token_dim();
        let total = blob.dim(dim)?;
        if start > total {
            return Err(CacheError::InvalidArgument(format!(
                "slice start {start} beyond {total} tokens"
            )));
        }
        let mut slices = Vec::with_capacity((total - start).div_ceil(self.chunk_size));
        let mut offset = start;
        while offset < total {
            let len = self.chunk_size.min(total - offset);
            slices.push(blob.narrow(dim, offset, len)?.contiguous()?);
            offset += len;
        }
        Ok(slices)
    }

    /// Drop the first `skip` tokens of a stacked blob.
    pub fn trim_front(&self, blob: &Tensor, skip: usize) -> Result<Tensor> {
        if skip == 0 {
            return Ok(blob.clone());
        }
        let dim = self.layout.stacked_token_dim();
        let total = blob.dim(dim)?;
        if skip > total {
            return Err(CacheError::InvalidArgument(format!(
                "cannot trim {skip} tokens from a {total}-token chunk"
            )));
        }
        Ok(blob.narrow(dim, skip, total - skip)?.contiguous()?)
    }

    /// Concatenate stacked chunks along the token axis.
    pub fn concat(&self, chunks: &[Tensor]) -> Result<Tensor> {
        Ok(Tensor::cat(chunks, self.layout.stacked_token_dim())?)
    }
}
