//! Per-segment retrieval for composite prompts.
//!
//! A composite prompt is a concatenation of independently cached segments
//! joined by a separator token pattern. Each segment is looked up on its own
//! (its cached KV was computed without the others as context), and the
//! per-segment prefixes are stitched back together along the token axis.

use std::sync::Arc;

use candle_core::Tensor;
use tracing::debug;

use crate::cache::codec::KvLayout;
use crate::cache::engine::CacheEngine;
use crate::cache::hasher::TokenId;
use crate::error::{CacheError, Result};

/// Splits composite prompts at separators and fetches each segment's cache.
pub struct SegmentRetriever {
    separator: Vec<TokenId>,
    engine: Arc<CacheEngine>,
}

impl SegmentRetriever {
    pub fn new(separator: Vec<TokenId>, engine: Arc<CacheEngine>) -> Result<Self> {
        if separator.is_empty() {
            return Err(CacheError::InvalidArgument(
                "separator pattern must not be empty".into(),
            ));
        }
        Ok(Self { separator, engine })
    }

    pub fn separator(&self) -> &[TokenId] {
        &self.separator
    }

    /// Remove every separator occurrence from `prompt`.
    ///
    /// Returns the cleaned prompt and the offsets in it where a new segment
    /// starts. A separator at the very end opens no segment.
    pub fn drop_separators_and_index(&self, prompt: &[TokenId]) -> (Vec<TokenId>, Vec<usize>) {
        let spt = self.separator.as_slice();
        let mut cleaned = Vec::with_capacity(prompt.len());
        let mut boundaries = Vec::new();

        let mut i = 0;
        while i < prompt.len() {
            if prompt[i..].starts_with(spt) {
                i += spt.len();
                if i < prompt.len() {
                    boundaries.push(cleaned.len());
                }
            } else {
                cleaned.push(prompt[i]);
                i += 1;
            }
        }
        (cleaned, boundaries)
    }

    /// Retrieve every segment of every request in the batch.
    ///
    /// `boundaries[r]` are the segment starts inside `prompts[r]`, as returned
    /// by [`drop_separators_and_index`](Self::drop_separators_and_index).
    pub fn new_request(
        &self,
        prompts: &[Vec<TokenId>],
        boundaries: &[Vec<usize>],
    ) -> Result<BlendRetrieverResult> {
        if prompts.len() != boundaries.len() {
            return Err(CacheError::InvalidArgument(format!(
                "{} prompts but {} boundary lists",
                prompts.len(),
                boundaries.len()
            )));
        }

        let codec = *self.engine.codec();
        let total: usize = prompts.iter().map(Vec::len).sum();
        let mut segments = Vec::new();
        let mut valid_mask = Vec::with_capacity(total);
        let mut original_positions = Vec::with_capacity(total);
        let mut query_start_loc = Vec::with_capacity(prompts.len() + 1);
        query_start_loc.push(0);

        for (prompt, starts) in prompts.iter().zip(boundaries) {
            let unordered = starts.windows(2).any(|w| w[0] > w[1]);
            if unordered || starts.last().is_some_and(|&b| b > prompt.len()) {
                return Err(CacheError::InvalidArgument(format!(
                    "segment boundaries {starts:?} are not ordered within {} tokens",
                    prompt.len()
                )));
            }

            let mut edges = Vec::with_capacity(starts.len() + 2);
            edges.push(0);
            edges.extend_from_slice(starts);
            edges.push(prompt.len());

            for window in edges.windows(2) {
                let (start, end) = (window[0], window[1]);
                if start == end {
                    continue;
                }
                let retrieval = self.engine.retrieve(&prompt[start..end], None, false)?;
                let hit_len = retrieval.num_hit_tokens();
                let blob = match retrieval.kv {
                    Some(kv) => Some(kv.into_stacked(&codec)?),
                    None => None,
                };

                valid_mask.extend((0..end - start).map(|i| i < hit_len));
                original_positions
                    .extend((0..end - start).map(|i| if i < hit_len { i as u32 } else { 0 }));
                segments.push(SegmentHit {
                    len: end - start,
                    hit_len,
                    blob,
                });
            }
            query_start_loc.push(valid_mask.len() as u32);
        }

        let hit_tokens = valid_mask.iter().filter(|v| **v).count();
        debug!(
            requests = prompts.len(),
            segments = segments.len(),
            tokens = total,
            hit_tokens,
            "Assembled blend retrieval"
        );

        Ok(BlendRetrieverResult {
            layout: codec.layout(),
            segments,
            valid_mask,
            original_positions,
            query_start_loc,
        })
    }
}

struct SegmentHit {
    len: usize,
    hit_len: usize,
    /// Stacked `[num_layers, 2, ...]` prefix, `hit_len` tokens long.
    blob: Option<Tensor>,
}

/// Retrieval for one layer.
#[derive(Debug, Clone)]
pub struct LayerRetrievalResult {
    /// Full-length keys; missed positions hold zeros. Absent if nothing hit.
    pub k: Option<Tensor>,
    pub v: Option<Tensor>,
    pub valid_mask: Vec<bool>,
    /// Position of each token within its own segment; 0 where invalid.
    pub original_positions: Vec<u32>,
}

/// Batch-wide retrieval, realized per layer on demand.
pub struct BlendRetrieverResult {
    layout: KvLayout,
    segments: Vec<SegmentHit>,
    valid_mask: Vec<bool>,
    original_positions: Vec<u32>,
    query_start_loc: Vec<u32>,
}

impl BlendRetrieverResult {
    pub fn num_tokens(&self) -> usize {
        self.valid_mask.len()
    }

    pub fn valid_mask(&self) -> &[bool] {
        &self.valid_mask
    }

    pub fn original_positions(&self) -> &[u32] {
        &self.original_positions
    }

    /// Request offsets in the concatenated batch, `num_requests + 1` entries.
    pub fn query_start_loc(&self) -> &[u32] {
        &self.query_start_loc
    }

    pub fn has_hits(&self) -> bool {
        self.segments.iter().any(|s| s.blob.is_some())
    }

    pub fn result(&self, layer: usize) -> Result<LayerRetrievalResult> {
        let (k, v) = match self.segments.iter().find_map(|s| s.blob.as_ref()) {
            Some(template) => {
                let num_layers = template.dim(0)?;
                if layer >= num_layers {
                    return Err(CacheError::InvalidArgument(format!(
                        "layer {layer} out of range for {num_layers} cached layers"
                    )));
                }
                let (k, v) = self.assemble_layer(layer, template)?;
                (Some(k), Some(v))
            }
            None => (None, None),
        };
        Ok(LayerRetrievalResult {
            k,
            v,
            valid_mask: self.valid_mask.clone(),
            original_positions: self.original_positions.clone(),
        })
    }

    fn assemble_layer(&self, layer: usize, template: &Tensor) -> Result<(Tensor, Tensor)> {
        let token_dim = self.layout.token_dim();
        // Per-layer shape of one key tensor in the template.
        let per_layer = template.get(layer)?.get(0)?;
        let dtype = per_layer.dtype();
        let device = per_layer.device().clone();
        let mut shape = per_layer.dims().to_vec();

        let mut keys = Vec::with_capacity(self.segments.len() * 2);
        let mut values = Vec::with_capacity(self.segments.len() * 2);
        for segment in &self.segments {
            if let Some(blob) = &segment.blob {
                let pair = blob.get(layer)?;
                keys.push(pair.get(0)?);
                values.push(pair.get(1)?);
            }
            let missed = segment.len - segment.hit_len;
            if missed > 0 {
                shape[token_dim] = missed;
                let zeros = Tensor::zeros(shape.as_slice(), dtype, &device)?;
                keys.push(zeros.clone());
                values.push(zeros);
            }
        }
        Ok((Tensor::cat(&keys, token_dim)?, Tensor::cat(&values, token_dim)?))
    }
}
