//! Layer-wise blend state machine.
//!
//! Driven by the host once per model layer, in order:
//!
//! | layer | role      | output                                                      |
//! |-------|-----------|-------------------------------------------------------------|
//! | 0     | pass      | inputs unchanged, `local_indices = 0..n`                    |
//! | 1     | selection | query and positions reduced to the positions to recompute   |
//! | >= 2  | merge     | recomputed keys/values scattered into the retrieved ones    |
//!
//! Layer 0 always starts a new pass.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::blend::importance::{ImportanceScorer, KeyDeviationScorer};
use crate::blend::positional::{NoPositionalEncoding, PositionalEncoder};
use crate::blend::retriever::LayerRetrievalResult;
use crate::config::EngineConfig;
use crate::error::{CacheError, Result};

/// Tensors handed to [`BlendExecutor::blend`] for one layer.
#[derive(Debug, Clone, Copy)]
pub struct BlendInput<'a> {
    pub layer: usize,
    /// Full-length cached keys; `None` means nothing was retrieved.
    pub retrieved_k: Option<&'a Tensor>,
    pub retrieved_v: Option<&'a Tensor>,
    pub valid_mask: &'a [bool],
    pub original_positions: &'a [u32],
    pub fresh_q: &'a Tensor,
    pub fresh_k: &'a Tensor,
    pub fresh_v: &'a Tensor,
    /// 1-D absolute positions of the tokens in `fresh_q`.
    pub positions: &'a Tensor,
    /// Request offsets, `num_requests + 1` entries.
    pub query_start_loc: Option<&'a [u32]>,
    /// Token axis of the q/k/v tensors.
    pub token_dim: usize,
}

impl<'a> BlendInput<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn from_retrieval(
        layer: usize,
        retrieved: &'a LayerRetrievalResult,
        fresh_q: &'a Tensor,
        fresh_k: &'a Tensor,
        fresh_v: &'a Tensor,
        positions: &'a Tensor,
        query_start_loc: Option<&'a [u32]>,
        token_dim: usize,
    ) -> Self {
        Self {
            layer,
            retrieved_k: retrieved.k.as_ref(),
            retrieved_v: retrieved.v.as_ref(),
            valid_mask: &retrieved.valid_mask,
            original_positions: &retrieved.original_positions,
            fresh_q,
            fresh_k,
            fresh_v,
            positions,
            query_start_loc,
            token_dim,
        }
    }
}

/// What the host feeds to this layer's attention.
#[derive(Debug, Clone)]
pub struct BlendOutput {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub positions: Tensor,
    /// Positions being recomputed, ascending.
    pub local_indices: Vec<u32>,
    /// Request offsets within the reduced batch, multi-request batches only.
    pub query_start_loc: Option<Vec<u32>>,
}

struct Selection {
    local_indices: Vec<u32>,
    /// Full-length positions seen at the selection layer.
    positions: Tensor,
    query_start_loc: Option<Vec<u32>>,
}

struct PassState {
    next_layer: usize,
    selection: Option<Selection>,
}

pub struct BlendExecutor {
    recompute_ratio: f64,
    min_tokens: usize,
    scorer: Arc<dyn ImportanceScorer>,
    encoder: Arc<dyn PositionalEncoder>,
    state: Option<PassState>,
}

impl BlendExecutor {
    /// `recompute_ratio` must lie in `[0, 1]`.
    pub fn new(recompute_ratio: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&recompute_ratio) {
            return Err(CacheError::InvalidArgument(format!(
                "recompute ratio {recompute_ratio} outside [0, 1]"
            )));
        }
        Ok(Self {
            recompute_ratio,
            min_tokens: 0,
            scorer: Arc::new(KeyDeviationScorer),
            encoder: Arc::new(NoPositionalEncoding),
            state: None,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(config.blend_recompute_ratio)?.with_min_tokens(config.blend_min_tokens))
    }

    /// Batches shorter than `min_tokens` are recomputed in full.
    pub fn with_min_tokens(mut self, min_tokens: usize) -> Self {
        self.min_tokens = min_tokens;
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ImportanceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_positional_encoder(mut self, encoder: Arc<dyn PositionalEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn recompute_ratio(&self) -> f64 {
        self.recompute_ratio
    }

    pub fn blend(&mut self, input: BlendInput<'_>) -> Result<BlendOutput> {
        if input.layer == 0 {
            self.state = Some(PassState {
                next_layer: 1,
                selection: None,
            });
            return self.pass_through(&input);
        }

        let state = self.state.as_mut().ok_or_else(|| {
            CacheError::InvalidState(format!("layer {} before layer 0", input.layer))
        })?;
        if input.layer != state.next_layer {
            return Err(CacheError::InvalidState(format!(
                "expected layer {}, got {}",
                state.next_layer, input.layer
            )));
        }

        let output = if input.layer == 1 {
            let (output, selection) = select(
                &input,
                self.recompute_ratio,
                self.min_tokens,
                self.scorer.as_ref(),
            )?;
            state.selection = Some(selection);
            output
        } else {
            let selection = state.selection.as_ref().ok_or_else(|| {
                CacheError::InvalidState("merge before selection".into())
            })?;
            merge(&input, selection, self.encoder.as_ref())?
        };
        state.next_layer += 1;
        Ok(output)
    }

    fn pass_through(&self, input: &BlendInput<'_>) -> Result<BlendOutput> {
        let n = input.fresh_k.dim(input.token_dim)?;
        Ok(BlendOutput {
            q: input.fresh_q.clone(),
            k: input.fresh_k.clone(),
            v: input.fresh_v.clone(),
            positions: input.positions.clone(),
            local_indices: (0..n as u32).collect(),
            query_start_loc: None,
        })
    }
}

fn select(
    input: &BlendInput<'_>,
    ratio: f64,
    min_tokens: usize,
    scorer: &dyn ImportanceScorer,
) -> Result<(BlendOutput, Selection)> {
    let n = input.fresh_k.dim(input.token_dim)?;
    if input.valid_mask.len() != n || input.original_positions.len() != n {
        return Err(CacheError::InvalidArgument(format!(
            "valid mask ({}) and original positions ({}) must cover {n} tokens",
            input.valid_mask.len(),
            input.original_positions.len()
        )));
    }

    let changed: Vec<u32> = match input.retrieved_k {
        _ if n < min_tokens => (0..n as u32).collect(),
        None => (0..n as u32).collect(),
        Some(retrieved_k) => {
            let (valid, mut changed): (Vec<u32>, Vec<u32>) =
                (0..n as u32).partition(|&i| input.valid_mask[i as usize]);
            let budget = (ratio * valid.len() as f64).floor() as usize;
            if budget > 0 {
                let scores = scorer.score(input.fresh_k, retrieved_k, input.token_dim)?;
                if scores.len() != n {
                    return Err(CacheError::InvalidArgument(format!(
                        "importance scorer returned {} scores for {n} tokens",
                        scores.len()
                    )));
                }
                let mut ranked = valid;
                ranked.sort_by(|&a, &b| {
                    scores[b as usize]
                        .total_cmp(&scores[a as usize])
                        .then(a.cmp(&b))
                });
                changed.extend_from_slice(&ranked[..budget]);
            }
            changed.sort_unstable();
            changed
        }
    };

    let query_start_loc = match input.query_start_loc {
        Some(loc) if loc.len() > 2 => Some(
            loc.iter()
                .map(|&boundary| changed.partition_point(|&i| i < boundary) as u32)
                .collect::<Vec<u32>>(),
        ),
        _ => None,
    };

    debug!(
        tokens = n,
        recompute = changed.len(),
        invalid = input.valid_mask.iter().filter(|v| !**v).count(),
        "Selected positions to recompute"
    );

    let selection = Selection {
        local_indices: changed.clone(),
        positions: input.positions.clone(),
        query_start_loc: query_start_loc.clone(),
    };

    if changed.is_empty() {
        return Ok((
            BlendOutput {
                q: input.fresh_q.clone(),
                k: input.fresh_k.clone(),
                v: input.fresh_v.clone(),
                positions: input.positions.clone(),
                local_indices: Vec::new(),
                query_start_loc,
            },
            selection,
        ));
    }

    let index = index_tensor(&changed, input.fresh_q.device())?;
    let output = BlendOutput {
        q: input.fresh_q.index_select(&index, input.token_dim)?,
        k: input.fresh_k.clone(),
        v: input.fresh_v.clone(),
        positions: input
            .positions
            .index_select(&index.to_device(input.positions.device())?, 0)?,
        local_indices: changed,
        query_start_loc,
    };
    Ok((output, selection))
}

fn merge(
    input: &BlendInput<'_>,
    selection: &Selection,
    encoder: &dyn PositionalEncoder,
) -> Result<BlendOutput> {
    let token_dim = input.token_dim;
    let n = selection.positions.dim(0)?;
    let local = &selection.local_indices;

    let (k, v) = match (input.retrieved_k, input.retrieved_v) {
        (Some(rk), Some(rv)) => {
            if rk.dim(token_dim)? != n || rv.dim(token_dim)? != n {
                return Err(CacheError::InvalidArgument(format!(
                    "retrieved KV must hold {n} tokens"
                )));
            }
            let from = Tensor::new(input.original_positions, rk.device())?;
            let rk = encoder.reencode(rk, &from, &selection.positions, token_dim)?;
            if local.is_empty() {
                (rk, rv.clone())
            } else {
                (
                    scatter(&rk, input.fresh_k, local, token_dim)?,
                    scatter(rv, input.fresh_v, local, token_dim)?,
                )
            }
        }
        _ => {
            if input.fresh_k.dim(token_dim)? != n {
                return Err(CacheError::InvalidArgument(format!(
                    "without retrieved KV the fresh KV must hold all {n} tokens"
                )));
            }
            (input.fresh_k.clone(), input.fresh_v.clone())
        }
    };

    Ok(BlendOutput {
        q: input.fresh_q.clone(),
        k,
        v,
        positions: input.positions.clone(),
        local_indices: local.clone(),
        query_start_loc: selection.query_start_loc.clone(),
    })
}

/// Replace the slots of `full` listed in `local` with the rows of `small`.
fn scatter(full: &Tensor, small: &Tensor, local: &[u32], token_dim: usize) -> Result<Tensor> {
    let n = full.dim(token_dim)?;
    if small.dim(token_dim)? != local.len() {
        return Err(CacheError::InvalidArgument(format!(
            "recomputed KV holds {} tokens, expected {}",
            small.dim(token_dim)?,
            local.len()
        )));
    }
    let small = small.to_device(full.device())?.to_dtype(full.dtype())?;

    // Row r of `small` lands at n + r in the concatenation.
    let mut map: Vec<u32> = (0..n as u32).collect();
    for (r, &pos) in local.iter().enumerate() {
        map[pos as usize] = (n + r) as u32;
    }
    let joined = Tensor::cat(&[full, &small], token_dim)?;
    Ok(joined.index_select(&index_tensor(&map, full.device())?, token_dim)?)
}

fn index_tensor(indices: &[u32], device: &Device) -> Result<Tensor> {
    Ok(Tensor::new(indices, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn rows(values: &[f32], width: usize) -> Tensor {
        let data: Vec<f32> = values
            .iter()
            .flat_map(|v| std::iter::repeat(*v).take(width))
            .collect();
        Tensor::from_vec(data, (values.len(), width), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_ratio_bounds() {
        assert!(BlendExecutor::new(-0.1).is_err());
        assert!(BlendExecutor::new(1.1).is_err());
        assert!(BlendExecutor::new(0.0).is_ok());
        assert!(BlendExecutor::new(1.0).is_ok());
    }

    #[test]
    fn test_scatter() {
        let full = rows(&[1.0; 5], 2);
        let small = rows(&[7.0, 8.0], 2);
        let out = scatter(&full, &small, &[1, 3], 0).unwrap();
        let firsts: Vec<f32> = out.get_on_dim(1, 0).unwrap().to_vec1().unwrap();
        assert_eq!(firsts, vec![1.0, 7.0, 1.0, 8.0, 1.0]);
    }

    #[test]
    fn test_merge_before_layer_zero_fails() {
        let mut exec = BlendExecutor::new(0.5).unwrap();
        let t = rows(&[1.0; 4], 2);
        let pos = Tensor::arange(0u32, 4, &Device::Cpu).unwrap();
        let valid = [true; 4];
        let orig = [0u32, 1, 2, 3];
        let input = BlendInput {
            layer: 2,
            retrieved_k: Some(&t),
            retrieved_v: Some(&t),
            valid_mask: &valid,
            original_positions: &orig,
            fresh_q: &t,
            fresh_k: &t,
            fresh_v: &t,
            positions: &pos,
            query_start_loc: None,
            token_dim: 0,
        };
        assert!(matches!(exec.blend(input), Err(CacheError::InvalidState(_))));
    }

    #[test]
    fn test_min_tokens_recomputes_everything() {
        let mut exec = BlendExecutor::new(0.0).unwrap().with_min_tokens(16);
        let t = rows(&[1.0; 4], 2);
        let z = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
        let pos = Tensor::arange(0u32, 4, &Device::Cpu).unwrap();
        let valid = [true; 4];
        let orig = [0u32, 1, 2, 3];
        let mut input = BlendInput {
            layer: 0,
            retrieved_k: Some(&z),
            retrieved_v: Some(&z),
            valid_mask: &valid,
            original_positions: &orig,
            fresh_q: &t,
            fresh_k: &t,
            fresh_v: &t,
            positions: &pos,
            query_start_loc: None,
            token_dim: 0,
        };
        exec.blend(input).unwrap();
        input.layer = 1;
        let out = exec.blend(input).unwrap();
        assert_eq!(out.local_indices, vec![0, 1, 2, 3]);
    }
}
