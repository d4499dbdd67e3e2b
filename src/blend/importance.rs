//! Importance signals for picking which reused positions to recompute.

use candle_core::{DType, Tensor};

use crate::error::Result;

/// Scores each token position; higher means more worth recomputing.
///
/// `fresh_k` and `retrieved_k` have identical shapes and share `token_dim`.
/// The returned vector has one score per token.
pub trait ImportanceScorer: Send + Sync {
    fn score(&self, fresh_k: &Tensor, retrieved_k: &Tensor, token_dim: usize) -> Result<Vec<f32>>;
}

/// Squared L2 distance between freshly computed and retrieved keys.
///
/// Positions whose cached keys drifted furthest from what the current
/// context produces score highest.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyDeviationScorer;

impl ImportanceScorer for KeyDeviationScorer {
    fn score(&self, fresh_k: &Tensor, retrieved_k: &Tensor, token_dim: usize) -> Result<Vec<f32>> {
        let fresh = fresh_k.to_dtype(DType::F32)?;
        let retrieved = retrieved_k
            .to_device(fresh.device())?
            .to_dtype(DType::F32)?;
        let mut diff = (fresh - retrieved)?.sqr()?;
        if token_dim != 0 {
            diff = diff.transpose(0, token_dim)?;
        }
        let per_token = if diff.rank() == 1 {
            diff
        } else {
            diff.flatten_from(1)?.sum(1)?
        };
        Ok(per_token.to_vec1::<f32>()?)
    }
}
