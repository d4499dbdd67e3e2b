//! Re-encoding cached keys for the positions they occupy after blending.
//!
//! A segment cached on its own was encoded at positions `0..len`. Once
//! spliced into a composite prompt its tokens sit at new absolute positions,
//! so position-dependent key transforms must be shifted before reuse.

use candle_core::{DType, Tensor, D};

use crate::error::{CacheError, Result};

pub trait PositionalEncoder: Send + Sync {
    /// Move `k` from positions `from` to positions `to` (both 1-D, one entry
    /// per token along `token_dim`).
    fn reencode(&self, k: &Tensor, from: &Tensor, to: &Tensor, token_dim: usize) -> Result<Tensor>;
}

/// Keys carry no positional information; returned as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPositionalEncoding;

impl PositionalEncoder for NoPositionalEncoding {
    fn reencode(
        &self,
        k: &Tensor,
        _from: &Tensor,
        _to: &Tensor,
        _token_dim: usize,
    ) -> Result<Tensor> {
        Ok(k.clone())
    }
}

/// Half-split rotary embeddings.
///
/// Rotations compose additively, so moving a key from `p` to `q` is one
/// rotation by `q - p`.
#[derive(Debug, Clone, Copy)]
pub struct RotaryReencoder {
    head_dim: usize,
    theta: f64,
}

impl RotaryReencoder {
    pub fn new(head_dim: usize, theta: f64) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(CacheError::InvalidArgument(format!(
                "rotary head_dim must be even and positive, got {head_dim}"
            )));
        }
        Ok(Self { head_dim, theta })
    }
}

impl PositionalEncoder for RotaryReencoder {
    fn reencode(&self, k: &Tensor, from: &Tensor, to: &Tensor, token_dim: usize) -> Result<Tensor> {
        let dims = k.dims().to_vec();
        let num_tokens = k.dim(token_dim)?;
        if dims.last() != Some(&self.head_dim) || token_dim + 1 >= dims.len() {
            return Err(CacheError::InvalidArgument(format!(
                "key shape {dims:?} does not end in head_dim {}",
                self.head_dim
            )));
        }
        let half_dim = self.head_dim / 2;
        let device = k.device();

        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| (1.0 / self.theta.powf(2.0 * i as f64 / self.head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let delta = (to.to_dtype(DType::F32)? - from.to_dtype(DType::F32)?)?
            .to_device(device)?
            .reshape((num_tokens, 1))?;
        // [num_tokens, half_dim]
        let angles = delta.matmul(&inv_freq)?;

        let mut bshape = vec![1usize; dims.len()];
        bshape[token_dim] = num_tokens;
        bshape[dims.len() - 1] = half_dim;
        let cos = angles.cos()?.reshape(bshape.as_slice())?.to_dtype(k.dtype())?;
        let sin = angles.sin()?.reshape(bshape.as_slice())?.to_dtype(k.dtype())?;

        let x1 = k.narrow(D::Minus1, 0, half_dim)?;
        let x2 = k.narrow(D::Minus1, half_dim, half_dim)?;
        let r1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let r2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;
        Ok(Tensor::cat(&[&r1, &r2], D::Minus1)?)
    }
}
