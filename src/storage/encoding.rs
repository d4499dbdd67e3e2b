//! Binary encoding of stacked KV chunks for byte-oriented tiers.
//!
//! Layout:
//!
//! ```text
//! "KVCH" | version: u8 | flags: u8 | header_len: u32 LE | header (JSON) | payload
//! ```
//!
//! The header carries dtype and shape; the payload holds the raw
//! little-endian element bytes, zstd-compressed when flag bit 0 is set.

use candle_core::{DType, Device, Tensor, WithDType};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

const MAGIC: &[u8; 4] = b"KVCH";
const VERSION: u8 = 1;
const FLAG_ZSTD: u8 = 0b0000_0001;
const PREAMBLE_LEN: usize = 4 + 1 + 1 + 4;

#[derive(Debug, Serialize, Deserialize)]
struct ChunkHeader {
    dtype: String,
    shape: Vec<usize>,
}

/// Encodes tensors to bytes and back, with optional zstd compression.
#[derive(Debug, Clone, Copy)]
pub struct ChunkEncoder {
    zstd_level: Option<i32>,
}

impl ChunkEncoder {
    /// `zstd_level = None` stores payloads uncompressed.
    pub fn new(zstd_level: Option<i32>) -> Self {
        Self { zstd_level }
    }

    pub fn encode(&self, tensor: &Tensor) -> Result<Vec<u8>, StorageError> {
        let header = serde_json::to_vec(&ChunkHeader {
            dtype: tensor.dtype().as_str().to_string(),
            shape: tensor.dims().to_vec(),
        })
        .map_err(|e| StorageError::Codec(e.to_string()))?;

        let raw = tensor_to_bytes(tensor)?;
        let (flags, payload) = match self.zstd_level {
            Some(level) => (FLAG_ZSTD, zstd::encode_all(raw.as_slice(), level)?),
            None => (0, raw),
        };

        let mut out = Vec::with_capacity(PREAMBLE_LEN + header.len() + payload.len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(flags);
        out.extend_from_slice(&(header.len() as u32).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode bytes produced by [`ChunkEncoder::encode`]. Compression is read
    /// from the flags, so any encoder instance can decode any chunk.
    pub fn decode(&self, data: &[u8], device: &Device) -> Result<Tensor, StorageError> {
        if data.len() < PREAMBLE_LEN || &data[..4] != MAGIC {
            return Err(StorageError::Codec("bad chunk magic".into()));
        }
        if data[4] != VERSION {
            return Err(StorageError::Codec(format!(
                "unsupported chunk version {}",
                data[4]
            )));
        }
        let flags = data[5];
        let header_len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
        let body = &data[PREAMBLE_LEN..];
        if body.len() < header_len {
            return Err(StorageError::Codec("truncated chunk header".into()));
        }
        let header: ChunkHeader = serde_json::from_slice(&body[..header_len])
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        let dtype: DType = header
            .dtype
            .parse()
            .map_err(|e| StorageError::Codec(format!("{e:?}")))?;

        let payload = &body[header_len..];
        let raw = if flags & FLAG_ZSTD != 0 {
            zstd::decode_all(payload)?
        } else {
            payload.to_vec()
        };
        tensor_from_bytes(dtype, &header.shape, &raw, device)
    }
}

fn tensor_to_bytes(tensor: &Tensor) -> Result<Vec<u8>, StorageError> {
    let flat = tensor.flatten_all()?;
    let bytes = match tensor.dtype() {
        DType::U8 => flat.to_vec1::<u8>()?,
        DType::U32 => bytemuck::cast_slice(&flat.to_vec1::<u32>()?).to_vec(),
        DType::I64 => bytemuck::cast_slice(&flat.to_vec1::<i64>()?).to_vec(),
        DType::F16 => bytemuck::cast_slice(&flat.to_vec1::<half::f16>()?).to_vec(),
        DType::BF16 => bytemuck::cast_slice(&flat.to_vec1::<half::bf16>()?).to_vec(),
        DType::F32 => bytemuck::cast_slice(&flat.to_vec1::<f32>()?).to_vec(),
        DType::F64 => bytemuck::cast_slice(&flat.to_vec1::<f64>()?).to_vec(),
        other => {
            return Err(StorageError::Codec(format!(
                "unsupported dtype {}",
                other.as_str()
            )))
        }
    };
    Ok(bytes)
}

fn tensor_from_bytes(
    dtype: DType,
    shape: &[usize],
    bytes: &[u8],
    device: &Device,
) -> Result<Tensor, StorageError> {
    let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
    if bytes.len() != expected {
        return Err(StorageError::Codec(format!(
            "payload has {} bytes, shape {shape:?} of {} needs {expected}",
            bytes.len(),
            dtype.as_str()
        )));
    }
    let tensor = match dtype {
        DType::U8 => Tensor::from_vec(bytes.to_vec(), shape, device)?,
        DType::U32 => pod_tensor::<u32>(bytes, shape, device)?,
        DType::I64 => pod_tensor::<i64>(bytes, shape, device)?,
        DType::F16 => pod_tensor::<half::f16>(bytes, shape, device)?,
        DType::BF16 => pod_tensor::<half::bf16>(bytes, shape, device)?,
        DType::F32 => pod_tensor::<f32>(bytes, shape, device)?,
        DType::F64 => pod_tensor::<f64>(bytes, shape, device)?,
        other => {
            return Err(StorageError::Codec(format!(
                "unsupported dtype {}",
                other.as_str()
            )))
        }
    };
    Ok(tensor)
}

/// Reinterpret little-endian element bytes as a tensor of `T`.
fn pod_tensor<T>(bytes: &[u8], shape: &[usize], device: &Device) -> Result<Tensor, StorageError>
where
    T: bytemuck::Pod + WithDType,
{
    Ok(Tensor::from_vec(
        bytemuck::pod_collect_to_vec::<u8, T>(bytes),
        shape,
        device,
    )?)
}
