//! Core quantization types.
//!
//! - `QuantScheme` - which reduced-precision encoding a tensor uses
//! - `QuantizedTensor` - encoded values plus scale / zero-point metadata
//! - `Int4ClampPolicy` - how int4 codes are clamped

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use super::fp8::{self, Fp8Format};
use super::{int4, int8};
use crate::error::{MoeError, Result};

/// Floor applied to per-slice max-abs before deriving a scale.
pub const MIN_MAX_ABS: f32 = 1e-8;

/// Supported weight encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantScheme {
    /// 8-bit float, one scale per preserved-dim slice
    Fp8(Fp8Format),
    /// Signed 8-bit integer in [-127, 127], one scale per preserved-dim slice
    Int8,
    /// 4-bit codes in [-7, 7] with one scale per group, no zero-point
    Int4Symmetric { group_size: usize },
    /// 4-bit codes in [0, 15] with one scale and zero-point per group
    Int4Asymmetric { group_size: usize },
}

impl QuantScheme {
    pub fn bits(&self) -> u32 {
        match self {
            Self::Fp8(_) | Self::Int8 => 8,
            Self::Int4Symmetric { .. } | Self::Int4Asymmetric { .. } => 4,
        }
    }

    pub fn has_zero_point(&self) -> bool {
        matches!(self, Self::Int4Asymmetric { .. })
    }

    pub fn group_size(&self) -> Option<usize> {
        match self {
            Self::Int4Symmetric { group_size } | Self::Int4Asymmetric { group_size } => {
                Some(*group_size)
            }
            _ => None,
        }
    }

    /// Largest code magnitude.
    pub fn max_representable(&self) -> f32 {
        match self {
            Self::Fp8(format) => format.max_value(),
            Self::Int8 => int8::INT8_MAX,
            Self::Int4Symmetric { .. } => int4::INT4_SYMMETRIC_MAX,
            Self::Int4Asymmetric { .. } => int4::INT4_ASYMMETRIC_MAX,
        }
    }
}

impl std::fmt::Display for QuantScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fp8(format) => write!(f, "fp8_{format}"),
            Self::Int8 => write!(f, "int8"),
            Self::Int4Symmetric { group_size } => write!(f, "int4_g{group_size}"),
            Self::Int4Asymmetric { group_size } => write!(f, "int4_zp_g{group_size}"),
        }
    }
}

/// Where the int4 clamp is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Int4ClampPolicy {
    /// Clamp the rounded, zero-point-shifted code into the code range.
    #[default]
    ClampQuantized,
    /// Clamp the raw input value into the code range, discarding the
    /// rounding and zero-point step. Packed expert weights combine two
    /// clamped values as `trunc(16 * odd + even)`, which is byte for byte
    /// what the legacy reference quantizer stores.
    ClampRawInput,
}

/// A quantized tensor with its scale metadata.
///
/// For fp8 and int8, `scale` is the quantization multiplier
/// (`code = x * scale`) and `inv_scale` dequantizes. For int4, `scale` is the
/// per-group step (`x = (code - zero_point) * scale`), as produced by the
/// group-wise quantizer; `inv_scale` is still `1 / scale`.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    pub scheme: QuantScheme,
    /// fp8: `U8` codes, int8: `I64` values, int4: `U8` codes (unpacked).
    pub values: Tensor,
    pub scale: Tensor,
    pub inv_scale: Tensor,
    /// int4 asymmetric only, `U8`.
    pub zero_point: Option<Tensor>,
    /// Dims that kept their own scale (fp8/int8).
    pub preserved_dims: Vec<usize>,
}

impl QuantizedTensor {
    /// Scale that maps codes back to real values.
    pub fn dequant_scale(&self) -> &Tensor {
        match self.scheme {
            QuantScheme::Fp8(_) | QuantScheme::Int8 => &self.inv_scale,
            QuantScheme::Int4Symmetric { .. } | QuantScheme::Int4Asymmetric { .. } => &self.scale,
        }
    }

    /// Reconstruct an `F32` approximation of the original tensor.
    pub fn dequantize(&self) -> Result<Tensor> {
        match self.scheme {
            QuantScheme::Fp8(format) => {
                let decoded = fp8::decode_tensor(&self.values, format)?;
                let scale = self.broadcastable_scale()?;
                Ok(decoded.broadcast_mul(&scale)?)
            }
            QuantScheme::Int8 => {
                let values = self.values.to_dtype(DType::F32)?;
                let scale = self.broadcastable_scale()?;
                Ok(values.broadcast_mul(&scale)?)
            }
            QuantScheme::Int4Symmetric { group_size } | QuantScheme::Int4Asymmetric { group_size } => {
                int4::dequantize_tensor(self, group_size)
            }
        }
    }

    /// `inv_scale` reshaped with singleton reduced dims.
    fn broadcastable_scale(&self) -> Result<Tensor> {
        let shape = keepdim_shape(self.values.dims(), &self.preserved_dims);
        Ok(self.inv_scale.reshape(shape)?)
    }
}

/// Sort and validate preserved dims, returning `(preserved, reduced)`.
pub(crate) fn split_dims(rank: usize, preserved_dims: &[usize]) -> Result<(Vec<usize>, Vec<usize>)> {
    let mut preserved = preserved_dims.to_vec();
    preserved.sort_unstable();
    preserved.dedup();
    if let Some(&dim) = preserved.iter().find(|&&d| d >= rank) {
        return Err(MoeError::InvalidDim { dim, rank });
    }
    let reduced = (0..rank).filter(|d| !preserved.contains(d)).collect();
    Ok((preserved, reduced))
}

/// Shape of a per-slice statistic kept with singleton reduced dims.
pub(crate) fn keepdim_shape(dims: &[usize], preserved: &[usize]) -> Vec<usize> {
    dims.iter()
        .enumerate()
        .map(|(d, &size)| if preserved.contains(&d) { size } else { 1 })
        .collect()
}

/// Max of `|tensor|` over `reduce_dims`, keeping them as size 1, floored
/// at [`MIN_MAX_ABS`].
pub(crate) fn absmax_keepdim(tensor: &Tensor, reduce_dims: &[usize]) -> Result<Tensor> {
    let mut max_vals = tensor.abs()?;
    for &dim in reduce_dims {
        max_vals = max_vals.max_keepdim(dim)?;
    }
    Ok(max_vals.maximum(MIN_MAX_ABS as f64)?)
}

/// `max_repr / max_vals`, computed as a single division.
pub(crate) fn scale_from_absmax(max_vals: &Tensor, max_repr: f32) -> Result<Tensor> {
    let numerator = (max_vals.ones_like()? * max_repr as f64)?;
    Ok(numerator.div(max_vals)?)
}

/// Drop the singleton reduced dims from a keepdim statistic.
pub(crate) fn squeeze_to_preserved(stat: &Tensor, dims: &[usize], preserved: &[usize]) -> Result<Tensor> {
    let shape: Vec<usize> = preserved.iter().map(|&d| dims[d]).collect();
    Ok(stat.reshape(shape)?)
}
