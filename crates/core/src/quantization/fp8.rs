//! FP8 E4M3 quantization.
//!
//! Two E4M3 flavours are supported:
//! - `E4M3Fnuz`: exponent bias 8, max 240, no negative zero, `0x80` is NaN
//!   (the format the ROCm kernels consume, and the default)
//! - `E4M3Fn`: exponent bias 7, max 448, `0x7F`/`0xFF` are NaN
//!
//! Codes are stored in `U8` tensors. Encoding rounds to nearest-even and
//! saturates to the largest finite value.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::config::{
    absmax_keepdim, scale_from_absmax, split_dims, squeeze_to_preserved, QuantScheme,
    QuantizedTensor,
};
use crate::error::Result;

const MANTISSA_BITS: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fp8Format {
    #[default]
    E4M3Fnuz,
    E4M3Fn,
}

impl std::fmt::Display for Fp8Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::E4M3Fnuz => write!(f, "e4m3fnuz"),
            Self::E4M3Fn => write!(f, "e4m3fn"),
        }
    }
}

impl Fp8Format {
    /// Largest finite value.
    pub const fn max_value(self) -> f32 {
        match self {
            Self::E4M3Fnuz => 240.0,
            Self::E4M3Fn => 448.0,
        }
    }

    const fn exponent_bias(self) -> i32 {
        match self {
            Self::E4M3Fnuz => 8,
            Self::E4M3Fn => 7,
        }
    }

    const fn max_code(self) -> u8 {
        match self {
            Self::E4M3Fnuz => 0x7F,
            Self::E4M3Fn => 0x7E,
        }
    }

    const fn nan_code(self) -> u8 {
        match self {
            Self::E4M3Fnuz => 0x80,
            Self::E4M3Fn => 0x7F,
        }
    }

    /// Encode an `f32`, rounding to nearest-even and saturating.
    pub fn encode(self, value: f32) -> u8 {
        if value.is_nan() {
            return self.nan_code();
        }
        let sign = if value.is_sign_negative() { 0x80u8 } else { 0 };
        let magnitude = self.encode_magnitude(value.abs());
        if magnitude == 0 && self == Self::E4M3Fnuz {
            // 0x80 is NaN here, so zero is unsigned.
            return 0;
        }
        sign | magnitude
    }

    fn encode_magnitude(self, abs: f32) -> u8 {
        if abs >= self.max_value() {
            return self.max_code();
        }
        let bias = self.exponent_bias();
        let min_normal_exp = 1 - bias;

        // f32 subnormals are far below the fp8 subnormal range.
        let exp = ((abs.to_bits() >> 23) & 0xFF) as i32 - 127;
        if abs == 0.0 || exp < min_normal_exp {
            let step = 2f32.powi(min_normal_exp - MANTISSA_BITS);
            // A result of 8 is the smallest normal, which shares the layout.
            return (abs / step).round_ties_even() as u8;
        }

        let mut exp = exp;
        let mut mantissa = ((abs / 2f32.powi(exp) - 1.0) * 8.0).round_ties_even() as u8;
        if mantissa == 8 {
            mantissa = 0;
            exp += 1;
        }
        let exp_field = exp + bias;
        if exp_field > 15 {
            return self.max_code();
        }
        let code = ((exp_field as u8) << MANTISSA_BITS) | mantissa;
        code.min(self.max_code())
    }

    /// Decode a code to `f32`.
    pub fn decode(self, code: u8) -> f32 {
        let is_nan = match self {
            Self::E4M3Fnuz => code == 0x80,
            Self::E4M3Fn => code & 0x7F == 0x7F,
        };
        if is_nan {
            return f32::NAN;
        }
        let sign = if code & 0x80 != 0 { -1.0f32 } else { 1.0 };
        let exp_field = ((code >> MANTISSA_BITS) & 0x0F) as i32;
        let mantissa = (code & 0x07) as f32;
        let bias = self.exponent_bias();
        if exp_field == 0 {
            sign * mantissa * 2f32.powi(1 - bias - MANTISSA_BITS)
        } else {
            sign * (1.0 + mantissa / 8.0) * 2f32.powi(exp_field - bias)
        }
    }
}

/// Encode an `F32` tensor into a `U8` code tensor of the same shape.
pub fn encode_tensor(tensor: &Tensor, format: Fp8Format) -> Result<Tensor> {
    let data: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let codes: Vec<u8> = data.iter().map(|&v| format.encode(v)).collect();
    Ok(Tensor::from_vec(codes, tensor.dims(), tensor.device())?)
}

/// Decode a `U8` code tensor into `F32` without applying any scale.
pub fn decode_tensor(codes: &Tensor, format: Fp8Format) -> Result<Tensor> {
    let data: Vec<u8> = codes.flatten_all()?.to_vec1()?;
    let values: Vec<f32> = data.iter().map(|&c| format.decode(c)).collect();
    Ok(Tensor::from_vec(values, codes.dims(), codes.device())?)
}

/// Quantize to fp8 with one scale per slice along `preserved_dims`.
///
/// `scale = max_value / max(|x|)` over each slice (max-abs floored at
/// `1e-8`), codes are `clamp(x * scale, -max, max)` encoded, and
/// `inv_scale = 1 / scale` dequantizes. An empty `preserved_dims` gives a
/// single per-tensor scale.
pub fn quantize_fp8(tensor: &Tensor, preserved_dims: &[usize], format: Fp8Format) -> Result<QuantizedTensor> {
    let tensor = tensor.to_dtype(DType::F32)?;
    let dims = tensor.dims().to_vec();
    let (preserved, reduced) = split_dims(dims.len(), preserved_dims)?;

    let max_repr = format.max_value();
    let max_vals = absmax_keepdim(&tensor, &reduced)?;
    let scale = scale_from_absmax(&max_vals, max_repr)?;

    let scaled = tensor
        .broadcast_mul(&scale)?
        .clamp(-max_repr as f64, max_repr as f64)?;
    let values = encode_tensor(&scaled, format)?;

    let scale = squeeze_to_preserved(&scale, &dims, &preserved)?;
    let inv_scale = scale.recip()?;
    trace!(?dims, ?preserved, %format, "quantized tensor to fp8");

    Ok(QuantizedTensor {
        scheme: QuantScheme::Fp8(format),
        values,
        scale,
        inv_scale,
        zero_point: None,
        preserved_dims: preserved,
    })
}
