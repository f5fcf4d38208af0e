//! Symmetric int8 quantization with per-slice scales.
//!
//! `scale = 127 / max(|x|)` over every slice along the reduced dims; values
//! are `round(clamp(x * scale, -127, 127))` with ties to even. Candle has no
//! native `I8`, so values are stored as `I64`.

use candle_core::{DType, Tensor};
use tracing::trace;

use super::config::{
    absmax_keepdim, scale_from_absmax, split_dims, squeeze_to_preserved, QuantScheme,
    QuantizedTensor,
};
use crate::error::Result;

pub const INT8_MAX: f32 = 127.0;

/// Round to nearest, ties to even, on host.
fn round_ties_even(tensor: &Tensor) -> Result<Tensor> {
    let data: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
    let rounded: Vec<i64> = data.iter().map(|v| v.round_ties_even() as i64).collect();
    Ok(Tensor::from_vec(rounded, tensor.dims(), tensor.device())?)
}

/// Quantize to int8 with one scale per slice along `preserved_dims`.
pub fn quantize_int8(tensor: &Tensor, preserved_dims: &[usize]) -> Result<QuantizedTensor> {
    let tensor = tensor.to_dtype(DType::F32)?;
    let dims = tensor.dims().to_vec();
    let (preserved, reduced) = split_dims(dims.len(), preserved_dims)?;

    let max_vals = absmax_keepdim(&tensor, &reduced)?;
    let scale = scale_from_absmax(&max_vals, INT8_MAX)?;

    let scaled = tensor
        .broadcast_mul(&scale)?
        .clamp(-INT8_MAX as f64, INT8_MAX as f64)?;
    let values = round_ties_even(&scaled)?;

    let scale = squeeze_to_preserved(&scale, &dims, &preserved)?;
    let inv_scale = scale.recip()?;
    trace!(?dims, ?preserved, "quantized tensor to int8");

    Ok(QuantizedTensor {
        scheme: QuantScheme::Int8,
        values,
        scale,
        inv_scale,
        zero_point: None,
        preserved_dims: preserved,
    })
}
