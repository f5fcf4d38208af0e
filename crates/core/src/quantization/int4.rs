//! Group-wise int4 quantization and nibble packing.
//!
//! A `[K, N]` weight is split along K into groups of `group_size` rows; each
//! `(group, column)` pair gets its own scale (and zero-point when
//! asymmetric).
//!
//! Stored codes are always unsigned nibbles:
//! - asymmetric: `q` in [0, 15], `x = (q - zp) * scale`
//! - symmetric: `q + 8` with `q` in [-7, 7], `x = (nibble - 8) * scale`
//!
//! [`Int4ClampPolicy::ClampRawInput`] codes are the truncated raw values with
//! no symmetric offset; negative values keep their two's complement nibble.

use candle_core::{DType, Device, Tensor};
use tracing::trace;

use super::config::{Int4ClampPolicy, QuantScheme, QuantizedTensor};
use crate::error::{MoeError, Result};

pub const INT4_SYMMETRIC_MAX: f32 = 7.0;
pub const INT4_ASYMMETRIC_MAX: f32 = 15.0;
/// Smallest scale magnitude a group may get.
pub const MIN_INT4_SCALE: f32 = 1e-5;
/// Nibble offset of symmetric codes.
pub const SYMMETRIC_ZERO_POINT: u8 = 8;

/// Host-side result of group-wise int4 quantization.
#[derive(Debug, Clone, PartialEq)]
pub struct Int4Groups {
    /// `[K, N]` unpacked nibbles.
    pub codes: Vec<u8>,
    /// `[K / group_size, N]`.
    pub scales: Vec<f32>,
    /// `[K / group_size, N]`, asymmetric only.
    pub zero_points: Option<Vec<u8>>,
    pub k: usize,
    pub n: usize,
    pub group_size: usize,
}

impl Int4Groups {
    pub fn num_groups(&self) -> usize {
        self.k / self.group_size
    }

    /// Reconstruct the `[K, N]` weight.
    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.k * self.n);
        for row in 0..self.k {
            let group = row / self.group_size;
            for col in 0..self.n {
                let idx = group * self.n + col;
                let zp = match &self.zero_points {
                    Some(zps) => zps[idx],
                    None => SYMMETRIC_ZERO_POINT,
                };
                let code = self.codes[row * self.n + col];
                out.push((code as f32 - zp as f32) * self.scales[idx]);
            }
        }
        out
    }

    pub fn to_quantized_tensor(&self, device: &Device) -> Result<QuantizedTensor> {
        let groups = self.num_groups();
        let scheme = if self.zero_points.is_some() {
            QuantScheme::Int4Asymmetric {
                group_size: self.group_size,
            }
        } else {
            QuantScheme::Int4Symmetric {
                group_size: self.group_size,
            }
        };
        let values = Tensor::from_vec(self.codes.clone(), (self.k, self.n), device)?;
        let scale = Tensor::from_vec(self.scales.clone(), (groups, self.n), device)?;
        let inv_scale = scale.recip()?;
        let zero_point = self
            .zero_points
            .as_ref()
            .map(|zps| Tensor::from_vec(zps.clone(), (groups, self.n), device))
            .transpose()?;
        Ok(QuantizedTensor {
            scheme,
            values,
            scale,
            inv_scale,
            zero_point,
            preserved_dims: Vec::new(),
        })
    }
}

fn validate_group_size(k: usize, group_size: usize) -> Result<()> {
    if group_size == 0 || k % group_size != 0 {
        return Err(MoeError::InvalidGroupSize { group_size, dim: k });
    }
    Ok(())
}

/// Quantize a row-major `[K, N]` weight group-wise along K.
pub fn quantize_int4_groups(
    weight: &[f32],
    k: usize,
    n: usize,
    group_size: usize,
    has_zero_point: bool,
    policy: Int4ClampPolicy,
) -> Result<Int4Groups> {
    if weight.len() != k * n {
        return Err(MoeError::shape(
            "int4 weight",
            format!("expected {k}x{n} = {} values, got {}", k * n, weight.len()),
        ));
    }
    validate_group_size(k, group_size)?;

    let (min_q, max_q) = if has_zero_point {
        (0.0, INT4_ASYMMETRIC_MAX)
    } else {
        (-INT4_SYMMETRIC_MAX, INT4_SYMMETRIC_MAX)
    };

    let num_groups = k / group_size;
    let mut scales = vec![0.0f32; num_groups * n];
    let mut zero_points = has_zero_point.then(|| vec![0u8; num_groups * n]);
    let mut codes = vec![0u8; k * n];

    for group in 0..num_groups {
        let rows = group * group_size..(group + 1) * group_size;
        for col in 0..n {
            let column = rows.clone().map(|row| weight[row * n + col]);
            let (min_val, max_val) = column.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });

            let (scale, zp) = if has_zero_point {
                let scale = (max_val - min_val).max(MIN_INT4_SCALE) / INT4_ASYMMETRIC_MAX;
                let zp = (min_val / scale).abs().round_ties_even().clamp(min_q, max_q);
                (scale, zp)
            } else {
                let mut scale = max_val / INT4_SYMMETRIC_MAX;
                if scale.abs() < MIN_INT4_SCALE {
                    scale = MIN_INT4_SCALE;
                }
                (scale, 0.0)
            };

            let idx = group * n + col;
            scales[idx] = scale;
            if let Some(zps) = zero_points.as_mut() {
                zps[idx] = zp as u8;
            }

            for row in rows.clone() {
                let x = weight[row * n + col];
                codes[row * n + col] = match policy {
                    Int4ClampPolicy::ClampQuantized => {
                        let q = ((x / scale).round_ties_even() + zp).clamp(min_q, max_q);
                        if has_zero_point {
                            q as u8
                        } else {
                            (q as i32 + SYMMETRIC_ZERO_POINT as i32) as u8
                        }
                    }
                    Int4ClampPolicy::ClampRawInput => (x.clamp(min_q, max_q).trunc() as i32 as u8) & 0x0F,
                };
            }
        }
    }

    trace!(k, n, group_size, has_zero_point, ?policy, "quantized weight to int4");

    Ok(Int4Groups {
        codes,
        scales,
        zero_points,
        k,
        n,
        group_size,
    })
}

/// Quantize a `[K, N]` tensor group-wise along K.
pub fn quantize_int4(
    weight: &Tensor,
    group_size: usize,
    has_zero_point: bool,
    policy: Int4ClampPolicy,
) -> Result<QuantizedTensor> {
    let (k, n) = weight.dims2()?;
    let data: Vec<f32> = weight.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    quantize_int4_groups(&data, k, n, group_size, has_zero_point, policy)?
        .to_quantized_tensor(weight.device())
}

/// Dequantize an int4 [`QuantizedTensor`] back to `[K, N]` `F32`.
pub(crate) fn dequantize_tensor(quantized: &QuantizedTensor, group_size: usize) -> Result<Tensor> {
    let (k, n) = quantized.values.dims2()?;
    validate_group_size(k, group_size)?;
    let groups = k / group_size;

    let codes = quantized
        .values
        .to_dtype(DType::F32)?
        .reshape((groups, group_size, n))?;
    let zero_point = match &quantized.zero_point {
        Some(zp) => zp.to_dtype(DType::F32)?,
        None => (quantized.scale.ones_like()? * SYMMETRIC_ZERO_POINT as f64)?,
    };
    let zero_point = zero_point.reshape((groups, 1, n))?;
    let scale = quantized.scale.reshape((groups, 1, n))?;

    let values = codes.broadcast_sub(&zero_point)?.broadcast_mul(&scale)?;
    Ok(values.reshape((k, n))?)
}

/// Byte for two K-neighbours under [`Int4ClampPolicy::ClampRawInput`].
///
/// Both raw values are clamped into the code range, combined as
/// `16 * odd + even` while still real-valued and only then truncated to a
/// byte. The odd value's fraction therefore lands in the low nibble.
pub fn pack_raw_int4_pair(even: f32, odd: f32, has_zero_point: bool) -> u8 {
    let (min_q, max_q) = if has_zero_point {
        (0.0, INT4_ASYMMETRIC_MAX)
    } else {
        (-INT4_SYMMETRIC_MAX, INT4_SYMMETRIC_MAX)
    };
    (16.0 * odd.clamp(min_q, max_q) + even.clamp(min_q, max_q)).trunc() as i32 as u8
}

/// Pack pairs of rows of a row-major `[rows, cols]` nibble array into
/// `[rows / 2, cols]` bytes. The even row goes to the low nibble.
pub fn pack_int4_rows(codes: &[u8], rows: usize, cols: usize) -> Result<Vec<u8>> {
    if codes.len() != rows * cols {
        return Err(MoeError::shape(
            "int4 codes",
            format!("expected {rows}x{cols} = {} codes, got {}", rows * cols, codes.len()),
        ));
    }
    if rows % 2 != 0 {
        return Err(MoeError::shape(
            "int4 codes",
            format!("cannot pack an odd number of rows ({rows})"),
        ));
    }
    let mut packed = Vec::with_capacity(rows / 2 * cols);
    for pair in codes.chunks(2 * cols) {
        let (even, odd) = pair.split_at(cols);
        packed.extend(even.iter().zip(odd).map(|(&lo, &hi)| (lo & 0x0F) | ((hi & 0x0F) << 4)));
    }
    Ok(packed)
}

/// Inverse of [`pack_int4_rows`]: `[rows / 2, cols]` bytes to `[rows, cols]`.
pub fn unpack_int4_rows(packed: &[u8], cols: usize) -> Vec<u8> {
    let mut codes = Vec::with_capacity(packed.len() * 2);
    for row in packed.chunks(cols) {
        codes.extend(row.iter().map(|&byte| byte & 0x0F));
        codes.extend(row.iter().map(|&byte| (byte >> 4) & 0x0F));
    }
    codes
}
