//! Quantized expert weight stacks.
//!
//! Expert weights are `[E, N, K]`. fp8 and int8 stacks carry one scale per
//! expert; int4 stacks use the packed layout the W4A16 kernel reads:
//!
//! ```text
//! qweight [E, N, K/2]           two K-neighbours per byte, even k low
//! scales  [E, N, K/group]
//! qzeros  [E, N/2, K/group]     two N-neighbours per byte, even n low
//! ```

use candle_core::{DType, Tensor};
use tracing::debug;

use super::config::{Int4ClampPolicy, QuantScheme};
use super::fp8::{self, quantize_fp8, Fp8Format};
use super::int4::{pack_int4_rows, pack_raw_int4_pair, quantize_int4_groups, SYMMETRIC_ZERO_POINT};
use super::int8::quantize_int8;
use crate::error::{MoeError, Result};

/// Packed int4 expert weights.
#[derive(Debug, Clone)]
pub struct Int4ExpertWeights {
    /// `[E, N, K/2]`, `U8`.
    pub qweight: Tensor,
    /// `[E, N, K/group_size]`, `F32`.
    pub scales: Tensor,
    /// `[E, N/2, K/group_size]`, `U8`; `None` for symmetric weights.
    pub qzeros: Option<Tensor>,
    pub group_size: usize,
}

impl Int4ExpertWeights {
    pub fn dims(&self) -> Result<(usize, usize, usize)> {
        let (e, n, half_k) = self.qweight.dims3()?;
        Ok((e, n, half_k * 2))
    }

    /// Unpack and dequantize to `[E, N, K]` `F32`.
    pub fn dequantize(&self) -> Result<Tensor> {
        let (num_experts, n, k) = self.dims()?;
        let groups = k / self.group_size;
        let qweight: Vec<u8> = self.qweight.flatten_all()?.to_vec1()?;
        let scales: Vec<f32> = self.scales.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let qzeros: Option<Vec<u8>> = self
            .qzeros
            .as_ref()
            .map(|zp| zp.flatten_all().and_then(|zp| zp.to_vec1()))
            .transpose()?;

        let mut out = Vec::with_capacity(num_experts * n * k);
        for e in 0..num_experts {
            for row in 0..n {
                for col in 0..k {
                    let byte = qweight[(e * n + row) * (k / 2) + col / 2];
                    let nibble = (byte >> ((col % 2) * 4)) & 0x0F;
                    let group = col / self.group_size;
                    let zp = match &qzeros {
                        Some(zps) => (zps[(e * (n / 2) + row / 2) * groups + group] >> ((row % 2) * 4)) & 0x0F,
                        None => SYMMETRIC_ZERO_POINT,
                    };
                    let scale = scales[(e * n + row) * groups + group];
                    out.push((nibble as f32 - zp as f32) * scale);
                }
            }
        }
        Ok(Tensor::from_vec(out, (num_experts, n, k), self.qweight.device())?)
    }
}

/// A stack of expert weights in one of the supported encodings.
#[derive(Debug, Clone)]
pub enum ExpertWeights {
    /// Unquantized `[E, N, K]`.
    Full(Tensor),
    /// fp8 codes `[E, N, K]` (`U8`) with `inv_scale` `[E]`.
    Fp8 {
        codes: Tensor,
        inv_scale: Tensor,
        format: Fp8Format,
    },
    /// int8 values `[E, N, K]` (`I64`) with `inv_scale` `[E]`.
    Int8 { values: Tensor, inv_scale: Tensor },
    Int4(Int4ExpertWeights),
}

impl ExpertWeights {
    pub fn scheme(&self) -> Option<QuantScheme> {
        match self {
            Self::Full(_) => None,
            Self::Fp8 { format, .. } => Some(QuantScheme::Fp8(*format)),
            Self::Int8 { .. } => Some(QuantScheme::Int8),
            Self::Int4(w) => Some(if w.qzeros.is_some() {
                QuantScheme::Int4Asymmetric {
                    group_size: w.group_size,
                }
            } else {
                QuantScheme::Int4Symmetric {
                    group_size: w.group_size,
                }
            }),
        }
    }

    /// `(num_experts, N, K)`.
    pub fn dims(&self) -> Result<(usize, usize, usize)> {
        match self {
            Self::Full(w) => Ok(w.dims3()?),
            Self::Fp8 { codes, .. } => Ok(codes.dims3()?),
            Self::Int8 { values, .. } => Ok(values.dims3()?),
            Self::Int4(w) => w.dims(),
        }
    }

    pub fn num_experts(&self) -> Result<usize> {
        Ok(self.dims()?.0)
    }

    /// `[E, N, K]` `F32` operand of the expert dot product.
    ///
    /// fp8 and int8 stay in the scaled code domain; the caller rescales the
    /// product with [`output_scale`](Self::output_scale). int4 is fully
    /// dequantized.
    pub fn matmul_operand(&self) -> Result<Tensor> {
        match self {
            Self::Full(w) => Ok(w.to_dtype(DType::F32)?),
            Self::Fp8 { codes, format, .. } => fp8::decode_tensor(codes, *format),
            Self::Int8 { values, .. } => Ok(values.to_dtype(DType::F32)?),
            Self::Int4(w) => w.dequantize(),
        }
    }

    /// Per-expert `[E]` scale applied after the dot product, if any.
    pub fn output_scale(&self) -> Option<&Tensor> {
        match self {
            Self::Fp8 { inv_scale, .. } | Self::Int8 { inv_scale, .. } => Some(inv_scale),
            Self::Full(_) | Self::Int4(_) => None,
        }
    }

    /// Real-valued `[E, N, K]` approximation.
    pub fn dequantize(&self) -> Result<Tensor> {
        let operand = self.matmul_operand()?;
        match self.output_scale() {
            Some(scale) => {
                let e = scale.dims1()?;
                Ok(operand.broadcast_mul(&scale.reshape((e, 1, 1))?)?)
            }
            None => Ok(operand),
        }
    }
}

/// Quantize an `[E, N, K]` expert stack with one scale per expert (fp8,
/// int8) or group-wise along K (int4).
pub fn quantize_experts(weights: &Tensor, scheme: QuantScheme, policy: Int4ClampPolicy) -> Result<ExpertWeights> {
    let (num_experts, n, k) = weights.dims3()?;
    debug!(num_experts, n, k, %scheme, "quantizing expert weights");
    match scheme {
        QuantScheme::Fp8(format) => {
            let q = quantize_fp8(weights, &[0], format)?;
            Ok(ExpertWeights::Fp8 {
                codes: q.values,
                inv_scale: q.inv_scale,
                format,
            })
        }
        QuantScheme::Int8 => {
            let q = quantize_int8(weights, &[0])?;
            Ok(ExpertWeights::Int8 {
                values: q.values,
                inv_scale: q.inv_scale,
            })
        }
        QuantScheme::Int4Symmetric { group_size } => {
            quantize_experts_int4(weights, group_size, false, policy).map(ExpertWeights::Int4)
        }
        QuantScheme::Int4Asymmetric { group_size } => {
            quantize_experts_int4(weights, group_size, true, policy).map(ExpertWeights::Int4)
        }
    }
}

fn transpose<T: Copy>(data: &[T], rows: usize, cols: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(data.len());
    for c in 0..cols {
        out.extend((0..rows).map(|r| data[r * cols + c]));
    }
    out
}

/// Quantize every expert of `[E, N, K]` group-wise along K and pack into
/// the kernel layout.
///
/// Under [`Int4ClampPolicy::ClampRawInput`] each `qweight` byte is
/// [`pack_raw_int4_pair`] of two K-neighbours, matching the legacy packing
/// byte for byte; scales and zero-points are the same as for the default
/// policy.
pub fn quantize_experts_int4(
    weights: &Tensor,
    group_size: usize,
    has_zero_point: bool,
    policy: Int4ClampPolicy,
) -> Result<Int4ExpertWeights> {
    let (num_experts, n, k) = weights.dims3()?;
    if k % 2 != 0 {
        return Err(MoeError::shape("int4 expert weights", format!("K = {k} must be even")));
    }
    if has_zero_point && n % 2 != 0 {
        return Err(MoeError::shape(
            "int4 expert weights",
            format!("N = {n} must be even to pack zero-points"),
        ));
    }

    if group_size == 0 || k % group_size != 0 {
        return Err(MoeError::InvalidGroupSize { group_size, dim: k });
    }

    let data: Vec<f32> = weights.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let groups = k / group_size;
    let mut qweight = Vec::with_capacity(num_experts * n * k / 2);
    let mut scales = Vec::with_capacity(num_experts * n * groups);
    let mut qzeros = Vec::with_capacity(num_experts * n / 2 * groups);

    for expert in data.chunks(n * k) {
        // The quantizer groups along the leading dim, so feed it [K, N].
        let q = quantize_int4_groups(&transpose(expert, n, k), k, n, group_size, has_zero_point, policy)?;

        match policy {
            Int4ClampPolicy::ClampQuantized => {
                let packed = pack_int4_rows(&q.codes, k, n)?;
                qweight.extend(transpose(&packed, k / 2, n));
            }
            Int4ClampPolicy::ClampRawInput => qweight.extend(
                expert
                    .chunks(2)
                    .map(|pair| pack_raw_int4_pair(pair[0], pair[1], has_zero_point)),
            ),
        }
        scales.extend(transpose(&q.scales, groups, n));
        if let Some(zps) = &q.zero_points {
            qzeros.extend(pack_int4_rows(&transpose(zps, groups, n), n, groups)?);
        }
    }

    let device = weights.device();
    let qzeros = if has_zero_point {
        Some(Tensor::from_vec(qzeros, (num_experts, n / 2, groups), device)?)
    } else {
        None
    };
    Ok(Int4ExpertWeights {
        qweight: Tensor::from_vec(qweight, (num_experts, n, k / 2), device)?,
        scales: Tensor::from_vec(scales, (num_experts, n, groups), device)?,
        qzeros,
        group_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::int4::quantize_int4_groups;
    use candle_core::Device;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_fp8_experts_keep_per_expert_scale() {
        let device = Device::Cpu;
        let w = Tensor::rand(0f32, 1.0, (3, 8, 16), &device).unwrap();
        let q = quantize_experts(&w, QuantScheme::Fp8(Fp8Format::E4M3Fnuz), Int4ClampPolicy::default()).unwrap();

        assert_eq!(q.dims().unwrap(), (3, 8, 16));
        assert_eq!(q.output_scale().unwrap().dims(), &[3]);
        assert_eq!(q.scheme(), Some(QuantScheme::Fp8(Fp8Format::E4M3Fnuz)));
        // Weights in [0, 1): fp8 relative error is at most 1/16.
        assert!(max_abs_diff(&q.dequantize().unwrap(), &w) <= 1.0 / 16.0);
    }

    #[test]
    fn test_int8_experts_roundtrip() {
        let device = Device::Cpu;
        let w = Tensor::rand(0f32, 1.0, (2, 4, 8), &device).unwrap();
        let q = quantize_experts(&w, QuantScheme::Int8, Int4ClampPolicy::default()).unwrap();

        assert!(matches!(q, ExpertWeights::Int8 { .. }));
        assert!(q.matmul_operand().unwrap().dtype() == DType::F32);
        assert!(max_abs_diff(&q.dequantize().unwrap(), &w) <= 0.5 / 127.0 + 1e-6);
    }

    #[test]
    fn test_int4_layout_shapes() {
        let device = Device::Cpu;
        let w = Tensor::rand(0f32, 1.0, (2, 6, 32), &device).unwrap();
        let q = quantize_experts_int4(&w, 8, true, Int4ClampPolicy::default()).unwrap();
        assert_eq!(q.qweight.dims(), &[2, 6, 16]);
        assert_eq!(q.scales.dims(), &[2, 6, 4]);
        assert_eq!(q.qzeros.as_ref().unwrap().dims(), &[2, 3, 4]);

        let sym = quantize_experts_int4(&w, 8, false, Int4ClampPolicy::default()).unwrap();
        assert!(sym.qzeros.is_none());
        assert_eq!(
            ExpertWeights::Int4(sym).scheme(),
            Some(QuantScheme::Int4Symmetric { group_size: 8 })
        );
    }

    #[test]
    fn test_int4_packed_dequantize_matches_group_quantizer() {
        let device = Device::Cpu;
        let (e, n, k, g) = (2, 4, 16, 4);
        let w = Tensor::rand(0f32, 1.0, (e, n, k), &device).unwrap();
        let stack: Vec<Vec<Vec<f32>>> = w.to_vec3().unwrap();

        for has_zp in [false, true] {
            let packed = quantize_experts_int4(&w, g, has_zp, Int4ClampPolicy::default()).unwrap();
            let deq: Vec<Vec<Vec<f32>>> = packed.dequantize().unwrap().to_vec3().unwrap();

            for expert in 0..e {
                // Same expert through the unpacked [K, N] path.
                let kn: Vec<f32> = (0..k)
                    .flat_map(|col| (0..n).map(move |row| (row, col)))
                    .map(|(row, col)| stack[expert][row][col])
                    .collect();
                let host = quantize_int4_groups(&kn, k, n, g, has_zp, Int4ClampPolicy::default()).unwrap();
                let expected = host.dequantize();
                for row in 0..n {
                    for col in 0..k {
                        assert!((deq[expert][row][col] - expected[col * n + row]).abs() < 1e-6);
                    }
                }
            }
        }
    }

    #[test]
    fn test_int4_zero_point_packing_pairs_along_n() {
        // Row n of expert 0 is shifted by -n so each row gets its own zero-point.
        let data: Vec<f32> = (0..2 * 8)
            .map(|i| {
                let (row, col) = (i / 8, i % 8);
                col as f32 * 0.1 - row as f32
            })
            .collect();
        let w = Tensor::from_vec(data, (1, 2, 8), &Device::Cpu).unwrap();
        let q = quantize_experts_int4(&w, 8, true, Int4ClampPolicy::default()).unwrap();

        let qzeros: Vec<Vec<Vec<u8>>> = q.qzeros.unwrap().to_vec3().unwrap();
        let byte = qzeros[0][0][0];
        // Row 0 has min 0 -> zp 0; row 1 has min -1 over a 0.7 range.
        assert_eq!(byte & 0x0F, 0);
        assert_eq!(byte >> 4, 15);
    }

    #[test]
    fn test_raw_input_qweight_packs_real_values() {
        let device = Device::Cpu;
        let w = Tensor::new(&[[[0.3f32, 0.5], [0.9, 0.7]]], &device).unwrap();

        let asym = quantize_experts_int4(&w, 2, true, Int4ClampPolicy::ClampRawInput).unwrap();
        let qweight: Vec<Vec<Vec<u8>>> = asym.qweight.to_vec3().unwrap();
        assert_eq!(qweight[0], vec![vec![8], vec![12]]);

        let sym = quantize_experts_int4(&w, 2, false, Int4ClampPolicy::ClampRawInput).unwrap();
        let qweight: Vec<Vec<Vec<u8>>> = sym.qweight.to_vec3().unwrap();
        assert_eq!(qweight[0], vec![vec![8], vec![12]]);

        // Scale and zero-point metadata do not depend on the policy.
        let default = quantize_experts_int4(&w, 2, true, Int4ClampPolicy::ClampQuantized).unwrap();
        assert_eq!(
            asym.scales.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            default.scales.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
        assert_eq!(
            asym.qzeros.unwrap().flatten_all().unwrap().to_vec1::<u8>().unwrap(),
            default.qzeros.unwrap().flatten_all().unwrap().to_vec1::<u8>().unwrap()
        );
    }

    #[test]
    fn test_int4_rejects_odd_dims() {
        let device = Device::Cpu;
        let odd_k = Tensor::zeros((1, 2, 7), DType::F32, &device).unwrap();
        assert!(quantize_experts_int4(&odd_k, 7, false, Int4ClampPolicy::default()).is_err());
        let odd_n = Tensor::zeros((1, 3, 8), DType::F32, &device).unwrap();
        assert!(quantize_experts_int4(&odd_n, 4, true, Int4ClampPolicy::default()).is_err());
        assert!(quantize_experts_int4(&odd_n, 4, false, Int4ClampPolicy::default()).is_ok());
    }

    #[test]
    fn test_full_weights_pass_through() {
        let device = Device::Cpu;
        let w = Tensor::rand(0f32, 1.0, (2, 3, 4), &device).unwrap();
        let full = ExpertWeights::Full(w.clone());
        assert!(full.output_scale().is_none());
        assert!(full.scheme().is_none());
        assert_eq!(max_abs_diff(&full.dequantize().unwrap(), &w), 0.0);
    }
}
