//! Weight quantization for MoE expert stacks.
//!
//! - **FP8**: E4M3 codes with one scale per preserved-dim slice
//! - **INT8**: symmetric, one scale per preserved-dim slice
//! - **INT4**: group-wise along K, symmetric or with zero-points, nibble packed
//!
//! Every scheme produces a [`QuantizedTensor`]; whole expert stacks go
//! through [`quantize_experts`] and come back as [`ExpertWeights`].
//!
//! # Example
//!
//! ```ignore
//! use fused_moe_core::quantization::{quantize, Fp8Format, Int4ClampPolicy, QuantScheme};
//!
//! let q = quantize(&w, QuantScheme::Fp8(Fp8Format::E4M3Fnuz), &[0], Int4ClampPolicy::default())?;
//! let approx = q.dequantize()?;
//! ```

mod config;
pub mod experts;
pub mod fp8;
pub mod int4;
pub mod int8;

pub use config::{Int4ClampPolicy, QuantScheme, QuantizedTensor, MIN_MAX_ABS};
pub use experts::{quantize_experts, quantize_experts_int4, ExpertWeights, Int4ExpertWeights};
pub use fp8::{quantize_fp8, Fp8Format};
pub use int4::{
    pack_int4_rows, pack_raw_int4_pair, quantize_int4, quantize_int4_groups, unpack_int4_rows, Int4Groups,
};
pub use int8::quantize_int8;

use candle_core::Tensor;

use crate::error::Result;

/// Quantize `tensor` with `scheme`.
///
/// `preserved_dims` selects the per-slice scale for fp8/int8 (empty means
/// one per-tensor scale). int4 expects a `[K, N]` tensor, groups along K,
/// and ignores `preserved_dims`; `policy` only affects int4.
pub fn quantize(
    tensor: &Tensor,
    scheme: QuantScheme,
    preserved_dims: &[usize],
    policy: Int4ClampPolicy,
) -> Result<QuantizedTensor> {
    match scheme {
        QuantScheme::Fp8(format) => quantize_fp8(tensor, preserved_dims, format),
        QuantScheme::Int8 => quantize_int8(tensor, preserved_dims),
        QuantScheme::Int4Symmetric { group_size } => quantize_int4(tensor, group_size, false, policy),
        QuantScheme::Int4Asymmetric { group_size } => quantize_int4(tensor, group_size, true, policy),
    }
}
