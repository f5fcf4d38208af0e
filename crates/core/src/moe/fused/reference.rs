//! Reference MoE computation.
//!
//! Straight-line tensor math that the fused kernels are checked against.
//! For every `(token, slot)` the token's activation row is multiplied with
//! the routed expert's `[N, K]` weight, then post-processed in a fixed order:
//!
//! 1. routing weight (when `routed_weight`)
//! 2. tanh GELU (when `gelu` and not `routed_weight`)
//! 3. fp8: `* w_scale[expert] * a_scale`; int8: `* w_scale[expert]`
//!
//! fp8 weights imply fp8 activations: `a` is quantized per tensor first and
//! both operands enter the dot product as decoded codes.

use candle_core::{DType, Tensor};
use tracing::debug;

use super::activation::{gelu_tanh, silu_and_mul};
use crate::error::{MoeError, Result};
use crate::quantization::{quantize_fp8, ExpertWeights};

/// Options shared by the reference and blocked paths.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceOptions {
    /// Multiply each slot's output by its routing weight.
    pub routed_weight: bool,
    /// Apply tanh GELU to unrouted outputs.
    pub gelu: bool,
    /// dtype of the dot-product operands and of the returned tensor.
    pub compute_dtype: DType,
}

impl Default for ReferenceOptions {
    fn default() -> Self {
        Self {
            routed_weight: false,
            gelu: false,
            compute_dtype: DType::F32,
        }
    }
}

impl ReferenceOptions {
    pub fn with_routed_weight(mut self, routed_weight: bool) -> Self {
        self.routed_weight = routed_weight;
        self
    }

    pub fn with_gelu(mut self, gelu: bool) -> Self {
        self.gelu = gelu;
        self
    }

    pub fn with_compute_dtype(mut self, dtype: DType) -> Self {
        self.compute_dtype = dtype;
        self
    }
}

/// Activations as they enter the first GEMM.
pub(crate) struct PreparedActivations {
    /// `[M, K]` `F32`, decoded codes for fp8.
    pub rows: Tensor,
    /// Per-tensor fp8 dequantization scale.
    pub scale: Option<Tensor>,
}

pub(crate) fn prepare_activations(a: &Tensor, weights: &ExpertWeights) -> Result<PreparedActivations> {
    let (_m, k) = a.dims2()?;
    let (_e, _n, weight_k) = weights.dims()?;
    if k != weight_k {
        return Err(MoeError::shape(
            "activations",
            format!("hidden size {k} does not match expert weight K {weight_k}"),
        ));
    }
    quantize_rows(&a.to_dtype(DType::F32)?, weights)
}

/// fp8-quantize `rows` per tensor when `weights` are fp8.
pub(crate) fn quantize_rows(rows: &Tensor, weights: &ExpertWeights) -> Result<PreparedActivations> {
    match weights {
        ExpertWeights::Fp8 { format, .. } => {
            let q = quantize_fp8(rows, &[], *format)?;
            let decoded = crate::quantization::fp8::decode_tensor(&q.values, *format)?;
            Ok(PreparedActivations {
                rows: decoded,
                scale: Some(q.inv_scale),
            })
        }
        _ => Ok(PreparedActivations {
            rows: rows.clone(),
            scale: None,
        }),
    }
}

pub(crate) fn check_expert_ids(ids: &[u32], num_experts: usize) -> Result<()> {
    match ids.iter().position(|&id| id as usize >= num_experts) {
        Some(slot) => Err(MoeError::ExpertOutOfRange {
            expert_id: ids[slot],
            slot,
            num_experts,
        }),
        None => Ok(()),
    }
}

/// `rows[s] @ operand[ids[s]]^T` for every slot: `[S, K] x [E, N, K] -> [S, N]` `F32`.
pub(crate) fn gather_matmul(rows: &Tensor, operand: &Tensor, ids: &Tensor, dtype: DType) -> Result<Tensor> {
    let gathered = operand.index_select(ids, 0)?.transpose(1, 2)?.contiguous()?;
    let out = rows
        .to_dtype(dtype)?
        .unsqueeze(1)?
        .matmul(&gathered.to_dtype(dtype)?)?
        .squeeze(1)?;
    Ok(out.to_dtype(DType::F32)?)
}

/// Post-process `[S, N]` slot outputs in the reference order.
pub(crate) fn finish_rows(
    rows: Tensor,
    ids: &Tensor,
    slot_weights: &Tensor,
    weights: &ExpertWeights,
    a_scale: Option<&Tensor>,
    options: &ReferenceOptions,
) -> Result<Tensor> {
    let mut c = rows;
    if options.routed_weight {
        c = c.broadcast_mul(&slot_weights.to_dtype(DType::F32)?.unsqueeze(1)?)?;
    }
    if options.gelu && !options.routed_weight {
        c = gelu_tanh(&c)?;
    }
    c = rescale(c, ids, weights, a_scale)?;
    Ok(c)
}

pub(crate) fn rescale(c: Tensor, ids: &Tensor, weights: &ExpertWeights, a_scale: Option<&Tensor>) -> Result<Tensor> {
    let mut c = c;
    if let Some(w_scale) = weights.output_scale() {
        let per_slot = w_scale.index_select(ids, 0)?.unsqueeze(1)?;
        c = c.broadcast_mul(&per_slot)?;
    }
    if let Some(a_scale) = a_scale {
        c = c.broadcast_mul(a_scale)?;
    }
    Ok(c)
}

/// Flattened `[M * top_k]` ids and weights.
fn flatten_routing(topk_ids: &Tensor, topk_weights: &Tensor, num_experts: usize) -> Result<(Tensor, Tensor, usize, usize)> {
    let (m, top_k) = topk_ids.dims2()?;
    if topk_weights.dims() != topk_ids.dims() {
        return Err(MoeError::shape(
            "topk_weights",
            format!("expected {:?}, got {:?}", topk_ids.dims(), topk_weights.dims()),
        ));
    }
    let ids = topk_ids.to_dtype(DType::U32)?.flatten_all()?;
    check_expert_ids(&ids.to_vec1::<u32>()?, num_experts)?;
    Ok((ids, topk_weights.flatten_all()?, m, top_k))
}

/// Single-layer reference: `[M, K]` activations to `[M, top_k, N]`.
pub fn moe_reference(
    a: &Tensor,
    weights: &ExpertWeights,
    topk_ids: &Tensor,
    topk_weights: &Tensor,
    options: &ReferenceOptions,
) -> Result<Tensor> {
    let (num_experts, n, _k) = weights.dims()?;
    let (ids, slot_weights, m, top_k) = flatten_routing(topk_ids, topk_weights, num_experts)?;
    let prepared = prepare_activations(a, weights)?;
    if prepared.rows.dim(0)? != m {
        return Err(MoeError::shape(
            "activations",
            format!("{} rows for {m} routed tokens", prepared.rows.dim(0)?),
        ));
    }
    debug!(m, n, top_k, num_experts, scheme = ?weights.scheme(), "running reference MoE");

    // One activation row per (token, slot).
    let rows = prepared
        .rows
        .unsqueeze(1)?
        .broadcast_as((m, top_k, prepared.rows.dim(1)?))?
        .reshape((m * top_k, prepared.rows.dim(1)?))?;
    let operand = weights.matmul_operand()?;
    let c = gather_matmul(&rows, &operand, &ids, options.compute_dtype)?;
    let c = finish_rows(c, &ids, &slot_weights, weights, prepared.scale.as_ref(), options)?;

    Ok(c.reshape((m, top_k, n))?.to_dtype(options.compute_dtype)?)
}

/// Single-layer reference followed by SiLU-and-mul: `[M * top_k, N / 2]`.
pub fn moe_reference_silu_fused(
    a: &Tensor,
    weights: &ExpertWeights,
    topk_ids: &Tensor,
    topk_weights: &Tensor,
    options: &ReferenceOptions,
) -> Result<Tensor> {
    let c = moe_reference(a, weights, topk_ids, topk_weights, options)?;
    let (m, top_k, n) = c.dims3()?;
    silu_and_mul(&c.to_dtype(DType::F32)?.reshape((m * top_k, n))?)?
        .to_dtype(options.compute_dtype)
        .map_err(MoeError::from)
}

/// `(E, N, K)` of `w1 [E, N, K]` once `w2` is checked to be `[E, K, N/2]`.
pub(crate) fn check_e2e_weights(w1: &ExpertWeights, w2: &ExpertWeights) -> Result<(usize, usize, usize)> {
    let (num_experts, n, k) = w1.dims()?;
    let (w2_experts, w2_k, w2_n) = w2.dims()?;
    if w2_experts != num_experts || w2_k != k || w2_n * 2 != n {
        return Err(MoeError::shape(
            "w2",
            format!("expected [{num_experts}, {k}, {}], got [{w2_experts}, {w2_k}, {w2_n}]", n / 2),
        ));
    }
    Ok((num_experts, n, k))
}

/// Two-layer reference: `a [M, K]`, `w1 [E, N, K]`, `w2 [E, K, N/2]` to
/// `[M, top_k, K]`.
///
/// First GEMM and rescale, SiLU-and-mul, per-tensor fp8 re-quantization of
/// the intermediate (fp8 only), second GEMM and rescale. The routing weight
/// is applied once, at the very end; `gelu` is ignored.
pub fn moe_e2e_reference(
    a: &Tensor,
    w1: &ExpertWeights,
    w2: &ExpertWeights,
    topk_ids: &Tensor,
    topk_weights: &Tensor,
    options: &ReferenceOptions,
) -> Result<Tensor> {
    let (num_experts, n, k) = check_e2e_weights(w1, w2)?;
    let (ids, slot_weights, m, top_k) = flatten_routing(topk_ids, topk_weights, num_experts)?;
    debug!(m, n, k, top_k, num_experts, scheme = ?w1.scheme(), "running reference e2e MoE");

    let prepared = prepare_activations(a, w1)?;
    let rows = prepared
        .rows
        .unsqueeze(1)?
        .broadcast_as((m, top_k, k))?
        .reshape((m * top_k, k))?;
    let intermediate = gather_matmul(&rows, &w1.matmul_operand()?, &ids, options.compute_dtype)?;
    let intermediate = rescale(intermediate, &ids, w1, prepared.scale.as_ref())?;

    let activated = silu_and_mul(&intermediate)?;
    let second = quantize_rows(&activated, w2)?;
    let c = gather_matmul(&second.rows, &w2.matmul_operand()?, &ids, options.compute_dtype)?;
    let mut c = rescale(c, &ids, w2, second.scale.as_ref())?;

    if options.routed_weight {
        c = c.broadcast_mul(&slot_weights.to_dtype(DType::F32)?.unsqueeze(1)?)?;
    }
    Ok(c.reshape((m, top_k, k))?.to_dtype(options.compute_dtype)?)
}
