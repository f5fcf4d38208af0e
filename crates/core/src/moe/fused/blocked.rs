//! Block-walking MoE executor.
//!
//! Consumes the aligner's output the way the fused GEMM kernel does: the
//! output is tiled into `BLOCK_SIZE_M x BLOCK_SIZE_N` tiles, every M tile is
//! one aligned block owned by a single expert, and padding slots are
//! skipped. Program ids map to tiles with `GROUP_SIZE_M` grouped ordering;
//! with [`KernelOptions::persistent`] a fixed grid of programs strides over
//! all tiles instead of launching one program per tile. Each tile's dot
//! product accumulates over `BLOCK_SIZE_K` wide slices of K.
//!
//! The two-layer walk runs the same grid twice: GEMM1 with `BLOCK_SIZE_N1`
//! and `BLOCK_SIZE_K1` into an `[M * top_k, N]` intermediate, then
//! SiLU-and-mul, then GEMM2 with `BLOCK_SIZE_N2` and `BLOCK_SIZE_K2`.

use std::ops::Range;

use candle_core::{DType, Tensor};
use tracing::{debug, trace};

use super::activation::silu_and_mul;
use super::config::{FusedMoEBlockConfig, FusedMoEE2EConfig, KernelOptions};
use super::reference::{
    check_e2e_weights, finish_rows, prepare_activations, quantize_rows, rescale, ReferenceOptions,
};
use super::token_grouper::{AlignedBlock, AlignedTokens, BlockAlignment};
use crate::error::{MoeError, Result};
use crate::quantization::ExpertWeights;

/// Map a program id to its `(pid_m, pid_n)` tile with grouped ordering.
pub fn tile_for_program(pid: usize, num_pid_m: usize, num_pid_n: usize, group_size_m: usize) -> (usize, usize) {
    let group_size_m = group_size_m.max(1);
    let num_pid_in_group = group_size_m * num_pid_n;
    let group_id = pid / num_pid_in_group;
    let first_pid_m = group_id * group_size_m;
    let rows_in_group = (num_pid_m - first_pid_m).min(group_size_m);
    let local = pid % num_pid_in_group;
    (first_pid_m + local % rows_in_group, local / rows_in_group)
}

/// Program ids handled by `program` out of `num_tiles`, in execution order.
fn program_schedule(options: &KernelOptions, num_tiles: usize) -> Vec<Vec<usize>> {
    if options.persistent {
        let programs = options.num_programs.max(1);
        (0..programs)
            .map(|program| (program..num_tiles).step_by(programs).collect())
            .collect()
    } else {
        (0..num_tiles).map(|pid| vec![pid]).collect()
    }
}

fn check_alignment(alignment: &BlockAlignment, block_size_m: usize, num_slots: usize) -> Result<()> {
    if block_size_m == 0 {
        return Err(MoeError::InvalidBlockSize(0));
    }
    if alignment.block_size != block_size_m {
        return Err(MoeError::shape(
            "alignment",
            format!(
                "aligned with block size {}, config BLOCK_SIZE_M is {block_size_m}",
                alignment.block_size
            ),
        ));
    }
    if alignment.num_valid_tokens != num_slots {
        return Err(MoeError::shape(
            "alignment",
            format!("{} valid slots for {num_slots} routed slots", alignment.num_valid_tokens),
        ));
    }
    Ok(())
}

/// Visit every non-empty tile of the `blocks x ceil(width / block_n)` grid
/// in program order. `visit` gets the block, its real slots and the output
/// columns of the tile.
fn walk_tiles<F>(
    blocks: &[AlignedBlock<'_>],
    width: usize,
    block_n: usize,
    group_size_m: usize,
    kernel: &KernelOptions,
    num_experts: usize,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(&AlignedBlock<'_>, &[u32], Range<usize>) -> Result<()>,
{
    if block_n == 0 {
        return Err(MoeError::InvalidBlockSize(0));
    }
    let num_pid_m = blocks.len();
    let num_pid_n = width.div_ceil(block_n);
    let schedule = program_schedule(kernel, num_pid_m * num_pid_n);
    debug!(
        num_pid_m,
        num_pid_n,
        num_programs = schedule.len(),
        persistent = kernel.persistent,
        "walking aligned blocks"
    );

    for (program, pids) in schedule.iter().enumerate() {
        for &pid in pids {
            let (pid_m, pid_n) = tile_for_program(pid, num_pid_m, num_pid_n, group_size_m);
            let block = &blocks[pid_m];
            if block.expert as usize >= num_experts {
                return Err(MoeError::ExpertOutOfRange {
                    expert_id: block.expert,
                    slot: block.index,
                    num_experts,
                });
            }
            let slots: Vec<u32> = block.assignments().map(|slot| slot as u32).collect();
            if slots.is_empty() {
                continue;
            }
            let n0 = pid_n * block_n;
            let columns = n0..(n0 + block_n).min(width);
            trace!(program, pid, pid_m, pid_n, expert = block.expert, rows = slots.len(), "tile");
            visit(block, &slots, columns)?;
        }
    }
    Ok(())
}

/// `rows [S, K] x tile [n, K]^T` accumulated over `block_k` wide slices of K.
/// Returns `[S, n]` `F32`.
fn tile_matmul(rows: &Tensor, tile: &Tensor, block_k: usize, dtype: DType) -> Result<Tensor> {
    if block_k == 0 {
        return Err(MoeError::InvalidBlockSize(0));
    }
    let (num_rows, k) = rows.dims2()?;
    let mut acc = Tensor::zeros((num_rows, tile.dim(0)?), DType::F32, rows.device())?;
    for k0 in (0..k).step_by(block_k) {
        let len = block_k.min(k - k0);
        let lhs = rows.narrow(1, k0, len)?.contiguous()?.to_dtype(dtype)?;
        let rhs = tile.narrow(1, k0, len)?.contiguous()?.to_dtype(dtype)?;
        acc = (acc + lhs.matmul(&rhs.t()?)?.to_dtype(DType::F32)?)?;
    }
    Ok(acc)
}

/// Write a tile's `[slots, columns]` values into a row-major `[_, width]` buffer.
fn scatter_tile(out: &mut [f32], tile: &Tensor, slots: &[u32], width: usize, columns: &Range<usize>) -> Result<()> {
    let tile: Vec<Vec<f32>> = tile.to_vec2()?;
    for (row, &slot) in tile.iter().zip(slots) {
        let base = slot as usize * width;
        out[base + columns.start..base + columns.end].copy_from_slice(row);
    }
    Ok(())
}

/// Single-layer MoE driven by an alignment: `[M, K]` to `[M, top_k, N]`.
///
/// Produces the same values as
/// [`moe_reference`](super::reference::moe_reference) up to floating-point
/// summation order.
pub fn fused_moe_blocked(
    a: &Tensor,
    weights: &ExpertWeights,
    topk_weights: &Tensor,
    aligned: &AlignedTokens,
    config: &FusedMoEBlockConfig,
    kernel: &KernelOptions,
    options: &ReferenceOptions,
) -> Result<Tensor> {
    let alignment = aligned.to_alignment()?;
    fused_moe_blocked_host(a, weights, topk_weights, &alignment, config, kernel, options)
}

/// [`fused_moe_blocked`] over a host-side alignment.
pub fn fused_moe_blocked_host(
    a: &Tensor,
    weights: &ExpertWeights,
    topk_weights: &Tensor,
    alignment: &BlockAlignment,
    config: &FusedMoEBlockConfig,
    kernel: &KernelOptions,
    options: &ReferenceOptions,
) -> Result<Tensor> {
    let (num_experts, n, _k) = weights.dims()?;
    let (m, top_k) = topk_weights.dims2()?;
    check_alignment(alignment, config.block_size_m, m * top_k)?;

    let prepared = prepare_activations(a, weights)?;
    let operand = weights.matmul_operand()?;
    let slot_weights = topk_weights.to_dtype(DType::F32)?.flatten_all()?;
    let device = a.device();
    let blocks: Vec<_> = alignment.blocks().collect();

    let mut out = vec![0f32; m * top_k * n];
    walk_tiles(
        &blocks,
        n,
        config.block_size_n,
        config.group_size_m,
        kernel,
        num_experts,
        |block, slots, columns| {
            let slot_ids = Tensor::new(slots, device)?;
            let tokens: Vec<u32> = slots.iter().map(|&slot| slot / top_k as u32).collect();
            let rows = prepared.rows.index_select(&Tensor::new(tokens.as_slice(), device)?, 0)?;
            let tile = operand
                .get(block.expert as usize)?
                .narrow(0, columns.start, columns.len())?;
            let c = tile_matmul(&rows, &tile, config.block_size_k, options.compute_dtype)?;

            let expert_ids = Tensor::from_vec(vec![block.expert; slots.len()], slots.len(), device)?;
            let c = finish_rows(
                c,
                &expert_ids,
                &slot_weights.index_select(&slot_ids, 0)?,
                weights,
                prepared.scale.as_ref(),
                options,
            )?;
            scatter_tile(&mut out, &c, slots, n, &columns)
        },
    )?;

    Ok(Tensor::from_vec(out, (m, top_k, n), device)?.to_dtype(options.compute_dtype)?)
}

/// Two-layer MoE driven by an alignment: `a [M, K]`, `w1 [E, N, K]`,
/// `w2 [E, K, N/2]` to `[M, top_k, K]`.
///
/// Produces the same values as
/// [`moe_e2e_reference`](super::reference::moe_e2e_reference) up to
/// floating-point summation order.
#[allow(clippy::too_many_arguments)]
pub fn fused_moe_e2e_blocked(
    a: &Tensor,
    w1: &ExpertWeights,
    w2: &ExpertWeights,
    topk_weights: &Tensor,
    aligned: &AlignedTokens,
    config: &FusedMoEE2EConfig,
    kernel: &KernelOptions,
    options: &ReferenceOptions,
) -> Result<Tensor> {
    let alignment = aligned.to_alignment()?;
    fused_moe_e2e_blocked_host(a, w1, w2, topk_weights, &alignment, config, kernel, options)
}

/// [`fused_moe_e2e_blocked`] over a host-side alignment.
#[allow(clippy::too_many_arguments)]
pub fn fused_moe_e2e_blocked_host(
    a: &Tensor,
    w1: &ExpertWeights,
    w2: &ExpertWeights,
    topk_weights: &Tensor,
    alignment: &BlockAlignment,
    config: &FusedMoEE2EConfig,
    kernel: &KernelOptions,
    options: &ReferenceOptions,
) -> Result<Tensor> {
    let (num_experts, n, k) = check_e2e_weights(w1, w2)?;
    let (m, top_k) = topk_weights.dims2()?;
    let num_slots = m * top_k;
    check_alignment(alignment, config.block_size_m, num_slots)?;
    let block_n1 = config
        .gemm1_block_n()
        .ok_or_else(|| MoeError::shape("e2e config", "neither BLOCK_SIZE_N1 nor BLOCK_SIZE_N is set"))?;
    let block_n2 = config
        .gemm2_block_n()
        .ok_or_else(|| MoeError::shape("e2e config", "neither BLOCK_SIZE_N2 nor BLOCK_SIZE_N is set"))?;
    let group_size_m = config.group_size_m.unwrap_or(1);
    debug!(m, n, k, top_k, block_n1, block_n2, "running blocked e2e MoE");

    let prepared = prepare_activations(a, w1)?;
    let slot_weights = topk_weights.to_dtype(DType::F32)?.flatten_all()?;
    let device = a.device();
    let blocks: Vec<_> = alignment.blocks().collect();

    let operand = w1.matmul_operand()?;
    let mut intermediate = vec![0f32; num_slots * n];
    walk_tiles(
        &blocks,
        n,
        block_n1,
        group_size_m,
        kernel,
        num_experts,
        |block, slots, columns| {
            let tokens: Vec<u32> = slots.iter().map(|&slot| slot / top_k as u32).collect();
            let rows = prepared.rows.index_select(&Tensor::new(tokens.as_slice(), device)?, 0)?;
            let tile = operand
                .get(block.expert as usize)?
                .narrow(0, columns.start, columns.len())?;
            let c = tile_matmul(&rows, &tile, config.block_size_k1, options.compute_dtype)?;
            let expert_ids = Tensor::from_vec(vec![block.expert; slots.len()], slots.len(), device)?;
            let c = rescale(c, &expert_ids, w1, prepared.scale.as_ref())?;
            scatter_tile(&mut intermediate, &c, slots, n, &columns)
        },
    )?;

    // The fp8 re-quantization scale spans every slot, so it waits for GEMM1.
    let intermediate = Tensor::from_vec(intermediate, (num_slots, n), device)?;
    let second = quantize_rows(&silu_and_mul(&intermediate)?, w2)?;

    let operand = w2.matmul_operand()?;
    let mut out = vec![0f32; num_slots * k];
    walk_tiles(
        &blocks,
        k,
        block_n2,
        group_size_m,
        kernel,
        num_experts,
        |block, slots, columns| {
            let slot_ids = Tensor::new(slots, device)?;
            let rows = second.rows.index_select(&slot_ids, 0)?;
            let tile = operand
                .get(block.expert as usize)?
                .narrow(0, columns.start, columns.len())?;
            let c = tile_matmul(&rows, &tile, config.block_size_k2, options.compute_dtype)?;
            let expert_ids = Tensor::from_vec(vec![block.expert; slots.len()], slots.len(), device)?;
            let mut c = rescale(c, &expert_ids, w2, second.scale.as_ref())?;
            if options.routed_weight {
                c = c.broadcast_mul(&slot_weights.index_select(&slot_ids, 0)?.unsqueeze(1)?)?;
            }
            scatter_tile(&mut out, &c, slots, k, &columns)
        },
    )?;

    Ok(Tensor::from_vec(out, (m, top_k, k), device)?.to_dtype(options.compute_dtype)?)
}
