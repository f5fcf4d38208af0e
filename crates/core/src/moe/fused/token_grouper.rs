//! Token grouping for fused MoE execution.
//!
//! Every `(token, slot)` assignment is laid out contiguously per expert and
//! each expert's run is padded up to a multiple of `block_size`, so a
//! block-tiled GEMM can hand exactly one expert to every block of rows.
//!
//! ```text
//! topk_ids = [[2, 3, 4], [1, 2, 4], [1, 3, 4], [1, 2, 3]], block_size = 4
//!
//! sorted_token_ids: [3, 6, 9, 12 | 0, 4, 10, 12 | 1, 7, 11, 12 | 2, 5, 8, 12 | 12 ..]
//! expert_ids:       [1,            2,              3,              4,            12 ..]
//! ```
//!
//! Slot indices are flattened assignments (`token * top_k + slot`). The value
//! `num_tokens * top_k` is the padding sentinel; it fills the tail of every
//! expert's last block and all unused capacity in both arrays.
//!
//! Placement order is part of the contract: experts in increasing index
//! order, and within an expert the `(token, slot)` scan order.

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use super::config::FusedMoEBlockConfig;
use crate::error::{MoeError, Result};

/// Length of the sorted-token-slot array allocated by the aligner.
pub fn sorted_ids_capacity(num_assignments: usize, num_experts: usize, block_size: usize) -> usize {
    num_assignments + num_experts * block_size.saturating_sub(1)
}

/// Length of the expert-per-block array allocated by the aligner.
pub fn expert_ids_capacity(num_assignments: usize, num_experts: usize) -> usize {
    num_assignments + num_experts
}

/// Upper bound on the number of blocks any routing can produce.
fn max_num_blocks(num_assignments: usize, num_experts: usize, block_size: usize) -> usize {
    num_assignments / block_size + num_experts
}

/// Host-side result of token alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAlignment {
    /// Flattened assignment index per padded slot, sentinel for padding.
    pub sorted_token_ids: Vec<u32>,
    /// Owning expert per block, sentinel for unused trailing entries.
    pub expert_ids: Vec<u32>,
    /// Real plus intra-expert padding slots written.
    pub num_tokens_post_padded: usize,
    /// `num_tokens * top_k`, also the sentinel value.
    pub num_valid_tokens: usize,
    pub block_size: usize,
}

impl BlockAlignment {
    pub fn sentinel(&self) -> u32 {
        self.num_valid_tokens as u32
    }

    /// Number of occupied blocks; zero for a zero `block_size`.
    pub fn num_blocks(&self) -> usize {
        self.num_tokens_post_padded.checked_div(self.block_size).unwrap_or(0)
    }

    /// Occupied blocks in kernel iteration order.
    pub fn blocks(&self) -> impl Iterator<Item = AlignedBlock<'_>> + '_ {
        let sentinel = self.sentinel();
        let padded = self.num_tokens_post_padded.min(self.sorted_token_ids.len());
        self.sorted_token_ids[..padded]
            .chunks(self.block_size.max(1))
            .take(self.num_blocks())
            .zip(self.expert_ids.iter())
            .enumerate()
            .map(move |(index, (slots, &expert))| AlignedBlock {
                index,
                expert,
                slots,
                sentinel,
            })
    }

    /// Upload to `device` as `U32` tensors.
    pub fn to_tensors(&self, device: &Device) -> Result<AlignedTokens> {
        let sorted_token_ids = Tensor::new(self.sorted_token_ids.as_slice(), device)?;
        let expert_ids = Tensor::new(self.expert_ids.as_slice(), device)?;
        Ok(AlignedTokens {
            sorted_token_ids,
            expert_ids,
            num_tokens_post_padded: self.num_tokens_post_padded,
            num_valid_tokens: self.num_valid_tokens,
            block_size: self.block_size,
        })
    }
}

/// One `block_size` run of slots owned by a single expert.
#[derive(Debug, Clone, Copy)]
pub struct AlignedBlock<'a> {
    pub index: usize,
    pub expert: u32,
    pub slots: &'a [u32],
    sentinel: u32,
}

impl<'a> AlignedBlock<'a> {
    /// Real flattened assignment indices in this block, padding skipped.
    pub fn assignments(&self) -> impl Iterator<Item = usize> + 'a {
        let sentinel = self.sentinel;
        let slots: &'a [u32] = self.slots;
        slots
            .iter()
            .copied()
            .filter(move |&slot| slot < sentinel)
            .map(|slot| slot as usize)
    }

    pub fn padding(&self) -> usize {
        self.slots.iter().filter(|&&slot| slot >= self.sentinel).count()
    }
}

/// Result of token alignment as device tensors.
#[derive(Debug)]
pub struct AlignedTokens {
    /// Shape `[sorted_ids_capacity]`, `U32`.
    pub sorted_token_ids: Tensor,
    /// Shape `[expert_ids_capacity]`, `U32`.
    pub expert_ids: Tensor,
    pub num_tokens_post_padded: usize,
    pub num_valid_tokens: usize,
    pub block_size: usize,
}

impl AlignedTokens {
    /// Copy back to host vectors.
    pub fn to_alignment(&self) -> Result<BlockAlignment> {
        Ok(BlockAlignment {
            sorted_token_ids: self.sorted_token_ids.to_vec1()?,
            expert_ids: self.expert_ids.to_vec1()?,
            num_tokens_post_padded: self.num_tokens_post_padded,
            num_valid_tokens: self.num_valid_tokens,
            block_size: self.block_size,
        })
    }
}

/// Align flattened `topk_ids` into caller-provided buffers.
///
/// `sorted_token_ids` must hold at least
/// `num_assignments + num_experts * (block_size - 1)` entries and
/// `expert_ids` at least `num_assignments / block_size + num_experts`.
/// Both buffers are fully overwritten; unused capacity ends up holding the
/// sentinel. Returns `num_tokens_post_padded`.
///
/// Runs in three passes: per-expert counts, an exclusive prefix sum of the
/// padded counts, then a scatter in `(token, slot)` order.
pub fn align_block_size_into(
    topk_ids: &[u32],
    top_k: usize,
    block_size: usize,
    num_experts: usize,
    sorted_token_ids: &mut [u32],
    expert_ids: &mut [u32],
) -> Result<usize> {
    if block_size == 0 {
        return Err(MoeError::InvalidBlockSize(block_size));
    }
    let num_assignments = topk_ids.len();
    if top_k == 0 || num_assignments % top_k != 0 {
        return Err(MoeError::InvalidTopK {
            top_k,
            num_assignments,
        });
    }
    let sentinel = u32::try_from(num_assignments).map_err(|_| {
        MoeError::shape(
            "topk_ids",
            format!("{num_assignments} assignments do not fit in u32 slot indices"),
        )
    })?;

    let required = sorted_ids_capacity(num_assignments, num_experts, block_size);
    if sorted_token_ids.len() < required {
        return Err(MoeError::BufferTooSmall {
            buffer: "sorted_token_ids",
            required,
            actual: sorted_token_ids.len(),
        });
    }
    let required = max_num_blocks(num_assignments, num_experts, block_size);
    if expert_ids.len() < required {
        return Err(MoeError::BufferTooSmall {
            buffer: "expert_ids",
            required,
            actual: expert_ids.len(),
        });
    }

    let mut counts = vec![0usize; num_experts];
    for (slot, &expert_id) in topk_ids.iter().enumerate() {
        match counts.get_mut(expert_id as usize) {
            Some(count) => *count += 1,
            None => {
                return Err(MoeError::ExpertOutOfRange {
                    expert_id,
                    slot,
                    num_experts,
                })
            }
        }
    }

    // offsets[e]..offsets[e + 1] is expert e's padded span.
    let mut offsets = Vec::with_capacity(num_experts + 1);
    offsets.push(0usize);
    for &count in &counts {
        let padded = count.div_ceil(block_size) * block_size;
        offsets.push(offsets[offsets.len() - 1] + padded);
    }
    let num_tokens_post_padded = offsets[num_experts];

    sorted_token_ids.fill(sentinel);
    expert_ids.fill(sentinel);

    let mut cursor = offsets[..num_experts].to_vec();
    for (slot, &expert_id) in topk_ids.iter().enumerate() {
        let pos = &mut cursor[expert_id as usize];
        sorted_token_ids[*pos] = slot as u32;
        *pos += 1;
    }

    for expert in 0..num_experts {
        let start_block = offsets[expert] / block_size;
        let end_block = offsets[expert + 1] / block_size;
        expert_ids[start_block..end_block].fill(expert as u32);
    }

    debug!(
        num_assignments,
        num_experts,
        block_size,
        num_tokens_post_padded,
        num_blocks = num_tokens_post_padded / block_size,
        "aligned tokens to expert blocks"
    );

    Ok(num_tokens_post_padded)
}

/// Token grouper that aligns tokens by expert for block-tiled execution.
#[derive(Debug, Clone, Copy)]
pub struct MoETokenGrouper {
    block_size: usize,
    num_experts: usize,
}

impl MoETokenGrouper {
    pub fn new(block_size: usize, num_experts: usize) -> Self {
        Self {
            block_size,
            num_experts,
        }
    }

    /// Use the config's `BLOCK_SIZE_M` as the alignment block.
    pub fn from_config(config: &FusedMoEBlockConfig, num_experts: usize) -> Self {
        Self::new(config.block_size_m, num_experts)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    /// Align flattened `topk_ids` (`[num_tokens * top_k]`, row-major).
    ///
    /// Output arrays are sized like the kernel's pre-allocated buffers:
    /// `numel + num_experts * (block_size - 1)` and `numel + num_experts`.
    pub fn align_block_size_slice(&self, topk_ids: &[u32], top_k: usize) -> Result<BlockAlignment> {
        if self.block_size == 0 {
            return Err(MoeError::InvalidBlockSize(self.block_size));
        }
        let numel = topk_ids.len();
        let mut sorted_token_ids =
            vec![0u32; sorted_ids_capacity(numel, self.num_experts, self.block_size)];
        let mut expert_ids = vec![0u32; expert_ids_capacity(numel, self.num_experts)];

        let num_tokens_post_padded = align_block_size_into(
            topk_ids,
            top_k,
            self.block_size,
            self.num_experts,
            &mut sorted_token_ids,
            &mut expert_ids,
        )?;

        Ok(BlockAlignment {
            sorted_token_ids,
            expert_ids,
            num_tokens_post_padded,
            num_valid_tokens: numel,
            block_size: self.block_size,
        })
    }

    /// Align `topk_ids` of shape `[num_tokens, top_k]`.
    pub fn align_block_size(&self, topk_ids: &Tensor) -> Result<AlignedTokens> {
        let (_num_tokens, top_k) = topk_ids.dims2()?;
        let flat: Vec<u32> = topk_ids.to_dtype(DType::U32)?.flatten_all()?.to_vec1()?;
        self.align_block_size_slice(&flat, top_k)?
            .to_tensors(topk_ids.device())
    }
}

/// Align `topk_ids` (`[num_tokens, top_k]`) for `num_experts` experts.
pub fn moe_align_block_size(
    topk_ids: &Tensor,
    num_experts: usize,
    block_size: usize,
) -> Result<AlignedTokens> {
    MoETokenGrouper::new(block_size, num_experts).align_block_size(topk_ids)
}
