//! Mixture of Experts (MoE) routing and fused-kernel support.
//!
//! ## Submodules
//!
//! - [`topk_softmax`]: Top-k softmax routing from router logits
//! - [`fused`]: Token alignment, tiling config, reference math and the
//!   block-walking executor for fused MoE kernels

pub mod fused;
pub mod topk_softmax;

pub use fused::{
    fused_moe_blocked, fused_moe_e2e_blocked, moe_align_block_size, moe_e2e_reference, moe_reference, AlignedTokens,
    BlockAlignment, FusedMoEBlockConfig, FusedMoEE2EConfig, KernelOptions, MoETokenGrouper,
    ReferenceOptions,
};
pub use topk_softmax::{topk_softmax, TopKSoftmaxConfig};
