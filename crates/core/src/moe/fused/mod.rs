//! Fused MoE support: alignment, reference math and block execution.
//!
//! ```text
//!  topk_ids ──▶ token_grouper ──▶ sorted_token_ids / expert_ids
//!                                        │
//!  a, expert weights ────────────────────┼──▶ blocked   (kernel-shaped walk)
//!                                        └──▶ reference (oracle)
//! ```
//!
//! ## Key Components
//!
//! - [`config`]: Tiling configuration and per-call kernel options
//! - [`token_grouper`]: Token alignment by expert for block-tiled execution
//! - [`reference`]: Single-layer and two-layer reference computation
//! - [`blocked`]: Executor that walks aligned blocks like the fused kernels,
//!   single-layer and two-layer
//! - [`activation`]: SiLU-and-mul and tanh GELU
//! - [`scenario`]: Seeded problem builders
//!
//! ## Algorithm
//!
//! 1. **Token-to-Expert Alignment:** Sort slots by expert, pad each expert's
//!    run to a multiple of `BLOCK_SIZE_M`
//! 2. **Blocked GEMM:** Every M tile belongs to one expert; padding rows are
//!    skipped
//! 3. **Post-processing:** Routing weight, activation, quantization rescale

pub mod activation;
pub mod blocked;
pub mod config;
pub mod reference;
pub mod scenario;
pub mod token_grouper;

pub use activation::{gelu_tanh, silu_and_mul};
pub use blocked::{
    fused_moe_blocked, fused_moe_blocked_host, fused_moe_e2e_blocked, fused_moe_e2e_blocked_host, tile_for_program,
};
pub use config::{FusedMoEBlockConfig, FusedMoEE2EConfig, KernelOptions};
pub use reference::{moe_e2e_reference, moe_reference, moe_reference_silu_fused, ReferenceOptions};
pub use scenario::{MoeE2EScenario, MoeScenario, MoeScenarioBuilder};
pub use token_grouper::{
    align_block_size_into, expert_ids_capacity, moe_align_block_size, sorted_ids_capacity,
    AlignedBlock, AlignedTokens, BlockAlignment, MoETokenGrouper,
};
