//! Configuration for fused MoE kernels.
//!
//! Tiling keys only shape the accelerated kernel's launch. The reference
//! math ignores them, except `BLOCK_SIZE_M`, which is the token alignment
//! block used by [`MoETokenGrouper`](super::MoETokenGrouper).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Block size configuration for the single-layer fused MoE kernels.
///
/// Deserialises from the tuning map format, e.g.
/// `{"BLOCK_SIZE_M": 64, "BLOCK_SIZE_N": 64, "BLOCK_SIZE_K": 32, "GROUP_SIZE_M": 8}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusedMoEBlockConfig {
    /// Block size for M dimension (token slots); also the alignment block.
    #[serde(rename = "BLOCK_SIZE_M")]
    pub block_size_m: usize,
    /// Block size for N dimension (output features).
    #[serde(rename = "BLOCK_SIZE_N")]
    pub block_size_n: usize,
    /// Block size for K dimension (input features).
    #[serde(rename = "BLOCK_SIZE_K")]
    pub block_size_k: usize,
    /// Group size for M dimension (L2 cache reuse).
    #[serde(rename = "GROUP_SIZE_M")]
    pub group_size_m: usize,
}

impl Default for FusedMoEBlockConfig {
    fn default() -> Self {
        Self {
            block_size_m: 64,
            block_size_n: 64,
            block_size_k: 32,
            group_size_m: 8,
        }
    }
}

impl FusedMoEBlockConfig {
    /// Configuration optimized for small batches.
    pub fn small_batch() -> Self {
        Self {
            block_size_m: 16,
            block_size_n: 64,
            block_size_k: 64,
            group_size_m: 8,
        }
    }

    /// Configuration optimized for large batches.
    pub fn large_batch() -> Self {
        Self {
            block_size_m: 128,
            block_size_n: 128,
            block_size_k: 32,
            group_size_m: 8,
        }
    }

    /// Pick a configuration from the problem size.
    pub fn auto_select(num_tokens: usize, n: usize, k: usize) -> Self {
        if num_tokens < 64 {
            Self::small_batch()
        } else if num_tokens >= 256 && k >= 4096 && n >= 11008 {
            Self::large_batch()
        } else {
            Self::default()
        }
    }

    /// Parse a JSON tuning map. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build from an already-parsed tuning map.
    pub fn from_map(map: &HashMap<String, serde_json::Value>) -> Result<Self> {
        let value = serde_json::to_value(map)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Block configuration for the two-layer (end-to-end) kernel.
///
/// The persistent kernel tiles both GEMMs independently (`N1`/`N2`); the
/// grouped kernel shares one `BLOCK_SIZE_N` and uses `GROUP_SIZE_M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusedMoEE2EConfig {
    #[serde(rename = "BLOCK_SIZE_M")]
    pub block_size_m: usize,
    #[serde(rename = "BLOCK_SIZE_N", skip_serializing_if = "Option::is_none")]
    pub block_size_n: Option<usize>,
    #[serde(rename = "BLOCK_SIZE_N1", skip_serializing_if = "Option::is_none")]
    pub block_size_n1: Option<usize>,
    #[serde(rename = "BLOCK_SIZE_N2", skip_serializing_if = "Option::is_none")]
    pub block_size_n2: Option<usize>,
    #[serde(rename = "BLOCK_SIZE_K1")]
    pub block_size_k1: usize,
    #[serde(rename = "BLOCK_SIZE_K2")]
    pub block_size_k2: usize,
    #[serde(rename = "GROUP_SIZE_M", skip_serializing_if = "Option::is_none")]
    pub group_size_m: Option<usize>,
}

impl Default for FusedMoEE2EConfig {
    fn default() -> Self {
        Self::for_kernel(&KernelOptions::default())
    }
}

impl FusedMoEE2EConfig {
    /// Default tiling for the chosen kernel flavour.
    pub fn for_kernel(options: &KernelOptions) -> Self {
        if options.persistent {
            Self {
                block_size_m: 64,
                block_size_n: None,
                block_size_n1: Some(128),
                block_size_n2: Some(64),
                block_size_k1: 64,
                block_size_k2: 64,
                group_size_m: None,
            }
        } else {
            // GROUP_SIZE_M = 1 is known to crash the grouped kernel.
            Self {
                block_size_m: 64,
                block_size_n: Some(128),
                block_size_n1: None,
                block_size_n2: None,
                block_size_k1: 64,
                block_size_k2: 64,
                group_size_m: Some(2),
            }
        }
    }

    /// Output tile width of the first GEMM: `BLOCK_SIZE_N1`, else the shared
    /// `BLOCK_SIZE_N`.
    pub fn gemm1_block_n(&self) -> Option<usize> {
        self.block_size_n1.or(self.block_size_n)
    }

    /// Output tile width of the second GEMM: `BLOCK_SIZE_N2`, else the shared
    /// `BLOCK_SIZE_N`.
    pub fn gemm2_block_n(&self) -> Option<usize> {
        self.block_size_n2.or(self.block_size_n)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Per-call kernel options.
///
/// Replaces process-wide toggles: every launch states which kernel flavour
/// it wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelOptions {
    /// Persistent kernels launch a fixed grid that strides over all blocks.
    pub persistent: bool,
    /// Grid size used when `persistent` is set.
    pub num_programs: usize,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            persistent: false,
            num_programs: 4,
        }
    }
}

impl KernelOptions {
    pub fn persistent(num_programs: usize) -> Self {
        Self {
            persistent: true,
            num_programs,
        }
    }
}
