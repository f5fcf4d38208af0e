//! Top-k softmax routing.
//!
//! Produces the `(topk_weights, topk_ids)` pair every other MoE stage
//! consumes:
//!
//! 1. Softmax over expert logits
//! 2. Top-k experts by probability, highest first
//! 3. Optional renormalisation of the selected weights to sum to 1

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{MoeError, Result};

/// Configuration for top-k softmax routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopKSoftmaxConfig {
    /// Number of experts per token.
    pub k: usize,
    /// Rescale the selected weights to sum to 1.
    pub renormalize: bool,
}

impl Default for TopKSoftmaxConfig {
    fn default() -> Self {
        Self {
            k: 2,
            renormalize: true,
        }
    }
}

impl TopKSoftmaxConfig {
    pub fn new(k: usize, renormalize: bool) -> Self {
        Self { k, renormalize }
    }
}

/// Route `[num_tokens, num_experts]` logits.
///
/// Returns `(weights, ids)`, both `[num_tokens, k]`; ids are `U32` and each
/// row is ordered by decreasing probability. Non-CPU tensors are routed on
/// the host and moved back.
pub fn topk_softmax(router_logits: &Tensor, config: &TopKSoftmaxConfig) -> Result<(Tensor, Tensor)> {
    match router_logits.device() {
        Device::Cpu => topk_softmax_cpu(router_logits, config),
        device => {
            let (weights, ids) = topk_softmax_cpu(&router_logits.to_device(&Device::Cpu)?, config)?;
            Ok((weights.to_device(device)?, ids.to_device(device)?))
        }
    }
}

fn topk_softmax_cpu(router_logits: &Tensor, config: &TopKSoftmaxConfig) -> Result<(Tensor, Tensor)> {
    let (num_tokens, num_experts) = router_logits.dims2()?;
    let k = config.k;
    if k > num_experts {
        return Err(MoeError::TopKExceedsExperts { k, num_experts });
    }

    let probs = candle_nn::ops::softmax(&router_logits.to_dtype(DType::F32)?, candle_core::D::Minus1)?;

    let sorted = probs.arg_sort_last_dim(false)?;
    let topk_ids = sorted.narrow(1, 0, k)?.contiguous()?;
    let topk_weights = probs.gather(&topk_ids, 1)?;

    let topk_weights = if config.renormalize {
        let sum = topk_weights.sum_keepdim(1)?;
        topk_weights.broadcast_div(&sum)?
    } else {
        topk_weights
    };

    trace!(num_tokens, num_experts, k, renormalize = config.renormalize, "routed tokens");

    Ok((topk_weights, topk_ids.to_dtype(DType::U32)?))
}
