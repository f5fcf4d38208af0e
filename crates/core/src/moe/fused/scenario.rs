//! Seeded MoE problem builders.
//!
//! A scenario bundles everything a kernel check needs: activations
//! `a ~ N(0, 1)`, expert weights `~ U[0, 1)` (optionally quantized with one
//! scale per expert), routing from softmax over `N(0, 1)` logits without
//! renormalisation, and the alignment for the chosen `BLOCK_SIZE_M`.
//!
//! ```ignore
//! let scenario = MoeScenario::builder(64, 128, 256, 2, 8)
//!     .scheme(QuantScheme::Int8)
//!     .routed_weight(true)
//!     .seed(7)
//!     .build()?;
//! let expected = scenario.reference()?;
//! let got = scenario.blocked(&KernelOptions::default())?;
//! ```

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::debug;

use super::blocked::{fused_moe_blocked, fused_moe_e2e_blocked};
use super::config::{FusedMoEBlockConfig, FusedMoEE2EConfig, KernelOptions};
use super::reference::{moe_e2e_reference, moe_reference, moe_reference_silu_fused, ReferenceOptions};
use super::token_grouper::{AlignedTokens, MoETokenGrouper};
use crate::error::{MoeError, Result};
use crate::moe::topk_softmax::{topk_softmax, TopKSoftmaxConfig};
use crate::quantization::{quantize_experts, ExpertWeights, Int4ClampPolicy, QuantScheme};

/// Builder for [`MoeScenario`] and [`MoeE2EScenario`].
#[derive(Debug, Clone)]
pub struct MoeScenarioBuilder {
    m: usize,
    n: usize,
    k: usize,
    top_k: usize,
    num_experts: usize,
    routed_weight: bool,
    gelu: bool,
    scheme: Option<QuantScheme>,
    int4_policy: Int4ClampPolicy,
    seed: u64,
    block_size: Option<usize>,
    config: Option<FusedMoEBlockConfig>,
    device: Device,
}

/// A single-layer problem with its routing and alignment.
#[derive(Debug)]
pub struct MoeScenario {
    /// `[M, K]`.
    pub a: Tensor,
    /// Unquantized `[E, N, K]`.
    pub w: Tensor,
    pub weights: ExpertWeights,
    /// `[M, top_k]`.
    pub topk_weights: Tensor,
    /// `[M, top_k]`, `U32`.
    pub topk_ids: Tensor,
    pub aligned: AlignedTokens,
    pub config: FusedMoEBlockConfig,
    pub options: ReferenceOptions,
}

/// A two-layer problem: `w1 [E, N, K]`, `w2 [E, K, N/2]`.
#[derive(Debug)]
pub struct MoeE2EScenario {
    pub a: Tensor,
    pub w1: ExpertWeights,
    pub w2: ExpertWeights,
    pub topk_weights: Tensor,
    pub topk_ids: Tensor,
    pub aligned: AlignedTokens,
    pub config: FusedMoEE2EConfig,
    pub options: ReferenceOptions,
}

fn normal(rng: &mut StdRng, shape: &[usize], device: &Device) -> Result<Tensor> {
    let len = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

fn uniform(rng: &mut StdRng, shape: &[usize], device: &Device) -> Result<Tensor> {
    let len = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.gen::<f32>()).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

impl MoeScenario {
    pub fn builder(m: usize, n: usize, k: usize, top_k: usize, num_experts: usize) -> MoeScenarioBuilder {
        MoeScenarioBuilder {
            m,
            n,
            k,
            top_k,
            num_experts,
            routed_weight: false,
            gelu: false,
            scheme: None,
            int4_policy: Int4ClampPolicy::default(),
            seed: 0,
            block_size: None,
            config: None,
            device: Device::Cpu,
        }
    }

    pub fn reference(&self) -> Result<Tensor> {
        moe_reference(&self.a, &self.weights, &self.topk_ids, &self.topk_weights, &self.options)
    }

    pub fn reference_silu_fused(&self) -> Result<Tensor> {
        moe_reference_silu_fused(&self.a, &self.weights, &self.topk_ids, &self.topk_weights, &self.options)
    }

    pub fn blocked(&self, kernel: &KernelOptions) -> Result<Tensor> {
        fused_moe_blocked(
            &self.a,
            &self.weights,
            &self.topk_weights,
            &self.aligned,
            &self.config,
            kernel,
            &self.options,
        )
    }
}

impl MoeE2EScenario {
    pub fn reference(&self) -> Result<Tensor> {
        moe_e2e_reference(
            &self.a,
            &self.w1,
            &self.w2,
            &self.topk_ids,
            &self.topk_weights,
            &self.options,
        )
    }

    /// Walk the scenario's alignment with its two-layer tiling.
    pub fn blocked(&self, kernel: &KernelOptions) -> Result<Tensor> {
        fused_moe_e2e_blocked(
            &self.a,
            &self.w1,
            &self.w2,
            &self.topk_weights,
            &self.aligned,
            &self.config,
            kernel,
            &self.options,
        )
    }
}

impl MoeScenarioBuilder {
    pub fn routed_weight(mut self, routed_weight: bool) -> Self {
        self.routed_weight = routed_weight;
        self
    }

    pub fn gelu(mut self, gelu: bool) -> Self {
        self.gelu = gelu;
        self
    }

    /// Quantize the expert weights; unquantized when never called.
    pub fn scheme(mut self, scheme: QuantScheme) -> Self {
        self.scheme = Some(scheme);
        self
    }

    pub fn int4_policy(mut self, policy: Int4ClampPolicy) -> Self {
        self.int4_policy = policy;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Override `BLOCK_SIZE_M`.
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = Some(block_size);
        self
    }

    /// Tiling config; picked from the problem size when never called.
    pub fn config(mut self, config: FusedMoEBlockConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    fn options(&self) -> ReferenceOptions {
        ReferenceOptions::default()
            .with_routed_weight(self.routed_weight)
            .with_gelu(self.gelu)
    }

    fn quantize(&self, w: &Tensor) -> Result<ExpertWeights> {
        match self.scheme {
            Some(scheme) => quantize_experts(w, scheme, self.int4_policy),
            None => Ok(ExpertWeights::Full(w.clone())),
        }
    }

    /// Router logits -> `(topk_weights, topk_ids)`, then alignment.
    fn route(&self, rng: &mut StdRng, block_size: usize) -> Result<(Tensor, Tensor, AlignedTokens)> {
        let logits = normal(rng, &[self.m, self.num_experts], &self.device)?;
        let (topk_weights, topk_ids) = topk_softmax(&logits, &TopKSoftmaxConfig::new(self.top_k, false))?;
        let aligned = MoETokenGrouper::new(block_size, self.num_experts).align_block_size(&topk_ids)?;
        Ok((topk_weights, topk_ids, aligned))
    }

    pub fn build(self) -> Result<MoeScenario> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut config = self
            .config
            .unwrap_or_else(|| FusedMoEBlockConfig::auto_select(self.m, self.n, self.k));
        if let Some(block_size) = self.block_size {
            config.block_size_m = block_size;
        }

        let a = normal(&mut rng, &[self.m, self.k], &self.device)?;
        let w = uniform(&mut rng, &[self.num_experts, self.n, self.k], &self.device)?;
        let weights = self.quantize(&w)?;
        let (topk_weights, topk_ids, aligned) = self.route(&mut rng, config.block_size_m)?;

        debug!(
            m = self.m,
            n = self.n,
            k = self.k,
            top_k = self.top_k,
            num_experts = self.num_experts,
            seed = self.seed,
            block_size_m = config.block_size_m,
            "built MoE scenario"
        );

        Ok(MoeScenario {
            a,
            w,
            weights,
            topk_weights,
            topk_ids,
            aligned,
            config,
            options: self.options(),
        })
    }

    /// Build a two-layer problem; `N` is the first layer's width and must be even.
    pub fn build_e2e(self, kernel: &KernelOptions) -> Result<MoeE2EScenario> {
        if self.n % 2 != 0 {
            return Err(MoeError::shape("w1", format!("N = {} must be even", self.n)));
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut config = FusedMoEE2EConfig::for_kernel(kernel);
        if let Some(block_size) = self.block_size {
            config.block_size_m = block_size;
        }

        let a = normal(&mut rng, &[self.m, self.k], &self.device)?;
        let w1 = uniform(&mut rng, &[self.num_experts, self.n, self.k], &self.device)?;
        let w2 = uniform(&mut rng, &[self.num_experts, self.k, self.n / 2], &self.device)?;
        let w1 = self.quantize(&w1)?;
        let w2 = self.quantize(&w2)?;
        let (topk_weights, topk_ids, aligned) = self.route(&mut rng, config.block_size_m)?;

        Ok(MoeE2EScenario {
            a,
            w1,
            w2,
            topk_weights,
            topk_ids,
            aligned,
            config,
            options: self.options(),
        })
    }
}
