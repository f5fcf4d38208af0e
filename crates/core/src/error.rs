use thiserror::Error;

pub type Result<T> = std::result::Result<T, MoeError>;

#[derive(Error, Debug)]
pub enum MoeError {
    #[error("block size must be at least 1, got {0}")]
    InvalidBlockSize(usize),

    #[error("invalid top_k {top_k} for {num_assignments} assignments")]
    InvalidTopK { top_k: usize, num_assignments: usize },

    #[error("k ({k}) cannot be greater than num_experts ({num_experts})")]
    TopKExceedsExperts { k: usize, num_experts: usize },

    #[error("expert id {expert_id} at slot {slot} is out of range for {num_experts} experts")]
    ExpertOutOfRange {
        expert_id: u32,
        slot: usize,
        num_experts: usize,
    },

    #[error("{buffer} buffer too small: need {required}, got {actual}")]
    BufferTooSmall {
        buffer: &'static str,
        required: usize,
        actual: usize,
    },

    #[error("shape mismatch for {what}: {detail}")]
    ShapeMismatch { what: &'static str, detail: String },

    #[error("group size {group_size} does not divide dimension {dim}")]
    InvalidGroupSize { group_size: usize, dim: usize },

    #[error("dimension {dim} out of range for rank {rank}")]
    InvalidDim { dim: usize, rank: usize },

    #[error(
        "tensors not close: {mismatched} of {total} elements exceed tolerance, \
         worst at index {index}: actual {actual}, expected {expected} (atol {atol}, rtol {rtol})"
    )]
    ToleranceExceeded {
        mismatched: usize,
        total: usize,
        index: usize,
        actual: f32,
        expected: f32,
        atol: f32,
        rtol: f32,
    },

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl MoeError {
    pub(crate) fn shape(what: &'static str, detail: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            what,
            detail: detail.into(),
        }
    }
}
