//! Closeness checks between kernel and reference outputs.
//!
//! An element passes when `|actual - expected| <= atol + rtol * |expected|`.
//! NaN never passes; equal infinities do.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{MoeError, Result};
use crate::quantization::QuantScheme;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub atol: f32,
    pub rtol: f32,
}

impl Tolerance {
    /// Bound used for fp8, int8 and unquantized kernel outputs.
    pub const KERNEL: Self = Self::new(1e-1, 1e-1);
    /// Looser bound for int4 weights.
    pub const INT4: Self = Self::new(2e-1, 2e-1);

    pub const fn new(atol: f32, rtol: f32) -> Self {
        Self { atol, rtol }
    }

    pub fn for_scheme(scheme: Option<QuantScheme>) -> Self {
        match scheme {
            Some(QuantScheme::Int4Symmetric { .. } | QuantScheme::Int4Asymmetric { .. }) => Self::INT4,
            _ => Self::KERNEL,
        }
    }

    fn is_close(&self, actual: f32, expected: f32) -> bool {
        if actual == expected {
            return true;
        }
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }

    /// Compare flat slices.
    pub fn check_slices(&self, actual: &[f32], expected: &[f32]) -> Result<()> {
        if actual.len() != expected.len() {
            return Err(MoeError::shape(
                "tolerance check",
                format!("{} actual values vs {} expected", actual.len(), expected.len()),
            ));
        }

        let mut mismatched = 0usize;
        let mut worst: Option<(usize, f32)> = None;
        for (index, (&a, &e)) in actual.iter().zip(expected).enumerate() {
            if self.is_close(a, e) {
                continue;
            }
            mismatched += 1;
            let excess = (a - e).abs() - (self.atol + self.rtol * e.abs());
            let excess = if excess.is_nan() { f32::INFINITY } else { excess };
            if worst.map_or(true, |(_, w)| excess > w) {
                worst = Some((index, excess));
            }
        }

        match worst {
            None => Ok(()),
            Some((index, _)) => Err(MoeError::ToleranceExceeded {
                mismatched,
                total: actual.len(),
                index,
                actual: actual[index],
                expected: expected[index],
                atol: self.atol,
                rtol: self.rtol,
            }),
        }
    }

    /// Compare two tensors of the same shape.
    pub fn check(&self, actual: &Tensor, expected: &Tensor) -> Result<()> {
        if actual.dims() != expected.dims() {
            return Err(MoeError::shape(
                "tolerance check",
                format!("actual {:?} vs expected {:?}", actual.dims(), expected.dims()),
            ));
        }
        let actual: Vec<f32> = actual.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let expected: Vec<f32> = expected.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        self.check_slices(&actual, &expected)
    }
}

/// [`Tolerance::check`] with explicit bounds.
pub fn check_close(actual: &Tensor, expected: &Tensor, atol: f32, rtol: f32) -> Result<()> {
    Tolerance::new(atol, rtol).check(actual, expected)
}
