//! Activations fused into the expert GEMMs.

use candle_core::{Tensor, D};

use crate::error::{MoeError, Result};

const GELU_SQRT_2_OVER_PI: f64 = 0.7978845608;
const GELU_CUBIC: f64 = 0.044715;

/// `silu(x[..., :N/2]) * x[..., N/2:]`, halving the last dim.
pub fn silu_and_mul(x: &Tensor) -> Result<Tensor> {
    let n = x.dim(D::Minus1)?;
    if n % 2 != 0 {
        return Err(MoeError::shape(
            "silu_and_mul input",
            format!("last dim {n} must be even"),
        ));
    }
    let half = n / 2;
    let gate = x.narrow(D::Minus1, 0, half)?;
    let up = x.narrow(D::Minus1, half, half)?;
    Ok(candle_nn::ops::silu(&gate)?.mul(&up)?)
}

/// Tanh-approximated GELU:
/// `0.5 * c * (1 + tanh(0.7978845608 * (c + 0.044715 * c^3)))`.
pub fn gelu_tanh(c: &Tensor) -> Result<Tensor> {
    let cubic = ((c * c)?.mul(c)? * GELU_CUBIC)?;
    let inner = (c.add(&cubic)? * GELU_SQRT_2_OVER_PI)?.tanh()?;
    Ok(((c * 0.5)?.mul(&(inner + 1.0)?))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_silu_and_mul_halves_last_dim() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[0.0f32, 1.0, 2.0, 3.0], [-1.0, 2.0, 0.5, -4.0]], &device).unwrap();

        let out = silu_and_mul(&x).unwrap();

        assert_eq!(out.dims(), &[2, 2]);
        let out: Vec<Vec<f32>> = out.to_vec2().unwrap();
        let silu = |v: f32| v / (1.0 + (-v).exp());
        let expected = [[silu(0.0) * 2.0, silu(1.0) * 3.0], [silu(-1.0) * 0.5, silu(2.0) * -4.0]];
        for (row, exp) in out.iter().zip(expected.iter()) {
            for (a, b) in row.iter().zip(exp.iter()) {
                assert!((a - b).abs() < 1e-6, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_silu_and_mul_rejects_odd_width() {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 3), candle_core::DType::F32, &device).unwrap();
        assert!(silu_and_mul(&x).is_err());
    }

    #[test]
    fn test_gelu_tanh_matches_formula() {
        let device = Device::Cpu;
        let values = [-3.0f32, -0.5, 0.0, 0.5, 1.0, 3.0];
        let x = Tensor::new(&values, &device).unwrap();

        let out: Vec<f32> = gelu_tanh(&x).unwrap().to_vec1().unwrap();

        for (c, y) in values.iter().zip(out) {
            let expected = 0.5 * c * (1.0 + (0.797_884_6 * (c + 0.044715 * c * c * c)).tanh());
            assert!((y - expected).abs() < 1e-5, "{y} vs {expected}");
        }
        assert_eq!(out_at_zero(&device), 0.0);
    }

    fn out_at_zero(device: &Device) -> f32 {
        let zero = Tensor::new(&[0.0f32], device).unwrap();
        gelu_tanh(&zero).unwrap().to_vec1::<f32>().unwrap()[0]
    }
}
