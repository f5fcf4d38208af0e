//! Integration tests for weight quantization.
//!
//! Covers the error bounds of every scheme, the packed int4 expert layout
//! and both int4 clamp policies. All tests run on CPU.

use candle_core::{DType, Device, Tensor};
use fused_moe_core::quantization::{
    pack_int4_rows, quantize, quantize_experts, quantize_fp8, quantize_int4, quantize_int4_groups,
    quantize_int8, unpack_int4_rows, ExpertWeights, Fp8Format, Int4ClampPolicy, QuantScheme,
};
use fused_moe_core::MoeError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn to_vec(t: &Tensor) -> Vec<f32> {
    t.to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap()
}

fn max_abs(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
}

// ─── FP8 ─────────────────────────────────────────────────────────────────────

#[test]
fn test_fp8_error_is_bounded_for_both_formats() {
    let device = Device::Cpu;
    let w = Tensor::randn(0f32, 1.0, (4, 16, 32), &device).unwrap();
    let original = to_vec(&w);

    for format in [Fp8Format::E4M3Fnuz, Fp8Format::E4M3Fn] {
        let q = quantize_fp8(&w, &[], format).unwrap();
        let inv_scale = q.inv_scale.to_vec0::<f32>().unwrap();
        assert!((inv_scale - max_abs(&original) / format.max_value()).abs() < 1e-6);

        let restored = to_vec(&q.dequantize().unwrap());
        // Three mantissa bits: relative error at most 2^-4 for normals, half
        // a subnormal step otherwise.
        let subnormal_step = 2f32.powi(-9) * inv_scale;
        for (&x, &y) in original.iter().zip(&restored) {
            let bound = x.abs() / 16.0 + subnormal_step + 1e-6;
            assert!((x - y).abs() <= bound, "{format}: {x} -> {y}");
        }
    }
}

#[test]
fn test_fp8_largest_element_saturates_to_max_code() {
    let device = Device::Cpu;
    let w = Tensor::new(&[[0.5f32, -3.0, 1.25], [2.0, 0.0, -0.75]], &device).unwrap();

    for (format, max_code) in [(Fp8Format::E4M3Fnuz, 0x7Fu8), (Fp8Format::E4M3Fn, 0x7E)] {
        let q = quantize_fp8(&w, &[], format).unwrap();
        let codes: Vec<u8> = q.values.flatten_all().unwrap().to_vec1().unwrap();
        // -3.0 has the largest magnitude.
        assert_eq!(codes[1], 0x80 | max_code);
        assert_eq!(codes[4], 0x00);
        let scale = q.scale.to_vec0::<f32>().unwrap();
        assert!((scale - format.max_value() / 3.0).abs() < 1e-3);
    }
}

#[test]
fn test_fp8_per_expert_scales_are_independent() {
    let device = Device::Cpu;
    let small = (Tensor::ones((1, 4, 8), DType::F32, &device).unwrap() * 0.01).unwrap();
    let large = (Tensor::ones((1, 4, 8), DType::F32, &device).unwrap() * 100.0).unwrap();
    let w = Tensor::cat(&[&small, &large], 0).unwrap();

    let q = quantize_fp8(&w, &[0], Fp8Format::E4M3Fnuz).unwrap();
    let inv: Vec<f32> = q.inv_scale.to_vec1().unwrap();
    assert_eq!(inv.len(), 2);
    assert!((inv[0] - 0.01 / 240.0).abs() < 1e-9);
    assert!((inv[1] - 100.0 / 240.0).abs() < 1e-5);

    let restored = to_vec(&q.dequantize().unwrap());
    assert!(restored[..32].iter().all(|&v| (v - 0.01).abs() < 1e-6));
    assert!(restored[32..].iter().all(|&v| (v - 100.0).abs() < 1e-3));
}

// ─── INT8 ────────────────────────────────────────────────────────────────────

#[test]
fn test_int8_error_is_half_a_step() {
    let device = Device::Cpu;
    let w = Tensor::randn(0f32, 2.0, (3, 24, 40), &device).unwrap();
    let q = quantize_int8(&w, &[0]).unwrap();

    let values: Vec<i64> = q.values.flatten_all().unwrap().to_vec1().unwrap();
    assert!(values.iter().all(|v| (-127..=127).contains(v)));

    let original = to_vec(&w);
    let restored = to_vec(&q.dequantize().unwrap());
    for (expert, (x, y)) in original.chunks(24 * 40).zip(restored.chunks(24 * 40)).enumerate() {
        let step = max_abs(x) / 127.0;
        for (a, b) in x.iter().zip(y) {
            assert!((a - b).abs() <= step * 0.5 + 1e-5, "expert {expert}: {a} -> {b}");
        }
        // The slice's largest value lands exactly on the last code.
        let peak = x.iter().zip(values.chunks(24 * 40).nth(expert).unwrap()).fold(
            (0.0f32, 0i64),
            |best, (&v, &c)| if v.abs() > best.0 { (v.abs(), c) } else { best },
        );
        assert_eq!(peak.1.abs(), 127);
    }
}

#[test]
fn test_int8_zero_slice_stays_zero() {
    let device = Device::Cpu;
    let w = Tensor::zeros((2, 4, 4), DType::F32, &device).unwrap();
    let q = quantize_int8(&w, &[0]).unwrap();

    let values: Vec<i64> = q.values.flatten_all().unwrap().to_vec1().unwrap();
    assert!(values.iter().all(|&v| v == 0));
    assert!(to_vec(&q.dequantize().unwrap()).iter().all(|&v| v == 0.0));
}

// ─── INT4 ────────────────────────────────────────────────────────────────────

/// `[K, N]` weights whose every group has a negative minimum.
fn signed_weights(rng: &mut StdRng, k: usize, n: usize, group_size: usize) -> Vec<f32> {
    let mut data: Vec<f32> = (0..k * n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    for group in 0..k / group_size {
        for col in 0..n {
            data[group * group_size * n + col] = -rng.gen_range(0.1f32..1.0);
        }
    }
    data
}

#[test]
fn test_int4_asymmetric_error_bound() {
    let mut rng = StdRng::seed_from_u64(21);
    let (k, n, group_size) = (64, 16, 16);
    let data = signed_weights(&mut rng, k, n, group_size);

    let q = quantize_int4_groups(&data, k, n, group_size, true, Int4ClampPolicy::default()).unwrap();
    assert!(q.codes.iter().all(|&c| c <= 15));
    assert!(q.zero_points.as_ref().unwrap().iter().all(|&z| z <= 15));

    let restored = q.dequantize();
    for row in 0..k {
        for col in 0..n {
            let scale = q.scales[(row / group_size) * n + col];
            let (x, y) = (data[row * n + col], restored[row * n + col]);
            // Rounding both the value and the zero-point costs up to 1.5 steps
            // at the top of the range.
            assert!((x - y).abs() <= 1.5 * scale + 1e-6, "row {row} col {col}: {x} -> {y}");
        }
    }
}

#[test]
fn test_int4_symmetric_error_bound_for_non_negative_weights() {
    let device = Device::Cpu;
    let w = Tensor::rand(0f32, 1.0, (32, 8), &device).unwrap();

    let q = quantize_int4(&w, 8, false, Int4ClampPolicy::default()).unwrap();
    assert!(q.zero_point.is_none());

    let codes: Vec<u8> = q.values.flatten_all().unwrap().to_vec1().unwrap();
    assert!(codes.iter().all(|&c| (1..=15).contains(&c)));

    let scales: Vec<Vec<f32>> = q.scale.to_vec2().unwrap();
    let original: Vec<Vec<f32>> = w.to_vec2().unwrap();
    let restored: Vec<Vec<f32>> = q.dequantize().unwrap().to_vec2().unwrap();
    for row in 0..32 {
        for col in 0..8 {
            let step = scales[row / 8][col];
            assert!((original[row][col] - restored[row][col]).abs() <= step * 0.5 + 1e-6);
        }
    }
}

#[test]
fn test_raw_input_clamp_ignores_scale_and_zero_point() {
    let data = [0.3f32, -9.2, 5.7, 3.9];

    let asymmetric = quantize_int4_groups(&data, 2, 2, 2, true, Int4ClampPolicy::ClampRawInput).unwrap();
    assert_eq!(asymmetric.codes, vec![0, 0, 5, 3]);

    let symmetric = quantize_int4_groups(&data, 2, 2, 2, false, Int4ClampPolicy::ClampRawInput).unwrap();
    // trunc(clamp(x, -7, 7)) with no offset; -7 keeps its low nibble.
    assert_eq!(symmetric.codes, vec![0, 9, 5, 3]);

    let corrected = quantize_int4_groups(&data, 2, 2, 2, true, Int4ClampPolicy::ClampQuantized).unwrap();
    assert_ne!(corrected.codes, asymmetric.codes);
    // Only the quantization step differs; scales and zero-points agree.
    assert_eq!(corrected.scales, asymmetric.scales);
    assert_eq!(corrected.zero_points, asymmetric.zero_points);
}

#[test]
fn test_raw_input_expert_bytes_follow_real_valued_packing() {
    let mut rng = StdRng::seed_from_u64(21);
    let (e, n, k) = (2, 4, 16);
    let data: Vec<f32> = (0..e * n * k).map(|_| rng.gen::<f32>()).collect();
    let w = Tensor::from_vec(data.clone(), (e, n, k), &Device::Cpu).unwrap();

    for has_zp in [false, true] {
        let scheme = if has_zp {
            QuantScheme::Int4Asymmetric { group_size: 8 }
        } else {
            QuantScheme::Int4Symmetric { group_size: 8 }
        };
        let ExpertWeights::Int4(packed) = quantize_experts(&w, scheme, Int4ClampPolicy::ClampRawInput).unwrap()
        else {
            panic!("expected int4 experts");
        };
        let qweight: Vec<u8> = packed.qweight.flatten_all().unwrap().to_vec1().unwrap();

        // U[0, 1) inputs: clamping is a no-op, the byte is trunc(16 * odd + even).
        let expected: Vec<u8> = data.chunks(2).map(|pair| (16.0 * pair[1] + pair[0]) as u8).collect();
        assert_eq!(qweight, expected, "has_zp={has_zp}");
        assert!(qweight.iter().any(|&byte| byte != 0 && byte != 0x88));
    }
}

#[test]
fn test_int4_rejects_uneven_groups() {
    let err = quantize_int4_groups(&[0.0; 24], 6, 4, 4, true, Int4ClampPolicy::default()).unwrap_err();
    assert!(matches!(err, MoeError::InvalidGroupSize { group_size: 4, dim: 6 }));
}

#[test]
fn test_nibble_packing_layout() {
    // [4, 3] codes: rows 0/1 and 2/3 share bytes.
    let codes = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
    let packed = pack_int4_rows(&codes, 4, 3).unwrap();
    assert_eq!(packed, vec![0x41, 0x52, 0x63, 0xA7, 0xB8, 0xC9]);
    assert_eq!(unpack_int4_rows(&packed, 3), codes.to_vec());
    assert!(pack_int4_rows(&codes[..9], 3, 3).is_err());
}

// ─── Expert stacks ───────────────────────────────────────────────────────────

#[test]
fn test_int4_expert_layout_matches_per_expert_quantization() {
    let device = Device::Cpu;
    let (num_experts, n, k, group_size) = (3, 8, 32, 8);
    let w = Tensor::randn(0f32, 1.0, (num_experts, n, k), &device).unwrap();

    let packed = quantize_experts(&w, QuantScheme::Int4Asymmetric { group_size }, Int4ClampPolicy::default())
        .unwrap();
    let ExpertWeights::Int4(int4) = &packed else {
        panic!("expected int4 expert weights");
    };
    assert_eq!(int4.qweight.dims(), &[num_experts, n, k / 2]);
    assert_eq!(int4.scales.dims(), &[num_experts, n, k / group_size]);
    assert_eq!(int4.qzeros.as_ref().unwrap().dims(), &[num_experts, n / 2, k / group_size]);

    let dequantized = packed.dequantize().unwrap();
    for expert in 0..num_experts {
        let w_e = w.get(expert).unwrap().t().unwrap().contiguous().unwrap();
        let single = quantize_int4(&w_e, group_size, true, Int4ClampPolicy::default()).unwrap();
        let expected = single.dequantize().unwrap().t().unwrap();
        let got = dequantized.get(expert).unwrap();
        let diff = to_vec(&(got - expected).unwrap().abs().unwrap());
        assert!(max_abs(&diff) < 1e-6, "expert {expert}");
    }
}

#[test]
fn test_expert_stacks_approximate_the_original() {
    let device = Device::Cpu;
    let w = Tensor::rand(0f32, 1.0, (4, 16, 32), &device).unwrap();
    let policy = Int4ClampPolicy::default();

    for (scheme, bound) in [
        (QuantScheme::Fp8(Fp8Format::E4M3Fnuz), 1.0 / 16.0),
        (QuantScheme::Fp8(Fp8Format::E4M3Fn), 1.0 / 16.0),
        (QuantScheme::Int8, 1.0 / 127.0),
        (QuantScheme::Int4Symmetric { group_size: 16 }, 1.0 / 7.0),
    ] {
        let q = quantize_experts(&w, scheme, policy).unwrap();
        assert_eq!(q.scheme(), Some(scheme));
        assert_eq!(q.dims().unwrap(), (4, 16, 32));

        let diff = to_vec(&(q.dequantize().unwrap() - &w).unwrap().abs().unwrap());
        // All weights lie in [0, 1), so each bound is in units of the largest.
        assert!(max_abs(&diff) <= bound + 1e-5, "{scheme}: {}", max_abs(&diff));
    }
}

#[test]
fn test_quantize_dispatch_matches_direct_calls() {
    let device = Device::Cpu;
    let w = Tensor::randn(0f32, 1.0, (8, 8), &device).unwrap();
    let policy = Int4ClampPolicy::default();

    let via_dispatch = quantize(&w, QuantScheme::Int8, &[1], policy).unwrap();
    let direct = quantize_int8(&w, &[1]).unwrap();
    assert_eq!(
        via_dispatch.values.flatten_all().unwrap().to_vec1::<i64>().unwrap(),
        direct.values.flatten_all().unwrap().to_vec1::<i64>().unwrap()
    );
    assert_eq!(via_dispatch.preserved_dims, vec![1]);
}

#[test]
fn test_scheme_config_round_trip() {
    let scheme: QuantScheme = serde_json::from_str(r#"{"int4_asymmetric":{"group_size":128}}"#).unwrap();
    assert_eq!(scheme, QuantScheme::Int4Asymmetric { group_size: 128 });
    assert_eq!(scheme.to_string(), "int4_zp_g128");

    let fp8: QuantScheme = serde_json::from_str(r#"{"fp8":"e4m3fn"}"#).unwrap();
    assert_eq!(fp8, QuantScheme::Fp8(Fp8Format::E4M3Fn));
    assert_eq!(fp8.max_representable(), 448.0);

    let policy: Int4ClampPolicy = serde_json::from_str(r#""clamp_raw_input""#).unwrap();
    assert_eq!(policy, Int4ClampPolicy::ClampRawInput);
}
