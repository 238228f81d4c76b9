use super::*;
use crate::quant::quantize_q4_0;

fn sequence(len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|i| ((i * 7 % 13) as f32 - 6.0) * scale).collect()
}

fn reference(a: &[f32], b: &[f32], n: usize, m: usize, k: usize) -> Vec<f32> {
    let mut c = vec![0.0; n * k];
    for i in 0..n {
        for j in 0..k {
            c[i * k + j] = (0..m).map(|p| a[i * m + p] * b[p * k + j]).sum();
        }
    }
    c
}

#[test]
fn test_scalar_small_product() {
    // [1 2; 3 4] x [5 6; 7 8]
    let mut c = [0.0; 4];
    ScalarKernel.matmul(&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0], &mut c, 2, 2, 2);
    assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
}

#[test]
fn test_vector_times_matrix() {
    // row vector [1, 1, 1] times a 3x2 matrix sums the columns
    let b = [1.0, 10.0, 2.0, 20.0, 3.0, 30.0];
    let mut c = [0.0; 2];
    ScalarKernel.matmul(&[1.0, 1.0, 1.0], &b, &mut c, 1, 3, 2);
    assert_eq!(c, [6.0, 60.0]);
}

#[test]
fn test_selected_kernel_matches_reference() {
    // k = 19 exercises both the vector body and the scalar tail
    let (n, m, k) = (3, 37, 19);
    let a = sequence(n * m, 0.1);
    let b = sequence(m * k, 0.05);
    let expected = reference(&a, &b, n, m, k);

    for precision in [Precision::Strict, Precision::Relaxed] {
        let kernel = select_kernel(CpuCapabilities::detect(), precision);
        let mut c = vec![f32::NAN; n * k];
        kernel.matmul(&a, &b, &mut c, n, m, k);
        for (got, want) in c.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-4, "{}: {got} vs {want}", kernel.name());
        }
    }
}

#[test]
fn test_strict_precision_is_scalar() {
    let kernel = select_kernel(CpuCapabilities::detect(), Precision::Strict);
    assert_eq!(kernel.name(), "scalar");
    let fallback = select_kernel(CpuCapabilities::scalar_only(), Precision::Relaxed);
    assert_eq!(fallback.name(), "scalar");
}

#[test]
#[should_panic]
fn test_short_buffers_panic() {
    let mut c = [0.0; 1];
    ScalarKernel.matmul(&[1.0, 2.0], &[1.0, 2.0, 3.0, 4.0], &mut c, 1, 2, 2);
}

#[test]
fn test_q4_matmul_matches_dequantized_dense() {
    let (n, m, k) = (2, 16, 12);
    let a = sequence(n * m, 0.2);
    let weights = sequence(m * k, 0.03);
    let raw = quantize_q4_0(&weights);

    let mut dense = vec![0.0; m * k];
    crate::quant::dequantize_q4_0(&raw, &mut dense);
    let expected = reference(&a, &dense, n, m, k);

    let mut c = vec![0.0; n * k];
    matmul_q4(&a, &raw, &mut c, n, m, k);
    for (got, want) in c.iter().zip(&expected) {
        assert!((got - want).abs() < 1e-5, "{got} vs {want}");
    }
}
