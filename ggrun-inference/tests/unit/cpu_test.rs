use super::*;

#[test]
fn test_detect_is_stable() {
    assert_eq!(CpuCapabilities::detect(), CpuCapabilities::detect());
    assert!(!CpuCapabilities::detect().description().is_empty());
}

#[test]
fn test_scalar_description() {
    assert_eq!(CpuCapabilities::scalar_only().description(), "Scalar (no SIMD)");
}

#[test]
fn test_description_lists_extensions() {
    let caps = CpuCapabilities { has_avx2_fma: true, has_neon: true };
    assert_eq!(caps.description(), "AVX2+FMA, NEON");
}
