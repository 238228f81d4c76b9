//! Runtime CPU feature probe.

use std::sync::OnceLock;

#[cfg(test)]
#[path = "../tests/unit/cpu_test.rs"]
mod cpu_test;

/// Vector extensions relevant to the matmul kernels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCapabilities {
    /// x86-64 AVX2 together with FMA.
    pub has_avx2_fma: bool,
    /// ARM NEON (always present on aarch64).
    pub has_neon: bool,
}

impl CpuCapabilities {
    /// Probes the running CPU once and caches the answer.
    pub fn detect() -> Self {
        static CAPS: OnceLock<CpuCapabilities> = OnceLock::new();
        *CAPS.get_or_init(Self::probe)
    }

    #[cfg(target_arch = "x86_64")]
    fn probe() -> Self {
        Self {
            has_avx2_fma: is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma"),
            has_neon: false,
        }
    }

    #[cfg(target_arch = "aarch64")]
    fn probe() -> Self {
        Self { has_avx2_fma: false, has_neon: std::arch::is_aarch64_feature_detected!("neon") }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn probe() -> Self {
        Self::default()
    }

    /// No vector extension at all.
    pub fn scalar_only() -> Self {
        Self::default()
    }

    pub fn description(&self) -> String {
        let mut caps = Vec::new();
        if self.has_avx2_fma {
            caps.push("AVX2+FMA");
        }
        if self.has_neon {
            caps.push("NEON");
        }
        if caps.is_empty() { "Scalar (no SIMD)".to_string() } else { caps.join(", ") }
    }
}
