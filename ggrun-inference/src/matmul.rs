//! Dense matrix multiply with runtime-selected SIMD kernels.
//!
//! Every kernel computes `C[n×k] = A[n×m] · B[m×k]` over row-major slices, so `B[p][j]` lives at `b[p * k + j]`.

use std::fmt;

use log::info;

use crate::cpu::CpuCapabilities;
use crate::quant::{Q4_0_BLOCK_BYTES, QK, dequantize_q4_0_block};

#[cfg(test)]
#[path = "../tests/unit/matmul_test.rs"]
mod matmul_test;

/// Numeric mode for kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// Portable scalar loop; bit-for-bit reproducible across machines.
    Strict,
    /// Fastest kernel the CPU supports; fused multiply-add may round differently.
    #[default]
    Relaxed,
}

pub trait MatmulKernel: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Computes `c = a · b`. Panics if a slice is shorter than its declared shape.
    fn matmul(&self, a: &[f32], b: &[f32], c: &mut [f32], n: usize, m: usize, k: usize);
}

/// Picks the kernel once; the choice depends only on the probe result and the precision mode.
pub fn select_kernel(caps: CpuCapabilities, precision: Precision) -> Box<dyn MatmulKernel> {
    let kernel: Box<dyn MatmulKernel> = match precision {
        Precision::Strict => Box::new(ScalarKernel),
        Precision::Relaxed => simd_kernel(caps).unwrap_or_else(|| Box::new(ScalarKernel)),
    };
    info!("Matmul kernel: {} ({})", kernel.name(), caps.description());
    kernel
}

#[cfg(target_arch = "x86_64")]
fn simd_kernel(caps: CpuCapabilities) -> Option<Box<dyn MatmulKernel>> {
    Avx2Kernel::new(caps).map(|k| Box::new(k) as Box<dyn MatmulKernel>)
}

#[cfg(target_arch = "aarch64")]
fn simd_kernel(caps: CpuCapabilities) -> Option<Box<dyn MatmulKernel>> {
    NeonKernel::new(caps).map(|k| Box::new(k) as Box<dyn MatmulKernel>)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn simd_kernel(_caps: CpuCapabilities) -> Option<Box<dyn MatmulKernel>> {
    None
}

fn check_shapes(a: &[f32], b: &[f32], c: &[f32], n: usize, m: usize, k: usize) {
    assert!(a.len() >= n * m, "A has {} elements, need {}x{}", a.len(), n, m);
    assert!(b.len() >= m * k, "B has {} elements, need {}x{}", b.len(), m, k);
    assert!(c.len() >= n * k, "C has {} elements, need {}x{}", c.len(), n, k);
}

/// Plain triple loop in `i, j, p` order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarKernel;

impl MatmulKernel for ScalarKernel {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn matmul(&self, a: &[f32], b: &[f32], c: &mut [f32], n: usize, m: usize, k: usize) {
        check_shapes(a, b, c, n, m, k);
        for i in 0..n {
            let row = &a[i * m..(i + 1) * m];
            for j in 0..k {
                let mut sum = 0.0f32;
                for (p, &a_ip) in row.iter().enumerate() {
                    sum += a_ip * b[p * k + j];
                }
                c[i * k + j] = sum;
            }
        }
    }
}

/// AVX2/FMA kernel: broadcasts `A[i][p]` and streams row `p` of `B`, eight lanes at a time.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy)]
pub struct Avx2Kernel {
    _private: (),
}

#[cfg(target_arch = "x86_64")]
impl Avx2Kernel {
    /// Only constructible when the probe reports AVX2 and FMA.
    pub fn new(caps: CpuCapabilities) -> Option<Self> {
        caps.has_avx2_fma.then_some(Self { _private: () })
    }
}

#[cfg(target_arch = "x86_64")]
impl MatmulKernel for Avx2Kernel {
    fn name(&self) -> &'static str {
        "avx2-fma"
    }

    fn matmul(&self, a: &[f32], b: &[f32], c: &mut [f32], n: usize, m: usize, k: usize) {
        check_shapes(a, b, c, n, m, k);
        // SAFETY: the kernel only exists when AVX2 and FMA were detected; shapes were checked above.
        unsafe { matmul_avx2(a, b, c, n, m, k) }
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn matmul_avx2(a: &[f32], b: &[f32], c: &mut [f32], n: usize, m: usize, k: usize) {
    use std::arch::x86_64::*;

    const LANES: usize = 8;
    let vec_end = k - k % LANES;

    for i in 0..n {
        let c_row = &mut c[i * k..(i + 1) * k];
        c_row.fill(0.0);

        for p in 0..m {
            let a_ip = a[i * m + p];
            let b_row = &b[p * k..(p + 1) * k];
            let a_vec = _mm256_set1_ps(a_ip);

            let mut j = 0;
            while j < vec_end {
                // SAFETY: j + LANES <= k, both rows hold k elements.
                unsafe {
                    let b_vec = _mm256_loadu_ps(b_row.as_ptr().add(j));
                    let c_vec = _mm256_loadu_ps(c_row.as_ptr().add(j));
                    _mm256_storeu_ps(c_row.as_mut_ptr().add(j), _mm256_fmadd_ps(a_vec, b_vec, c_vec));
                }
                j += LANES;
            }
            for j in vec_end..k {
                c_row[j] += a_ip * b_row[j];
            }
        }
    }
}

/// NEON kernel: same row-broadcast scheme with four lanes.
#[cfg(target_arch = "aarch64")]
#[derive(Debug, Clone, Copy)]
pub struct NeonKernel {
    _private: (),
}

#[cfg(target_arch = "aarch64")]
impl NeonKernel {
    pub fn new(caps: CpuCapabilities) -> Option<Self> {
        caps.has_neon.then_some(Self { _private: () })
    }
}

#[cfg(target_arch = "aarch64")]
impl MatmulKernel for NeonKernel {
    fn name(&self) -> &'static str {
        "neon"
    }

    fn matmul(&self, a: &[f32], b: &[f32], c: &mut [f32], n: usize, m: usize, k: usize) {
        check_shapes(a, b, c, n, m, k);
        // SAFETY: the kernel only exists when NEON was detected; shapes were checked above.
        unsafe { matmul_neon(a, b, c, n, m, k) }
    }
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn matmul_neon(a: &[f32], b: &[f32], c: &mut [f32], n: usize, m: usize, k: usize) {
    use std::arch::aarch64::*;

    const LANES: usize = 4;
    let vec_end = k - k % LANES;

    for i in 0..n {
        let c_row = &mut c[i * k..(i + 1) * k];
        c_row.fill(0.0);

        for p in 0..m {
            let a_ip = a[i * m + p];
            let b_row = &b[p * k..(p + 1) * k];
            let a_vec = vdupq_n_f32(a_ip);

            let mut j = 0;
            while j < vec_end {
                // SAFETY: j + LANES <= k, both rows hold k elements.
                unsafe {
                    let b_vec = vld1q_f32(b_row.as_ptr().add(j));
                    let c_vec = vld1q_f32(c_row.as_ptr().add(j));
                    vst1q_f32(c_row.as_mut_ptr().add(j), vfmaq_f32(c_vec, a_vec, b_vec));
                }
                j += LANES;
            }
            for j in vec_end..k {
                c_row[j] += a_ip * b_row[j];
            }
        }
    }
}

/// `C[n×k] = A[n×m] · B[m×k]` with `B` stored as raw `Q4_0` blocks over its flat row-major index.
///
/// Blocks are dequantized one at a time; each output element accumulates in ascending `p`, the same order
/// as [`ScalarKernel`].
pub fn matmul_q4(a: &[f32], b_q4: &[u8], c: &mut [f32], n: usize, m: usize, k: usize) {
    let total = m * k;
    assert!(a.len() >= n * m, "A has {} elements, need {}x{}", a.len(), n, m);
    assert!(b_q4.len() >= total.div_ceil(QK) * Q4_0_BLOCK_BYTES, "Q4_0 buffer too short for {m}x{k}");
    assert!(c.len() >= n * k, "C has {} elements, need {}x{}", c.len(), n, k);

    c[..n * k].fill(0.0);
    let mut block = [0.0f32; QK];

    for (block_idx, raw) in b_q4.chunks_exact(Q4_0_BLOCK_BYTES).take(total.div_ceil(QK)).enumerate() {
        dequantize_q4_0_block(raw, &mut block);
        let start = block_idx * QK;
        let end = (start + QK).min(total);

        for i in 0..n {
            let a_row = &a[i * m..(i + 1) * m];
            let c_row = &mut c[i * k..(i + 1) * k];
            for (flat, &w) in (start..end).zip(&block) {
                c_row[flat % k] += a_row[flat / k] * w;
            }
        }
    }
}
