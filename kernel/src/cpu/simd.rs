//! SIMD-dispatched fixed-point kernels
//!
//! Hot vector ops for the inference engine: dot product, elementwise
//! add/multiply, matrix-vector multiply, RMSNorm and softmax, all over
//! Q16.16 values. The implementation is picked once at first use from the
//! runtime CPU probe: AVX2 (8 lanes) → SSE2 (4 lanes) → scalar on x86_64,
//! NEON (4 lanes) → scalar on aarch64. Remainders fall through to scalar.
//!
//! All dot products accumulate in i64 before the final `>> 16`.
//!
//! SSE2 has no signed 32×32→64 multiply, so those paths compute the
//! unsigned product and subtract the two's-complement correction
//! `((a<0 ? b : 0) + (b<0 ? a : 0)) << 32` per lane.

use crate::fixed::{self, Fx, FX_SHIFT};
use spin::Once;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdLevel {
    Avx2,
    Sse2,
    Neon,
    Scalar,
}

static LEVEL: Once<SimdLevel> = Once::new();

/// The dispatch level in use (probed once).
pub fn level() -> SimdLevel {
    *LEVEL.call_once(|| {
        let f = crate::cpu::features();
        if f.avx2 {
            SimdLevel::Avx2
        } else if f.sse2 {
            SimdLevel::Sse2
        } else if f.neon {
            SimdLevel::Neon
        } else {
            SimdLevel::Scalar
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Scalar reference kernels
// ═══════════════════════════════════════════════════════════════════════

fn dot_raw_scalar(a: &[Fx], b: &[Fx]) -> i64 {
    let n = a.len().min(b.len());
    let mut acc: i64 = 0;
    for i in 0..n {
        acc = acc.wrapping_add(a[i] as i64 * b[i] as i64);
    }
    acc
}

fn vadd_scalar(out: &mut [Fx], a: &[Fx], b: &[Fx]) {
    for i in 0..out.len() {
        out[i] = a[i].wrapping_add(b[i]);
    }
}

fn vmul_scalar(out: &mut [Fx], a: &[Fx], b: &[Fx]) {
    for i in 0..out.len() {
        out[i] = fixed::fx_mul(a[i], b[i]);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// AVX2 kernels (8 × i32 per iteration)
// ═══════════════════════════════════════════════════════════════════════

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use super::*;
    use core::arch::x86_64::*;

    #[target_feature(enable = "avx2")]
    pub unsafe fn dot_raw(a: &[Fx], b: &[Fx]) -> i64 {
        let n = a.len().min(b.len());
        let ap = a.as_ptr();
        let bp = b.as_ptr();

        let mut acc_e = _mm256_setzero_si256();
        let mut acc_o = _mm256_setzero_si256();

        let chunks = n / 8;
        for i in 0..chunks {
            let va = _mm256_loadu_si256(ap.add(i * 8) as *const __m256i);
            let vb = _mm256_loadu_si256(bp.add(i * 8) as *const __m256i);
            // mul_epi32 sign-extends the low 32 bits of each 64-bit lane
            let even = _mm256_mul_epi32(va, vb);
            let odd = _mm256_mul_epi32(_mm256_srli_epi64::<32>(va), _mm256_srli_epi64::<32>(vb));
            acc_e = _mm256_add_epi64(acc_e, even);
            acc_o = _mm256_add_epi64(acc_o, odd);
        }

        let acc = _mm256_add_epi64(acc_e, acc_o);
        let mut lanes = [0i64; 4];
        _mm256_storeu_si256(lanes.as_mut_ptr() as *mut __m256i, acc);
        let mut sum = lanes[0]
            .wrapping_add(lanes[1])
            .wrapping_add(lanes[2])
            .wrapping_add(lanes[3]);

        for i in chunks * 8..n {
            sum = sum.wrapping_add(*ap.add(i) as i64 * *bp.add(i) as i64);
        }
        sum
    }

    #[target_feature(enable = "avx2")]
    pub unsafe fn vadd(out: &mut [Fx], a: &[Fx], b: &[Fx]) {
        let n = out.len();
        let ap = a.as_ptr();
        let bp = b.as_ptr();
        let op = out.as_mut_ptr();

        let chunks = n / 8;
        for i in 0..chunks {
            let va = _mm256_loadu_si256(ap.add(i * 8) as *const __m256i);
            let vb = _mm256_loadu_si256(bp.add(i * 8) as *const __m256i);
            _mm256_storeu_si256(op.add(i * 8) as *mut __m256i, _mm256_add_epi32(va, vb));
        }
        for i in chunks * 8..n {
            *op.add(i) = (*ap.add(i)).wrapping_add(*bp.add(i));
        }
    }

    #[target_feature(enable = "avx2")]
    pub unsafe fn vmul(out: &mut [Fx], a: &[Fx], b: &[Fx]) {
        let n = out.len();
        let ap = a.as_ptr();
        let bp = b.as_ptr();
        let op = out.as_mut_ptr();

        let lo_mask = _mm256_set1_epi64x(0xFFFF_FFFF);
        let chunks = n / 8;
        for i in 0..chunks {
            let va = _mm256_loadu_si256(ap.add(i * 8) as *const __m256i);
            let vb = _mm256_loadu_si256(bp.add(i * 8) as *const __m256i);

            let even = _mm256_mul_epi32(va, vb);
            let odd = _mm256_mul_epi32(_mm256_srli_epi64::<32>(va), _mm256_srli_epi64::<32>(vb));

            // Bits 16..47 of the product are the Q16.16 result; a logical
            // shift is enough because the repack keeps only the low 32.
            let e16 = _mm256_and_si256(_mm256_srli_epi64::<16>(even), lo_mask);
            let o16 = _mm256_slli_epi64::<32>(_mm256_srli_epi64::<16>(odd));
            _mm256_storeu_si256(op.add(i * 8) as *mut __m256i, _mm256_or_si256(e16, o16));
        }
        for i in chunks * 8..n {
            *op.add(i) = fixed::fx_mul(*ap.add(i), *bp.add(i));
        }
    }

    #[target_feature(enable = "avx2")]
    pub unsafe fn max(v: &[Fx]) -> Fx {
        let n = v.len();
        let vp = v.as_ptr();
        let mut best = v[0];

        let chunks = n / 8;
        if chunks > 0 {
            let mut m = _mm256_loadu_si256(vp as *const __m256i);
            for i in 1..chunks {
                let x = _mm256_loadu_si256(vp.add(i * 8) as *const __m256i);
                m = _mm256_max_epi32(m, x);
            }
            let mut lanes = [0i32; 8];
            _mm256_storeu_si256(lanes.as_mut_ptr() as *mut __m256i, m);
            for &l in &lanes {
                if l > best {
                    best = l;
                }
            }
        }
        for i in chunks * 8..n {
            if *vp.add(i) > best {
                best = *vp.add(i);
            }
        }
        best
    }
}

// ═══════════════════════════════════════════════════════════════════════
// SSE2 kernels (4 × i32 per iteration)
// ═══════════════════════════════════════════════════════════════════════

#[cfg(target_arch = "x86_64")]
mod sse2 {
    use super::*;
    use core::arch::x86_64::*;

    /// Signed 32×32→64 products of the even (0,2) and odd (1,3) lanes.
    #[inline(always)]
    unsafe fn mul_wide(va: __m128i, vb: __m128i) -> (__m128i, __m128i) {
        let pe = _mm_mul_epu32(va, vb);
        let po = _mm_mul_epu32(_mm_srli_epi64::<32>(va), _mm_srli_epi64::<32>(vb));

        let am = _mm_srai_epi32::<31>(va);
        let bm = _mm_srai_epi32::<31>(vb);
        let corr = _mm_add_epi32(_mm_and_si128(am, vb), _mm_and_si128(bm, va));

        // corr lanes [c0,c1,c2,c3]: evens need c0/c2 << 32, odds c1/c3 << 32
        let ce = _mm_slli_epi64::<32>(corr);
        let co = _mm_and_si128(corr, _mm_set1_epi64x(0xFFFF_FFFF_0000_0000u64 as i64));

        (_mm_sub_epi64(pe, ce), _mm_sub_epi64(po, co))
    }

    pub unsafe fn dot_raw(a: &[Fx], b: &[Fx]) -> i64 {
        let n = a.len().min(b.len());
        let ap = a.as_ptr();
        let bp = b.as_ptr();

        let mut acc = _mm_setzero_si128();
        let chunks = n / 4;
        for i in 0..chunks {
            let va = _mm_loadu_si128(ap.add(i * 4) as *const __m128i);
            let vb = _mm_loadu_si128(bp.add(i * 4) as *const __m128i);
            let (se, so) = mul_wide(va, vb);
            acc = _mm_add_epi64(acc, _mm_add_epi64(se, so));
        }

        let mut lanes = [0i64; 2];
        _mm_storeu_si128(lanes.as_mut_ptr() as *mut __m128i, acc);
        let mut sum = lanes[0].wrapping_add(lanes[1]);

        for i in chunks * 4..n {
            sum = sum.wrapping_add(*ap.add(i) as i64 * *bp.add(i) as i64);
        }
        sum
    }

    pub unsafe fn vadd(out: &mut [Fx], a: &[Fx], b: &[Fx]) {
        let n = out.len();
        let ap = a.as_ptr();
        let bp = b.as_ptr();
        let op = out.as_mut_ptr();

        let chunks = n / 4;
        for i in 0..chunks {
            let va = _mm_loadu_si128(ap.add(i * 4) as *const __m128i);
            let vb = _mm_loadu_si128(bp.add(i * 4) as *const __m128i);
            _mm_storeu_si128(op.add(i * 4) as *mut __m128i, _mm_add_epi32(va, vb));
        }
        for i in chunks * 4..n {
            *op.add(i) = (*ap.add(i)).wrapping_add(*bp.add(i));
        }
    }

    pub unsafe fn vmul(out: &mut [Fx], a: &[Fx], b: &[Fx]) {
        let n = out.len();
        let ap = a.as_ptr();
        let bp = b.as_ptr();
        let op = out.as_mut_ptr();

        let lo_mask = _mm_set1_epi64x(0xFFFF_FFFF);
        let chunks = n / 4;
        for i in 0..chunks {
            let va = _mm_loadu_si128(ap.add(i * 4) as *const __m128i);
            let vb = _mm_loadu_si128(bp.add(i * 4) as *const __m128i);
            let (se, so) = mul_wide(va, vb);

            let e16 = _mm_and_si128(_mm_srli_epi64::<16>(se), lo_mask);
            let o16 = _mm_slli_epi64::<32>(_mm_srli_epi64::<16>(so));
            _mm_storeu_si128(op.add(i * 4) as *mut __m128i, _mm_or_si128(e16, o16));
        }
        for i in chunks * 4..n {
            *op.add(i) = fixed::fx_mul(*ap.add(i), *bp.add(i));
        }
    }

    pub unsafe fn max(v: &[Fx]) -> Fx {
        let n = v.len();
        let vp = v.as_ptr();
        let mut best = v[0];

        let chunks = n / 4;
        if chunks > 0 {
            let mut m = _mm_loadu_si128(vp as *const __m128i);
            for i in 1..chunks {
                let x = _mm_loadu_si128(vp.add(i * 4) as *const __m128i);
                // SSE2 has no signed 32-bit max: select via compare mask
                let gt = _mm_cmpgt_epi32(x, m);
                m = _mm_or_si128(_mm_and_si128(gt, x), _mm_andnot_si128(gt, m));
            }
            let mut lanes = [0i32; 4];
            _mm_storeu_si128(lanes.as_mut_ptr() as *mut __m128i, m);
            for &l in &lanes {
                if l > best {
                    best = l;
                }
            }
        }
        for i in chunks * 4..n {
            if *vp.add(i) > best {
                best = *vp.add(i);
            }
        }
        best
    }
}

// ═══════════════════════════════════════════════════════════════════════
// NEON kernels (4 × i32 per iteration)
// ═══════════════════════════════════════════════════════════════════════

#[cfg(target_arch = "aarch64")]
mod neon {
    use super::*;
    use core::arch::aarch64::*;

    pub unsafe fn dot_raw(a: &[Fx], b: &[Fx]) -> i64 {
        let n = a.len().min(b.len());
        let ap = a.as_ptr();
        let bp = b.as_ptr();

        let mut acc = vdupq_n_s64(0);
        let chunks = n / 4;
        for i in 0..chunks {
            let va = vld1q_s32(ap.add(i * 4));
            let vb = vld1q_s32(bp.add(i * 4));
            acc = vaddq_s64(acc, vmull_s32(vget_low_s32(va), vget_low_s32(vb)));
            acc = vaddq_s64(acc, vmull_s32(vget_high_s32(va), vget_high_s32(vb)));
        }
        let mut sum = vaddvq_s64(acc);

        for i in chunks * 4..n {
            sum = sum.wrapping_add(*ap.add(i) as i64 * *bp.add(i) as i64);
        }
        sum
    }

    pub unsafe fn vadd(out: &mut [Fx], a: &[Fx], b: &[Fx]) {
        let n = out.len();
        let ap = a.as_ptr();
        let bp = b.as_ptr();
        let op = out.as_mut_ptr();

        let chunks = n / 4;
        for i in 0..chunks {
            let va = vld1q_s32(ap.add(i * 4));
            let vb = vld1q_s32(bp.add(i * 4));
            vst1q_s32(op.add(i * 4), vaddq_s32(va, vb));
        }
        for i in chunks * 4..n {
            *op.add(i) = (*ap.add(i)).wrapping_add(*bp.add(i));
        }
    }

    pub unsafe fn vmul(out: &mut [Fx], a: &[Fx], b: &[Fx]) {
        let n = out.len();
        let ap = a.as_ptr();
        let bp = b.as_ptr();
        let op = out.as_mut_ptr();

        let chunks = n / 4;
        for i in 0..chunks {
            let va = vld1q_s32(ap.add(i * 4));
            let vb = vld1q_s32(bp.add(i * 4));
            let lo = vshrq_n_s64::<16>(vmull_s32(vget_low_s32(va), vget_low_s32(vb)));
            let hi = vshrq_n_s64::<16>(vmull_s32(vget_high_s32(va), vget_high_s32(vb)));
            vst1q_s32(op.add(i * 4), vcombine_s32(vmovn_s64(lo), vmovn_s64(hi)));
        }
        for i in chunks * 4..n {
            *op.add(i) = fixed::fx_mul(*ap.add(i), *bp.add(i));
        }
    }

    pub unsafe fn max(v: &[Fx]) -> Fx {
        let n = v.len();
        let vp = v.as_ptr();
        let mut best = v[0];

        let chunks = n / 4;
        if chunks > 0 {
            let mut m = vld1q_s32(vp);
            for i in 1..chunks {
                m = vmaxq_s32(m, vld1q_s32(vp.add(i * 4)));
            }
            let lane_max = vmaxvq_s32(m);
            if lane_max > best {
                best = lane_max;
            }
        }
        for i in chunks * 4..n {
            if *vp.add(i) > best {
                best = *vp.add(i);
            }
        }
        best
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Dispatch surface
// ═══════════════════════════════════════════════════════════════════════

/// Raw i64 dot product (no final shift) — used by RMSNorm and the codec.
pub fn dot_raw(a: &[Fx], b: &[Fx]) -> i64 {
    match level() {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => unsafe { avx2::dot_raw(a, b) },
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse2 => unsafe { sse2::dot_raw(a, b) },
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => unsafe { neon::dot_raw(a, b) },
        _ => dot_raw_scalar(a, b),
    }
}

/// Q16.16 dot product: `(Σ a[i]·b[i]) >> 16` with i64 accumulation.
pub fn dot(a: &[Fx], b: &[Fx]) -> Fx {
    (dot_raw(a, b) >> FX_SHIFT) as Fx
}

/// Elementwise wrapping add.
pub fn vadd(out: &mut [Fx], a: &[Fx], b: &[Fx]) {
    debug_assert!(a.len() >= out.len() && b.len() >= out.len());
    match level() {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => unsafe { avx2::vadd(out, a, b) },
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse2 => unsafe { sse2::vadd(out, a, b) },
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => unsafe { neon::vadd(out, a, b) },
        _ => vadd_scalar(out, a, b),
    }
}

/// Elementwise Q16.16 multiply.
pub fn vmul(out: &mut [Fx], a: &[Fx], b: &[Fx]) {
    debug_assert!(a.len() >= out.len() && b.len() >= out.len());
    match level() {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => unsafe { avx2::vmul(out, a, b) },
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse2 => unsafe { sse2::vmul(out, a, b) },
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => unsafe { neon::vmul(out, a, b) },
        _ => vmul_scalar(out, a, b),
    }
}

/// Row-major matrix-vector multiply: `out[r] = Σ_c w[r·cols + c] · x[c]`.
pub fn matvec(out: &mut [Fx], w: &[Fx], x: &[Fx], rows: usize, cols: usize) {
    debug_assert!(out.len() >= rows && w.len() >= rows * cols && x.len() >= cols);
    for r in 0..rows {
        let row = &w[r * cols..r * cols + cols];
        out[r] = dot(row, &x[..cols]);
    }
}

/// RMSNorm with SIMD sum-of-squares.
pub fn rmsnorm(out: &mut [Fx], x: &[Fx], weight: &[Fx], eps: Fx) {
    let n = x.len();
    if n == 0 {
        return;
    }
    let acc = dot_raw(x, x);
    let mean_sq = ((acc / n as i64) >> FX_SHIFT) as Fx;
    let inv_rms = fixed::fx_inv_sqrt(mean_sq.saturating_add(eps));
    for i in 0..n {
        out[i] = fixed::fx_mul(fixed::fx_mul(x[i], inv_rms), weight[i]);
    }
}

/// In-place softmax; the max scan is vectorized, exponentiation is scalar.
pub fn softmax(v: &mut [Fx]) {
    if v.is_empty() {
        return;
    }
    let max = match level() {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => unsafe { avx2::max(v) },
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse2 => unsafe { sse2::max(v) },
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => unsafe { neon::max(v) },
        _ => {
            let mut m = v[0];
            for &x in v.iter() {
                if x > m {
                    m = x;
                }
            }
            m
        }
    };

    let mut sum: i64 = 0;
    for &x in v.iter() {
        sum += fixed::fx_exp(x.wrapping_sub(max)) as i64;
    }
    if sum == 0 {
        return;
    }
    for x in v.iter_mut() {
        let e = fixed::fx_exp(x.wrapping_sub(max)) as i64;
        *x = ((e << FX_SHIFT) / sum) as Fx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::FX_ONE;
    use alloc::vec::Vec;

    fn test_vec(n: usize, seed: u64) -> Vec<Fx> {
        let mut s = seed | 1;
        (0..n)
            .map(|_| {
                s ^= s << 13;
                s ^= s >> 7;
                s ^= s << 17;
                // keep magnitudes in ±4.0 so dot sums stay well-formed
                ((s as i64 % (4 * FX_ONE as i64)) - 2 * FX_ONE as i64) as Fx
            })
            .collect()
    }

    #[test]
    fn dot_matches_scalar_all_lengths() {
        for n in [0usize, 1, 3, 4, 7, 8, 15, 16, 33, 64, 257] {
            let a = test_vec(n, 0x1234_5678);
            let b = test_vec(n, 0x9abc_def0);
            let want = dot_raw_scalar(&a, &b);
            let got = dot_raw(&a, &b);
            assert_eq!(got, want, "n = {n}, level = {:?}", level());
        }
    }

    #[test]
    fn dot_negative_heavy() {
        // Stress the SSE2 sign-correction: all-negative and mixed lanes
        let a: Vec<Fx> = (0..64).map(|i| -FX_ONE * (i + 1) / 7).collect();
        let b: Vec<Fx> = (0..64)
            .map(|i| if i % 2 == 0 { -3 * FX_ONE } else { 2 * FX_ONE })
            .collect();
        assert_eq!(dot_raw(&a, &b), dot_raw_scalar(&a, &b));
    }

    #[test]
    fn vadd_matches_scalar() {
        for n in [1usize, 5, 8, 19, 128] {
            let a = test_vec(n, 11);
            let b = test_vec(n, 23);
            let mut want = alloc::vec![0; n];
            let mut got = alloc::vec![0; n];
            vadd_scalar(&mut want, &a, &b);
            vadd(&mut got, &a, &b);
            assert_eq!(got, want, "n = {n}");
        }
    }

    #[test]
    fn vmul_matches_scalar() {
        for n in [1usize, 4, 7, 8, 31, 100] {
            let a = test_vec(n, 777);
            let b = test_vec(n, 999);
            let mut want = alloc::vec![0; n];
            let mut got = alloc::vec![0; n];
            vmul_scalar(&mut want, &a, &b);
            vmul(&mut got, &a, &b);
            assert_eq!(got, want, "n = {n}");
        }
    }

    #[test]
    fn matvec_small_known() {
        // 2×3 matrix times vector, hand-checked
        let w = [
            FX_ONE, 2 * FX_ONE, 3 * FX_ONE, //
            -FX_ONE, 0, FX_ONE / 2,
        ];
        let x = [FX_ONE, FX_ONE, 2 * FX_ONE];
        let mut out = [0; 2];
        matvec(&mut out, &w, &x, 2, 3);
        assert_eq!(out[0], 9 * FX_ONE); // 1 + 2 + 6
        assert_eq!(out[1], 0); // -1 + 0 + 1
    }

    #[test]
    fn softmax_sums_to_one() {
        let mut v = test_vec(40, 31);
        softmax(&mut v);
        let sum: i64 = v.iter().map(|&x| x as i64).sum();
        assert!((sum - FX_ONE as i64).abs() < 128, "sum = {sum}");
        assert!(v.iter().all(|&x| x >= 0));
    }

    #[test]
    fn rmsnorm_matches_reference() {
        let x = test_vec(96, 5);
        let w = alloc::vec![FX_ONE; 96];
        let mut got = alloc::vec![0; 96];
        let mut want = alloc::vec![0; 96];
        rmsnorm(&mut got, &x, &w, 7);
        fixed::fx_rmsnorm(&mut want, &x, &w, 7);
        assert_eq!(got, want);
    }
}
