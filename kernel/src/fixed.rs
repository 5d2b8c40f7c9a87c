//! Q16.16 fixed-point core
//!
//! All neural ops in the kernel run on `Fx` (signed 32-bit, 16 integer and
//! 16 fractional bits). No floating point at steady state: F16/F32 tensor
//! data is converted once at load time. Multiplication widens to 64 bits
//! before the shift; overflow wraps; division by zero yields 0.

use alloc::vec::Vec;

/// Q16.16 fixed-point value.
pub type Fx = i32;

pub const FX_SHIFT: u32 = 16;
pub const FX_ONE: Fx = 1 << FX_SHIFT;
pub const FX_HALF: Fx = FX_ONE / 2;

/// π and 2π in Q16.16.
pub const FX_PI: Fx = 205_887; // 3.14159265 * 65536
pub const FX_TAU: Fx = 411_775;

/// Number of entries in each activation lookup table.
pub const LUT_SIZE: usize = 256;

// ═══════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════

#[inline(always)]
pub const fn fx_from_int(v: i32) -> Fx {
    v.wrapping_shl(FX_SHIFT)
}

/// Truncating downcast to the integer part.
#[inline(always)]
pub const fn fx_to_int(v: Fx) -> i32 {
    v >> FX_SHIFT
}

/// Compile-time float constant lift (load-time only).
#[inline(always)]
pub fn fx_from_f32(v: f32) -> Fx {
    (v * FX_ONE as f32) as Fx
}

#[inline(always)]
pub fn fx_to_f32(v: Fx) -> f32 {
    v as f32 / FX_ONE as f32
}

// ═══════════════════════════════════════════════════════════════════════
// Arithmetic
// ═══════════════════════════════════════════════════════════════════════

/// `(a · b) >> 16` with a 64-bit intermediate. Wraps on overflow.
#[inline(always)]
pub const fn fx_mul(a: Fx, b: Fx) -> Fx {
    ((a as i64 * b as i64) >> FX_SHIFT) as Fx
}

/// `(a << 16) / b`; returns 0 when `b == 0`. Wraps on overflow.
#[inline(always)]
pub const fn fx_div(a: Fx, b: Fx) -> Fx {
    if b == 0 {
        return 0;
    }
    (((a as i64) << FX_SHIFT) / b as i64) as Fx
}

#[inline(always)]
pub const fn fx_abs(v: Fx) -> Fx {
    if v < 0 { v.wrapping_neg() } else { v }
}

#[inline(always)]
pub const fn fx_clamp(v: Fx, lo: Fx, hi: Fx) -> Fx {
    if v < lo { lo } else if v > hi { hi } else { v }
}

/// Square root via 8 Newton-Raphson iterations from `x >> 1`.
pub fn fx_sqrt(x: Fx) -> Fx {
    if x <= 0 {
        return 0;
    }
    let mut g = x >> 1;
    if g == 0 {
        g = 1;
    }
    for _ in 0..8 {
        let q = fx_div(x, g);
        g = (g + q) >> 1;
        if g == 0 {
            return 0;
        }
    }
    g
}

/// Exponential. Clamps the argument to [-10, 10], scales by 1/16,
/// evaluates the 5-term Taylor polynomial, then squares four times.
pub fn fx_exp(x: Fx) -> Fx {
    let x = fx_clamp(x, -10 * FX_ONE, 10 * FX_ONE);
    let y = x >> 4;

    // 1 + y + y²/2 + y³/6 + y⁴/24
    let y2 = fx_mul(y, y);
    let y3 = fx_mul(y2, y);
    let y4 = fx_mul(y3, y);
    let mut r = FX_ONE + y + y2 / 2 + y3 / 6 + y4 / 24;

    for _ in 0..4 {
        r = fx_mul(r, r);
    }
    r
}

/// sin(x) — wraps to [-π, π], 7th-order Taylor.
pub fn fx_sin(x: Fx) -> Fx {
    // Range-reduce in 64 bits so large angles don't wrap the i32.
    let mut a = (x as i64) % FX_TAU as i64;
    if a > FX_PI as i64 {
        a -= FX_TAU as i64;
    } else if a < -(FX_PI as i64) {
        a += FX_TAU as i64;
    }
    let x = a as Fx;

    let x2 = fx_mul(x, x);
    let x3 = fx_mul(x, x2);
    let x5 = fx_mul(x3, x2);
    let x7 = fx_mul(x5, x2);
    x - x3 / 6 + x5 / 120 - x7 / 5040
}

/// cos(x) = sin(x + π/2)
#[inline]
pub fn fx_cos(x: Fx) -> Fx {
    fx_sin(x.wrapping_add(FX_PI / 2))
}

// ═══════════════════════════════════════════════════════════════════════
// Softmax / RMSNorm (scalar reference forms)
// ═══════════════════════════════════════════════════════════════════════

/// In-place softmax with max subtraction. If the exponential sum is zero
/// the slice is left untouched.
pub fn fx_softmax(v: &mut [Fx]) {
    if v.is_empty() {
        return;
    }
    let mut max = v[0];
    for &x in v.iter() {
        if x > max {
            max = x;
        }
    }

    let mut sum: i64 = 0;
    for &x in v.iter() {
        sum += fx_exp(x.wrapping_sub(max)) as i64;
    }
    if sum == 0 {
        return;
    }

    for x in v.iter_mut() {
        let e = fx_exp(x.wrapping_sub(max)) as i64;
        *x = ((e << FX_SHIFT) / sum) as Fx;
    }
}

/// Reciprocal square root: one Newton-Raphson step from the initial guess
/// `2 / (v + 1)`, with the argument prescaled into [0.5, 2) by powers of
/// four so the guess stays inside the step's convergence basin.
pub fn fx_inv_sqrt(v: Fx) -> Fx {
    if v <= 0 {
        return 0;
    }
    // v = m · 4^k  ⇒  1/√v = (1/√m) · 2^-k
    let mut m = v;
    let mut k: i32 = 0;
    while m >= 2 * FX_ONE {
        m >>= 2;
        k += 1;
    }
    while m < FX_HALF {
        m <<= 2;
        k -= 1;
    }

    let y0 = fx_div(2 * FX_ONE, m + FX_ONE);
    // y1 = y0 · (3 − m·y0²) / 2
    let y2 = fx_mul(m, fx_mul(y0, y0));
    let y1 = fx_mul(y0, 3 * FX_ONE - y2) >> 1;

    if k >= 0 { y1 >> k } else { y1 << (-k) }
}

/// RMS normalization: `out[i] = x[i] · (1/rms) · weight[i]`, with the mean
/// of squares accumulated in 64 bits.
pub fn fx_rmsnorm(out: &mut [Fx], x: &[Fx], weight: &[Fx], eps: Fx) {
    let n = x.len();
    if n == 0 {
        return;
    }
    debug_assert!(out.len() >= n && weight.len() >= n);

    let mut acc: i64 = 0;
    for &v in x.iter() {
        acc += v as i64 * v as i64;
    }
    let mean_sq = ((acc / n as i64) >> FX_SHIFT) as Fx;

    let inv_rms = fx_inv_sqrt(mean_sq.saturating_add(eps));
    for i in 0..n {
        out[i] = fx_mul(fx_mul(x[i], inv_rms), weight[i]);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Activation lookup tables (256 entries, Q1.15)
// ═══════════════════════════════════════════════════════════════════════

pub const SIGMOID_LO: Fx = -8 * FX_ONE;
pub const SIGMOID_HI: Fx = 8 * FX_ONE;
pub const TANH_LO: Fx = -4 * FX_ONE;
pub const TANH_HI: Fx = 4 * FX_ONE;
pub const EXP_LO: Fx = -8 * FX_ONE;
pub const EXP_HI: Fx = 0;

fn build_lut(lo: Fx, hi: Fx, f: impl Fn(Fx) -> Fx) -> Vec<i16> {
    let span = (hi - lo) as i64;
    let mut t = Vec::with_capacity(LUT_SIZE);
    for i in 0..LUT_SIZE {
        let x = lo + ((span * i as i64) / (LUT_SIZE as i64 - 1)) as Fx;
        let v = f(x);
        // Q16.16 → Q1.15
        let q15 = fx_clamp(v >> 1, -32768, 32767);
        t.push(q15 as i16);
    }
    t
}

fn sigmoid_ref(x: Fx) -> Fx {
    // 1 / (1 + e^-x)
    fx_div(FX_ONE, FX_ONE.saturating_add(fx_exp(-x)))
}

fn tanh_ref(x: Fx) -> Fx {
    // 2·σ(2x) − 1
    2 * sigmoid_ref(x.saturating_mul(2).min(8 * FX_ONE).max(-8 * FX_ONE)) - FX_ONE
}

lazy_static::lazy_static! {
    static ref SIGMOID_LUT: Vec<i16> = build_lut(SIGMOID_LO, SIGMOID_HI, sigmoid_ref);
    static ref TANH_LUT: Vec<i16> = build_lut(TANH_LO, TANH_HI, tanh_ref);
    static ref EXP_LUT: Vec<i16> = build_lut(EXP_LO, EXP_HI, fx_exp);
}

#[inline]
fn lut_lookup(t: &[i16], lo: Fx, hi: Fx, x: Fx) -> Fx {
    let x = fx_clamp(x, lo, hi);
    let span = (hi - lo) as i64;
    let idx = (((x - lo) as i64 * (LUT_SIZE as i64 - 1)) / span) as usize;
    // Q1.15 → Q16.16
    (t[idx] as Fx) << 1
}

/// Table sigmoid over x ∈ [-8, 8]; saturates outside the domain.
pub fn fx_sigmoid(x: Fx) -> Fx {
    lut_lookup(&SIGMOID_LUT, SIGMOID_LO, SIGMOID_HI, x)
}

/// Table tanh over x ∈ [-4, 4]; saturates outside the domain.
pub fn fx_tanh(x: Fx) -> Fx {
    lut_lookup(&TANH_LUT, TANH_LO, TANH_HI, x)
}

/// Table exp over x ∈ [-8, 0]; saturates outside the domain.
pub fn fx_exp_lut(x: Fx) -> Fx {
    lut_lookup(&EXP_LUT, EXP_LO, EXP_HI, x)
}

/// SiLU: `x · σ(x)` — the FFN gate activation.
#[inline]
pub fn fx_silu(x: Fx) -> Fx {
    fx_mul(x, fx_sigmoid(x))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_matches_wide_reference() {
        let cases: [(Fx, Fx); 6] = [
            (FX_ONE, FX_ONE),
            (3 * FX_ONE / 2, -5 * FX_ONE),
            (-FX_ONE / 3, -FX_ONE / 7),
            (123_456, 789),
            (-98_765, 43_210),
            (FX_ONE / 2, FX_ONE / 2),
        ];
        for (a, b) in cases {
            let exact = (a as i64 * b as i64) as f64 / 65536.0;
            let got = fx_mul(a, b) as f64;
            assert!(
                (got - exact).abs() <= 1.0,
                "fx_mul({a},{b}) = {got}, want ~{exact}"
            );
        }
    }

    #[test]
    fn div_by_zero_is_zero() {
        assert_eq!(fx_div(12345, 0), 0);
        assert_eq!(fx_div(0, 0), 0);
        assert_eq!(fx_div(-FX_ONE, 0), 0);
    }

    #[test]
    fn div_round_trip() {
        let a = 7 * FX_ONE;
        let b = 2 * FX_ONE;
        assert_eq!(fx_div(a, b), 7 * FX_ONE / 2);
    }

    #[test]
    fn sqrt_converges() {
        // √4 = 2, √1 = 1, √0.25 = 0.5
        let s4 = fx_sqrt(4 * FX_ONE);
        assert!((s4 - 2 * FX_ONE).abs() < 64, "sqrt(4) = {s4}");
        let s1 = fx_sqrt(FX_ONE);
        assert!((s1 - FX_ONE).abs() < 64, "sqrt(1) = {s1}");
        let sq = fx_sqrt(FX_ONE / 4);
        assert!((sq - FX_ONE / 2).abs() < 64, "sqrt(0.25) = {sq}");
        assert_eq!(fx_sqrt(0), 0);
        assert_eq!(fx_sqrt(-FX_ONE), 0);
    }

    #[test]
    fn exp_sane() {
        let e0 = fx_exp(0);
        assert!((e0 - FX_ONE).abs() < 256, "exp(0) = {e0}");
        let e1 = fx_exp(FX_ONE);
        let want = fx_from_f32(2.71828);
        assert!((e1 - want).abs() < want / 50, "exp(1) = {e1}");
        let em2 = fx_exp(-2 * FX_ONE);
        let want = fx_from_f32(0.13534);
        assert!((em2 - want).abs() < 512, "exp(-2) = {em2}");
        // Clamped domain
        assert!(fx_exp(-100 * FX_ONE) < 16);
    }

    #[test]
    fn softmax_normalizes() {
        let mut v = [FX_ONE, 2 * FX_ONE, 3 * FX_ONE, 0];
        fx_softmax(&mut v);
        let sum: i64 = v.iter().map(|&x| x as i64).sum();
        assert!((sum - FX_ONE as i64).abs() < 64, "sum = {sum}");
        assert!(v[2] > v[1] && v[1] > v[0] && v[0] > v[3]);
    }

    #[test]
    fn softmax_empty_is_noop() {
        let mut v: [Fx; 0] = [];
        fx_softmax(&mut v);
    }

    #[test]
    fn rmsnorm_unit_weight_normalizes() {
        // Property: after rms_norm with weight = 1, mean(x²) ≈ 1 within 0.3.
        let scales = [FX_ONE / 2, FX_ONE, 3 * FX_ONE, 10 * FX_ONE];
        for &s in &scales {
            let x: Vec<Fx> = (0..64)
                .map(|i| fx_mul(((i % 13) as Fx - 6) * FX_ONE / 6, s))
                .collect();
            let w = alloc::vec![FX_ONE; 64];
            let mut out = alloc::vec![0; 64];
            fx_rmsnorm(&mut out, &x, &w, 7); // eps ≈ 1e-4 in Q16.16
            let mut acc: i64 = 0;
            for &v in &out {
                acc += v as i64 * v as i64;
            }
            let mean_sq = (acc / 64) as f64 / (65536.0 * 65536.0);
            assert!(
                (mean_sq - 1.0).abs() < 0.3,
                "scale {s}: mean(x²) = {mean_sq}"
            );
        }
    }

    #[test]
    fn sin_cos_identity() {
        // The truncated Taylor series is weakest near |x| ≈ π·0.8, where
        // the x⁹/9! term reaches a few percent; 4096 ULPs (≈ 0.0625)
        // bounds that comfortably.
        for i in -20..20 {
            let x = i * FX_ONE / 3;
            let s = fx_sin(x);
            let c = fx_cos(x);
            let one = fx_mul(s, s) + fx_mul(c, c);
            assert!(
                (one - FX_ONE).abs() < 4096,
                "sin²+cos² at {x} = {one}"
            );
        }
    }

    #[test]
    fn sigmoid_lut_shape() {
        assert!(fx_sigmoid(-100 * FX_ONE) < FX_ONE / 100); // saturates low
        let mid = fx_sigmoid(0);
        assert!((mid - FX_HALF).abs() < 2048, "σ(0) = {mid}");
        assert!(fx_sigmoid(100 * FX_ONE) > FX_ONE * 98 / 100); // saturates high
        // Monotone
        assert!(fx_sigmoid(FX_ONE) > fx_sigmoid(-FX_ONE));
    }

    #[test]
    fn tanh_lut_shape() {
        assert!(fx_tanh(0).abs() < 2048);
        assert!(fx_tanh(4 * FX_ONE) > FX_ONE * 9 / 10);
        assert!(fx_tanh(-4 * FX_ONE) < -FX_ONE * 9 / 10);
    }

    #[test]
    fn exp_lut_shape() {
        let e0 = fx_exp_lut(0);
        assert!((e0 - FX_ONE).abs() < 2048, "exp_lut(0) = {e0}");
        assert!(fx_exp_lut(-8 * FX_ONE) < FX_ONE / 100);
        // Saturation outside domain
        assert_eq!(fx_exp_lut(5 * FX_ONE), fx_exp_lut(0));
    }

    #[test]
    fn conversions() {
        assert_eq!(fx_from_int(3), 3 * FX_ONE);
        assert_eq!(fx_to_int(fx_from_int(-7)), -7);
        assert_eq!(fx_to_int(FX_ONE + FX_HALF), 1);
        assert!((fx_to_f32(fx_from_f32(1.5)) - 1.5).abs() < 1e-4);
    }
}
