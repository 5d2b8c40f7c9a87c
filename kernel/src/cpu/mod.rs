//! CPU capability detection
//!
//! Runtime feature probe, done once at boot and cached. The SIMD dispatcher
//! and the timer both key off this instead of compile-time `#ifdef` ladders.

pub mod simd;
pub mod tsc;

use spin::Once;

/// CPU features the core cares about.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuFeatures {
    // Timing
    pub tsc: bool,
    pub rdtscp: bool,
    pub tsc_invariant: bool,

    // SIMD
    pub sse2: bool,
    pub sse4_1: bool,
    pub avx: bool,
    pub avx2: bool,
    pub neon: bool,
}

static FEATURES: Once<CpuFeatures> = Once::new();

/// Detect (once) and return the cached feature set.
pub fn features() -> &'static CpuFeatures {
    FEATURES.call_once(detect)
}

#[cfg(target_arch = "x86_64")]
fn detect() -> CpuFeatures {
    use core::arch::x86_64::{__cpuid, __cpuid_count};

    let mut f = CpuFeatures::default();

    let leaf0 = unsafe { __cpuid(0) };
    let max_basic = leaf0.eax;

    if max_basic >= 1 {
        let leaf1 = unsafe { __cpuid(1) };
        f.tsc = leaf1.edx & (1 << 4) != 0;
        f.sse2 = leaf1.edx & (1 << 26) != 0;
        f.sse4_1 = leaf1.ecx & (1 << 19) != 0;
        f.avx = leaf1.ecx & (1 << 28) != 0;
    }

    if max_basic >= 7 {
        let leaf7 = unsafe { __cpuid_count(7, 0) };
        f.avx2 = f.avx && leaf7.ebx & (1 << 5) != 0;
    }

    let ext0 = unsafe { __cpuid(0x8000_0000) };
    if ext0.eax >= 0x8000_0001 {
        let ext1 = unsafe { __cpuid(0x8000_0001) };
        f.rdtscp = ext1.edx & (1 << 27) != 0;
    }
    if ext0.eax >= 0x8000_0007 {
        let ext7 = unsafe { __cpuid(0x8000_0007) };
        f.tsc_invariant = ext7.edx & (1 << 8) != 0;
    }

    f
}

#[cfg(target_arch = "aarch64")]
fn detect() -> CpuFeatures {
    // NEON (AdvSIMD) and the generic counter are architectural on aarch64.
    CpuFeatures {
        tsc: true,
        tsc_invariant: true,
        neon: true,
        ..CpuFeatures::default()
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect() -> CpuFeatures {
    CpuFeatures::default()
}

/// Log the detected feature set.
pub fn init() {
    let f = features();
    crate::log!(
        "[CPU] tsc={} rdtscp={} invariant={} sse2={} avx2={} neon={}",
        f.tsc, f.rdtscp, f.tsc_invariant, f.sse2, f.avx2, f.neon
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_is_stable() {
        let a = *features();
        let b = *features();
        assert_eq!(a.sse2, b.sse2);
        assert_eq!(a.avx2, b.avx2);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x86_64_baseline_has_sse2() {
        assert!(features().sse2);
        assert!(features().tsc);
    }
}
