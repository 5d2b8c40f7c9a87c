//! Kernel-space test harness
//!
//! On-target self tests: cases register themselves (or arrive as static
//! suites), `run_all` executes everything and reports over the console.
//! Host builds use `cargo test`; this harness is what runs on bare metal.

use alloc::vec::Vec;
use spin::Mutex;

pub type KtestFn = fn() -> Result<(), &'static str>;

#[derive(Clone, Copy)]
pub struct KtestCase {
    pub name: &'static str,
    pub run: KtestFn,
}

lazy_static::lazy_static! {
    static ref REGISTRY: Mutex<Vec<KtestCase>> = Mutex::new(Vec::new());
}

/// Fail the current test unless `cond` holds.
#[macro_export]
macro_rules! kassert {
    ($cond:expr) => {
        if !$cond {
            return Err(concat!("assertion failed: ", stringify!($cond)));
        }
    };
}

/// Fail the current test unless both sides compare equal.
#[macro_export]
macro_rules! kassert_eq {
    ($a:expr, $b:expr) => {
        if $a != $b {
            return Err(concat!(
                "not equal: ",
                stringify!($a),
                " vs ",
                stringify!($b)
            ));
        }
    };
}

/// Register a single case.
pub fn register(name: &'static str, run: KtestFn) {
    REGISTRY.lock().push(KtestCase { name, run });
}

/// Register a whole suite.
pub fn register_suite(cases: &[KtestCase]) {
    REGISTRY.lock().extend_from_slice(cases);
}

pub fn registered_count() -> usize {
    REGISTRY.lock().len()
}

/// Run a list of cases, logging each result. Returns (passed, failed).
pub fn run_cases(cases: &[KtestCase]) -> (usize, usize) {
    let mut passed = 0;
    let mut failed = 0;
    for case in cases {
        match (case.run)() {
            Ok(()) => {
                crate::log!("[KTEST] {} ... PASS", case.name);
                passed += 1;
            }
            Err(msg) => {
                crate::log_error!("[KTEST] {} ... FAIL: {}", case.name, msg);
                failed += 1;
            }
        }
    }
    (passed, failed)
}

/// Run every registered case. Returns (passed, failed).
pub fn run_all() -> (usize, usize) {
    let cases: Vec<KtestCase> = REGISTRY.lock().clone();
    let (passed, failed) = run_cases(&cases);
    crate::log!("[KTEST] total: {} passed, {} failed", passed, failed);
    (passed, failed)
}

/// Built-in on-target suites covering the subsystems that need no
/// hardware. The boot path registers these before calling [`run_all`].
pub mod builtin {
    use super::KtestCase;
    use crate::fixed::{self, Fx, FX_HALF, FX_ONE};
    use crate::kvcache::{EvictionPolicy, KvCache, KvCacheConfig, KvElemType};
    use crate::quant::{self, GgmlType};
    use alloc::vec;

    fn fixed_point_arithmetic() -> Result<(), &'static str> {
        kassert_eq!(fixed::fx_mul(2 * FX_ONE, 3 * FX_ONE), 6 * FX_ONE);
        kassert_eq!(fixed::fx_div(FX_ONE, 0), 0);
        kassert_eq!(fixed::fx_div(6 * FX_ONE, 2 * FX_ONE), 3 * FX_ONE);
        let s = fixed::fx_sqrt(9 * FX_ONE);
        kassert!((s - 3 * FX_ONE).abs() < 128);
        Ok(())
    }

    fn fixed_point_softmax() -> Result<(), &'static str> {
        let mut v = [FX_ONE, 0, -FX_ONE, FX_HALF];
        fixed::fx_softmax(&mut v);
        let sum: i64 = v.iter().map(|&x| x as i64).sum();
        kassert!((sum - FX_ONE as i64).abs() < 128);
        kassert!(v[0] > v[3] && v[3] > v[1] && v[1] > v[2]);
        Ok(())
    }

    fn simd_matches_scalar() -> Result<(), &'static str> {
        let a: vec::Vec<Fx> = (0..65).map(|i| (i - 32) * 1000).collect();
        let b: vec::Vec<Fx> = (0..65).map(|i| (37 - i) * 777).collect();
        let mut scalar: i64 = 0;
        for i in 0..65 {
            scalar += a[i] as i64 * b[i] as i64;
        }
        kassert_eq!(crate::cpu::simd::dot_raw(&a, &b), scalar);
        Ok(())
    }

    fn quant_q8_0_roundtrip() -> Result<(), &'static str> {
        let mut blk = vec![0u8; quant::BLOCK_Q8_0_BYTES];
        blk[0] = 0x00;
        blk[1] = 0x01; // scale 1.0 in Q8.8
        blk[2] = 64;
        let mut out = vec![0 as Fx; 32];
        if quant::dequantize(GgmlType::Q8_0, &blk, &mut out, 32).is_err() {
            return Err("q8_0 dequantize failed");
        }
        kassert_eq!(out[0], FX_HALF);
        kassert_eq!(out[1], 0);
        Ok(())
    }

    fn kv_cache_bounds() -> Result<(), &'static str> {
        let cfg = KvCacheConfig {
            n_layers: 1,
            n_kv_heads: 1,
            head_dim: 4,
            max_seq_len: 2,
            elem: KvElemType::Fixed,
            policy: EvictionPolicy::None,
            window: 0,
        };
        let mut cache = match KvCache::create(cfg) {
            Ok(c) => c,
            Err(_) => return Err("kv cache create failed"),
        };
        let v = [0u8; 16];
        kassert!(cache.store(0, 0, &v, &v).is_ok());
        kassert!(cache.store(0, 1, &v, &v).is_ok());
        kassert!(cache.store(0, 2, &v, &v).is_err());
        Ok(())
    }

    fn timer_monotonic() -> Result<(), &'static str> {
        let mut prev = crate::cpu::tsc::read_cycles();
        for _ in 0..1000 {
            let now = crate::cpu::tsc::read_cycles();
            kassert!(now >= prev);
            prev = now;
        }
        Ok(())
    }

    pub const SUITE: &[KtestCase] = &[
        KtestCase {
            name: "fixed::arithmetic",
            run: fixed_point_arithmetic,
        },
        KtestCase {
            name: "fixed::softmax",
            run: fixed_point_softmax,
        },
        KtestCase {
            name: "simd::dot_vs_scalar",
            run: simd_matches_scalar,
        },
        KtestCase {
            name: "quant::q8_0_roundtrip",
            run: quant_q8_0_roundtrip,
        },
        KtestCase {
            name: "kvcache::bounds",
            run: kv_cache_bounds,
        },
        KtestCase {
            name: "tsc::monotonic",
            run: timer_monotonic,
        },
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passing() -> Result<(), &'static str> {
        kassert!(1 + 1 == 2);
        kassert_eq!(6 * 7, 42);
        Ok(())
    }

    fn failing() -> Result<(), &'static str> {
        kassert_eq!(1, 2);
        Ok(())
    }

    #[test]
    fn cases_report_pass_fail() {
        let cases = [
            KtestCase {
                name: "pass",
                run: passing,
            },
            KtestCase {
                name: "fail",
                run: failing,
            },
        ];
        assert_eq!(run_cases(&cases), (1, 1));
    }

    #[test]
    fn registration_accumulates() {
        let before = registered_count();
        register("ktest_self", passing);
        register_suite(&[KtestCase {
            name: "ktest_suite_member",
            run: passing,
        }]);
        assert!(registered_count() >= before + 2);
    }

    #[test]
    fn builtin_suite_passes() {
        let (passed, failed) = run_cases(super::builtin::SUITE);
        assert_eq!(failed, 0);
        assert_eq!(passed, super::builtin::SUITE.len());
    }
}
