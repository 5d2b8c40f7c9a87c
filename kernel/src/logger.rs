//! Structured log output for the core
//!
//! Every subsystem reports through these macros rather than printing
//! directly, so one runtime threshold can silence chatter (say, DMA sync
//! traces) without touching call sites. Records carry a timestamp from
//! the calibrated cycle counter when the timer is up; before calibration
//! they fall back to the coarse tick count fed in by the boot layer's
//! tick source. A `us`/`tk` marker on the line says which clock stamped
//! it. Suppressed and emitted records are counted for diagnostics.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Severity, ordered so a single threshold comparison gates a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl LogLevel {
    /// Three-letter tag printed on each record.
    pub fn label(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRC",
            LogLevel::Debug => "DBG",
            LogLevel::Info => "INF",
            LogLevel::Warn => "WRN",
            LogLevel::Error => "ERR",
            LogLevel::Fatal => "FTL",
        }
    }
}

/// Records below this severity are dropped (default: everything passes).
static MIN_LEVEL: AtomicU32 = AtomicU32::new(LogLevel::Trace as u32);

/// Coarse fallback clock, advanced by the boot layer's tick source.
static TICKS: AtomicU64 = AtomicU64::new(0);

static EMITTED: AtomicU64 = AtomicU64::new(0);
static SUPPRESSED: AtomicU64 = AtomicU64::new(0);

/// Raise or lower the severity threshold at runtime.
pub fn set_min_level(level: LogLevel) {
    MIN_LEVEL.store(level as u32, Ordering::Relaxed);
}

/// Whether a record at `level` would currently be emitted.
pub fn enabled(level: LogLevel) -> bool {
    level as u32 >= MIN_LEVEL.load(Ordering::Relaxed)
}

/// Advance the fallback clock. Called by the external tick source.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Current fallback tick count.
pub fn tick_count() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Best available timestamp: microseconds once the timer is calibrated,
/// raw ticks before that. The marker distinguishes the two on the wire.
fn timestamp() -> (u64, &'static str) {
    if crate::cpu::tsc::frequency_hz() != 0 {
        (crate::cpu::tsc::now_micros(), "us")
    } else {
        (TICKS.load(Ordering::Relaxed), "tk")
    }
}

/// (emitted, suppressed) record counts since boot.
pub fn stats() -> (u64, u64) {
    (
        EMITTED.load(Ordering::Relaxed),
        SUPPRESSED.load(Ordering::Relaxed),
    )
}

#[doc(hidden)]
pub fn _log(level: LogLevel, args: core::fmt::Arguments) {
    if !enabled(level) {
        SUPPRESSED.fetch_add(1, Ordering::Relaxed);
        return;
    }
    EMITTED.fetch_add(1, Ordering::Relaxed);

    let (t, unit) = timestamp();
    crate::console::_print(format_args!("{:>10}{} {} {}\n", t, unit, level.label(), args));
}

/// Routine progress (the default level).
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        $crate::logger::_log($crate::logger::LogLevel::Info, format_args!($($arg)*))
    };
}

/// Noisy detail, normally filtered out on release builds.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logger::_log($crate::logger::LogLevel::Debug, format_args!($($arg)*))
    };
}

/// Unexpected but survivable conditions.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::_log($crate::logger::LogLevel::Warn, format_args!($($arg)*))
    };
}

/// Operation failed; the caller gets an error code alongside this line.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logger::_log($crate::logger::LogLevel::Error, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_gates_levels() {
        set_min_level(LogLevel::Error);
        assert!(!enabled(LogLevel::Trace));
        assert!(!enabled(LogLevel::Info));
        assert!(!enabled(LogLevel::Warn));
        assert!(enabled(LogLevel::Error));
        assert!(enabled(LogLevel::Fatal));

        // A gated record lands in the suppressed counter, not the console
        let (_, suppressed_before) = stats();
        _log(LogLevel::Debug, format_args!("dropped"));
        let (_, suppressed_after) = stats();
        assert!(suppressed_after >= suppressed_before + 1);

        set_min_level(LogLevel::Trace);
        assert!(enabled(LogLevel::Trace));
    }

    #[test]
    fn emitted_counter_advances() {
        // Error passes any threshold another test may have set briefly
        let (emitted_before, _) = stats();
        _log(LogLevel::Error, format_args!("counted"));
        let (emitted_after, _) = stats();
        assert!(emitted_after >= emitted_before + 1);
    }

    #[test]
    fn fallback_clock_ticks() {
        let before = tick_count();
        tick();
        tick();
        assert!(tick_count() >= before + 2);
    }

    #[test]
    fn levels_are_ordered() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert_eq!(LogLevel::Fatal.label(), "FTL");
    }
}
