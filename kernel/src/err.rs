//! Kernel error taxonomy
//!
//! Every fallible call in the core returns `KResult<T>`. Lower layers never
//! panic on bad input; `KernelError` carries the failure class so callers can
//! react (retry, log, tear down) without string matching.

use core::fmt;

/// Failure classes shared by all core subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Required input pointer/buffer is absent.
    Null,
    /// Index, size, or count outside the defined range.
    Bounds,
    /// Structurally well-formed but rejected (e.g. n_embd % n_heads != 0).
    Invalid,
    /// Lifecycle already active.
    AlreadyInit,
    /// Lifecycle not yet active.
    NotInit,
    /// Allocation failed.
    NoMem,
    /// Hardware or peer did not respond in time.
    Timeout,
    /// Underlying read/write failed.
    Io,
    /// Device or tensor absent.
    NotFound,
    /// Address arithmetic would wrap.
    Overflow,
    /// Bounded container cannot accept another entry.
    Full,
    /// On-disk data fails a format check.
    Decode,
}

impl KernelError {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelError::Null => "NULL",
            KernelError::Bounds => "BOUNDS",
            KernelError::Invalid => "INVALID",
            KernelError::AlreadyInit => "ALREADY_INIT",
            KernelError::NotInit => "NOT_INIT",
            KernelError::NoMem => "NOMEM",
            KernelError::Timeout => "TIMEOUT",
            KernelError::Io => "IO",
            KernelError::NotFound => "NOT_FOUND",
            KernelError::Overflow => "OVERFLOW",
            KernelError::Full => "FULL",
            KernelError::Decode => "DECODE",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type KResult<T> = Result<T, KernelError>;
