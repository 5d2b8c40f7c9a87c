//! Block device layer
//!
//! Sector-granular I/O behind a narrow trait; the GGUF loader and the
//! filesystem-free boot path only need `read` + capacity. The NVMe driver
//! implements this trait over its I/O queue; the RAM disk backs tests and
//! early bring-up.

use crate::err::{KResult, KernelError};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

/// Disk sector size
pub const SECTOR_SIZE: usize = 512;

/// Sector-addressed block device.
pub trait BlockDevice {
    /// Read `count` sectors starting at `lba` into `buf`.
    fn read(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> KResult<()>;

    /// Write `count` sectors starting at `lba` from `buf`.
    fn write(&mut self, lba: u64, count: usize, buf: &[u8]) -> KResult<()>;

    /// Total device capacity in sectors.
    fn capacity_sectors(&self) -> u64;

    /// Total device capacity in bytes.
    fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors() * SECTOR_SIZE as u64
    }

    fn model(&self) -> &str {
        "block"
    }
}

/// RAM-backed block device.
pub struct RamDisk {
    data: Vec<u8>,
    model: String,
    reads: u64,
    writes: u64,
}

impl RamDisk {
    pub fn new(sectors: u64) -> Self {
        RamDisk {
            data: vec![0u8; sectors as usize * SECTOR_SIZE],
            model: String::from("EMBODIOS RAMDisk"),
            reads: 0,
            writes: 0,
        }
    }

    /// Wrap an existing image, padding the tail to a sector boundary.
    pub fn from_bytes(mut data: Vec<u8>) -> Self {
        let rem = data.len() % SECTOR_SIZE;
        if rem != 0 {
            data.resize(data.len() + SECTOR_SIZE - rem, 0);
        }
        RamDisk {
            data,
            model: String::from("EMBODIOS RAMDisk"),
            reads: 0,
            writes: 0,
        }
    }

    /// (reads, writes) sector counters.
    pub fn stats(&self) -> (u64, u64) {
        (self.reads, self.writes)
    }

    fn span(&self, lba: u64, count: usize) -> KResult<(usize, usize)> {
        if count == 0 {
            return Err(KernelError::Bounds);
        }
        let start = (lba as usize)
            .checked_mul(SECTOR_SIZE)
            .ok_or(KernelError::Overflow)?;
        let len = count
            .checked_mul(SECTOR_SIZE)
            .ok_or(KernelError::Overflow)?;
        let end = start.checked_add(len).ok_or(KernelError::Overflow)?;
        if end > self.data.len() {
            return Err(KernelError::Bounds);
        }
        Ok((start, len))
    }
}

impl BlockDevice for RamDisk {
    fn read(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> KResult<()> {
        let (start, len) = self.span(lba, count)?;
        if buf.len() < len {
            return Err(KernelError::Bounds);
        }
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        self.reads += count as u64;
        Ok(())
    }

    fn write(&mut self, lba: u64, count: usize, buf: &[u8]) -> KResult<()> {
        let (start, len) = self.span(lba, count)?;
        if buf.len() < len {
            return Err(KernelError::Bounds);
        }
        self.data[start..start + len].copy_from_slice(&buf[..len]);
        self.writes += count as u64;
        Ok(())
    }

    fn capacity_sectors(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn model(&self) -> &str {
        &self.model
    }
}
