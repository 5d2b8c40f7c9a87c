//! Accelerator bridge (optional offload path)
//!
//! A single shared-memory request slot at a fixed physical address. The
//! kernel fills the prompt, flips `status` to PENDING and busy-waits (with
//! a deadline) for the peer to post DONE; the peer obeys the mirror
//! protocol. `IDLE → PENDING → RUNNING → DONE → IDLE`.

use crate::cpu::tsc::Deadline;
use crate::err::{KResult, KernelError};
use crate::fixed::Fx;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

pub const ACCEL_MAGIC: u32 = 0x4149_4F53; // 'AIOS'
pub const ACCEL_VERSION: u32 = 1;
pub const ACCEL_PROMPT_LEN: usize = 1024;
pub const ACCEL_RESPONSE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotStatus {
    Idle = 0,
    Pending = 1,
    Running = 2,
    Done = 3,
}

/// Shared request slot layout — mirrored by the offload peer.
#[repr(C)]
pub struct AiRequestSlot {
    pub magic: u32,
    pub version: u32,
    pub request_id: u32,
    pub status: u32,
    pub max_tokens: u32,
    /// Q16.16 sampling temperature.
    pub temperature: i32,
    pub flags: u32,
    pub prompt: [u8; ACCEL_PROMPT_LEN],
    pub response: [u8; ACCEL_RESPONSE_LEN],
}

pub struct AccelBridge {
    base: usize,
    next_request: u32,
    requests: u64,
    timeouts: u64,
}

impl AccelBridge {
    /// Attach to the shared slot at `base` (fixed physical address,
    /// identity-mapped).
    pub fn new(base: usize) -> KResult<Self> {
        if base == 0 {
            return Err(KernelError::Null);
        }
        Ok(AccelBridge {
            base,
            next_request: 1,
            requests: 0,
            timeouts: 0,
        })
    }

    #[inline]
    fn slot(&self) -> *mut AiRequestSlot {
        self.base as *mut AiRequestSlot
    }

    /// Host-side slot setup: stamp magic/version and mark idle.
    pub fn init_slot(&mut self) {
        unsafe {
            let s = self.slot();
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*s).magic), ACCEL_MAGIC);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*s).version), ACCEL_VERSION);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*s).request_id), 0);
            core::ptr::write_volatile(
                core::ptr::addr_of_mut!((*s).status),
                SlotStatus::Idle as u32,
            );
        }
    }

    /// Whether a live peer slot is mapped at the base.
    pub fn is_present(&self) -> bool {
        unsafe {
            let s = self.slot();
            core::ptr::read_volatile(core::ptr::addr_of!((*s).magic)) == ACCEL_MAGIC
                && core::ptr::read_volatile(core::ptr::addr_of!((*s).version)) == ACCEL_VERSION
        }
    }

    fn status(&self) -> u32 {
        fence(Ordering::Acquire);
        unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*self.slot()).status)) }
    }

    fn set_status(&mut self, st: SlotStatus) {
        fence(Ordering::Release);
        unsafe {
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*self.slot()).status), st as u32);
        }
    }

    /// Submit a prompt and wait for the peer's response. On timeout the
    /// slot is returned to IDLE so a later request can retry.
    pub fn submit(
        &mut self,
        prompt: &[u8],
        max_tokens: u32,
        temperature: Fx,
        timeout_ms: u64,
    ) -> KResult<Vec<u8>> {
        if prompt.is_empty() {
            return Err(KernelError::Null);
        }
        if prompt.len() > ACCEL_PROMPT_LEN {
            return Err(KernelError::Bounds);
        }
        if !self.is_present() {
            return Err(KernelError::NotInit);
        }
        if self.status() != SlotStatus::Idle as u32 {
            return Err(KernelError::Full);
        }

        let id = self.next_request;
        self.next_request = self.next_request.wrapping_add(1).max(1);

        unsafe {
            let s = self.slot();
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*s).request_id), id);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*s).max_tokens), max_tokens);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*s).temperature), temperature);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*s).flags), 0);

            let dst = core::ptr::addr_of_mut!((*s).prompt) as *mut u8;
            core::ptr::copy_nonoverlapping(prompt.as_ptr(), dst, prompt.len());
            if prompt.len() < ACCEL_PROMPT_LEN {
                core::ptr::write_bytes(dst.add(prompt.len()), 0, ACCEL_PROMPT_LEN - prompt.len());
            }
        }

        self.set_status(SlotStatus::Pending);
        self.requests += 1;

        let mut deadline = Deadline::new(timeout_ms);
        loop {
            let st = self.status();
            if st == SlotStatus::Done as u32 {
                break;
            }
            if deadline.expired() {
                self.timeouts += 1;
                self.set_status(SlotStatus::Idle);
                return Err(KernelError::Timeout);
            }
            core::hint::spin_loop();
        }

        // Copy the response out (NUL-terminated within the fixed field)
        let mut out = Vec::new();
        unsafe {
            let src = core::ptr::addr_of!((*self.slot()).response) as *const u8;
            for i in 0..ACCEL_RESPONSE_LEN {
                let b = core::ptr::read_volatile(src.add(i));
                if b == 0 {
                    break;
                }
                out.push(b);
            }
        }

        self.set_status(SlotStatus::Idle);
        Ok(out)
    }

    /// (requests, timeouts)
    pub fn stats(&self) -> (u64, u64) {
        (self.requests, self.timeouts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::FX_ONE;
    use alloc::boxed::Box;

    fn boxed_slot() -> Box<AiRequestSlot> {
        // Zeroed slot memory, heap-backed for the test
        unsafe { Box::new(core::mem::zeroed()) }
    }

    #[test]
    fn presence_requires_stamp() {
        let slot = boxed_slot();
        let base = &*slot as *const AiRequestSlot as usize;
        let mut bridge = AccelBridge::new(base).unwrap();
        assert!(!bridge.is_present());
        assert_eq!(
            bridge.submit(b"hi", 8, FX_ONE, 5).err(),
            Some(KernelError::NotInit)
        );
        bridge.init_slot();
        assert!(bridge.is_present());
    }

    #[test]
    fn oversized_prompt_rejected() {
        let slot = boxed_slot();
        let base = &*slot as *const AiRequestSlot as usize;
        let mut bridge = AccelBridge::new(base).unwrap();
        bridge.init_slot();
        let huge = alloc::vec![b'x'; ACCEL_PROMPT_LEN + 1];
        assert_eq!(bridge.submit(&huge, 8, FX_ONE, 5).err(), Some(KernelError::Bounds));
        assert_eq!(bridge.submit(&[], 8, FX_ONE, 5).err(), Some(KernelError::Null));
        assert_eq!(AccelBridge::new(0).err(), Some(KernelError::Null));
    }

    #[test]
    fn timeout_returns_slot_to_idle() {
        let slot = boxed_slot();
        let base = &*slot as *const AiRequestSlot as usize;
        let mut bridge = AccelBridge::new(base).unwrap();
        bridge.init_slot();

        // No peer: the wait must expire, and the slot must be reusable
        assert_eq!(
            bridge.submit(b"ping", 4, FX_ONE, 2).err(),
            Some(KernelError::Timeout)
        );
        assert_eq!(bridge.status(), SlotStatus::Idle as u32);
        assert_eq!(bridge.stats().1, 1);
    }

    #[test]
    fn peer_round_trip() {
        let slot = boxed_slot();
        let base = &*slot as *const AiRequestSlot as usize;
        let mut bridge = AccelBridge::new(base).unwrap();
        bridge.init_slot();

        // Peer thread: poll for PENDING, echo the prompt, post DONE
        let peer = std::thread::spawn(move || {
            let s = base as *mut AiRequestSlot;
            loop {
                let st = unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*s).status)) };
                if st == SlotStatus::Pending as u32 {
                    break;
                }
                std::thread::yield_now();
            }
            unsafe {
                core::ptr::write_volatile(
                    core::ptr::addr_of_mut!((*s).status),
                    SlotStatus::Running as u32,
                );
                let prompt = core::ptr::addr_of!((*s).prompt) as *const u8;
                let resp = core::ptr::addr_of_mut!((*s).response) as *mut u8;
                resp.copy_from(prompt, 5); // "howdy"
                *resp.add(5) = 0;
                core::sync::atomic::fence(Ordering::Release);
                core::ptr::write_volatile(
                    core::ptr::addr_of_mut!((*s).status),
                    SlotStatus::Done as u32,
                );
            }
        });

        let out = bridge.submit(b"howdy", 16, FX_ONE, 2_000).unwrap();
        peer.join().unwrap();
        assert_eq!(&out, b"howdy");
        assert_eq!(bridge.status(), SlotStatus::Idle as u32);
    }
}
