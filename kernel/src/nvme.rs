//! NVMe Driver — NVM Express 1.x over MMIO
//!
//! Polling-mode driver: controller reset and enable, admin and I/O queue
//! pairs, Identify, Read/Write/Flush with PRP lists, bounded-time
//! completion waits. No interrupts.
//!
//! Ordering rules:
//! - SQE bytes are made visible (write barrier) before the doorbell write;
//! - a read barrier is issued before each phase-bit read;
//! - a CQE belongs to a caller iff `phase == expected` AND the command ID
//!   matches. Out-of-order completions are parked until their owner polls.

use crate::block::{BlockDevice, SECTOR_SIZE};
use crate::dma::{self, DmaBuffer, DmaDirection, DmaPool};
use crate::err::{KResult, KernelError};
use crate::memory::PAGE_SIZE;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

// ═══════════════════════════════════════════════════════════════════════
// Register offsets (MMIO BAR0)
// ═══════════════════════════════════════════════════════════════════════

const REG_CAP: usize = 0x00; // Controller Capabilities (64-bit)
const REG_VS: usize = 0x08; // Version
const REG_INTMS: usize = 0x0C; // Interrupt Mask Set
const REG_CC: usize = 0x14; // Controller Configuration
const REG_CSTS: usize = 0x1C; // Controller Status
const REG_AQA: usize = 0x24; // Admin Queue Attributes
const REG_ASQ: usize = 0x28; // Admin SQ Base (64-bit)
const REG_ACQ: usize = 0x30; // Admin CQ Base (64-bit)

const DOORBELL_BASE: usize = 0x1000;

// Controller Configuration bits
const CC_EN: u32 = 1 << 0;
const CC_CSS_NVM: u32 = 0 << 4;
const CC_MPS_4K: u32 = 0 << 7; // 2^(12+0)
const CC_AMS_RR: u32 = 0 << 11;
const CC_IOSQES: u32 = 6 << 16; // 64-byte SQE
const CC_IOCQES: u32 = 4 << 20; // 16-byte CQE

// Controller Status bits
const CSTS_RDY: u32 = 1 << 0;
const CSTS_CFS: u32 = 1 << 1;

// Admin opcodes
const ADMIN_CREATE_IO_SQ: u8 = 0x01;
const ADMIN_CREATE_IO_CQ: u8 = 0x05;
const ADMIN_IDENTIFY: u8 = 0x06;

// NVM I/O opcodes
const IO_FLUSH: u8 = 0x00;
const IO_WRITE: u8 = 0x01;
const IO_READ: u8 = 0x02;

// Identify CNS values
const IDENTIFY_NAMESPACE: u32 = 0x00;
const IDENTIFY_CONTROLLER: u32 = 0x01;

/// Longest PRP list the driver will build (entries).
pub const PRP_LIST_MAX: usize = 512;

/// Cap on blocks batched into one I/O command.
pub const NVME_MAX_IO_BLOCKS: usize = 256;

const ADMIN_TIMEOUT_MS: u64 = 1_000;
const IO_TIMEOUT_MS: u64 = 5_000;
const RESET_TIMEOUT_MS: u64 = 2_000;

// ═══════════════════════════════════════════════════════════════════════
// Wire structures
// ═══════════════════════════════════════════════════════════════════════

/// Submission Queue Entry (64 bytes)
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct SqEntry {
    /// Opcode + flags + command ID
    pub cdw0: u32,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(core::mem::size_of::<SqEntry>() == 64);

/// Completion Queue Entry (16 bytes)
#[derive(Clone, Copy, Default, Debug, PartialEq)]
#[repr(C)]
pub struct CqEntry {
    pub dw0: u32,
    pub dw1: u32,
    /// SQ Head (15:0) + SQ ID (31:16)
    pub sq_head_sqid: u32,
    /// Command ID (15:0) + Phase (bit 16) + Status (31:17)
    pub cid_status: u32,
}

const _: () = assert!(core::mem::size_of::<CqEntry>() == 16);

impl CqEntry {
    pub fn phase(&self) -> bool {
        self.cid_status & (1 << 16) != 0
    }

    pub fn status_code(&self) -> u16 {
        ((self.cid_status >> 17) & 0x7FFF) as u16
    }

    pub fn command_id(&self) -> u16 {
        (self.cid_status & 0xFFFF) as u16
    }
}

use crate::cpu::tsc::Deadline;

// ═══════════════════════════════════════════════════════════════════════
// Controller state machine
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlState {
    Resetting,
    AdminReady,
    IoReady,
    Running,
    Fatal,
}

// ═══════════════════════════════════════════════════════════════════════
// Queue pair
// ═══════════════════════════════════════════════════════════════════════

/// SQ + CQ pair: contiguous, page-aligned, power-of-two sized. One owner
/// per queue; `next_cid` is monotonic and wraps.
pub struct QueuePair {
    sq: DmaBuffer,
    cq: DmaBuffer,
    depth: u16,
    sq_tail: u16,
    cq_head: u16,
    cq_phase: bool,
    next_cid: u16,
    qid: u16,
    /// Doorbell register addresses (MMIO, or plain memory under test).
    sq_db: usize,
    cq_db: usize,
    /// Completions consumed while waiting for a different CID.
    parked: Vec<CqEntry>,
}

impl QueuePair {
    pub fn new(
        qid: u16,
        depth: u16,
        pool: &mut DmaPool,
        sq_db: usize,
        cq_db: usize,
    ) -> KResult<Self> {
        if depth == 0 || !depth.is_power_of_two() {
            return Err(KernelError::Invalid);
        }
        let sq = pool.alloc_coherent(depth as usize * core::mem::size_of::<SqEntry>())?;
        let cq = match pool.alloc_coherent(depth as usize * core::mem::size_of::<CqEntry>()) {
            Ok(b) => b,
            Err(e) => {
                pool.free_coherent(sq)?;
                return Err(e);
            }
        };
        Ok(QueuePair {
            sq,
            cq,
            depth,
            sq_tail: 0,
            cq_head: 0,
            cq_phase: true, // phase starts at 1
            next_cid: 0,
            qid,
            sq_db,
            cq_db,
            parked: Vec::new(),
        })
    }

    pub fn release(self, pool: &mut DmaPool) -> KResult<()> {
        pool.free_coherent(self.sq)?;
        pool.free_coherent(self.cq)?;
        Ok(())
    }

    pub fn sq_dma(&self) -> u64 {
        self.sq.dma_addr
    }

    pub fn cq_dma(&self) -> u64 {
        self.cq.dma_addr
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// Copy the SQE into the ring, make it visible, advance the tail and
    /// ring the doorbell. Returns the command ID.
    pub fn submit(&mut self, mut cmd: SqEntry) -> u16 {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);

        // Command ID lives in CDW0 bits [31:16]
        cmd.cdw0 = (cmd.cdw0 & 0x0000_FFFF) | ((cid as u32) << 16);

        let offset = self.sq_tail as usize * core::mem::size_of::<SqEntry>();
        unsafe {
            let ptr = (self.sq.vaddr + offset) as *mut SqEntry;
            core::ptr::write_volatile(ptr, cmd);
        }

        // SQE must be visible before the doorbell write.
        fence(Ordering::Release);

        self.sq_tail = (self.sq_tail + 1) % self.depth;
        unsafe {
            core::ptr::write_volatile(self.sq_db as *mut u32, self.sq_tail as u32);
        }
        cid
    }

    /// Consume the CQE at the head if its phase matches. Advances the head,
    /// toggles the expected phase on wrap and writes the CQ doorbell.
    fn poll_once(&mut self) -> Option<CqEntry> {
        fence(Ordering::Acquire);
        let offset = self.cq_head as usize * core::mem::size_of::<CqEntry>();
        let entry = unsafe {
            let ptr = (self.cq.vaddr + offset) as *const CqEntry;
            core::ptr::read_volatile(ptr)
        };

        if entry.phase() != self.cq_phase {
            return None;
        }

        self.cq_head += 1;
        if self.cq_head >= self.depth {
            self.cq_head = 0;
            self.cq_phase = !self.cq_phase;
        }
        unsafe {
            core::ptr::write_volatile(self.cq_db as *mut u32, self.cq_head as u32);
        }
        Some(entry)
    }

    /// Wait for the completion of `cid`. Completions for other commands
    /// observed along the way are parked, not lost.
    pub fn wait_for(&mut self, cid: u16, timeout_ms: u64) -> KResult<CqEntry> {
        if let Some(pos) = self.parked.iter().position(|e| e.command_id() == cid) {
            return Ok(self.parked.swap_remove(pos));
        }

        let mut deadline = Deadline::new(timeout_ms);
        loop {
            if let Some(entry) = self.poll_once() {
                if entry.command_id() == cid {
                    return Ok(entry);
                }
                if self.parked.len() < self.depth as usize {
                    self.parked.push(entry);
                }
                continue;
            }
            if deadline.expired() {
                return Err(KernelError::Timeout);
            }
            core::hint::spin_loop();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// PRP construction
// ═══════════════════════════════════════════════════════════════════════

/// Fill `prp1`/`prp2` for a transfer of `len` bytes at `dma`. Transfers
/// spilling past two pages use `list_buf` (entry i = page base + (i+1)
/// pages), whose DMA address goes into PRP2.
pub fn build_prps(
    cmd: &mut SqEntry,
    dma: u64,
    len: usize,
    list_buf: &mut [u64],
    list_dma: u64,
) -> KResult<()> {
    if len == 0 {
        return Err(KernelError::Bounds);
    }
    cmd.prp1 = dma;

    let page = PAGE_SIZE as u64;
    let first_len = (page - (dma % page)) as usize;
    if len <= first_len {
        cmd.prp2 = 0;
        return Ok(());
    }

    let base = dma & !(page - 1);
    if len <= first_len + PAGE_SIZE {
        cmd.prp2 = base + page;
        return Ok(());
    }

    let entries = (len - first_len + PAGE_SIZE - 1) / PAGE_SIZE;
    if entries > PRP_LIST_MAX || entries > list_buf.len() {
        return Err(KernelError::Bounds);
    }
    for i in 0..entries {
        list_buf[i] = base + (i as u64 + 1) * page;
    }
    cmd.prp2 = list_dma;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Identify data parsing
// ═══════════════════════════════════════════════════════════════════════

/// Identify Controller payload → (model, serial, max transfer pages).
fn parse_identify_controller(data: &[u8]) -> KResult<(String, String, u32)> {
    if data.len() < 4096 {
        return Err(KernelError::Decode);
    }
    let serial = String::from(core::str::from_utf8(&data[4..24]).unwrap_or("?").trim());
    let model = String::from(core::str::from_utf8(&data[24..64]).unwrap_or("?").trim());
    // MDTS: byte 77; 0 = unlimited, else 2^MDTS pages
    let mdts = data[77];
    let max_pages = if mdts == 0 { 256 } else { 1u32 << mdts.min(16) };
    Ok((model, serial, max_pages))
}

/// Identify Namespace payload → (size in LBAs, LBA bytes).
fn parse_identify_namespace(data: &[u8]) -> KResult<(u64, u32)> {
    if data.len() < 4096 {
        return Err(KernelError::Decode);
    }
    let nsze = u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]);
    let flbas = (data[26] & 0x0F) as usize;
    let lbaf_off = 128 + flbas * 4;
    let lbaf = u32::from_le_bytes([
        data[lbaf_off],
        data[lbaf_off + 1],
        data[lbaf_off + 2],
        data[lbaf_off + 3],
    ]);
    let lbads = (lbaf >> 16) & 0xFF;
    if lbads < 9 || lbads > 16 {
        return Err(KernelError::Decode);
    }
    Ok((nsze, 1u32 << lbads))
}

// ═══════════════════════════════════════════════════════════════════════
// Controller
// ═══════════════════════════════════════════════════════════════════════

pub struct NvmeController {
    bar: usize,
    doorbell_stride: u32,
    state: CtrlState,
    pool: DmaPool,
    admin: QueuePair,
    io: Option<QueuePair>,
    serial: String,
    model: String,
    ns1_blocks: u64,
    block_size: u32,
    max_transfer_pages: u32,
    cmds_submitted: u64,
    cmds_completed: u64,
    cmd_timeouts: u64,
}

impl NvmeController {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.bar + offset) as *const u32) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.bar + offset) as *mut u32, value) }
    }

    #[inline]
    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }

    fn doorbell_addr(bar: usize, stride: u32, qid: u16, is_cq: bool) -> usize {
        let index = 2 * qid as usize + if is_cq { 1 } else { 0 };
        bar + DOORBELL_BASE + index * stride as usize
    }

    /// Full init sequence over a mapped BAR:
    /// disable → program admin queues → enable → identify → create I/O
    /// queue pair. `RESETTING → ADMIN_READY → IO_READY → RUNNING`.
    pub fn init(bar: usize) -> KResult<Self> {
        if bar == 0 {
            return Err(KernelError::Null);
        }

        let cap_lo = unsafe { core::ptr::read_volatile((bar + REG_CAP) as *const u32) } as u64;
        let cap_hi =
            unsafe { core::ptr::read_volatile((bar + REG_CAP + 4) as *const u32) } as u64;
        let cap = cap_lo | (cap_hi << 32);

        let mqes = (cap & 0xFFFF) as u16 + 1;
        let dstrd = ((cap >> 32) & 0xF) as u32;
        let doorbell_stride = 4u32 << dstrd;
        // Largest power of two ≤ min(MQES, 64) so queues stay within a page
        let mut queue_depth = mqes.min(64);
        while !queue_depth.is_power_of_two() {
            queue_depth &= queue_depth - 1;
        }

        let vs = unsafe { core::ptr::read_volatile((bar + REG_VS) as *const u32) };
        crate::log!(
            "[NVMe] version {}.{}, MQES={}, DSTRD={}",
            (vs >> 16) & 0xFFFF,
            (vs >> 8) & 0xFF,
            mqes,
            dstrd
        );

        let mut pool = DmaPool::new();
        let admin = QueuePair::new(
            0,
            queue_depth,
            &mut pool,
            Self::doorbell_addr(bar, doorbell_stride, 0, false),
            Self::doorbell_addr(bar, doorbell_stride, 0, true),
        )?;

        let mut ctrl = NvmeController {
            bar,
            doorbell_stride,
            state: CtrlState::Resetting,
            pool,
            admin,
            io: None,
            serial: String::new(),
            model: String::new(),
            ns1_blocks: 0,
            block_size: SECTOR_SIZE as u32,
            max_transfer_pages: 256,
            cmds_submitted: 0,
            cmds_completed: 0,
            cmd_timeouts: 0,
        };

        // ── Disable controller, wait for !CSTS.RDY ──
        let cc = ctrl.read32(REG_CC);
        if cc & CC_EN != 0 {
            ctrl.write32(REG_CC, cc & !CC_EN);
            let mut deadline = Deadline::new(RESET_TIMEOUT_MS);
            while ctrl.read32(REG_CSTS) & CSTS_RDY != 0 {
                if deadline.expired() {
                    return Err(KernelError::Timeout);
                }
                core::hint::spin_loop();
            }
        }

        // ── Admin queue registers ──
        let aqa = ((queue_depth - 1) as u32) | (((queue_depth - 1) as u32) << 16);
        ctrl.write32(REG_AQA, aqa);
        ctrl.write64(REG_ASQ, ctrl.admin.sq_dma());
        ctrl.write64(REG_ACQ, ctrl.admin.cq_dma());

        // Mask all interrupts; this driver polls.
        ctrl.write32(REG_INTMS, 0xFFFF_FFFF);

        // ── Enable ──
        ctrl.write32(
            REG_CC,
            CC_EN | CC_CSS_NVM | CC_MPS_4K | CC_AMS_RR | CC_IOSQES | CC_IOCQES,
        );
        let mut deadline = Deadline::new(RESET_TIMEOUT_MS);
        loop {
            let csts = ctrl.read32(REG_CSTS);
            if csts & CSTS_CFS != 0 {
                ctrl.state = CtrlState::Fatal;
                return Err(KernelError::Io);
            }
            if csts & CSTS_RDY != 0 {
                break;
            }
            if deadline.expired() {
                ctrl.state = CtrlState::Fatal;
                return Err(KernelError::Timeout);
            }
            core::hint::spin_loop();
        }
        ctrl.state = CtrlState::AdminReady;

        ctrl.identify_controller()?;
        ctrl.identify_namespace()?;
        crate::log!(
            "[NVMe] model='{}' serial='{}' {} blocks × {} B",
            ctrl.model,
            ctrl.serial,
            ctrl.ns1_blocks,
            ctrl.block_size
        );

        ctrl.create_io_queues(queue_depth)?;
        ctrl.state = CtrlState::Running;
        Ok(ctrl)
    }

    pub fn state(&self) -> CtrlState {
        self.state
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (self.cmds_submitted, self.cmds_completed, self.cmd_timeouts)
    }

    fn admin_cmd(&mut self, cmd: SqEntry) -> KResult<CqEntry> {
        let cid = self.admin.submit(cmd);
        self.cmds_submitted += 1;
        match self.admin.wait_for(cid, ADMIN_TIMEOUT_MS) {
            Ok(cqe) => {
                self.cmds_completed += 1;
                if cqe.status_code() != 0 {
                    crate::log_error!("[NVMe] admin cmd failed: {:#x}", cqe.status_code());
                    return Err(KernelError::Io);
                }
                Ok(cqe)
            }
            Err(e) => {
                self.cmd_timeouts += 1;
                Err(e)
            }
        }
    }

    fn io_cmd(&mut self, cmd: SqEntry) -> KResult<CqEntry> {
        let io = self.io.as_mut().ok_or(KernelError::NotInit)?;
        let cid = io.submit(cmd);
        self.cmds_submitted += 1;
        match io.wait_for(cid, IO_TIMEOUT_MS) {
            Ok(cqe) => {
                self.cmds_completed += 1;
                if cqe.status_code() != 0 {
                    crate::log_error!("[NVMe] I/O cmd failed: {:#x}", cqe.status_code());
                    return Err(KernelError::Io);
                }
                Ok(cqe)
            }
            Err(e) => {
                self.cmd_timeouts += 1;
                Err(e)
            }
        }
    }

    fn identify(&mut self, cns: u32, nsid: u32) -> KResult<DmaBuffer> {
        let buf = self.pool.alloc_coherent(4096)?;
        let cmd = SqEntry {
            cdw0: ADMIN_IDENTIFY as u32,
            nsid,
            prp1: buf.dma_addr,
            cdw10: cns,
            ..Default::default()
        };
        match self.admin_cmd(cmd) {
            Ok(_) => {
                dma::sync_for_cpu(buf.vaddr, buf.size, DmaDirection::FromDevice);
                Ok(buf)
            }
            Err(e) => {
                let _ = self.pool.free_coherent(buf);
                Err(e)
            }
        }
    }

    fn identify_controller(&mut self) -> KResult<()> {
        let buf = self.identify(IDENTIFY_CONTROLLER, 0)?;
        let parsed = parse_identify_controller(buf.as_slice());
        self.pool.free_coherent(buf)?;
        let (model, serial, max_pages) = parsed?;
        self.model = model;
        self.serial = serial;
        self.max_transfer_pages = max_pages;
        Ok(())
    }

    fn identify_namespace(&mut self) -> KResult<()> {
        let buf = self.identify(IDENTIFY_NAMESPACE, 1)?;
        let parsed = parse_identify_namespace(buf.as_slice());
        self.pool.free_coherent(buf)?;
        let (blocks, block_size) = parsed?;
        self.ns1_blocks = blocks;
        self.block_size = block_size;
        Ok(())
    }

    /// Create the I/O CQ, then the I/O SQ bound to it (admin commands),
    /// in that order.
    fn create_io_queues(&mut self, depth: u16) -> KResult<()> {
        let sq_db = Self::doorbell_addr(self.bar, self.doorbell_stride, 1, false);
        let cq_db = Self::doorbell_addr(self.bar, self.doorbell_stride, 1, true);
        let queue = QueuePair::new(1, depth, &mut self.pool, sq_db, cq_db)?;

        let create_cq = SqEntry {
            cdw0: ADMIN_CREATE_IO_CQ as u32,
            prp1: queue.cq_dma(),
            // QID (15:0) + 0-based size (31:16)
            cdw10: 1u32 | (((depth - 1) as u32) << 16),
            cdw11: 1, // PC=1, polling
            ..Default::default()
        };
        if let Err(e) = self.admin_cmd(create_cq) {
            let _ = queue.release(&mut self.pool);
            return Err(e);
        }

        let create_sq = SqEntry {
            cdw0: ADMIN_CREATE_IO_SQ as u32,
            prp1: queue.sq_dma(),
            cdw10: 1u32 | (((depth - 1) as u32) << 16),
            cdw11: 1 | (1u32 << 16), // PC=1 + CQID=1
            ..Default::default()
        };
        if let Err(e) = self.admin_cmd(create_sq) {
            let _ = queue.release(&mut self.pool);
            return Err(e);
        }

        self.io = Some(queue);
        self.state = CtrlState::IoReady;
        Ok(())
    }

    fn blocks_per_command(&self) -> usize {
        let by_mdts = (self.max_transfer_pages as usize * PAGE_SIZE) / self.block_size as usize;
        NVME_MAX_IO_BLOCKS.min(by_mdts.max(1))
    }

    /// Read `count` blocks. On a per-command failure after some commands
    /// completed, returns the block count transferred so far; an error on
    /// the first command propagates.
    pub fn read_blocks(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> KResult<usize> {
        let bs = self.block_size as usize;
        if buf.len() < count * bs {
            return Err(KernelError::Bounds);
        }
        if lba + count as u64 > self.ns1_blocks {
            return Err(KernelError::Bounds);
        }

        let chunk_blocks = self.blocks_per_command();
        let dma_buf = self.pool.alloc_coherent(chunk_blocks * bs)?;
        let prp_list = match self.pool.alloc_coherent(PRP_LIST_MAX * 8) {
            Ok(b) => b,
            Err(e) => {
                let _ = self.pool.free_coherent(dma_buf);
                return Err(e);
            }
        };

        let mut done = 0usize;
        let result = loop {
            if done == count {
                break Ok(done);
            }
            let n = (count - done).min(chunk_blocks);
            let bytes = n * bs;

            let mut cmd = SqEntry {
                cdw0: IO_READ as u32,
                nsid: 1,
                cdw10: (lba + done as u64) as u32,
                cdw11: ((lba + done as u64) >> 32) as u32,
                cdw12: (n - 1) as u32, // NLB is 0-based
                ..Default::default()
            };
            let list = unsafe {
                core::slice::from_raw_parts_mut(prp_list.vaddr as *mut u64, PRP_LIST_MAX)
            };
            if let Err(e) = build_prps(&mut cmd, dma_buf.dma_addr, bytes, list, prp_list.dma_addr)
            {
                break if done > 0 { Ok(done) } else { Err(e) };
            }
            dma::sync_for_device(prp_list.vaddr, PRP_LIST_MAX * 8, DmaDirection::ToDevice);

            match self.io_cmd(cmd) {
                Ok(_) => {
                    dma::sync_for_cpu(dma_buf.vaddr, bytes, DmaDirection::FromDevice);
                    let src = unsafe {
                        core::slice::from_raw_parts(dma_buf.vaddr as *const u8, bytes)
                    };
                    buf[done * bs..done * bs + bytes].copy_from_slice(src);
                    done += n;
                }
                Err(e) => break if done > 0 { Ok(done) } else { Err(e) },
            }
        };

        let _ = self.pool.free_coherent(prp_list);
        let _ = self.pool.free_coherent(dma_buf);
        result
    }

    /// Write `count` blocks; same partial-completion contract as reads.
    pub fn write_blocks(&mut self, lba: u64, count: usize, buf: &[u8]) -> KResult<usize> {
        let bs = self.block_size as usize;
        if buf.len() < count * bs {
            return Err(KernelError::Bounds);
        }
        if lba + count as u64 > self.ns1_blocks {
            return Err(KernelError::Bounds);
        }

        let chunk_blocks = self.blocks_per_command();
        let dma_buf = self.pool.alloc_coherent(chunk_blocks * bs)?;
        let prp_list = match self.pool.alloc_coherent(PRP_LIST_MAX * 8) {
            Ok(b) => b,
            Err(e) => {
                let _ = self.pool.free_coherent(dma_buf);
                return Err(e);
            }
        };

        let mut done = 0usize;
        let result = loop {
            if done == count {
                break Ok(done);
            }
            let n = (count - done).min(chunk_blocks);
            let bytes = n * bs;

            // Data is staged before the doorbell rings.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    buf[done * bs..].as_ptr(),
                    dma_buf.vaddr as *mut u8,
                    bytes,
                );
            }
            dma::sync_for_device(dma_buf.vaddr, bytes, DmaDirection::ToDevice);

            let mut cmd = SqEntry {
                cdw0: IO_WRITE as u32,
                nsid: 1,
                cdw10: (lba + done as u64) as u32,
                cdw11: ((lba + done as u64) >> 32) as u32,
                cdw12: (n - 1) as u32,
                ..Default::default()
            };
            let list = unsafe {
                core::slice::from_raw_parts_mut(prp_list.vaddr as *mut u64, PRP_LIST_MAX)
            };
            if let Err(e) = build_prps(&mut cmd, dma_buf.dma_addr, bytes, list, prp_list.dma_addr)
            {
                break if done > 0 { Ok(done) } else { Err(e) };
            }
            dma::sync_for_device(prp_list.vaddr, PRP_LIST_MAX * 8, DmaDirection::ToDevice);

            match self.io_cmd(cmd) {
                Ok(_) => done += n,
                Err(e) => break if done > 0 { Ok(done) } else { Err(e) },
            }
        };

        let _ = self.pool.free_coherent(prp_list);
        let _ = self.pool.free_coherent(dma_buf);
        result
    }

    pub fn flush(&mut self) -> KResult<()> {
        let cmd = SqEntry {
            cdw0: IO_FLUSH as u32,
            nsid: 1,
            ..Default::default()
        };
        self.io_cmd(cmd)?;
        Ok(())
    }
}

impl BlockDevice for NvmeController {
    fn read(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> KResult<()> {
        let done = self.read_blocks(lba, count, buf)?;
        if done != count {
            return Err(KernelError::Io);
        }
        Ok(())
    }

    fn write(&mut self, lba: u64, count: usize, buf: &[u8]) -> KResult<()> {
        let done = self.write_blocks(lba, count, buf)?;
        if done != count {
            return Err(KernelError::Io);
        }
        Ok(())
    }

    fn capacity_sectors(&self) -> u64 {
        self.ns1_blocks * (self.block_size as u64 / SECTOR_SIZE as u64).max(1)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;

    /// A queue pair over plain memory with doorbells pointing at two
    /// heap words — enough to exercise submit/poll/phase logic without
    /// hardware.
    struct TestQueue {
        pool: DmaPool,
        qp: QueuePair,
        _sq_db: Box<u32>,
        _cq_db: Box<u32>,
    }

    impl TestQueue {
        fn new(depth: u16) -> Self {
            let mut pool = DmaPool::new();
            let sq_db = Box::new(0u32);
            let cq_db = Box::new(0u32);
            let qp = QueuePair::new(
                1,
                depth,
                &mut pool,
                &*sq_db as *const u32 as usize,
                &*cq_db as *const u32 as usize,
            )
            .unwrap();
            TestQueue {
                pool,
                qp,
                _sq_db: sq_db,
                _cq_db: cq_db,
            }
        }

        /// Act as the controller: write a CQE for `cid` at the device-side
        /// CQ slot with the given phase.
        fn complete(&mut self, slot: u16, cid: u16, phase: bool, status: u16) {
            let cid_status =
                cid as u32 | ((phase as u32) << 16) | ((status as u32) << 17);
            let entry = CqEntry {
                dw0: 0,
                dw1: 0,
                sq_head_sqid: 0,
                cid_status,
            };
            let offset = slot as usize * core::mem::size_of::<CqEntry>();
            unsafe {
                core::ptr::write_volatile(
                    (self.qp.cq.vaddr + offset) as *mut CqEntry,
                    entry,
                );
            }
        }

        fn sqe_at(&self, slot: u16) -> SqEntry {
            let offset = slot as usize * core::mem::size_of::<SqEntry>();
            unsafe { core::ptr::read_volatile((self.qp.sq.vaddr + offset) as *const SqEntry) }
        }

        fn sq_doorbell(&self) -> u32 {
            *self._sq_db
        }
    }

    #[test]
    fn wire_sizes() {
        assert_eq!(core::mem::size_of::<SqEntry>(), 64);
        assert_eq!(core::mem::size_of::<CqEntry>(), 16);
    }

    #[test]
    fn cqe_field_decoding() {
        let e = CqEntry {
            dw0: 0,
            dw1: 0,
            sq_head_sqid: 0,
            cid_status: 0x0003_0007 | (1 << 16),
        };
        assert_eq!(e.command_id(), 7);
        assert!(e.phase());
        assert_eq!(e.status_code(), 1);
    }

    #[test]
    fn submit_places_cid_and_rings_doorbell() {
        let mut t = TestQueue::new(8);
        let cid = t.qp.submit(SqEntry {
            cdw0: IO_READ as u32,
            nsid: 1,
            ..Default::default()
        });
        assert_eq!(cid, 0);
        assert_eq!(t.sq_doorbell(), 1);

        let sqe = t.sqe_at(0);
        assert_eq!(sqe.cdw0 & 0xFF, IO_READ as u32);
        assert_eq!(sqe.cdw0 >> 16, cid as u32);

        let cid2 = t.qp.submit(SqEntry::default());
        assert_eq!(cid2, 1);
        assert_eq!(t.sq_doorbell(), 2);
    }

    #[test]
    fn completion_requires_matching_phase() {
        let mut t = TestQueue::new(4);
        let cid = t.qp.submit(SqEntry::default());
        // Stale phase (0) — must not be accepted
        t.complete(0, cid, false, 0);
        assert_eq!(t.qp.wait_for(cid, 1), Err(KernelError::Timeout));
        // Correct phase (1) — accepted
        t.complete(0, cid, true, 0);
        let cqe = t.qp.wait_for(cid, 1).unwrap();
        assert_eq!(cqe.command_id(), cid);
    }

    #[test]
    fn out_of_order_completions_not_lost() {
        let mut t = TestQueue::new(8);
        let c0 = t.qp.submit(SqEntry::default());
        let c1 = t.qp.submit(SqEntry::default());
        let c2 = t.qp.submit(SqEntry::default());

        // Controller completes them in reverse order into successive slots
        t.complete(0, c2, true, 0);
        t.complete(1, c1, true, 0);
        t.complete(2, c0, true, 0);

        // Waiting for c0 walks past c2 and c1, parking them
        assert_eq!(t.qp.wait_for(c0, 10).unwrap().command_id(), c0);
        assert_eq!(t.qp.wait_for(c1, 10).unwrap().command_id(), c1);
        assert_eq!(t.qp.wait_for(c2, 10).unwrap().command_id(), c2);
    }

    #[test]
    fn phase_toggles_on_wrap() {
        let mut t = TestQueue::new(4);
        // First lap: phase 1
        for i in 0..4u16 {
            let cid = t.qp.submit(SqEntry::default());
            t.complete(i, cid, true, 0);
            assert_eq!(t.qp.wait_for(cid, 10).unwrap().command_id(), cid);
        }
        // Second lap: expected phase flipped to 0
        for i in 0..4u16 {
            let cid = t.qp.submit(SqEntry::default());
            // An entry still carrying the old phase must be ignored
            t.complete(i, cid, true, 0);
            assert_eq!(t.qp.wait_for(cid, 1), Err(KernelError::Timeout));
            t.complete(i, cid, false, 0);
            assert_eq!(t.qp.wait_for(cid, 10).unwrap().command_id(), cid);
        }
    }

    #[test]
    fn cid_wraps_monotonically() {
        let mut t = TestQueue::new(4);
        t.qp.next_cid = u16::MAX;
        let a = t.qp.submit(SqEntry::default());
        let b = t.qp.submit(SqEntry::default());
        assert_eq!(a, u16::MAX);
        assert_eq!(b, 0);
    }

    #[test]
    fn prp_single_page() {
        let mut cmd = SqEntry::default();
        let mut list = [0u64; PRP_LIST_MAX];
        build_prps(&mut cmd, 0x10000, 4096, &mut list, 0xBEEF000).unwrap();
        assert_eq!(cmd.prp1, 0x10000);
        assert_eq!(cmd.prp2, 0);
    }

    #[test]
    fn prp_offset_within_page() {
        let mut cmd = SqEntry::default();
        let mut list = [0u64; PRP_LIST_MAX];
        // 512 bytes at offset 0xE00: fits the first page remainder
        build_prps(&mut cmd, 0x10E00, 0x200, &mut list, 0xBEEF000).unwrap();
        assert_eq!(cmd.prp2, 0);
        // 1024 bytes at the same offset spills into the next page
        build_prps(&mut cmd, 0x10E00, 0x400, &mut list, 0xBEEF000).unwrap();
        assert_eq!(cmd.prp2, 0x11000);
    }

    #[test]
    fn prp_two_pages() {
        let mut cmd = SqEntry::default();
        let mut list = [0u64; PRP_LIST_MAX];
        build_prps(&mut cmd, 0x10000, 8192, &mut list, 0xBEEF000).unwrap();
        assert_eq!(cmd.prp1, 0x10000);
        assert_eq!(cmd.prp2, 0x11000);
    }

    #[test]
    fn prp_list_for_large_transfer() {
        let mut cmd = SqEntry::default();
        let mut list = [0u64; PRP_LIST_MAX];
        build_prps(&mut cmd, 0x10000, 5 * 4096, &mut list, 0xBEEF000).unwrap();
        assert_eq!(cmd.prp1, 0x10000);
        assert_eq!(cmd.prp2, 0xBEEF000);
        // Entry i = base + (i+1) pages
        assert_eq!(list[0], 0x11000);
        assert_eq!(list[3], 0x14000);
    }

    #[test]
    fn prp_list_cap() {
        let mut cmd = SqEntry::default();
        let mut list = [0u64; PRP_LIST_MAX];
        let too_big = (PRP_LIST_MAX + 2) * 4096;
        assert_eq!(
            build_prps(&mut cmd, 0x10000, too_big, &mut list, 0xBEEF000),
            Err(KernelError::Bounds)
        );
    }

    #[test]
    fn identify_parsers() {
        let mut data = vec![0u8; 4096];
        data[4..24].copy_from_slice(b"SN-0042             ");
        data[24..64].copy_from_slice(b"EMBODIOS Test Drive                     ");
        data[77] = 5; // MDTS: 32 pages
        let (model, serial, pages) = parse_identify_controller(&data).unwrap();
        assert_eq!(model, "EMBODIOS Test Drive");
        assert_eq!(serial, "SN-0042");
        assert_eq!(pages, 32);

        let mut ns = vec![0u8; 4096];
        ns[0..8].copy_from_slice(&1_000_000u64.to_le_bytes());
        ns[26] = 0; // LBA format 0
        ns[128..132].copy_from_slice(&(9u32 << 16).to_le_bytes()); // 512-byte LBAs
        let (blocks, bs) = parse_identify_namespace(&ns).unwrap();
        assert_eq!(blocks, 1_000_000);
        assert_eq!(bs, 512);

        assert_eq!(parse_identify_controller(&[0u8; 10]), Err(KernelError::Decode));
    }

    #[test]
    fn queue_release_returns_memory() {
        let mut t = TestQueue::new(8);
        assert_eq!(t.pool.in_use_count(), 2);
        let (sq_db, cq_db) = (t.qp.sq_db, t.qp.cq_db);
        let qp = core::mem::replace(
            &mut t.qp,
            QueuePair::new(2, 4, &mut t.pool, sq_db, cq_db).unwrap(),
        );
        qp.release(&mut t.pool).unwrap();
        assert_eq!(t.pool.in_use_count(), 2);
    }
}
