//! Kernel assembly
//!
//! The subsystems are plain values; this module owns the single `Kernel`
//! instance and the boot sequence that wires them together:
//! PMM → heap → DMA → block device → GGUF load → inference engine.
//! All global state lives in the one `KERNEL` slot.

use crate::block::BlockDevice;
use crate::dma::DmaPool;
use crate::err::{KResult, KernelError};
use crate::fixed::Fx;
use crate::gguf::GgufModel;
use crate::inference::{EngineConfig, InferenceEngine};
use crate::memory::buddy::BuddyAllocator;
use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

pub struct Kernel {
    pmm: BuddyAllocator,
    dma: DmaPool,
    block: Option<Box<dyn BlockDevice + Send>>,
    engine: Option<InferenceEngine>,
}

static KERNEL: Mutex<Option<Kernel>> = Mutex::new(None);

/// Bring the core up over the physical region `[mem_start, mem_start+mem_size)`.
pub fn boot(mem_start: usize, mem_size: usize) -> KResult<()> {
    let mut slot = KERNEL.lock();
    if slot.is_some() {
        return Err(KernelError::AlreadyInit);
    }

    crate::cpu::init();
    // The timer is calibrated on bare metal only; hosted builds (tests)
    // manage the counter frequency themselves.
    #[cfg(target_os = "none")]
    {
        let freq = crate::cpu::tsc::calibrate();
        if freq != 0 {
            crate::cpu::tsc::init(freq);
        }
    }

    #[allow(unused_mut)]
    let mut pmm = BuddyAllocator::init(mem_start, mem_size)?;

    // On bare metal the heap is carved out of the PMM; host builds run on
    // the platform allocator.
    #[cfg(target_os = "none")]
    {
        let heap_pages = 1usize << 10; // 4 MiB
        let heap_base = pmm.alloc_pages(heap_pages)?;
        unsafe {
            crate::memory::heap::init_at(heap_base, heap_pages * crate::memory::PAGE_SIZE);
        }
    }

    crate::log!(
        "[BOOT] core up: {} pages managed, {} free",
        pmm.total_page_count(),
        pmm.free_page_count()
    );

    *slot = Some(Kernel {
        pmm,
        dma: DmaPool::new(),
        block: None,
        engine: None,
    });
    Ok(())
}

/// Tear the kernel down (test/reboot path).
pub fn shutdown() {
    *KERNEL.lock() = None;
}

/// Run `f` against the live kernel.
pub fn with<R>(f: impl FnOnce(&mut Kernel) -> KResult<R>) -> KResult<R> {
    let mut slot = KERNEL.lock();
    let kernel = slot.as_mut().ok_or(KernelError::NotInit)?;
    f(kernel)
}

impl Kernel {
    pub fn pmm(&mut self) -> &mut BuddyAllocator {
        &mut self.pmm
    }

    pub fn dma(&mut self) -> &mut DmaPool {
        &mut self.dma
    }

    /// Install the boot block device (RAM disk or NVMe controller).
    pub fn attach_block(&mut self, dev: Box<dyn BlockDevice + Send>) {
        crate::log!(
            "[BOOT] block device '{}': {} sectors",
            dev.model(),
            dev.capacity_sectors()
        );
        self.block = Some(dev);
    }

    /// Load a GGUF image from the attached block device and stand the
    /// inference engine up on it. `size = 0` reads the whole device.
    pub fn load_model(&mut self, size: u64) -> KResult<()> {
        if self.engine.is_some() {
            return Err(KernelError::AlreadyInit);
        }
        let dev = self.block.as_mut().ok_or(KernelError::NotInit)?;
        let model = GgufModel::load_from_block(dev.as_mut(), size)?;
        crate::log!(
            "[BOOT] model '{}': {} tensors, vocab {}",
            model.arch.arch,
            model.n_tensors_total,
            model.arch.n_vocab
        );
        self.engine = Some(InferenceEngine::from_model(model)?);
        Ok(())
    }

    /// Stand the engine up on synthetic weights (no model file).
    pub fn init_inference_synthetic(&mut self, cfg: EngineConfig) -> KResult<()> {
        if self.engine.is_some() {
            return Err(KernelError::AlreadyInit);
        }
        self.engine = Some(InferenceEngine::new_synthetic(cfg)?);
        Ok(())
    }

    pub fn engine(&mut self) -> KResult<&mut InferenceEngine> {
        self.engine.as_mut().ok_or(KernelError::NotInit)
    }

    pub fn reset_inference(&mut self) -> KResult<()> {
        self.engine()?.reset();
        Ok(())
    }

    /// Tear down the engine (and the model it owns).
    pub fn cleanup_inference(&mut self) {
        self.engine = None;
    }
}

/// One decoding step; on failure logs a diagnostic and passes the error
/// up so the caller's loop can continue.
pub fn forward(token: u32) -> KResult<Vec<Fx>> {
    with(|k| match k.engine()?.forward(token) {
        Ok(logits) => Ok(logits.to_vec()),
        Err(e) => {
            crate::log_error!("[INFER] forward(token={}) failed: {}", token, e);
            Err(e)
        }
    })
}

/// Full generate call against the global engine.
pub fn generate(prompt: &[u32], max_new: usize, temperature: Fx, top_p: Fx) -> KResult<Vec<u32>> {
    with(|k| {
        match k
            .engine()?
            .generate(prompt, max_new, temperature, top_p)
        {
            Ok(tokens) => Ok(tokens),
            Err(e) => {
                crate::log_error!("[INFER] generate failed: {}", e);
                Err(e)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;
    use crate::fixed::FX_ONE;
    use crate::gguf::testutil::Builder;
    use crate::memory::PAGE_SIZE;
    use core::alloc::Layout;

    fn tiny_model_image() -> alloc::vec::Vec<u8> {
        let ones = alloc::vec![1.0f32; 8];
        let sq: alloc::vec::Vec<f32> = (0..64).map(|i| 0.02 * ((i % 5) as f32 - 2.0)).collect();
        let ff: alloc::vec::Vec<f32> = (0..128).map(|i| 0.01 * ((i % 3) as f32 - 1.0)).collect();
        Builder::new()
            .kv_str("general.architecture", "llama")
            .kv_u32("llama.embedding_length", 8)
            .kv_u32("llama.block_count", 1)
            .kv_u32("llama.attention.head_count", 2)
            .kv_u32("llama.feed_forward_length", 16)
            .kv_u32("llama.context_length", 8)
            .kv_u32("llama.vocab_size", 4)
            .tensor_f32("token_embd.weight", &[8, 4], &[0.05f32; 32])
            .tensor_f32("blk.0.attn_norm.weight", &[8], &ones)
            .tensor_f32("blk.0.attn_q.weight", &[8, 8], &sq)
            .tensor_f32("blk.0.attn_k.weight", &[8, 8], &sq)
            .tensor_f32("blk.0.attn_v.weight", &[8, 8], &sq)
            .tensor_f32("blk.0.attn_output.weight", &[8, 8], &sq)
            .tensor_f32("blk.0.ffn_norm.weight", &[8], &ones)
            .tensor_f32("blk.0.ffn_gate.weight", &[8, 16], &ff)
            .tensor_f32("blk.0.ffn_up.weight", &[8, 16], &ff)
            .tensor_f32("blk.0.ffn_down.weight", &[16, 8], &ff)
            .tensor_f32("output_norm.weight", &[8], &ones)
            .build()
    }

    /// The boot flow shares one global slot, so the whole lifecycle runs
    /// in a single test.
    #[test]
    fn boot_to_inference_lifecycle() {
        // Nothing booted yet
        assert_eq!(forward(0).err(), Some(KernelError::NotInit));

        let layout = Layout::from_size_align(512 * PAGE_SIZE, PAGE_SIZE).unwrap();
        let region = unsafe { alloc::alloc::alloc(layout) };
        assert!(!region.is_null());

        boot(region as usize, 512 * PAGE_SIZE).unwrap();
        assert_eq!(
            boot(region as usize, 512 * PAGE_SIZE).err(),
            Some(KernelError::AlreadyInit)
        );

        // PMM + DMA reachable through the kernel value
        with(|k| {
            let addr = k.pmm().alloc_pages(4)?;
            k.pmm().free_pages(addr, 4)?;
            let buf = k.dma().alloc_coherent(100)?;
            k.dma().free_coherent(buf)
        })
        .unwrap();

        // Model load before a block device is attached
        with(|k| k.load_model(0)).map(|_| ()).unwrap_err();

        let image = tiny_model_image();
        let image_len = image.len() as u64;
        with(|k| {
            k.attach_block(alloc::boxed::Box::new(RamDisk::from_bytes(image)));
            Ok(())
        })
        .unwrap();

        with(|k| k.load_model(image_len)).unwrap();
        assert_eq!(
            with(|k| k.load_model(image_len)).err(),
            Some(KernelError::AlreadyInit)
        );

        let logits = forward(1).unwrap();
        assert_eq!(logits.len(), 4);

        let tokens = generate(&[0, 1], 4, FX_ONE, FX_ONE).unwrap();
        assert!(tokens.iter().all(|&t| t < 4));

        // Bad token prints a diagnostic and propagates the error
        assert_eq!(forward(999).err(), Some(KernelError::Bounds));

        with(|k| k.reset_inference()).unwrap();
        with(|k| {
            k.cleanup_inference();
            Ok(())
        })
        .unwrap();
        assert_eq!(forward(0).err(), Some(KernelError::NotInit));

        shutdown();
        assert_eq!(forward(0).err(), Some(KernelError::NotInit));
        unsafe { alloc::alloc::dealloc(region, layout) };
    }
}
