//! Per-layer key/value attention cache
//!
//! Each layer owns two page-aligned buffers sized
//! `max_seq_len · n_kv_heads · head_dim · elem_size`; the vector for
//! position `p` lives at byte offset `p · vector_bytes`. A magic/version
//! stamp guards use-after-destroy, and per-layer `(seq_len, start_pos,
//! stats)` track occupancy.
//!
//! Eviction on an overflowing store:
//! - `None`     — the store fails with `BOUNDS`, state untouched.
//! - `Sliding`  — K and V shift left far enough that the incoming vector
//!                lands inside the window (overlap-safe move).
//! - `Ring`     — `start_pos` advances modulo `max_seq_len`, new writes
//!                overwrite the oldest slot.
//! - `Attention`— reserved; behaves as `Sliding`.

use crate::err::{KResult, KernelError};
use crate::fixed::Fx;
use crate::memory::heap::AlignedBuf;
use crate::memory::PAGE_SIZE;
use alloc::vec::Vec;

pub const KV_CACHE_MAGIC: u32 = 0x4B56_4331; // "KVC1"
pub const KV_CACHE_VERSION: u32 = 1;

pub const KV_MAX_LAYERS: u32 = 128;
pub const KV_MAX_KV_HEADS: u32 = 256;
pub const KV_MAX_HEAD_DIM: u32 = 512;
pub const KV_MAX_SEQ_LEN: u32 = 32_768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvElemType {
    F32,
    /// Q16.16 fixed point — what the inference engine stores.
    Fixed,
    /// IEEE binary16 carried as u16.
    F16,
}

impl KvElemType {
    pub fn size(&self) -> usize {
        match self {
            KvElemType::F32 | KvElemType::Fixed => 4,
            KvElemType::F16 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    None,
    Sliding,
    Ring,
    /// Reserved: attention-weighted retention. Falls back to sliding.
    Attention,
}

#[derive(Debug, Clone, Copy)]
pub struct KvCacheConfig {
    pub n_layers: u32,
    pub n_kv_heads: u32,
    pub head_dim: u32,
    pub max_seq_len: u32,
    pub elem: KvElemType,
    pub policy: EvictionPolicy,
    /// Window for sliding eviction; ignored by other policies.
    pub window: u32,
}

impl KvCacheConfig {
    pub fn vector_elems(&self) -> usize {
        self.n_kv_heads as usize * self.head_dim as usize
    }

    pub fn vector_bytes(&self) -> usize {
        self.vector_elems() * self.elem.size()
    }
}

/// Per-layer occupancy and counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct KvLayerStats {
    pub seq_len: u32,
    pub start_pos: u32,
    pub stores: u64,
    pub evictions: u64,
}

struct LayerState {
    keys: AlignedBuf,
    values: AlignedBuf,
    seq_len: u32,
    start_pos: u32,
    stores: u64,
    evictions: u64,
}

pub struct KvCache {
    magic: u32,
    version: u32,
    config: KvCacheConfig,
    layers: Vec<LayerState>,
}

impl KvCache {
    /// Validate the config and allocate every layer's K/V buffers
    /// page-aligned. On any allocation failure all prior buffers are
    /// released before the error returns.
    pub fn create(config: KvCacheConfig) -> KResult<Self> {
        if config.n_layers == 0 || config.n_layers > KV_MAX_LAYERS {
            return Err(KernelError::Bounds);
        }
        if config.n_kv_heads == 0 || config.n_kv_heads > KV_MAX_KV_HEADS {
            return Err(KernelError::Bounds);
        }
        if config.head_dim == 0 || config.head_dim > KV_MAX_HEAD_DIM {
            return Err(KernelError::Bounds);
        }
        if config.max_seq_len == 0 || config.max_seq_len > KV_MAX_SEQ_LEN {
            return Err(KernelError::Bounds);
        }
        if matches!(config.policy, EvictionPolicy::Sliding | EvictionPolicy::Attention)
            && (config.window == 0 || config.window > config.max_seq_len)
        {
            return Err(KernelError::Invalid);
        }

        let buf_bytes = config.max_seq_len as usize * config.vector_bytes();
        let mut layers = Vec::new();
        layers
            .try_reserve_exact(config.n_layers as usize)
            .map_err(|_| KernelError::NoMem)?;
        for _ in 0..config.n_layers {
            // An error here drops `layers`, freeing every earlier buffer.
            let keys = AlignedBuf::new_zeroed(buf_bytes, PAGE_SIZE)?;
            let values = AlignedBuf::new_zeroed(buf_bytes, PAGE_SIZE)?;
            layers.push(LayerState {
                keys,
                values,
                seq_len: 0,
                start_pos: 0,
                stores: 0,
                evictions: 0,
            });
        }

        Ok(KvCache {
            magic: KV_CACHE_MAGIC,
            version: KV_CACHE_VERSION,
            config,
            layers,
        })
    }

    /// Liveness check. The magic is read volatilely so a destroyed cache
    /// reached through a stale pointer fails fast; cross-CPU ordering of
    /// this read is deliberately left unspecified (single writer today).
    pub fn is_valid(&self) -> bool {
        let magic = unsafe { core::ptr::read_volatile(&self.magic) };
        magic == KV_CACHE_MAGIC && self.version == KV_CACHE_VERSION
    }

    pub fn config(&self) -> &KvCacheConfig {
        &self.config
    }

    fn check(&self, layer: u32) -> KResult<()> {
        if !self.is_valid() {
            return Err(KernelError::NotInit);
        }
        if layer >= self.config.n_layers {
            return Err(KernelError::Bounds);
        }
        Ok(())
    }

    /// Store the K and V vectors for `pos` into `layer`.
    pub fn store(&mut self, layer: u32, pos: u32, key: &[u8], value: &[u8]) -> KResult<()> {
        self.check(layer)?;
        let vb = self.config.vector_bytes();
        if key.is_empty() || value.is_empty() {
            return Err(KernelError::Null);
        }
        if key.len() != vb || value.len() != vb {
            return Err(KernelError::Bounds);
        }

        let max = self.config.max_seq_len;
        let policy = self.config.policy;
        let window = self.config.window;
        let state = &mut self.layers[layer as usize];

        let slot = if pos >= max {
            match policy {
                EvictionPolicy::None => return Err(KernelError::Bounds),
                EvictionPolicy::Sliding | EvictionPolicy::Attention => {
                    // Shift so the incoming vector fits inside the window.
                    // An empty layer shifts nothing and appends at slot 0.
                    let shift = state
                        .seq_len
                        .saturating_sub(window - 1)
                        .max(1)
                        .min(state.seq_len);
                    let keep = state.seq_len - shift;
                    unsafe {
                        // Overlapping regions: memmove semantics
                        core::ptr::copy(
                            state.keys.as_ptr().add(shift as usize * vb),
                            state.keys.as_mut_ptr(),
                            keep as usize * vb,
                        );
                        core::ptr::copy(
                            state.values.as_ptr().add(shift as usize * vb),
                            state.values.as_mut_ptr(),
                            keep as usize * vb,
                        );
                    }
                    state.seq_len = keep;
                    state.start_pos += shift;
                    state.evictions += shift as u64;
                    keep
                }
                EvictionPolicy::Ring => {
                    let slot = pos % max;
                    if state.seq_len >= max {
                        state.start_pos = (state.start_pos + 1) % max;
                        state.evictions += 1;
                    }
                    slot
                }
            }
        } else {
            pos
        };

        let off = slot as usize * vb;
        state.keys.as_mut_slice()[off..off + vb].copy_from_slice(key);
        state.values.as_mut_slice()[off..off + vb].copy_from_slice(value);

        if slot >= state.seq_len {
            state.seq_len = slot + 1;
        }
        state.stores += 1;
        Ok(())
    }

    fn copy_out(
        &self,
        layer: u32,
        start: u32,
        n: u32,
        dst: &mut [u8],
        keys: bool,
    ) -> KResult<()> {
        self.check(layer)?;
        let state = &self.layers[layer as usize];
        // Overflow-safe bounds: start + n ≤ seq_len without the addition
        if n > state.seq_len || start > state.seq_len - n {
            return Err(KernelError::Bounds);
        }
        let vb = self.config.vector_bytes();
        let bytes = n as usize * vb;
        if dst.len() < bytes {
            return Err(KernelError::Bounds);
        }
        let off = start as usize * vb;
        let src = if keys {
            &state.keys.as_slice()[off..off + bytes]
        } else {
            &state.values.as_slice()[off..off + bytes]
        };
        dst[..bytes].copy_from_slice(src);
        Ok(())
    }

    pub fn get_keys(&self, layer: u32, start: u32, n: u32, dst: &mut [u8]) -> KResult<()> {
        self.copy_out(layer, start, n, dst, true)
    }

    pub fn get_values(&self, layer: u32, start: u32, n: u32, dst: &mut [u8]) -> KResult<()> {
        self.copy_out(layer, start, n, dst, false)
    }

    // ── Fixed-point fast path for the inference engine ──────────

    /// Store Q16.16 vectors (element type must be `Fixed`).
    pub fn store_fx(&mut self, layer: u32, pos: u32, key: &[Fx], value: &[Fx]) -> KResult<()> {
        if self.config.elem != KvElemType::Fixed {
            return Err(KernelError::Invalid);
        }
        self.store(layer, pos, fx_as_bytes(key), fx_as_bytes(value))
    }

    /// Borrow the first `n` cached key vectors as Q16.16 values.
    pub fn keys_fx(&self, layer: u32, n: u32) -> KResult<&[Fx]> {
        self.typed_slice(layer, n, true)
    }

    /// Borrow the first `n` cached value vectors as Q16.16 values.
    pub fn values_fx(&self, layer: u32, n: u32) -> KResult<&[Fx]> {
        self.typed_slice(layer, n, false)
    }

    fn typed_slice(&self, layer: u32, n: u32, keys: bool) -> KResult<&[Fx]> {
        if self.config.elem != KvElemType::Fixed {
            return Err(KernelError::Invalid);
        }
        self.check(layer)?;
        let state = &self.layers[layer as usize];
        if n > state.seq_len {
            return Err(KernelError::Bounds);
        }
        let elems = n as usize * self.config.vector_elems();
        let buf = if keys { &state.keys } else { &state.values };
        Ok(unsafe { core::slice::from_raw_parts(buf.as_ptr() as *const Fx, elems) })
    }

    // ── Lifecycle / stats ───────────────────────────────────────

    /// Drop all cached positions, keeping the allocations.
    pub fn reset(&mut self) {
        for state in &mut self.layers {
            state.seq_len = 0;
            state.start_pos = 0;
        }
    }

    pub fn layer_stats(&self, layer: u32) -> KResult<KvLayerStats> {
        self.check(layer)?;
        let s = &self.layers[layer as usize];
        Ok(KvLayerStats {
            seq_len: s.seq_len,
            start_pos: s.start_pos,
            stores: s.stores,
            evictions: s.evictions,
        })
    }

    /// Tear down, clearing the magic before buffers are freed so a stale
    /// reference trips `NotInit` instead of reading freed pages.
    pub fn destroy(mut self) {
        self.magic = 0;
        // layers drop here, releasing every K/V buffer
    }

    #[cfg(test)]
    fn clear_magic(&mut self) {
        self.magic = 0;
    }
}

impl Drop for KvCache {
    fn drop(&mut self) {
        self.magic = 0;
    }
}

#[inline]
fn fx_as_bytes(v: &[Fx]) -> &[u8] {
    unsafe { core::slice::from_raw_parts(v.as_ptr() as *const u8, core::mem::size_of_val(v)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn config(max_seq: u32, policy: EvictionPolicy, window: u32) -> KvCacheConfig {
        KvCacheConfig {
            n_layers: 2,
            n_kv_heads: 2,
            head_dim: 4,
            max_seq_len: max_seq,
            elem: KvElemType::Fixed,
            policy,
            window,
        }
    }

    fn vec_for(tag: u8, vb: usize) -> alloc::vec::Vec<u8> {
        (0..vb).map(|i| tag.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn create_validates_ranges() {
        let base = config(8, EvictionPolicy::None, 0);

        let mut c = base;
        c.n_layers = 0;
        assert_eq!(KvCache::create(c).err(), Some(KernelError::Bounds));
        c = base;
        c.n_layers = KV_MAX_LAYERS + 1;
        assert_eq!(KvCache::create(c).err(), Some(KernelError::Bounds));
        c = base;
        c.n_kv_heads = KV_MAX_KV_HEADS + 1;
        assert_eq!(KvCache::create(c).err(), Some(KernelError::Bounds));
        c = base;
        c.head_dim = KV_MAX_HEAD_DIM + 1;
        assert_eq!(KvCache::create(c).err(), Some(KernelError::Bounds));
        c = base;
        c.max_seq_len = KV_MAX_SEQ_LEN + 1;
        assert_eq!(KvCache::create(c).err(), Some(KernelError::Bounds));
        // Sliding with a zero or oversized window
        c = base;
        c.policy = EvictionPolicy::Sliding;
        c.window = 0;
        assert_eq!(KvCache::create(c).err(), Some(KernelError::Invalid));
        c.window = 9;
        assert_eq!(KvCache::create(c).err(), Some(KernelError::Invalid));
    }

    #[test]
    fn store_and_read_back() {
        let cfg = config(8, EvictionPolicy::None, 0);
        let vb = cfg.vector_bytes();
        let mut cache = KvCache::create(cfg).unwrap();
        assert!(cache.is_valid());

        let k0 = vec_for(0x10, vb);
        let v0 = vec_for(0x80, vb);
        cache.store(0, 0, &k0, &v0).unwrap();
        cache.store(0, 1, &vec_for(0x11, vb), &vec_for(0x81, vb)).unwrap();

        let mut out = vec![0u8; 2 * vb];
        cache.get_keys(0, 0, 2, &mut out).unwrap();
        assert_eq!(&out[..vb], &k0[..]);
        cache.get_values(0, 0, 1, &mut out).unwrap();
        assert_eq!(&out[..vb], &v0[..]);

        let stats = cache.layer_stats(0).unwrap();
        assert_eq!(stats.seq_len, 2);
        assert_eq!(stats.start_pos, 0);
        assert_eq!(stats.stores, 2);
        // Layer 1 untouched
        assert_eq!(cache.layer_stats(1).unwrap().seq_len, 0);
    }

    #[test]
    fn overflow_without_eviction_is_rejected_unchanged() {
        let cfg = config(4, EvictionPolicy::None, 0);
        let vb = cfg.vector_bytes();
        let mut cache = KvCache::create(cfg).unwrap();
        for p in 0..4 {
            cache
                .store(0, p, &vec_for(p as u8, vb), &vec_for(p as u8, vb))
                .unwrap();
        }
        let before = cache.layer_stats(0).unwrap();
        assert_eq!(
            cache.store(0, 4, &vec_for(9, vb), &vec_for(9, vb)),
            Err(KernelError::Bounds)
        );
        let after = cache.layer_stats(0).unwrap();
        assert_eq!(after.seq_len, before.seq_len);
        assert_eq!(after.start_pos, before.start_pos);
        assert_eq!(after.stores, before.stores);
    }

    #[test]
    fn sliding_window_scenario() {
        // max_seq_len = 8, window = 4: store 0..=8
        let cfg = config(8, EvictionPolicy::Sliding, 4);
        let vb = cfg.vector_bytes();
        let mut cache = KvCache::create(cfg).unwrap();

        for p in 0..8u32 {
            cache
                .store(0, p, &vec_for(p as u8, vb), &vec_for(0x40 + p as u8, vb))
                .unwrap();
        }
        assert_eq!(cache.layer_stats(0).unwrap().seq_len, 8);

        cache
            .store(0, 8, &vec_for(8, vb), &vec_for(0x48, vb))
            .unwrap();
        let stats = cache.layer_stats(0).unwrap();
        assert_eq!(stats.seq_len, 4);
        assert_eq!(stats.start_pos, 5);

        // The surviving window reads back: original positions 5,6,7 plus
        // the new vector, now at slots 0..3.
        let mut out = vec![0u8; 4 * vb];
        cache.get_keys(0, 0, 4, &mut out).unwrap();
        assert_eq!(out[0], 5); // position 5's tag
        assert_eq!(out[vb], 6);
        assert_eq!(out[2 * vb], 7);
        assert_eq!(out[3 * vb], 8);
    }

    #[test]
    fn sliding_store_on_empty_layer() {
        // An out-of-range position on a fresh layer appends at slot 0
        // instead of corrupting state.
        let cfg = config(8, EvictionPolicy::Sliding, 4);
        let vb = cfg.vector_bytes();
        let mut cache = KvCache::create(cfg).unwrap();
        cache
            .store(0, 100, &vec_for(7, vb), &vec_for(7, vb))
            .unwrap();
        let stats = cache.layer_stats(0).unwrap();
        assert_eq!(stats.seq_len, 1);
        assert_eq!(stats.start_pos, 0);
        let mut out = vec![0u8; vb];
        cache.get_keys(0, 0, 1, &mut out).unwrap();
        assert_eq!(out[0], 7);
    }

    #[test]
    fn ring_overwrites_oldest() {
        let cfg = config(4, EvictionPolicy::Ring, 0);
        let vb = cfg.vector_bytes();
        let mut cache = KvCache::create(cfg).unwrap();
        for p in 0..4u32 {
            cache
                .store(0, p, &vec_for(p as u8, vb), &vec_for(p as u8, vb))
                .unwrap();
        }
        cache.store(0, 4, &vec_for(44, vb), &vec_for(44, vb)).unwrap();
        let stats = cache.layer_stats(0).unwrap();
        assert_eq!(stats.seq_len, 4);
        assert_eq!(stats.start_pos, 1);

        let mut out = vec![0u8; vb];
        cache.get_keys(0, 0, 1, &mut out).unwrap();
        assert_eq!(out[0], 44); // slot 0 overwritten
    }

    #[test]
    fn get_bounds_are_overflow_safe() {
        let cfg = config(8, EvictionPolicy::None, 0);
        let vb = cfg.vector_bytes();
        let mut cache = KvCache::create(cfg).unwrap();
        cache.store(0, 0, &vec_for(1, vb), &vec_for(1, vb)).unwrap();

        let mut out = vec![0u8; 8 * vb];
        assert_eq!(
            cache.get_keys(0, 0, 2, &mut out),
            Err(KernelError::Bounds)
        );
        assert_eq!(
            cache.get_keys(0, u32::MAX, 1, &mut out),
            Err(KernelError::Bounds)
        );
        assert_eq!(
            cache.get_keys(0, 1, u32::MAX, &mut out),
            Err(KernelError::Bounds)
        );
        // Short destination
        let mut small = vec![0u8; vb - 1];
        assert_eq!(
            cache.get_keys(0, 0, 1, &mut small),
            Err(KernelError::Bounds)
        );
    }

    #[test]
    fn fixed_point_fast_path() {
        let cfg = config(8, EvictionPolicy::None, 0);
        let ve = cfg.vector_elems();
        let mut cache = KvCache::create(cfg).unwrap();

        let k: alloc::vec::Vec<Fx> = (0..ve as Fx).collect();
        let v: alloc::vec::Vec<Fx> = (0..ve as Fx).map(|x| -x).collect();
        cache.store_fx(0, 0, &k, &v).unwrap();

        assert_eq!(cache.keys_fx(0, 1).unwrap(), &k[..]);
        assert_eq!(cache.values_fx(0, 1).unwrap(), &v[..]);
        assert_eq!(cache.keys_fx(0, 2).err(), Some(KernelError::Bounds));
    }

    #[test]
    fn cleared_magic_blocks_use() {
        let cfg = config(8, EvictionPolicy::None, 0);
        let vb = cfg.vector_bytes();
        let mut cache = KvCache::create(cfg).unwrap();
        cache.clear_magic();
        assert!(!cache.is_valid());
        assert_eq!(
            cache.store(0, 0, &vec_for(0, vb), &vec_for(0, vb)),
            Err(KernelError::NotInit)
        );
        let mut out = vec![0u8; vb];
        assert_eq!(cache.get_keys(0, 0, 1, &mut out), Err(KernelError::NotInit));
    }

    #[test]
    fn reset_clears_positions() {
        let cfg = config(8, EvictionPolicy::None, 0);
        let vb = cfg.vector_bytes();
        let mut cache = KvCache::create(cfg).unwrap();
        cache.store(0, 0, &vec_for(1, vb), &vec_for(1, vb)).unwrap();
        cache.reset();
        assert_eq!(cache.layer_stats(0).unwrap().seq_len, 0);
        cache.destroy();
    }
}
