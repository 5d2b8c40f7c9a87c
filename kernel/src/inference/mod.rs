//! Transformer inference runtime
//!
//! Decoder-only forward pass over Q16.16 fixed point: RMSNorm → QKV
//! projections (through the quantized codec) → RoPE → KV cache → scaled
//! dot-product attention → output projection → SwiGLU FFN, with residual
//! adds around both sublayers. One token per step; the KV cache carries
//! the past.

pub mod sampler;
pub mod weights;

use crate::cpu::simd;
use crate::err::{KResult, KernelError};
use crate::fixed::{
    fx_cos, fx_from_f32, fx_inv_sqrt, fx_mul, fx_silu, fx_sin, Fx, FX_ONE, FX_TAU,
};
use crate::gguf::GgufModel;
use crate::kvcache::{EvictionPolicy, KvCache, KvCacheConfig, KvElemType};
use alloc::vec;
use alloc::vec::Vec;
use weights::EngineWeights;

// ═══════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub n_vocab: u32,
    pub n_embd: u32,
    pub n_layer: u32,
    pub n_heads: u32,
    pub n_kv_heads: u32,
    pub n_ff: u32,
    pub max_seq_len: u32,
    /// RMSNorm epsilon in Q16.16 (≥ 1).
    pub rms_eps: Fx,
    pub rope_base: f32,
    pub rope_dim: u32,
}

impl EngineConfig {
    pub fn validate(&self) -> KResult<()> {
        if self.n_vocab == 0
            || self.n_embd == 0
            || self.n_layer == 0
            || self.n_heads == 0
            || self.n_kv_heads == 0
            || self.n_ff == 0
            || self.max_seq_len == 0
        {
            return Err(KernelError::Bounds);
        }
        if self.n_embd % self.n_heads != 0 {
            return Err(KernelError::Invalid);
        }
        if self.n_kv_heads > self.n_heads || self.n_heads % self.n_kv_heads != 0 {
            return Err(KernelError::Invalid);
        }
        Ok(())
    }

    /// Derive the engine config from parsed GGUF metadata.
    pub fn from_arch(arch: &crate::gguf::GgufModelArch) -> Self {
        EngineConfig {
            n_vocab: arch.n_vocab,
            n_embd: arch.n_embd,
            n_layer: arch.n_layer,
            n_heads: arch.n_head,
            n_kv_heads: arch.n_head_kv,
            n_ff: arch.n_ff,
            max_seq_len: arch.n_ctx.min(crate::kvcache::KV_MAX_SEQ_LEN),
            rms_eps: fx_from_f32(arch.rms_eps).max(1),
            rope_base: arch.rope_base,
            rope_dim: arch.rope_dim,
        }
    }

    #[inline]
    pub fn head_dim(&self) -> usize {
        (self.n_embd / self.n_heads) as usize
    }

    #[inline]
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads as usize * self.head_dim()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// RoPE
// ═══════════════════════════════════════════════════════════════════════

/// Natural log without libm, for the RoPE frequency table (load time only).
fn ln_f32(x: f32) -> f32 {
    if x <= 0.0 {
        return 0.0;
    }
    let bits = x.to_bits();
    let e = (((bits >> 23) & 0xFF) as i32 - 127) as f32;
    let m = f32::from_bits((bits & 0x007F_FFFF) | 0x3F80_0000); // [1, 2)
    let t = (m - 1.0) / (m + 1.0);
    let t2 = t * t;
    let ln_m = 2.0 * t * (1.0 + t2 / 3.0 + t2 * t2 / 5.0 + t2 * t2 * t2 / 7.0);
    ln_m + e * core::f32::consts::LN_2
}

/// Per-pair rotation frequencies `base^(-2i/rope_dim)` in Q16.16.
fn rope_freq_table(base: f32, rope_dim: usize, head_dim: usize) -> Vec<Fx> {
    let dim = rope_dim.min(head_dim).max(2);
    let ln_base = ln_f32(base);
    let mut freqs = Vec::with_capacity(dim / 2);
    for i in 0..dim / 2 {
        let exponent = -(2.0 * i as f32 / dim as f32) * ln_base;
        freqs.push(crate::fixed::fx_exp(fx_from_f32(exponent)));
    }
    freqs
}

/// Rotate each `(2i, 2i+1)` pair of every head by the position-dependent
/// angle. The angle product is reduced mod 2π in 64 bits first, so large
/// positions keep their precision.
pub fn apply_rope(v: &mut [Fx], heads: usize, head_dim: usize, pos: u32, freqs: &[Fx]) {
    for h in 0..heads {
        let base = h * head_dim;
        for (i, &f) in freqs.iter().enumerate() {
            let angle = ((pos as i64 * f as i64) % FX_TAU as i64) as Fx;
            let s = fx_sin(angle);
            let c = fx_cos(angle);
            let a = v[base + 2 * i];
            let b = v[base + 2 * i + 1];
            v[base + 2 * i] = fx_mul(a, c).wrapping_sub(fx_mul(b, s));
            v[base + 2 * i + 1] = fx_mul(a, s).wrapping_add(fx_mul(b, c));
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════

/// Scratch buffers reused across forward calls.
struct Scratch {
    x: Vec<Fx>,
    xn: Vec<Fx>,
    xb: Vec<Fx>,
    q: Vec<Fx>,
    k: Vec<Fx>,
    v: Vec<Fx>,
    attn: Vec<Fx>,
    scores: Vec<Fx>,
    gate: Vec<Fx>,
    up: Vec<Fx>,
    ffn: Vec<Fx>,
    logits: Vec<Fx>,
}

pub struct InferenceEngine {
    cfg: EngineConfig,
    model: Option<GgufModel>,
    weights: EngineWeights,
    kv: KvCache,
    bufs: Scratch,
    rope_freqs: Vec<Fx>,
    inv_sqrt_hd: Fx,
    pos: u32,
    rng: u64,
    tokens_generated: u64,
    eos_id: Option<u32>,
}

impl InferenceEngine {
    /// Model-less engine on synthetic weights (bring-up and tests).
    pub fn new_synthetic(cfg: EngineConfig) -> KResult<Self> {
        cfg.validate()?;
        let weights = weights::synthetic(&cfg);
        Self::build(cfg, None, weights, None)
    }

    /// Engine over a loaded GGUF model; the engine takes ownership of the
    /// model and its tensor storage.
    pub fn from_model(model: GgufModel) -> KResult<Self> {
        let cfg = EngineConfig::from_arch(&model.arch);
        cfg.validate()?;
        let weights = weights::from_gguf(&model, &cfg)?;
        let eos = Some(model.arch.eos_id);
        Self::build(cfg, Some(model), weights, eos)
    }

    fn build(
        cfg: EngineConfig,
        model: Option<GgufModel>,
        weights: EngineWeights,
        eos_id: Option<u32>,
    ) -> KResult<Self> {
        let kv = KvCache::create(KvCacheConfig {
            n_layers: cfg.n_layer,
            n_kv_heads: cfg.n_kv_heads,
            head_dim: cfg.head_dim() as u32,
            max_seq_len: cfg.max_seq_len,
            elem: KvElemType::Fixed,
            policy: EvictionPolicy::None,
            window: 0,
        })?;

        let n_embd = cfg.n_embd as usize;
        let bufs = Scratch {
            x: vec![0; n_embd],
            xn: vec![0; n_embd],
            xb: vec![0; n_embd],
            q: vec![0; n_embd],
            k: vec![0; cfg.kv_dim()],
            v: vec![0; cfg.kv_dim()],
            attn: vec![0; n_embd],
            scores: vec![0; cfg.max_seq_len as usize],
            gate: vec![0; cfg.n_ff as usize],
            up: vec![0; cfg.n_ff as usize],
            ffn: vec![0; cfg.n_ff as usize],
            logits: vec![0; cfg.n_vocab as usize],
        };

        let rope_freqs = rope_freq_table(cfg.rope_base, cfg.rope_dim as usize, cfg.head_dim());
        let inv_sqrt_hd = fx_inv_sqrt((cfg.head_dim() as Fx).wrapping_mul(FX_ONE));

        crate::log!(
            "[INFER] engine up: vocab={} embd={} layers={} heads={}/{} ff={} ctx={}",
            cfg.n_vocab,
            cfg.n_embd,
            cfg.n_layer,
            cfg.n_heads,
            cfg.n_kv_heads,
            cfg.n_ff,
            cfg.max_seq_len
        );

        Ok(InferenceEngine {
            cfg,
            model,
            weights,
            kv,
            bufs,
            rope_freqs,
            inv_sqrt_hd,
            pos: 0,
            // Timer-seeded so sampling varies across boots; | 1 keeps the
            // xorshift state nonzero on targets without a cycle counter.
            rng: crate::cpu::tsc::read_cycles().wrapping_add(0x5EED_BA5E) | 1,
            tokens_generated: 0,
            eos_id,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn position(&self) -> u32 {
        self.pos
    }

    /// (current position, tokens generated since boot)
    pub fn stats(&self) -> (u32, u64) {
        (self.pos, self.tokens_generated)
    }

    /// Rewind to position 0 and drop the cached context.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.kv.reset();
    }

    /// One decoding step: run `token` through every layer at the current
    /// position and return the vocabulary logits.
    pub fn forward(&mut self, token: u32) -> KResult<&[Fx]> {
        if token >= self.cfg.n_vocab {
            return Err(KernelError::Bounds);
        }
        if self.pos >= self.cfg.max_seq_len {
            return Err(KernelError::Bounds);
        }
        let p = self.pos;
        let n_embd = self.cfg.n_embd as usize;
        let n_heads = self.cfg.n_heads as usize;
        let n_kv_heads = self.cfg.n_kv_heads as usize;
        let hd = self.cfg.head_dim();
        let kv_dim = self.cfg.kv_dim();
        let n_ff = self.cfg.n_ff as usize;
        let group = n_heads / n_kv_heads;
        let eps = self.cfg.rms_eps;

        // ── Token embedding ─────────────────────────────────────────
        match &self.weights.embed {
            Some(table) => {
                let row = &table[token as usize * n_embd..(token as usize + 1) * n_embd];
                self.bufs.x.copy_from_slice(row);
            }
            None => {
                for (i, x) in self.bufs.x.iter_mut().enumerate() {
                    *x = weights::pseudo_embed(token, i as u32);
                }
            }
        }

        for l in 0..self.cfg.n_layer as usize {
            let layer = &self.weights.layers[l];
            let model = self.model.as_ref();
            let bufs = &mut self.bufs;

            // ── Attention sublayer ──────────────────────────────────
            simd::rmsnorm(&mut bufs.xn, &bufs.x, &layer.attn_norm, eps);

            layer.wq.apply(model, &bufs.xn, &mut bufs.q)?;
            layer.wk.apply(model, &bufs.xn, &mut bufs.k)?;
            layer.wv.apply(model, &bufs.xn, &mut bufs.v)?;

            apply_rope(&mut bufs.q, n_heads, hd, p, &self.rope_freqs);
            apply_rope(&mut bufs.k, n_kv_heads, hd, p, &self.rope_freqs);

            // A failed store must not advance anything: position and
            // seq_len only move after success.
            self.kv.store_fx(l as u32, p, &bufs.k[..kv_dim], &bufs.v[..kv_dim])?;

            let n_ctx = self.kv.layer_stats(l as u32)?.seq_len as usize;
            let keys = self.kv.keys_fx(l as u32, n_ctx as u32)?;
            let vals = self.kv.values_fx(l as u32, n_ctx as u32)?;

            for a in bufs.attn.iter_mut() {
                *a = 0;
            }
            for h in 0..n_heads {
                let kvh = h / group;
                let qh = &bufs.q[h * hd..(h + 1) * hd];

                for t in 0..n_ctx {
                    let krow = &keys[t * kv_dim + kvh * hd..t * kv_dim + (kvh + 1) * hd];
                    bufs.scores[t] = fx_mul(simd::dot(qh, krow), self.inv_sqrt_hd);
                }
                simd::softmax(&mut bufs.scores[..n_ctx]);

                for t in 0..n_ctx {
                    let w = bufs.scores[t];
                    if w == 0 {
                        continue;
                    }
                    let vrow = &vals[t * kv_dim + kvh * hd..t * kv_dim + (kvh + 1) * hd];
                    let out = &mut bufs.attn[h * hd..(h + 1) * hd];
                    for d in 0..hd {
                        out[d] = out[d].wrapping_add(fx_mul(w, vrow[d]));
                    }
                }
            }

            layer.wo.apply(model, &bufs.attn, &mut bufs.xb)?;
            for i in 0..n_embd {
                bufs.x[i] = bufs.x[i].wrapping_add(bufs.xb[i]);
            }

            // ── FFN sublayer: down(silu(gate(x)) · up(x)) ───────────
            simd::rmsnorm(&mut bufs.xn, &bufs.x, &layer.ffn_norm, eps);
            layer.w_gate.apply(model, &bufs.xn, &mut bufs.gate)?;
            layer.w_up.apply(model, &bufs.xn, &mut bufs.up)?;
            for i in 0..n_ff {
                bufs.ffn[i] = fx_mul(fx_silu(bufs.gate[i]), bufs.up[i]);
            }
            layer.w_down.apply(model, &bufs.ffn, &mut bufs.xb)?;
            for i in 0..n_embd {
                bufs.x[i] = bufs.x[i].wrapping_add(bufs.xb[i]);
            }
        }

        // ── Output head ─────────────────────────────────────────────
        {
            let bufs = &mut self.bufs;
            simd::rmsnorm(&mut bufs.xn, &bufs.x, &self.weights.out_norm, eps);
        }
        self.weights
            .w_out
            .apply(self.model.as_ref(), &self.bufs.xn, &mut self.bufs.logits)?;

        self.pos += 1;
        Ok(&self.bufs.logits)
    }

    /// Latest logits (valid after at least one forward).
    pub fn logits(&self) -> &[Fx] {
        &self.bufs.logits
    }

    /// Prefill the prompt, then sample up to `max_new` tokens. Stops at
    /// EOS (when known) or the context limit.
    pub fn generate(
        &mut self,
        prompt: &[u32],
        max_new: usize,
        temperature: Fx,
        top_p: Fx,
    ) -> KResult<Vec<u32>> {
        for &t in prompt {
            self.forward(t)?;
        }

        let mut out = Vec::new();
        let mut next = if prompt.is_empty() {
            self.model.as_ref().map(|m| m.arch.bos_id).unwrap_or(0)
        } else {
            sampler::sample(&self.bufs.logits, temperature, top_p, &mut self.rng)?
        };

        for _ in 0..max_new {
            if self.pos >= self.cfg.max_seq_len {
                break;
            }
            if Some(next) == self.eos_id {
                break;
            }
            out.push(next);
            self.tokens_generated += 1;
            self.forward(next)?;
            next = sampler::sample(&self.bufs.logits, temperature, top_p, &mut self.rng)?;
        }
        Ok(out)
    }

    /// Token text from the model vocabulary, when present.
    pub fn token_text(&self, id: u32) -> Option<&str> {
        self.model
            .as_ref()
            .and_then(|m| m.vocab.tokens.get(id as usize))
            .map(|s| s.as_str())
    }

    /// Render generated token ids as text. SentencePiece word markers
    /// (`▁`) become spaces; ids outside the vocabulary render as `<id>`.
    pub fn decode(&self, tokens: &[u32]) -> alloc::string::String {
        use core::fmt::Write;
        let mut out = alloc::string::String::new();
        for &t in tokens {
            match self.token_text(t) {
                Some(text) => {
                    for ch in text.chars() {
                        out.push(if ch == '\u{2581}' { ' ' } else { ch });
                    }
                }
                None => {
                    let _ = write!(out, "<{}>", t);
                }
            }
        }
        out
    }
}
