//! Weight storage and resolution
//!
//! Projection matrices stay in their packed GGUF encoding and are applied
//! through the quantized codec row kernels; norm vectors and the embedding
//! table are dequantized to Q16.16 once at load. When no model is present
//! (bring-up, tests) the engine runs on deterministic synthetic weights
//! and a hashed pseudo-embedding.

use super::EngineConfig;
use crate::cpu::simd;
use crate::err::{KResult, KernelError};
use crate::fixed::{fx_div, fx_mul, fx_sqrt, Fx, FX_ONE};
use crate::gguf::GgufModel;
use crate::quant;
use alloc::vec::Vec;

/// A matrix operand: either a packed tensor inside the model file or a
/// dense Q16.16 buffer.
pub enum MatWeight {
    Quant {
        tensor: usize,
        rows: usize,
        cols: usize,
    },
    Dense {
        data: Vec<Fx>,
        rows: usize,
        cols: usize,
    },
}

impl MatWeight {
    /// `y = W · x`
    pub fn apply(&self, model: Option<&GgufModel>, x: &[Fx], y: &mut [Fx]) -> KResult<()> {
        match self {
            MatWeight::Dense { data, rows, cols } => {
                simd::matvec(y, data, x, *rows, *cols);
                Ok(())
            }
            MatWeight::Quant { tensor, rows, cols } => {
                let model = model.ok_or(KernelError::NotInit)?;
                let info = model.tensors().get(*tensor).ok_or(KernelError::NotFound)?;
                let ty = info.ggml_type().ok_or(KernelError::Invalid)?;
                let data = model.tensor_data(info)?;
                quant::matvec_quant(ty, data, x, y, *rows, *cols)
            }
        }
    }
}

pub struct LayerWeights {
    pub attn_norm: Vec<Fx>,
    pub wq: MatWeight,
    pub wk: MatWeight,
    pub wv: MatWeight,
    pub wo: MatWeight,
    pub ffn_norm: Vec<Fx>,
    pub w_gate: MatWeight,
    pub w_up: MatWeight,
    pub w_down: MatWeight,
}

pub struct EngineWeights {
    /// Materialized embedding table `[n_vocab × n_embd]`; `None` falls back
    /// to the pseudo-embedding.
    pub embed: Option<Vec<Fx>>,
    pub layers: Vec<LayerWeights>,
    pub out_norm: Vec<Fx>,
    pub w_out: MatWeight,
}

// ═══════════════════════════════════════════════════════════════════════
// GGUF resolution
// ═══════════════════════════════════════════════════════════════════════

fn tensor_index(model: &GgufModel, name: &str) -> KResult<usize> {
    model
        .tensors()
        .iter()
        .position(|t| t.name == name)
        .ok_or(KernelError::NotFound)
}

fn resolve_mat(model: &GgufModel, name: &str, rows: usize, cols: usize) -> KResult<MatWeight> {
    let idx = tensor_index(model, name)?;
    let info = &model.tensors()[idx];
    let ty = info.ggml_type().ok_or(KernelError::Invalid)?;
    if quant::row_bytes(ty, cols).is_err() {
        return Err(KernelError::Invalid);
    }
    if info.shape_2d() != (rows, cols) {
        crate::log_error!(
            "[INFER] tensor '{}' shape {:?} != [{} x {}]",
            name,
            info.shape_2d(),
            rows,
            cols
        );
        return Err(KernelError::Invalid);
    }
    Ok(MatWeight::Quant {
        tensor: idx,
        rows,
        cols,
    })
}

fn dense_vec(model: &GgufModel, name: &str, n: usize) -> KResult<Vec<Fx>> {
    let idx = tensor_index(model, name)?;
    let info = &model.tensors()[idx];
    let ty = info.ggml_type().ok_or(KernelError::Invalid)?;
    if info.n_elements() as usize != n {
        return Err(KernelError::Invalid);
    }
    let data = model.tensor_data(info)?;
    let mut out = Vec::new();
    out.try_reserve_exact(n).map_err(|_| KernelError::NoMem)?;
    out.resize(n, 0);
    quant::dequantize(ty, data, &mut out, n)?;
    Ok(out)
}

/// Resolve the full weight set from a parsed model.
pub fn from_gguf(model: &GgufModel, cfg: &EngineConfig) -> KResult<EngineWeights> {
    let n_embd = cfg.n_embd as usize;
    let n_ff = cfg.n_ff as usize;
    let n_vocab = cfg.n_vocab as usize;
    let kv_dim = cfg.kv_dim();

    // Missing embedding table is survivable (pseudo-embedding); everything
    // else is required.
    let embed = dense_vec(model, "token_embd.weight", n_vocab * n_embd).ok();
    if embed.is_none() {
        crate::log_warn!("[INFER] token_embd.weight unavailable, using pseudo-embedding");
    }

    let mut layers = Vec::new();
    for i in 0..cfg.n_layer {
        let name = |suffix: &str| alloc::format!("blk.{}.{}", i, suffix);
        layers.push(LayerWeights {
            attn_norm: dense_vec(model, &name("attn_norm.weight"), n_embd)?,
            wq: resolve_mat(model, &name("attn_q.weight"), n_embd, n_embd)?,
            wk: resolve_mat(model, &name("attn_k.weight"), kv_dim, n_embd)?,
            wv: resolve_mat(model, &name("attn_v.weight"), kv_dim, n_embd)?,
            wo: resolve_mat(model, &name("attn_output.weight"), n_embd, n_embd)?,
            ffn_norm: dense_vec(model, &name("ffn_norm.weight"), n_embd)?,
            w_gate: resolve_mat(model, &name("ffn_gate.weight"), n_ff, n_embd)?,
            w_up: resolve_mat(model, &name("ffn_up.weight"), n_ff, n_embd)?,
            w_down: resolve_mat(model, &name("ffn_down.weight"), n_embd, n_ff)?,
        });
    }

    let out_norm = dense_vec(model, "output_norm.weight", n_embd)?;
    // Tied embeddings: fall back to the token embedding matrix, which has
    // the same [n_vocab × n_embd] orientation.
    let w_out = match resolve_mat(model, "output.weight", n_vocab, n_embd) {
        Ok(w) => w,
        Err(KernelError::NotFound) => resolve_mat(model, "token_embd.weight", n_vocab, n_embd)?,
        Err(e) => return Err(e),
    };

    Ok(EngineWeights {
        embed,
        layers,
        out_norm,
        w_out,
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Synthetic weights
// ═══════════════════════════════════════════════════════════════════════

#[inline]
pub fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

fn random_dense(rows: usize, cols: usize, seed: &mut u64) -> MatWeight {
    // Xavier-ish: values in ±1/√cols
    let scale = fx_div(FX_ONE, fx_sqrt((cols as Fx).wrapping_mul(FX_ONE)));
    let mut data = Vec::with_capacity(rows * cols);
    for _ in 0..rows * cols {
        let r = xorshift64(seed);
        // uniform in [-1, 1) then scaled
        let unit = ((r % (2 * FX_ONE as u64)) as i64 - FX_ONE as i64) as Fx;
        data.push(fx_mul(unit, scale));
    }
    MatWeight::Dense { data, rows, cols }
}

/// Deterministic random weights for a model-less engine.
pub fn synthetic(cfg: &EngineConfig) -> EngineWeights {
    let n_embd = cfg.n_embd as usize;
    let n_ff = cfg.n_ff as usize;
    let n_vocab = cfg.n_vocab as usize;
    let kv_dim = cfg.kv_dim();
    let mut seed = 0x45_4D42_4F44u64; // deterministic across boots

    let unit_norm = alloc::vec![FX_ONE; n_embd];
    let mut layers = Vec::with_capacity(cfg.n_layer as usize);
    for _ in 0..cfg.n_layer {
        layers.push(LayerWeights {
            attn_norm: unit_norm.clone(),
            wq: random_dense(n_embd, n_embd, &mut seed),
            wk: random_dense(kv_dim, n_embd, &mut seed),
            wv: random_dense(kv_dim, n_embd, &mut seed),
            wo: random_dense(n_embd, n_embd, &mut seed),
            ffn_norm: unit_norm.clone(),
            w_gate: random_dense(n_ff, n_embd, &mut seed),
            w_up: random_dense(n_ff, n_embd, &mut seed),
            w_down: random_dense(n_embd, n_ff, &mut seed),
        });
    }

    EngineWeights {
        embed: None,
        layers,
        out_norm: unit_norm,
        w_out: random_dense(n_vocab, n_embd, &mut seed),
    }
}

/// Hashed embedding for tokens with no materialized table: deterministic,
/// bounded to ±0.25.
#[inline]
pub fn pseudo_embed(token: u32, dim: u32) -> Fx {
    let mut s = (token as u64)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add((dim as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9))
        | 1;
    let r = xorshift64(&mut s);
    ((r % (FX_ONE as u64 / 2)) as i64 - FX_ONE as i64 / 4) as Fx
}
