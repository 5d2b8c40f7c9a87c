//! GGUF model loader
//!
//! Strict left-to-right parser for the GGUF container: header, KV metadata,
//! tensor directory, aligned tensor data. Every multi-byte read goes through
//! a bounded little-endian reader that rejects out-of-range sizes with
//! `DECODE` — a truncated file can never read past the buffer, and the
//! owned buffer is dropped on any error so nothing leaks.
//!
//! Versions 1 and 2 carry 32-bit counts and lengths, version 3 carries
//! 64-bit ones. Legacy GGML magics are rejected explicitly.

use crate::block::{BlockDevice, SECTOR_SIZE};
use crate::err::{KResult, KernelError};
use crate::memory::align_up;
use crate::quant::GgmlType;
use alloc::string::String;
use alloc::vec::Vec;

pub const GGUF_MAGIC: u32 = 0x4655_4747; // "GGUF" little-endian

/// Legacy pre-GGUF magics ("ggml", "ggmf", "ggjt"), rejected with a
/// distinct log line.
const LEGACY_MAGICS: [u32; 3] = [0x6767_6d6c, 0x6767_6d66, 0x6767_6a74];

pub const GGUF_MAX_KVS: u64 = 4096;
pub const GGUF_MAX_TENSORS: u64 = 65536;
pub const GGUF_MAX_STRING: u64 = 1 << 20;
pub const GGUF_MAX_ARRAY: u64 = 16 * 1024 * 1024;
pub const GGUF_MAX_VOCAB: usize = 262_144;
pub const GGUF_MAX_DIMS: u32 = 4;
/// Tensors beyond this are type-counted but not stored.
pub const GGUF_MAX_STORED_TENSORS: usize = 1024;
pub const GGUF_DEFAULT_ALIGNMENT: usize = 32;
pub const GGUF_MAX_ALIGNMENT: usize = 1 << 20;

/// Architecture prefixes understood by the metadata dispatcher.
const KNOWN_ARCHS: [&str; 5] = ["llama", "phi", "mistral", "qwen", "gemma"];

const CHUNK_BYTES: usize = 64 * 1024;

// ═══════════════════════════════════════════════════════════════════════
// Bounded reader
// ═══════════════════════════════════════════════════════════════════════

struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, off: 0 }
    }

    fn position(&self) -> usize {
        self.off
    }

    fn take(&mut self, n: usize) -> KResult<&'a [u8]> {
        let end = self.off.checked_add(n).ok_or(KernelError::Overflow)?;
        if end > self.buf.len() {
            return Err(KernelError::Decode);
        }
        let s = &self.buf[self.off..end];
        self.off = end;
        Ok(s)
    }

    fn skip(&mut self, n: u64) -> KResult<()> {
        let n = usize::try_from(n).map_err(|_| KernelError::Decode)?;
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> KResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> KResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> KResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> KResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn f32(&mut self) -> KResult<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn f64(&mut self) -> KResult<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    /// Count field: 64-bit from version 3, 32-bit before.
    fn count(&mut self, version: u32) -> KResult<u64> {
        if version >= 3 {
            self.u64()
        } else {
            Ok(self.u32()? as u64)
        }
    }

    /// Length-prefixed string (not NUL-terminated), bounded by `max`.
    fn string_bytes(&mut self, version: u32, max: u64) -> KResult<&'a [u8]> {
        let len = self.count(version)?;
        if len > max {
            return Err(KernelError::Decode);
        }
        self.take(len as usize)
    }

    fn key(&mut self, version: u32) -> KResult<&'a str> {
        let bytes = self.string_bytes(version, GGUF_MAX_STRING)?;
        core::str::from_utf8(bytes).map_err(|_| KernelError::Decode)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// KV value types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum ValueType {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    F32 = 6,
    Bool = 7,
    Str = 8,
    Array = 9,
    U64 = 10,
    I64 = 11,
    F64 = 12,
}

impl ValueType {
    fn from_u32(v: u32) -> KResult<Self> {
        Ok(match v {
            0 => ValueType::U8,
            1 => ValueType::I8,
            2 => ValueType::U16,
            3 => ValueType::I16,
            4 => ValueType::U32,
            5 => ValueType::I32,
            6 => ValueType::F32,
            7 => ValueType::Bool,
            8 => ValueType::Str,
            9 => ValueType::Array,
            10 => ValueType::U64,
            11 => ValueType::I64,
            12 => ValueType::F64,
            _ => return Err(KernelError::Decode),
        })
    }

    /// Fixed on-disk size, or None for strings/arrays.
    fn fixed_size(&self) -> Option<u64> {
        Some(match self {
            ValueType::U8 | ValueType::I8 | ValueType::Bool => 1,
            ValueType::U16 | ValueType::I16 => 2,
            ValueType::U32 | ValueType::I32 | ValueType::F32 => 4,
            ValueType::U64 | ValueType::I64 | ValueType::F64 => 8,
            ValueType::Str | ValueType::Array => return None,
        })
    }
}

/// Type-directed skip for values we don't care about.
fn skip_value(r: &mut Reader, ty: ValueType, version: u32, depth: u32) -> KResult<()> {
    if depth > 4 {
        return Err(KernelError::Decode);
    }
    if let Some(sz) = ty.fixed_size() {
        return r.skip(sz);
    }
    match ty {
        ValueType::Str => {
            r.string_bytes(version, GGUF_MAX_STRING)?;
            Ok(())
        }
        ValueType::Array => {
            let inner = ValueType::from_u32(r.u32()?)?;
            let count = r.count(version)?;
            if count > GGUF_MAX_ARRAY {
                return Err(KernelError::Decode);
            }
            if let Some(sz) = inner.fixed_size() {
                r.skip(count.checked_mul(sz).ok_or(KernelError::Overflow)?)
            } else {
                for _ in 0..count {
                    skip_value(r, inner, version, depth + 1)?;
                }
                Ok(())
            }
        }
        _ => unreachable!(),
    }
}

/// Integer-valued KV regardless of declared width.
fn read_uint(r: &mut Reader, ty: ValueType) -> KResult<u64> {
    Ok(match ty {
        ValueType::U8 | ValueType::Bool => r.u8()? as u64,
        ValueType::I8 => r.u8()? as i8 as i64 as u64,
        ValueType::U16 => r.u16()? as u64,
        ValueType::I16 => r.u16()? as i16 as i64 as u64,
        ValueType::U32 => r.u32()? as u64,
        ValueType::I32 => r.u32()? as i32 as i64 as u64,
        ValueType::U64 => r.u64()?,
        ValueType::I64 => r.u64()?,
        _ => return Err(KernelError::Decode),
    })
}

/// Float-valued KV (F32 or F64 on disk).
fn read_float(r: &mut Reader, ty: ValueType) -> KResult<f32> {
    match ty {
        ValueType::F32 => r.f32(),
        ValueType::F64 => Ok(r.f64()? as f32),
        _ => Err(KernelError::Decode),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Extracted metadata
// ═══════════════════════════════════════════════════════════════════════

/// Model architecture pulled from the metadata KVs, with defaults applied
/// after the parse.
#[derive(Debug, Clone, Default)]
pub struct GgufModelArch {
    pub arch: String,
    pub n_embd: u32,
    pub n_layer: u32,
    pub n_head: u32,
    pub n_head_kv: u32,
    pub n_ff: u32,
    pub n_ctx: u32,
    pub n_vocab: u32,
    pub rms_eps: f32,
    pub rope_base: f32,
    pub rope_dim: u32,
    pub tokenizer_model: String,
    pub bos_id: u32,
    pub eos_id: u32,
    pub pad_id: u32,
}

#[derive(Debug, Clone, Default)]
pub struct GgufVocab {
    pub tokens: Vec<String>,
    pub scores: Vec<f32>,
    pub token_types: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub n_dims: u32,
    pub dims: [u64; 4],
    pub type_id: u32,
    pub offset: u64,
}

impl TensorInfo {
    pub fn ggml_type(&self) -> Option<GgmlType> {
        GgmlType::from_u32(self.type_id)
    }

    pub fn n_elements(&self) -> u64 {
        let mut n = 1u64;
        for d in 0..self.n_dims as usize {
            n = n.saturating_mul(self.dims[d].max(1));
        }
        n
    }

    /// Row length (ne[0]) and row count (product of outer dims).
    pub fn shape_2d(&self) -> (usize, usize) {
        let cols = self.dims[0].max(1) as usize;
        let mut rows = 1usize;
        for d in 1..self.n_dims as usize {
            rows = rows.saturating_mul(self.dims[d].max(1) as usize);
        }
        (rows, cols)
    }

    /// On-disk size, when the codec understands the type.
    pub fn data_bytes(&self) -> KResult<usize> {
        let ty = self.ggml_type().ok_or(KernelError::Decode)?;
        let (rows, cols) = self.shape_2d();
        let rb = crate::quant::row_bytes(ty, cols)?;
        rows.checked_mul(rb).ok_or(KernelError::Overflow)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Parsed model
// ═══════════════════════════════════════════════════════════════════════

/// A parsed GGUF file owning its backing buffer. Tensor data is borrowed
/// out of the buffer; the loader is the sole owner.
pub struct GgufModel {
    buf: Vec<u8>,
    pub version: u32,
    pub arch: GgufModelArch,
    pub vocab: GgufVocab,
    tensors: Vec<TensorInfo>,
    pub n_tensors_total: u64,
    pub alignment: usize,
    data_start: usize,
    type_counts: [u64; 16],
}

impl GgufModel {
    /// Parse an in-memory GGUF image, taking ownership of the buffer.
    pub fn parse(buf: Vec<u8>) -> KResult<Self> {
        // Any error drops `buf` here — single rollback point.
        let parsed = Self::parse_inner(&buf)?;
        let (version, arch, vocab, tensors, n_tensors_total, alignment, data_start, type_counts) =
            parsed;
        Ok(GgufModel {
            buf,
            version,
            arch,
            vocab,
            tensors,
            n_tensors_total,
            alignment,
            data_start,
            type_counts,
        })
    }

    #[allow(clippy::type_complexity)]
    fn parse_inner(
        buf: &[u8],
    ) -> KResult<(
        u32,
        GgufModelArch,
        GgufVocab,
        Vec<TensorInfo>,
        u64,
        usize,
        usize,
        [u64; 16],
    )> {
        let mut r = Reader::new(buf);

        let magic = r.u32().map_err(|_| KernelError::Decode)?;
        if magic != GGUF_MAGIC {
            if LEGACY_MAGICS.contains(&magic) {
                crate::log_error!("[GGUF] legacy GGML container rejected ({:#010x})", magic);
            }
            return Err(KernelError::Decode);
        }

        let version = r.u32()?;
        if !(1..=3).contains(&version) {
            return Err(KernelError::Decode);
        }

        let n_tensors = r.count(version)?;
        let n_kv = r.count(version)?;
        if n_tensors > GGUF_MAX_TENSORS || n_kv > GGUF_MAX_KVS {
            return Err(KernelError::Decode);
        }

        let mut arch = GgufModelArch::default();
        let mut vocab = GgufVocab::default();
        let mut alignment = GGUF_DEFAULT_ALIGNMENT;

        for _ in 0..n_kv {
            let key = r.key(version)?;
            let ty = ValueType::from_u32(r.u32()?)?;
            parse_kv(&mut r, key, ty, version, &mut arch, &mut vocab, &mut alignment)?;
        }

        // ── Tensor directory ──
        let mut tensors: Vec<TensorInfo> = Vec::new();
        let mut type_counts = [0u64; 16];
        for _ in 0..n_tensors {
            let name_bytes = r.string_bytes(version, GGUF_MAX_STRING)?;
            let name = String::from_utf8_lossy(name_bytes).into_owned();
            let n_dims = r.u32()?;
            if n_dims == 0 || n_dims > GGUF_MAX_DIMS {
                return Err(KernelError::Decode);
            }
            let mut dims = [0u64; 4];
            for d in 0..n_dims as usize {
                dims[d] = r.u64()?;
            }
            let type_id = r.u32()?;
            let offset = r.u64()?;

            if (type_id as usize) < type_counts.len() {
                type_counts[type_id as usize] += 1;
            }
            if tensors.len() < GGUF_MAX_STORED_TENSORS {
                tensors.push(TensorInfo {
                    name,
                    n_dims,
                    dims,
                    type_id,
                    offset,
                });
            }
        }

        // ── Tensor data section ──
        let data_start = align_up(r.position(), alignment);
        if data_start > buf.len() {
            return Err(KernelError::Decode);
        }
        let data_len = buf.len() - data_start;
        for t in &tensors {
            if t.ggml_type().is_some() {
                if let Ok(nbytes) = t.data_bytes() {
                    let end = (t.offset as usize)
                        .checked_add(nbytes)
                        .ok_or(KernelError::Overflow)?;
                    if end > data_len {
                        return Err(KernelError::Decode);
                    }
                }
            }
        }

        // ── Post-parse validation + defaults ──
        if arch.n_embd == 0 || arch.n_layer == 0 || arch.n_head == 0 {
            return Err(KernelError::Decode);
        }
        if arch.n_head_kv == 0 {
            arch.n_head_kv = arch.n_head;
        }
        if arch.n_ff == 0 {
            arch.n_ff = 4 * arch.n_embd;
        }
        if arch.n_ctx == 0 {
            arch.n_ctx = 2048;
        }
        if arch.n_vocab == 0 {
            arch.n_vocab = vocab.tokens.len() as u32;
        }
        if arch.rms_eps == 0.0 {
            arch.rms_eps = 1e-5;
        }
        if arch.rope_base == 0.0 {
            arch.rope_base = 10000.0;
        }
        if arch.rope_dim == 0 {
            arch.rope_dim = arch.n_embd / arch.n_head;
        }

        Ok((
            version,
            arch,
            vocab,
            tensors,
            n_tensors,
            alignment,
            data_start,
            type_counts,
        ))
    }

    /// Load a model image from a block device in sector-aligned 64 KiB
    /// chunks, then parse. `size = 0` means the whole device.
    pub fn load_from_block(dev: &mut dyn BlockDevice, size: u64) -> KResult<Self> {
        let size = if size == 0 { dev.capacity_bytes() } else { size };
        if size == 0 || size > dev.capacity_bytes() {
            return Err(KernelError::Bounds);
        }
        let size = size as usize;

        let total_sectors = (size + SECTOR_SIZE - 1) / SECTOR_SIZE;
        let padded = total_sectors * SECTOR_SIZE;

        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(padded).map_err(|_| KernelError::NoMem)?;
        buf.resize(padded, 0);

        let chunk_sectors = CHUNK_BYTES / SECTOR_SIZE;
        let mut lba = 0u64;
        let mut done = 0usize;
        while done < padded {
            let n = chunk_sectors.min(total_sectors - done / SECTOR_SIZE);
            if let Err(e) = dev.read(lba, n, &mut buf[done..done + n * SECTOR_SIZE]) {
                // Partial read aborts; the buffer drop is the rollback.
                crate::log_error!("[GGUF] block read failed at LBA {}: {}", lba, e);
                return Err(KernelError::Io);
            }
            lba += n as u64;
            done += n * SECTOR_SIZE;
        }

        buf.truncate(size);
        Self::parse(buf)
    }

    pub fn find_tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    /// Borrow a tensor's packed bytes out of the owned buffer.
    pub fn tensor_data(&self, t: &TensorInfo) -> KResult<&[u8]> {
        let nbytes = t.data_bytes()?;
        let start = self
            .data_start
            .checked_add(t.offset as usize)
            .ok_or(KernelError::Overflow)?;
        let end = start.checked_add(nbytes).ok_or(KernelError::Overflow)?;
        if end > self.buf.len() {
            return Err(KernelError::Decode);
        }
        Ok(&self.buf[start..end])
    }

    /// Most common tensor quantization in the directory (counts every
    /// directory entry, stored or not).
    pub fn predominant_type(&self) -> Option<GgmlType> {
        let (mut best, mut best_n) = (None, 0u64);
        for (id, &n) in self.type_counts.iter().enumerate() {
            if n > best_n {
                if let Some(t) = GgmlType::from_u32(id as u32) {
                    best = Some(t);
                    best_n = n;
                }
            }
        }
        best
    }
}

/// Dispatch one metadata KV. Well-known keys land in `arch`/`vocab`;
/// everything else is skipped by type.
fn parse_kv(
    r: &mut Reader,
    key: &str,
    ty: ValueType,
    version: u32,
    arch: &mut GgufModelArch,
    vocab: &mut GgufVocab,
    alignment: &mut usize,
) -> KResult<()> {
    match key {
        "general.architecture" => {
            if ty != ValueType::Str {
                return Err(KernelError::Decode);
            }
            let bytes = r.string_bytes(version, GGUF_MAX_STRING)?;
            arch.arch = String::from_utf8_lossy(bytes).into_owned();
            return Ok(());
        }
        "general.alignment" => {
            let v = read_uint(r, ty)? as usize;
            if v == 0 || !v.is_power_of_two() {
                return Err(KernelError::Decode);
            }
            *alignment = v.min(GGUF_MAX_ALIGNMENT);
            return Ok(());
        }
        "tokenizer.ggml.model" => {
            if ty != ValueType::Str {
                return Err(KernelError::Decode);
            }
            let bytes = r.string_bytes(version, GGUF_MAX_STRING)?;
            arch.tokenizer_model = String::from_utf8_lossy(bytes).into_owned();
            return Ok(());
        }
        "tokenizer.ggml.bos_token_id" => {
            arch.bos_id = read_uint(r, ty)? as u32;
            return Ok(());
        }
        "tokenizer.ggml.eos_token_id" => {
            arch.eos_id = read_uint(r, ty)? as u32;
            return Ok(());
        }
        "tokenizer.ggml.padding_token_id" => {
            arch.pad_id = read_uint(r, ty)? as u32;
            return Ok(());
        }
        "tokenizer.ggml.tokens" => {
            if ty != ValueType::Array {
                return Err(KernelError::Decode);
            }
            let inner = ValueType::from_u32(r.u32()?)?;
            if inner != ValueType::Str {
                return Err(KernelError::Decode);
            }
            let count = r.count(version)?;
            if count as usize > GGUF_MAX_VOCAB {
                return Err(KernelError::Decode);
            }
            let mut tokens = Vec::new();
            tokens
                .try_reserve_exact(count as usize)
                .map_err(|_| KernelError::NoMem)?;
            for _ in 0..count {
                let bytes = r.string_bytes(version, GGUF_MAX_STRING)?;
                tokens.push(String::from_utf8_lossy(bytes).into_owned());
            }
            vocab.tokens = tokens;
            return Ok(());
        }
        "tokenizer.ggml.scores" => {
            if ty != ValueType::Array {
                return Err(KernelError::Decode);
            }
            let inner = ValueType::from_u32(r.u32()?)?;
            if inner != ValueType::F32 {
                return Err(KernelError::Decode);
            }
            let count = r.count(version)?;
            if count as usize > GGUF_MAX_VOCAB {
                return Err(KernelError::Decode);
            }
            let mut scores = Vec::new();
            scores
                .try_reserve_exact(count as usize)
                .map_err(|_| KernelError::NoMem)?;
            for _ in 0..count {
                scores.push(r.f32()?);
            }
            vocab.scores = scores;
            return Ok(());
        }
        "tokenizer.ggml.token_type" => {
            if ty != ValueType::Array {
                return Err(KernelError::Decode);
            }
            let inner = ValueType::from_u32(r.u32()?)?;
            let count = r.count(version)?;
            if count as usize > GGUF_MAX_VOCAB {
                return Err(KernelError::Decode);
            }
            let mut types = Vec::new();
            types
                .try_reserve_exact(count as usize)
                .map_err(|_| KernelError::NoMem)?;
            for _ in 0..count {
                types.push(read_uint(r, inner)? as i32);
            }
            vocab.token_types = types;
            return Ok(());
        }
        _ => {}
    }

    // Architecture-prefixed keys: "<arch>.suffix" against the known set.
    for known in KNOWN_ARCHS {
        if key.len() > known.len() + 1
            && key.starts_with(known)
            && key.as_bytes()[known.len()] == b'.'
        {
            let suffix = &key[known.len() + 1..];
            match suffix {
                "context_length" => {
                    arch.n_ctx = read_uint(r, ty)? as u32;
                    return Ok(());
                }
                "embedding_length" => {
                    arch.n_embd = read_uint(r, ty)? as u32;
                    return Ok(());
                }
                "block_count" => {
                    arch.n_layer = read_uint(r, ty)? as u32;
                    return Ok(());
                }
                "feed_forward_length" => {
                    arch.n_ff = read_uint(r, ty)? as u32;
                    return Ok(());
                }
                "attention.head_count" => {
                    arch.n_head = read_uint(r, ty)? as u32;
                    return Ok(());
                }
                "attention.head_count_kv" => {
                    arch.n_head_kv = read_uint(r, ty)? as u32;
                    return Ok(());
                }
                "attention.layer_norm_rms_epsilon" => {
                    arch.rms_eps = read_float(r, ty)?;
                    return Ok(());
                }
                "rope.freq_base" => {
                    arch.rope_base = read_float(r, ty)?;
                    return Ok(());
                }
                "rope.dimension_count" => {
                    arch.rope_dim = read_uint(r, ty)? as u32;
                    return Ok(());
                }
                "vocab_size" => {
                    arch.n_vocab = read_uint(r, ty)? as u32;
                    return Ok(());
                }
                _ => break,
            }
        }
    }

    skip_value(r, ty, version, 0)
}
