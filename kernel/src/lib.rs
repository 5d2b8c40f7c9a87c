//! EMBODIOS kernel core
//!
//! A bare-metal kernel whose only application is transformer inference:
//! the machine boots straight into an engine that loads a quantized GGUF
//! model from a block device and answers prompts. This crate is the core —
//! fixed-point math, SIMD kernels, the quantized codec, the buddy page
//! allocator and heap, DMA and NVMe, the GGUF loader, the KV cache, and
//! the forward pass. Boot assembly, the shell, and per-device register
//! maps live in the (external) boot layer, which hands this crate a
//! memory region, a console sink, and a block device.
//!
//! `no_std` + `alloc`; the same sources build hosted for the test suite.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod accel;
pub mod block;
pub mod console;
pub mod cpu;
pub mod dma;
pub mod err;
pub mod fixed;
pub mod gguf;
pub mod inference;
pub mod kernel;
pub mod ktest;
pub mod kvcache;
pub mod logger;
pub mod memory;
pub mod nvme;
pub mod quant;

pub use err::{KResult, KernelError};
pub use fixed::Fx;
