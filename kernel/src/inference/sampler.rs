//! Token sampling
//!
//! Greedy argmax at (near-)zero temperature; otherwise temperature-scaled
//! softmax, nucleus truncation at `top_p`, and a multinomial draw from the
//! kernel xorshift RNG.

use super::weights::xorshift64;
use crate::cpu::simd;
use crate::err::{KResult, KernelError};
use crate::fixed::{fx_div, Fx, FX_ONE};
use alloc::vec::Vec;

/// Temperatures below ~0.1 collapse to argmax.
pub const GREEDY_TEMP_THRESHOLD: Fx = 6554;

/// Index of the largest logit.
pub fn argmax(logits: &[Fx]) -> u32 {
    let mut best = 0usize;
    for (i, &v) in logits.iter().enumerate() {
        if v > logits[best] {
            best = i;
        }
    }
    best as u32
}

/// Sample a token id from `logits`.
pub fn sample(logits: &[Fx], temperature: Fx, top_p: Fx, rng: &mut u64) -> KResult<u32> {
    if logits.is_empty() {
        return Err(KernelError::Null);
    }
    if temperature < GREEDY_TEMP_THRESHOLD {
        return Ok(argmax(logits));
    }

    let mut probs: Vec<Fx> = logits.iter().map(|&l| fx_div(l, temperature)).collect();
    simd::softmax(&mut probs);

    // Sort indices by probability, descending
    let mut order: Vec<u32> = (0..logits.len() as u32).collect();
    order.sort_unstable_by(|&a, &b| probs[b as usize].cmp(&probs[a as usize]));

    // Smallest prefix whose cumulative probability reaches top_p
    let target = if top_p <= 0 || top_p >= FX_ONE {
        i64::MAX
    } else {
        top_p as i64
    };
    let mut prefix = 0usize;
    let mut cum: i64 = 0;
    while prefix < order.len() {
        cum += probs[order[prefix] as usize] as i64;
        prefix += 1;
        if cum >= target {
            break;
        }
    }
    if prefix == 0 || cum <= 0 {
        return Ok(argmax(logits));
    }

    // Multinomial draw within the prefix
    let mut r = (xorshift64(rng) % cum as u64) as i64;
    for &idx in &order[..prefix] {
        r -= probs[idx as usize] as i64;
        if r < 0 {
            return Ok(idx);
        }
    }
    Ok(order[prefix - 1])
}

/// Cumulative nucleus size for a probability mass — exposed for tests.
pub fn nucleus_len(probs_desc: &[Fx], top_p: Fx) -> usize {
    let mut cum: i64 = 0;
    for (i, &p) in probs_desc.iter().enumerate() {
        cum += p as i64;
        if cum >= top_p as i64 {
            return i + 1;
        }
    }
    probs_desc.len()
}
