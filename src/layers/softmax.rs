//! Output Softmax
//!
//! Turns each `(b, t)` row of `Vp` logits into a probability distribution
//! over the true vocabulary:
//!
//! ```text
//! probs[i] = exp(logits[i] - max) / Σ_{j<V} exp(logits[j] - max)   for i < V
//! probs[i] = 0                                                    for V <= i < Vp
//! ```
//!
//! Subtracting the row maximum keeps `exp` from overflowing without changing
//! the result. The padded tail is written as exact zeros so a sampler can
//! never land on it.

use rayon::prelude::*;

/// Row-wise softmax of `logits` (N, Vp) into `probs` (N, Vp)
pub fn softmax_forward(
    probs: &mut [f32],
    logits: &[f32],
    rows: usize,
    vocab_size: usize,
    padded_vocab_size: usize,
) {
    let (v, vp) = (vocab_size, padded_vocab_size);
    assert!(v <= vp, "vocab_size exceeds padded_vocab_size");
    assert_eq!(logits.len(), rows * vp);
    assert_eq!(probs.len(), rows * vp);

    probs
        .par_chunks_mut(vp)
        .zip(logits.par_chunks(vp))
        .for_each(|(probs_row, logits_row)| {
            let maxval = logits_row[..v]
                .iter()
                .fold(f32::NEG_INFINITY, |a, &b| a.max(b));

            let mut sum = 0.0f32;
            for (p, &l) in probs_row[..v].iter_mut().zip(&logits_row[..v]) {
                *p = (l - maxval).exp();
                sum += *p;
            }
            for p in probs_row[..v].iter_mut() {
                *p /= sum;
            }
            probs_row[v..].fill(0.0);
        });
}
