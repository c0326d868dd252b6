//! Cross-Entropy Loss
//!
//! ```text
//! loss(b,t) = -ln(probs[b,t,target[b,t]])
//! ```
//!
//! A zero probability at the target gives an infinite loss. It is returned
//! as-is, not clamped.
//!
//! The backward pass is fused with the softmax: for probabilities from a
//! softmax over logits, `dloss/dlogit[i] = probs[i] - 1{i == target}`.

use rayon::prelude::*;

/// Per-position negative log-likelihood of `targets` under `probs` (N, Vp)
pub fn crossentropy_forward(
    losses: &mut [f32],
    probs: &[f32],
    targets: &[u32],
    rows: usize,
    padded_vocab_size: usize,
) {
    let vp = padded_vocab_size;
    assert_eq!(losses.len(), rows);
    assert_eq!(targets.len(), rows);
    assert_eq!(probs.len(), rows * vp);

    losses
        .par_iter_mut()
        .zip(probs.par_chunks(vp))
        .zip(targets.par_iter())
        .for_each(|((loss, probs_row), &target)| {
            *loss = -probs_row[target as usize].ln();
        });
}

/// Accumulate `dlosses[row] * (probs - onehot(target))` into `dlogits`
///
/// Only the first `V` entries of each row receive gradient; the padded
/// logits never influenced the loss.
pub fn crossentropy_softmax_backward(
    dlogits: &mut [f32],
    dlosses: &[f32],
    probs: &[f32],
    targets: &[u32],
    vocab_size: usize,
    padded_vocab_size: usize,
) {
    let (v, vp) = (vocab_size, padded_vocab_size);
    let rows = targets.len();
    assert_eq!(dlosses.len(), rows);
    assert_eq!(probs.len(), rows * vp);
    assert_eq!(dlogits.len(), rows * vp);

    dlogits
        .par_chunks_mut(vp)
        .zip(probs.par_chunks(vp))
        .zip(dlosses.par_iter().zip(targets.par_iter()))
        .for_each(|((dlogits_row, probs_row), (&dloss, &target))| {
            let target = target as usize;
            for (i, (d, &p)) in dlogits_row[..v].iter_mut().zip(&probs_row[..v]).enumerate() {
                let indicator = if i == target { 1.0 } else { 0.0 };
                *d += (p - indicator) * dloss;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_certain_target_has_zero_loss() {
        let probs = [0.0, 1.0, 0.0];
        let mut losses = [f32::NAN];
        crossentropy_forward(&mut losses, &probs, &[1], 1, 3);
        assert_eq!(losses[0], 0.0);
    }

    #[test]
    fn test_even_odds_loss_is_ln2() {
        let probs = [0.5, 0.5];
        let mut losses = [0.0];
        crossentropy_forward(&mut losses, &probs, &[0], 1, 2);
        assert!((losses[0] - 0.6931).abs() < 1e-4);
    }

    #[test]
    fn test_zero_probability_propagates_infinity() {
        let probs = [1.0, 0.0];
        let mut losses = [0.0];
        crossentropy_forward(&mut losses, &probs, &[1], 1, 2);
        assert!(losses[0].is_infinite() && losses[0] > 0.0);
    }

    #[test]
    fn test_backward_skips_padding() {
        let probs = [0.2, 0.3, 0.5, 0.0];
        let mut dlogits = [0.0; 4];
        crossentropy_softmax_backward(&mut dlogits, &[2.0], &probs, &[1], 3, 4);
        assert!((dlogits[0] - 0.4).abs() < 1e-6);
        assert!((dlogits[1] + 1.4).abs() < 1e-6);
        assert!((dlogits[2] - 1.0).abs() < 1e-6);
        assert_eq!(dlogits[3], 0.0);
    }
}
