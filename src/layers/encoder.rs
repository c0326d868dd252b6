//! Token + Position Embedding
//!
//! ```text
//! out[b,t,:] = wte[inp[b,t],:] + wpe[t,:]
//! ```
//!
//! The backward pass scatters `dout` rows back into the two embedding
//! tables. A token that appears several times in a batch receives the sum of
//! its gradients, so the scatter runs sequentially.

use rayon::prelude::*;

/// Embed a `(B, T)` batch of token ids into `out` (B, T, C)
///
/// Token ids must index a row of `wte`; callers validate them against the
/// true vocabulary first.
pub fn encoder_forward(
    out: &mut [f32],
    inp: &[u32],
    wte: &[f32],
    wpe: &[f32],
    batch_size: usize,
    seq_len: usize,
    channels: usize,
) {
    let c = channels;
    assert_eq!(inp.len(), batch_size * seq_len);
    assert_eq!(out.len(), batch_size * seq_len * c);
    assert!(wpe.len() >= seq_len * c, "position table shorter than sequence");

    out.par_chunks_mut(c).enumerate().for_each(|(bt, out_bt)| {
        let t = bt % seq_len;
        let ix = inp[bt] as usize;
        let wte_ix = &wte[ix * c..(ix + 1) * c];
        let wpe_t = &wpe[t * c..(t + 1) * c];
        for ((o, &tok), &pos) in out_bt.iter_mut().zip(wte_ix).zip(wpe_t) {
            *o = tok + pos;
        }
    });
}

/// Accumulate embedding gradients from `dout` (B, T, C)
pub fn encoder_backward(
    dwte: &mut [f32],
    dwpe: &mut [f32],
    dout: &[f32],
    inp: &[u32],
    batch_size: usize,
    seq_len: usize,
    channels: usize,
) {
    let c = channels;
    assert_eq!(inp.len(), batch_size * seq_len);
    assert_eq!(dout.len(), batch_size * seq_len * c);

    for (bt, dout_bt) in dout.chunks_exact(c).enumerate() {
        let t = bt % seq_len;
        let ix = inp[bt] as usize;
        for (d, &g) in dwte[ix * c..(ix + 1) * c].iter_mut().zip(dout_bt) {
            *d += g;
        }
        for (d, &g) in dwpe[t * c..(t + 1) * c].iter_mut().zip(dout_bt) {
            *d += g;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_adds_token_and_position_rows() {
        // V=3, maxT=2, C=2
        let wte = [0.0, 0.0, 1.0, 2.0, 10.0, 20.0];
        let wpe = [0.5, 0.5, 0.25, 0.25];
        let inp = [2, 1];
        let mut out = [0.0; 4];
        encoder_forward(&mut out, &inp, &wte, &wpe, 1, 2, 2);
        assert_eq!(out, [10.5, 20.5, 1.25, 2.25]);
    }

    #[test]
    fn test_backward_sums_repeated_tokens() {
        let inp = [1, 1, 0, 1];
        let dout = [1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0];
        let mut dwte = [0.0; 4];
        let mut dwpe = [0.0; 4];
        // B=2, T=2, C=2
        encoder_backward(&mut dwte, &mut dwpe, &dout, &inp, 2, 2, 2);
        assert_eq!(dwte, [3.0, 3.0, 7.0, 7.0]);
        assert_eq!(dwpe, [4.0, 4.0, 6.0, 6.0]);
    }

    #[test]
    #[should_panic]
    fn test_forward_rejects_wrong_output_size() {
        let mut out = [0.0; 3];
        encoder_forward(&mut out, &[0, 0], &[0.0; 4], &[0.0; 4], 1, 2, 2);
    }
}
