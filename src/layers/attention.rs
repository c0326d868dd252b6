//! Causal Multi-Head Self-Attention
//!
//! Attention is the only kernel that mixes information across time steps.
//! The input is the fused QKV projection, `3C` wide per `(b, t)`:
//!
//! ```text
//! inp[b,t,:] = [ query (C) | key (C) | value (C) ]
//! ```
//!
//! Each of the `NH` heads owns a contiguous `hs = C / NH` slice of the
//! query, key and value.
//!
//! ## Forward Pass
//!
//! For every `(b, t, h)`:
//!
//! ```text
//! preatt[t2] = (query_t · key_t2) / √hs          for t2 <= t
//! att[t2]    = softmax(preatt[0..=t])[t2]         (0 for t2 > t)
//! out_t      = Σ_{t2<=t} att[t2] * value_t2
//! ```
//!
//! The softmax subtracts the row maximum before exponentiating. A row always
//! contains `t2 = t`, so it is never empty.
//!
//! `preatt` and `att` are `(B, NH, T, T)` and kept for the backward pass.
//!
//! ## Backward Pass
//!
//! Reverses the three stages: the value-weighted sum, the softmax Jacobian
//! `att[t2] * (δ(t2,t3) - att[t3])`, and the scaled query-key product.
//!
//! ## Parallelism
//!
//! Work is split by batch element. Different batch elements never read or
//! write each other's rows, so the gradient scatter into keys and values
//! (which crosses time steps) stays inside one task.

use rayon::prelude::*;

/// Causal self-attention over a fused QKV buffer
///
/// # Arguments
///
/// * `out` - Attention output (B, T, C)
/// * `preatt` - Scaled scores before softmax (B, NH, T, T)
/// * `att` - Attention weights after softmax (B, NH, T, T)
/// * `inp` - Fused query/key/value (B, T, 3C)
#[allow(clippy::too_many_arguments)]
pub fn attention_forward(
    out: &mut [f32],
    preatt: &mut [f32],
    att: &mut [f32],
    inp: &[f32],
    batch_size: usize,
    seq_len: usize,
    channels: usize,
    num_heads: usize,
) {
    let (t_len, c, nh) = (seq_len, channels, num_heads);
    let c3 = 3 * c;
    let hs = c / nh;
    let scale = 1.0 / (hs as f32).sqrt();
    assert_eq!(c % nh, 0, "channels must divide evenly into heads");
    assert_eq!(inp.len(), batch_size * t_len * c3);
    assert_eq!(out.len(), batch_size * t_len * c);
    assert_eq!(preatt.len(), batch_size * nh * t_len * t_len);
    assert_eq!(att.len(), batch_size * nh * t_len * t_len);

    out.par_chunks_mut(t_len * c)
        .zip(preatt.par_chunks_mut(nh * t_len * t_len))
        .zip(att.par_chunks_mut(nh * t_len * t_len))
        .zip(inp.par_chunks(t_len * c3))
        .for_each(|(((out_b, preatt_b), att_b), inp_b)| {
            for t in 0..t_len {
                for h in 0..nh {
                    let query_t = &inp_b[t * c3 + h * hs..t * c3 + (h + 1) * hs];
                    let row = (h * t_len + t) * t_len;
                    let preatt_bth = &mut preatt_b[row..row + t_len];
                    let att_bth = &mut att_b[row..row + t_len];

                    // Pass 1: scores and running max
                    let mut maxval = f32::NEG_INFINITY;
                    for t2 in 0..=t {
                        let key_t2 = &inp_b[t2 * c3 + c + h * hs..t2 * c3 + c + (h + 1) * hs];
                        let val = query_t
                            .iter()
                            .zip(key_t2)
                            .map(|(q, k)| q * k)
                            .sum::<f32>()
                            * scale;
                        if val > maxval {
                            maxval = val;
                        }
                        preatt_bth[t2] = val;
                    }

                    // Pass 2: exponentiate and sum
                    let mut expsum = 0.0f32;
                    for t2 in 0..=t {
                        let expv = (preatt_bth[t2] - maxval).exp();
                        expsum += expv;
                        att_bth[t2] = expv;
                    }
                    let expsum_inv = if expsum == 0.0 { 0.0 } else { 1.0 / expsum };

                    // Pass 3: normalize, masked positions are exactly zero
                    for t2 in 0..t_len {
                        if t2 <= t {
                            att_bth[t2] *= expsum_inv;
                        } else {
                            preatt_bth[t2] = 0.0;
                            att_bth[t2] = 0.0;
                        }
                    }

                    // Pass 4: weighted sum of values
                    let out_bth = &mut out_b[t * c + h * hs..t * c + (h + 1) * hs];
                    out_bth.fill(0.0);
                    for t2 in 0..=t {
                        let value_t2 =
                            &inp_b[t2 * c3 + 2 * c + h * hs..t2 * c3 + 2 * c + (h + 1) * hs];
                        let a = att_bth[t2];
                        for (o, &v) in out_bth.iter_mut().zip(value_t2) {
                            *o += a * v;
                        }
                    }
                }
            }
        });
}

/// Accumulate attention gradients into `dinp` (B, T, 3C)
///
/// `dpreatt` and `datt` are scratch gradients of the cached scores; they are
/// accumulated into as well.
#[allow(clippy::too_many_arguments)]
pub fn attention_backward(
    dinp: &mut [f32],
    dpreatt: &mut [f32],
    datt: &mut [f32],
    dout: &[f32],
    inp: &[f32],
    att: &[f32],
    batch_size: usize,
    seq_len: usize,
    channels: usize,
    num_heads: usize,
) {
    let (t_len, c, nh) = (seq_len, channels, num_heads);
    let c3 = 3 * c;
    let hs = c / nh;
    let scale = 1.0 / (hs as f32).sqrt();
    assert_eq!(inp.len(), batch_size * t_len * c3);
    assert_eq!(dinp.len(), batch_size * t_len * c3);
    assert_eq!(dout.len(), batch_size * t_len * c);
    assert_eq!(att.len(), batch_size * nh * t_len * t_len);
    assert_eq!(datt.len(), att.len());
    assert_eq!(dpreatt.len(), att.len());

    dinp.par_chunks_mut(t_len * c3)
        .zip(dpreatt.par_chunks_mut(nh * t_len * t_len))
        .zip(datt.par_chunks_mut(nh * t_len * t_len))
        .zip(inp.par_chunks(t_len * c3))
        .zip(att.par_chunks(nh * t_len * t_len))
        .zip(dout.par_chunks(t_len * c))
        .for_each(|(((((dinp_b, dpreatt_b), datt_b), inp_b), att_b), dout_b)| {
            for t in 0..t_len {
                for h in 0..nh {
                    let row = (h * t_len + t) * t_len;
                    let att_bth = &att_b[row..row + t_len];
                    let datt_bth = &mut datt_b[row..row + t_len];
                    let dpreatt_bth = &mut dpreatt_b[row..row + t_len];
                    let dout_bth = &dout_b[t * c + h * hs..t * c + (h + 1) * hs];
                    let q_off = t * c3 + h * hs;

                    // Through the value accumulation
                    for t2 in 0..=t {
                        let v_off = t2 * c3 + 2 * c + h * hs;
                        for i in 0..hs {
                            datt_bth[t2] += inp_b[v_off + i] * dout_bth[i];
                            dinp_b[v_off + i] += att_bth[t2] * dout_bth[i];
                        }
                    }

                    // Through the softmax
                    for t2 in 0..=t {
                        for t3 in 0..=t {
                            let indicator = if t2 == t3 { 1.0 } else { 0.0 };
                            let local_derivative = att_bth[t2] * (indicator - att_bth[t3]);
                            dpreatt_bth[t3] += local_derivative * datt_bth[t2];
                        }
                    }

                    // Through the query-key product
                    for t2 in 0..=t {
                        let k_off = t2 * c3 + c + h * hs;
                        let d = dpreatt_bth[t2] * scale;
                        for i in 0..hs {
                            dinp_b[q_off + i] += inp_b[k_off + i] * d;
                            dinp_b[k_off + i] += inp_b[q_off + i] * d;
                        }
                    }
                }
            }
        });
}
