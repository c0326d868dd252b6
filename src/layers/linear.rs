//! Matrix Multiplication (Linear Projection)
//!
//! Every projection in GPT-2 is a matmul against a weight stored
//! `(out_channels, in_channels)`, i.e. PyTorch's `nn.Linear` layout:
//!
//! ```text
//! Input:  inp    [B*T, C]
//! Weight: weight [OC, C]
//! Bias:   bias   [OC]        (optional)
//! Output: out    [B*T, OC] = inp @ weightᵀ + bias
//! ```
//!
//! ## Two Forward Paths
//!
//! - **Tiled**: processes `LOOP_UNROLL` rows per task so each weight element
//!   loaded from memory is reused across eight rows. Taken when `B*T` is a
//!   multiple of `LOOP_UNROLL`.
//! - **Naive**: one row per task, plain triple loop.
//!
//! Both paths start each output from the bias (or zero) and add products in
//! ascending input-channel order, so they produce bit-identical results.
//!
//! ## Backward Pass
//!
//! ```text
//! dinp    += dout @ weight
//! dweight += doutᵀ @ inp
//! dbias   += sum(dout, rows)
//! ```

use rayon::prelude::*;

/// Rows handled together by the tiled forward path
pub const LOOP_UNROLL: usize = 8;

/// `out = inp @ weightᵀ + bias`, dispatching to the tiled path when
/// `rows % LOOP_UNROLL == 0`
#[allow(clippy::too_many_arguments)]
pub fn matmul_forward(
    out: &mut [f32],
    inp: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    rows: usize,
    in_channels: usize,
    out_channels: usize,
) {
    if rows % LOOP_UNROLL == 0 {
        matmul_forward_tiled(out, inp, weight, bias, rows, in_channels, out_channels);
    } else {
        matmul_forward_naive(out, inp, weight, bias, rows, in_channels, out_channels);
    }
}

fn check_forward_shapes(
    out: &[f32],
    inp: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    rows: usize,
    c: usize,
    oc: usize,
) {
    assert_eq!(out.len(), rows * oc, "matmul output size");
    assert_eq!(inp.len(), rows * c, "matmul input size");
    assert_eq!(weight.len(), oc * c, "matmul weight size");
    if let Some(bias) = bias {
        assert_eq!(bias.len(), oc, "matmul bias size");
    }
}

/// Reference path: one task per output row
pub fn matmul_forward_naive(
    out: &mut [f32],
    inp: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    rows: usize,
    in_channels: usize,
    out_channels: usize,
) {
    let (c, oc) = (in_channels, out_channels);
    check_forward_shapes(out, inp, weight, bias, rows, c, oc);

    out.par_chunks_mut(oc)
        .zip(inp.par_chunks(c))
        .for_each(|(out_row, inp_row)| {
            for (o, out_o) in out_row.iter_mut().enumerate() {
                let w_row = &weight[o * c..(o + 1) * c];
                let mut val = bias.map_or(0.0, |b| b[o]);
                for (&x, &w) in inp_row.iter().zip(w_row) {
                    val += x * w;
                }
                *out_o = val;
            }
        });
}

/// Register-tiled path: one task per block of `LOOP_UNROLL` rows
///
/// # Panics
///
/// If `rows` is not a multiple of `LOOP_UNROLL`.
pub fn matmul_forward_tiled(
    out: &mut [f32],
    inp: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    rows: usize,
    in_channels: usize,
    out_channels: usize,
) {
    let (c, oc) = (in_channels, out_channels);
    check_forward_shapes(out, inp, weight, bias, rows, c, oc);
    assert_eq!(rows % LOOP_UNROLL, 0, "tiled matmul needs rows % {} == 0", LOOP_UNROLL);

    out.par_chunks_mut(LOOP_UNROLL * oc)
        .zip(inp.par_chunks(LOOP_UNROLL * c))
        .for_each(|(out_block, inp_block)| {
            for o in 0..oc {
                let mut result = [bias.map_or(0.0, |b| b[o]); LOOP_UNROLL];
                let w_row = &weight[o * c..(o + 1) * c];
                for (i, &w) in w_row.iter().enumerate() {
                    for (ibt, acc) in result.iter_mut().enumerate() {
                        *acc += inp_block[ibt * c + i] * w;
                    }
                }
                for (ibt, &val) in result.iter().enumerate() {
                    out_block[ibt * oc + o] = val;
                }
            }
        });
}

/// Accumulate gradients of `out = inp @ weightᵀ + bias`
///
/// `dinp` is parallel over rows, `dweight`/`dbias` parallel over output
/// channels; each element has a single writer.
#[allow(clippy::too_many_arguments)]
pub fn matmul_backward(
    dinp: &mut [f32],
    dweight: &mut [f32],
    dbias: Option<&mut [f32]>,
    dout: &[f32],
    inp: &[f32],
    weight: &[f32],
    rows: usize,
    in_channels: usize,
    out_channels: usize,
) {
    let (c, oc) = (in_channels, out_channels);
    assert_eq!(dinp.len(), rows * c);
    assert_eq!(inp.len(), rows * c);
    assert_eq!(dout.len(), rows * oc);
    assert_eq!(weight.len(), oc * c);
    assert_eq!(dweight.len(), oc * c);

    dinp.par_chunks_mut(c)
        .zip(dout.par_chunks(oc))
        .for_each(|(dinp_row, dout_row)| {
            for (o, &d) in dout_row.iter().enumerate() {
                let w_row = &weight[o * c..(o + 1) * c];
                for (di, &w) in dinp_row.iter_mut().zip(w_row) {
                    *di += w * d;
                }
            }
        });

    dweight
        .par_chunks_mut(c)
        .enumerate()
        .for_each(|(o, dw_row)| {
            for (dout_row, inp_row) in dout.chunks_exact(oc).zip(inp.chunks_exact(c)) {
                let d = dout_row[o];
                for (dw, &x) in dw_row.iter_mut().zip(inp_row) {
                    *dw += x * d;
                }
            }
        });

    if let Some(dbias) = dbias {
        assert_eq!(dbias.len(), oc);
        dbias.par_iter_mut().enumerate().for_each(|(o, db)| {
            *db += dout.chunks_exact(oc).map(|row| row[o]).sum::<f32>();
        });
    }
}
