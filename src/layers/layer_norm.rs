//! Layer Normalization
//!
//! Normalizes each `(b, t)` row of C channels to zero mean and unit
//! variance, then applies a learnable scale (weight) and shift (bias).
//!
//! ## Forward Pass
//!
//! ```text
//! 1. mean = sum(x) / C
//! 2. var  = sum((x - mean)²) / C        (population variance)
//! 3. rstd = 1 / √(var + ε)
//! 4. y    = weight * (x - mean) * rstd + bias
//! ```
//!
//! `mean` and `rstd` are cached per row so the backward pass does not have to
//! recompute them.
//!
//! ## Backward Pass
//!
//! With `norm = (x - mean) * rstd` and `dnorm = dy * weight`:
//!
//! ```text
//! dbias   += dy
//! dweight += norm * dy
//! dx      += rstd * (dnorm - mean(dnorm) - norm * mean(dnorm * norm))
//! ```
//!
//! The two mean terms account for every element of the row feeding into the
//! row's mean and variance.

use rayon::prelude::*;

/// Variance epsilon used by GPT-2
pub const LAYERNORM_EPS: f32 = 1e-5;

/// Normalize `inp` (N, C) into `out`, caching per-row `mean` and `rstd` (N)
#[allow(clippy::too_many_arguments)]
pub fn layernorm_forward(
    out: &mut [f32],
    mean: &mut [f32],
    rstd: &mut [f32],
    inp: &[f32],
    weight: &[f32],
    bias: &[f32],
    rows: usize,
    channels: usize,
) {
    let c = channels;
    assert_eq!(inp.len(), rows * c);
    assert_eq!(out.len(), rows * c);
    assert_eq!(mean.len(), rows);
    assert_eq!(rstd.len(), rows);
    assert_eq!(weight.len(), c);
    assert_eq!(bias.len(), c);

    out.par_chunks_mut(c)
        .zip(inp.par_chunks(c))
        .zip(mean.par_iter_mut().zip(rstd.par_iter_mut()))
        .for_each(|((out_row, x), (mean_row, rstd_row))| {
            let m = x.iter().sum::<f32>() / c as f32;
            let v = x.iter().map(|&xi| (xi - m) * (xi - m)).sum::<f32>() / c as f32;
            let s = 1.0 / (v + LAYERNORM_EPS).sqrt();

            for (((o, &xi), &w), &b) in out_row.iter_mut().zip(x).zip(weight).zip(bias) {
                let n = s * (xi - m);
                *o = n * w + b;
            }

            *mean_row = m;
            *rstd_row = s;
        });
}

/// Accumulate layernorm gradients into `dinp`, `dweight` and `dbias`
///
/// `dweight` and `dbias` sum over every row, so rows are visited in order.
#[allow(clippy::too_many_arguments)]
pub fn layernorm_backward(
    dinp: &mut [f32],
    dweight: &mut [f32],
    dbias: &mut [f32],
    dout: &[f32],
    inp: &[f32],
    weight: &[f32],
    mean: &[f32],
    rstd: &[f32],
    rows: usize,
    channels: usize,
) {
    let c = channels;
    assert_eq!(dinp.len(), rows * c);
    assert_eq!(dout.len(), rows * c);
    assert_eq!(inp.len(), rows * c);
    assert_eq!(mean.len(), rows);
    assert_eq!(rstd.len(), rows);
    assert_eq!(weight.len(), c);
    assert_eq!(dweight.len(), c);
    assert_eq!(dbias.len(), c);

    for row in 0..rows {
        let span = row * c..(row + 1) * c;
        let dout_row = &dout[span.clone()];
        let x = &inp[span.clone()];
        let dinp_row = &mut dinp[span];
        let m = mean[row];
        let s = rstd[row];

        // Two reductions: mean(dnorm) and mean(dnorm * norm)
        let mut dnorm_mean = 0.0f32;
        let mut dnorm_norm_mean = 0.0f32;
        for i in 0..c {
            let norm = (x[i] - m) * s;
            let dnorm = weight[i] * dout_row[i];
            dnorm_mean += dnorm;
            dnorm_norm_mean += dnorm * norm;
        }
        dnorm_mean /= c as f32;
        dnorm_norm_mean /= c as f32;

        for i in 0..c {
            let norm = (x[i] - m) * s;
            let dnorm = weight[i] * dout_row[i];
            dbias[i] += dout_row[i];
            dweight[i] += norm * dout_row[i];
            dinp_row[i] += (dnorm - dnorm_mean - norm * dnorm_norm_mean) * s;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_forward_known_row() {
        let inp = [1.0, 2.0, 3.0, 4.0];
        let weight = [1.0; 4];
        let bias = [0.0; 4];
        let mut out = [0.0; 4];
        let mut mean = [0.0; 1];
        let mut rstd = [0.0; 1];
        layernorm_forward(&mut out, &mut mean, &mut rstd, &inp, &weight, &bias, 1, 4);

        // Population variance of 1..4 is 1.25
        assert!((mean[0] - 2.5).abs() < 1e-6);
        assert!((rstd[0] - 1.0 / (1.25f32 + LAYERNORM_EPS).sqrt()).abs() < 1e-6);
        assert!((out[0] + 1.5 * rstd[0]).abs() < 1e-6);
        assert!((out[3] - 1.5 * rstd[0]).abs() < 1e-6);
    }

    #[test]
    fn test_forward_applies_scale_and_shift() {
        let inp = [0.0, 2.0];
        let weight = [2.0, 3.0];
        let bias = [10.0, 20.0];
        let mut out = [0.0; 2];
        let mut mean = [0.0; 1];
        let mut rstd = [0.0; 1];
        layernorm_forward(&mut out, &mut mean, &mut rstd, &inp, &weight, &bias, 1, 2);
        // norm ≈ [-1, 1]
        assert!((out[0] - 8.0).abs() < 1e-3);
        assert!((out[1] - 23.0).abs() < 1e-3);
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let c = 5;
        let inp = [0.3, -1.2, 2.0, 0.7, -0.4];
        let weight = [1.0, 0.5, -0.7, 1.3, 0.9];
        let bias = [0.1; 5];
        let dout = [0.2, -0.1, 0.4, 0.3, -0.5];

        let loss = |x: &[f32]| -> f32 {
            let mut out = vec![0.0; c];
            let (mut m, mut s) = ([0.0], [0.0]);
            layernorm_forward(&mut out, &mut m, &mut s, x, &weight, &bias, 1, c);
            out.iter().zip(&dout).map(|(o, d)| o * d).sum()
        };

        let mut out = vec![0.0; c];
        let (mut m, mut s) = ([0.0], [0.0]);
        layernorm_forward(&mut out, &mut m, &mut s, &inp, &weight, &bias, 1, c);
        let mut dinp = vec![0.0; c];
        let mut dweight = vec![0.0; c];
        let mut dbias = vec![0.0; c];
        layernorm_backward(
            &mut dinp, &mut dweight, &mut dbias, &dout, &inp, &weight, &m, &s, 1, c,
        );

        let h = 1e-3;
        for i in 0..c {
            let mut plus = inp;
            let mut minus = inp;
            plus[i] += h;
            minus[i] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert!(
                (numeric - dinp[i]).abs() < 1e-2,
                "dinp[{}]: analytic {} numeric {}",
                i,
                dinp[i],
                numeric
            );
        }
        assert_eq!(dbias, dout.to_vec());
    }

    #[test]
    fn test_backward_accumulates() {
        let inp = [1.0, -1.0];
        let weight = [1.0, 1.0];
        let mean = [0.0];
        let rstd = [1.0];
        let dout = [1.0, 0.0];
        let mut dinp = [0.0; 2];
        let mut dweight = [0.0; 2];
        let mut dbias = [0.0; 2];
        for _ in 0..2 {
            layernorm_backward(
                &mut dinp, &mut dweight, &mut dbias, &dout, &inp, &weight, &mean, &rstd, 1, 2,
            );
        }
        assert_eq!(dbias, [2.0, 0.0]);
        assert_eq!(dweight, [2.0, 0.0]);
    }

    proptest! {
        #[test]
        fn prop_rows_have_zero_mean_unit_variance(
            rows in prop::collection::vec(prop::collection::vec(-50.0f32..50.0, 16), 1..6)
        ) {
            let c = 16;
            let n = rows.len();
            let inp: Vec<f32> = rows.concat();
            // Skip near-constant rows where ε dominates the variance
            for row in &rows {
                let m = row.iter().sum::<f32>() / c as f32;
                let v = row.iter().map(|x| (x - m) * (x - m)).sum::<f32>() / c as f32;
                prop_assume!(v > 1e-2);
            }

            let mut out = vec![0.0; n * c];
            let mut mean = vec![0.0; n];
            let mut rstd = vec![0.0; n];
            layernorm_forward(&mut out, &mut mean, &mut rstd, &inp, &[1.0; 16], &[0.0; 16], n, c);

            for row in out.chunks(c) {
                let m = row.iter().sum::<f32>() / c as f32;
                let v = row.iter().map(|x| (x - m) * (x - m)).sum::<f32>() / c as f32;
                prop_assert!(m.abs() < 1e-4, "mean {}", m);
                prop_assert!((v - 1.0).abs() < 1e-2, "variance {}", v);
            }
        }
    }
}
