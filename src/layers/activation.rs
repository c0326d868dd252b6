//! Activation Functions
//!
//! ## GELU (Gaussian Error Linear Unit)
//!
//! ```text
//! GELU(x) = x × Φ(x)
//! ```
//!
//! where Φ(x) is the cumulative distribution function of the standard normal
//! distribution. GPT-2 was trained with the tanh approximation, so that is
//! what we compute (not the exact erf form):
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```

use rayon::prelude::*;

const GELU_COEFF: f32 = 0.044715;

fn gelu_scaling_factor() -> f32 {
    (2.0 / std::f32::consts::PI).sqrt()
}

/// GELU activation (forward pass), element-wise from `inp` into `out`
pub fn gelu_forward(out: &mut [f32], inp: &[f32]) {
    assert_eq!(out.len(), inp.len());
    let s = gelu_scaling_factor();
    out.par_iter_mut().zip(inp.par_iter()).for_each(|(o, &x)| {
        let cube = GELU_COEFF * x * x * x;
        *o = 0.5 * x * (1.0 + (s * (x + cube)).tanh());
    });
}

/// GELU derivative (backward pass)
///
/// Accumulates `dout * GELU'(inp)` into `dinp`. The derivative combines the
/// product rule with the sech² of the tanh argument.
pub fn gelu_backward(dinp: &mut [f32], inp: &[f32], dout: &[f32]) {
    assert_eq!(dinp.len(), inp.len());
    assert_eq!(dout.len(), inp.len());
    let s = gelu_scaling_factor();
    dinp.par_iter_mut()
        .zip(inp.par_iter().zip(dout.par_iter()))
        .for_each(|(d, (&x, &g))| {
            let inner = s * (x + GELU_COEFF * x * x * x);
            let tanh_inner = inner.tanh();
            let sech_sq = 1.0 - tanh_inner * tanh_inner;
            let local_grad = 0.5 * (1.0 + tanh_inner)
                + 0.5 * x * sech_sq * s * (1.0 + 3.0 * GELU_COEFF * x * x);
            *d += local_grad * g;
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gelu_known_values() {
        let inp = [0.0, 1.0, -1.0, 10.0];
        let mut out = [0.0; 4];
        gelu_forward(&mut out, &inp);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.841192).abs() < 1e-5);
        assert!((out[2] + 0.158808).abs() < 1e-5);
        assert!((out[3] - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_gelu_backward_matches_finite_differences() {
        let xs = [-3.0f32, -0.5, 0.0, 0.3, 2.0];
        let mut dinp = [0.0; 5];
        gelu_backward(&mut dinp, &xs, &[1.0; 5]);

        let h = 1e-3;
        for (i, &x) in xs.iter().enumerate() {
            let mut pair = [0.0; 2];
            gelu_forward(&mut pair, &[x + h, x - h]);
            let numeric = (pair[0] - pair[1]) / (2.0 * h);
            assert!((numeric - dinp[i]).abs() < 1e-3, "x={} {} vs {}", x, numeric, dinp[i]);
        }
    }

    #[test]
    fn test_gelu_backward_accumulates() {
        let mut dinp = [1.0];
        gelu_backward(&mut dinp, &[0.0], &[2.0]);
        // GELU'(0) = 0.5
        assert!((dinp[0] - 2.0).abs() < 1e-6);
    }
}
