//! Residual Connection
//!
//! `out = inp1 + inp2`. The gradient flows unchanged to both inputs.

use rayon::prelude::*;

pub fn residual_forward(out: &mut [f32], inp1: &[f32], inp2: &[f32]) {
    assert_eq!(out.len(), inp1.len());
    assert_eq!(out.len(), inp2.len());
    out.par_iter_mut()
        .zip(inp1.par_iter().zip(inp2.par_iter()))
        .for_each(|(o, (&a, &b))| *o = a + b);
}

pub fn residual_backward(dinp1: &mut [f32], dinp2: &mut [f32], dout: &[f32]) {
    assert_eq!(dinp1.len(), dout.len());
    assert_eq!(dinp2.len(), dout.len());
    dinp1
        .par_iter_mut()
        .zip(dinp2.par_iter_mut())
        .zip(dout.par_iter())
        .for_each(|((d1, d2), &g)| {
            *d1 += g;
            *d2 += g;
        });
}
