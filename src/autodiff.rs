//! Differentiation Bridge
//!
//! Training needs `∂loss/∂parameter` for every element of the parameter
//! buffer. The [`Differentiator`] trait is the seam where that capability
//! plugs in: given the model, a batch and a zeroed shadow buffer, it runs
//! the forward pass and accumulates gradients into the shadow buffer.
//!
//! [`HandWrittenBackward`] implements it with one backward kernel per
//! forward kernel, replaying the forward schedule in reverse:
//!
//! ```text
//! dlosses = 1 / (B*T)                     (derivative of the mean)
//! softmax + cross-entropy  → dlogits
//! logits matmul            → dlnf, dwte   (tied embedding)
//! final layernorm          → dresidual3[L-1]
//! for l = L-1 .. 0:
//!     residual → MLP contract → GELU → MLP expand → layernorm 2
//!     residual → attention projection → attention → QKV → layernorm 1
//!                          → dresidual3[l-1] (or dencoded)
//! encoder                  → dwte, dwpe
//! ```
//!
//! Parameters are the only differentiation target; inputs, targets and the
//! config are constants. Every kernel accumulates with `+=`, so calling
//! `differentiate` twice without `zero_grad` sums the two gradients.

use crate::config::Config;
use crate::error::{ModelError, Result};
use crate::gradients::GradientBuffers;
use crate::layers::{
    attention_backward, crossentropy_softmax_backward, encoder_backward, gelu_backward,
    layernorm_backward, matmul_backward, residual_backward,
};
use crate::model::{Batch, GPT2};
use crate::tensor::{layer, layer_mut, ActivationTensors, ParameterTensors};
use log::trace;

/// A way of computing parameter gradients of the mean loss
pub trait Differentiator {
    /// Run the forward pass on `batch` and accumulate `∂(mean loss)/∂params`
    /// into `shadow`
    ///
    /// Returns the mean loss of the forward pass.
    fn differentiate(
        &mut self,
        model: &mut GPT2,
        batch: &Batch,
        shadow: &mut GradientBuffers,
    ) -> Result<f32>;
}

/// Explicit reverse-mode pass built from the per-kernel backward functions
#[derive(Clone, Copy, Debug, Default)]
pub struct HandWrittenBackward;

impl Differentiator for HandWrittenBackward {
    fn differentiate(
        &mut self,
        model: &mut GPT2,
        batch: &Batch,
        shadow: &mut GradientBuffers,
    ) -> Result<f32> {
        let (b, t) = (batch.batch_size, batch.seq_len);
        let loss = model
            .forward(&batch.inputs, Some(&batch.targets), b, t)?
            .ok_or(ModelError::MissingTargets)?;

        let (config, params, acts) = model.parts();
        let acts = acts.ok_or_else(|| {
            ModelError::ShapeMismatch("forward pass left no activations".into())
        })?;
        let (grads, grads_acts) = shadow.backward_buffers(b, t)?;
        gpt2_backward(
            params,
            config,
            acts,
            grads,
            grads_acts,
            &batch.inputs,
            &batch.targets,
            b,
            t,
        )?;
        trace!("backward B={} T={} done", b, t);
        Ok(loss)
    }
}

/// Backpropagate the mean loss of the forward pass stored in `acts`
///
/// `grads` receives parameter gradients, `grads_acts` is scratch space for
/// activation gradients and must be zeroed by the caller.
#[allow(clippy::too_many_arguments)]
pub fn gpt2_backward(
    params: &ParameterTensors,
    config: &Config,
    acts: &ActivationTensors,
    grads: &mut ParameterTensors,
    grads_acts: &mut ActivationTensors,
    inputs: &[u32],
    targets: &[u32],
    batch_size: usize,
    seq_len: usize,
) -> Result<()> {
    acts.check_dims(batch_size, seq_len)?;
    grads_acts.check_dims(batch_size, seq_len)?;
    if grads.len() != params.len() {
        return Err(ModelError::ShapeMismatch(format!(
            "gradient buffer holds {} elements, parameters hold {}",
            grads.len(),
            params.len()
        )));
    }
    let expected = batch_size * seq_len;
    if inputs.len() != expected || targets.len() != expected {
        return Err(ModelError::ShapeMismatch(format!(
            "expected {} input and target ids, got {} and {}",
            expected,
            inputs.len(),
            targets.len()
        )));
    }

    let (b, t) = (batch_size, seq_len);
    let c = config.channels;
    let nh = config.num_heads;
    let nl = config.num_layers;
    let v = config.vocab_size;
    let vp = config.padded_vocab_size;
    let bt = b * t;
    let btc = bt * c;

    let p = params.views();
    let a = acts.views();
    let mut g = grads.views_mut();
    let mut ga = grads_acts.views_mut();

    // d(mean)/d(loss[b,t])
    ga.losses.fill(1.0 / bt as f32);
    crossentropy_softmax_backward(ga.logits, ga.losses, a.probs, targets, v, vp);
    matmul_backward(ga.lnf, g.wte, None, ga.logits, a.lnf, p.wte, bt, c, vp);

    let residual = layer(a.residual3, nl - 1, nl);
    layernorm_backward(
        layer_mut(ga.residual3, nl - 1, nl),
        g.lnfw,
        g.lnfb,
        ga.lnf,
        residual,
        p.lnfw,
        a.lnf_mean,
        a.lnf_rstd,
        bt,
        c,
    );

    for l in (0..nl).rev() {
        let lp = p.layer(l);
        let mut lg = g.layer_mut(l);

        let residual = if l == 0 {
            a.encoded
        } else {
            layer(a.residual3, l - 1, nl)
        };

        // dresidual3[l] is complete; layer l feeds dresidual3[l - 1]
        let (before, current) = ga.residual3.split_at_mut(l * btc);
        let dl_residual3 = &current[..btc];
        let dresidual: &mut [f32] = if l == 0 {
            &mut ga.encoded[..]
        } else {
            &mut before[(l - 1) * btc..]
        };

        // MLP sub-block
        residual_backward(
            layer_mut(ga.residual2, l, nl),
            layer_mut(ga.fcproj, l, nl),
            dl_residual3,
        );
        matmul_backward(
            layer_mut(ga.fch_gelu, l, nl),
            lg.fcprojw,
            Some(lg.fcprojb),
            layer(ga.fcproj, l, nl),
            layer(a.fch_gelu, l, nl),
            lp.fcprojw,
            bt,
            4 * c,
            c,
        );
        gelu_backward(
            layer_mut(ga.fch, l, nl),
            layer(a.fch, l, nl),
            layer(ga.fch_gelu, l, nl),
        );
        matmul_backward(
            layer_mut(ga.ln2, l, nl),
            lg.fcw,
            Some(lg.fcb),
            layer(ga.fch, l, nl),
            layer(a.ln2, l, nl),
            lp.fcw,
            bt,
            c,
            4 * c,
        );
        layernorm_backward(
            layer_mut(ga.residual2, l, nl),
            lg.ln2w,
            lg.ln2b,
            layer(ga.ln2, l, nl),
            layer(a.residual2, l, nl),
            lp.ln2w,
            layer(a.ln2_mean, l, nl),
            layer(a.ln2_rstd, l, nl),
            bt,
            c,
        );

        // Attention sub-block
        residual_backward(dresidual, layer_mut(ga.attproj, l, nl), layer(ga.residual2, l, nl));
        matmul_backward(
            layer_mut(ga.atty, l, nl),
            lg.attprojw,
            Some(lg.attprojb),
            layer(ga.attproj, l, nl),
            layer(a.atty, l, nl),
            lp.attprojw,
            bt,
            c,
            c,
        );
        attention_backward(
            layer_mut(ga.qkv, l, nl),
            layer_mut(ga.preatt, l, nl),
            layer_mut(ga.att, l, nl),
            layer(ga.atty, l, nl),
            layer(a.qkv, l, nl),
            layer(a.att, l, nl),
            b,
            t,
            c,
            nh,
        );
        matmul_backward(
            layer_mut(ga.ln1, l, nl),
            lg.qkvw,
            Some(lg.qkvb),
            layer(ga.qkv, l, nl),
            layer(a.ln1, l, nl),
            lp.qkvw,
            bt,
            c,
            3 * c,
        );
        layernorm_backward(
            dresidual,
            lg.ln1w,
            lg.ln1b,
            layer(ga.ln1, l, nl),
            residual,
            lp.ln1w,
            layer(a.ln1_mean, l, nl),
            layer(a.ln1_rstd, l, nl),
            bt,
            c,
        );
    }

    encoder_backward(g.wte, g.wpe, ga.encoded, inputs, b, t, c);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ParamTensor;

    fn batch() -> Batch {
        Batch::new(vec![3, 1, 4, 1, 5, 9, 2, 6], vec![1, 4, 1, 5, 9, 2, 6, 5], 2, 4).unwrap()
    }

    #[test]
    fn test_returns_forward_loss() {
        let mut model = GPT2::random(Config::tiny(), 21).unwrap();
        let mut grads = GradientBuffers::new(model.config());
        let batch = batch();
        let loss = HandWrittenBackward
            .differentiate(&mut model, &batch, &mut grads)
            .unwrap();
        assert_eq!(Some(loss), model.mean_loss());
        assert!(grads.grad_norm() > 0.0);
    }

    #[test]
    fn test_gradients_accumulate_across_calls() {
        let mut model = GPT2::random(Config::tiny(), 21).unwrap();
        let mut grads = GradientBuffers::new(model.config());
        let batch = batch();

        HandWrittenBackward
            .differentiate(&mut model, &batch, &mut grads)
            .unwrap();
        let once = grads.params().as_slice().to_vec();
        HandWrittenBackward
            .differentiate(&mut model, &batch, &mut grads)
            .unwrap();

        for (twice, once) in grads.params().as_slice().iter().zip(&once) {
            assert!((twice - 2.0 * once).abs() <= 1e-6 + 1e-5 * once.abs());
        }
    }

    #[test]
    fn test_position_gradient_covers_sequence_only() {
        let mut model = GPT2::random(Config::tiny(), 21).unwrap();
        let mut grads = GradientBuffers::new(model.config());
        let batch = batch();
        HandWrittenBackward
            .differentiate(&mut model, &batch, &mut grads)
            .unwrap();

        // wpe rows past T are never read
        let c = model.config().channels;
        let dwpe = grads.tensor(ParamTensor::Wpe);
        assert!(dwpe[4 * c..].iter().all(|&g| g == 0.0));
        assert!(dwpe[..4 * c].iter().any(|&g| g != 0.0));
    }

    #[test]
    fn test_gradients_are_finite() {
        let mut model = GPT2::random(Config::tiny(), 2).unwrap();
        let mut grads = GradientBuffers::new(model.config());
        HandWrittenBackward
            .differentiate(&mut model, &batch(), &mut grads)
            .unwrap();
        assert!(grads.params().as_slice().iter().all(|g| g.is_finite()));
    }
}
