//! Gradient Buffers
//!
//! Gradients live in "shadow" buffers with exactly the same layout as the
//! tensors they differentiate: one parameter-shaped buffer, plus an
//! activation-shaped scratch buffer used while backpropagating through the
//! layers.
//!
//! ## Phases
//!
//! A training step moves the buffers through three explicit phases:
//!
//! ```text
//! zero_grad()          every parameter gradient = 0
//!   ↓
//! differentiate(...)   backward kernels accumulate (+=) into the buffers
//!   ↓
//! consume_and_reset()  the optimizer reads each gradient once, then all = 0
//! ```
//!
//! ## Gradient Clipping
//!
//! Occasional batches produce very large gradients. Clipping rescales the
//! whole gradient when its global L2 norm exceeds a threshold:
//!
//! ```text
//! norm = √(Σ gradient²)
//! if norm > max_norm:
//!     gradients *= (max_norm / norm)
//! ```
//!
//! Every gradient is scaled by the same factor, so the update direction is
//! preserved.

use crate::config::Config;
use crate::error::Result;
use crate::layout::ParamTensor;
use crate::tensor::{ActivationTensors, ParameterTensors};
use rayon::prelude::*;

/// Shadow buffers for one model
pub struct GradientBuffers {
    config: Config,
    params: ParameterTensors,
    acts: Option<ActivationTensors>,
}

impl GradientBuffers {
    /// Zeroed parameter gradients; activation gradients are allocated on the
    /// first backward pass, once `(B, T)` is known
    pub fn new(config: &Config) -> Self {
        Self {
            config: *config,
            params: ParameterTensors::zeros(config),
            acts: None,
        }
    }

    /// Start of a step: clear every parameter gradient
    pub fn zero_grad(&mut self) {
        self.params.zero();
    }

    /// Parameter gradients, same layout as the parameters
    pub fn params(&self) -> &ParameterTensors {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParameterTensors {
        &mut self.params
    }

    /// Gradient of one parameter tensor
    pub fn tensor(&self, tensor: ParamTensor) -> &[f32] {
        self.params.tensor(tensor)
    }

    /// Hand the flat parameter gradients to `consume`, then zero them
    ///
    /// The buffer is clean for the next accumulation whatever `consume`
    /// returns.
    pub fn consume_and_reset<R>(&mut self, consume: impl FnOnce(&[f32]) -> R) -> R {
        let result = consume(self.params.as_slice());
        self.params.zero();
        result
    }

    /// Both shadow buffers for a backward pass over `(B, T)`
    ///
    /// The activation gradients are cleared here: unlike parameter gradients
    /// they are scratch space and never carry over between passes.
    pub(crate) fn backward_buffers(
        &mut self,
        batch_size: usize,
        seq_len: usize,
    ) -> Result<(&mut ParameterTensors, &mut ActivationTensors)> {
        if let Some(acts) = &self.acts {
            acts.check_dims(batch_size, seq_len)?;
        }
        let config = &self.config;
        let acts = self
            .acts
            .get_or_insert_with(|| ActivationTensors::zeros(config, batch_size, seq_len));
        acts.zero();
        Ok((&mut self.params, acts))
    }

    /// Global L2 norm of all parameter gradients
    pub fn grad_norm(&self) -> f32 {
        self.params
            .as_slice()
            .par_iter()
            .map(|&g| g * g)
            .sum::<f32>()
            .sqrt()
    }

    /// Rescale gradients so their global norm is at most `max_norm`
    ///
    /// Returns the norm before clipping.
    pub fn clip(&mut self, max_norm: f32) -> f32 {
        let norm = self.grad_norm();
        if norm > max_norm {
            let scale = max_norm / norm;
            self.params
                .as_mut_slice()
                .par_iter_mut()
                .for_each(|g| *g *= scale);
        }
        norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;

    #[test]
    fn test_grad_norm_and_clip() {
        let config = Config::tiny();
        let mut grads = GradientBuffers::new(&config);
        let buf = grads.params_mut().as_mut_slice();
        buf[0] = 3.0;
        buf[1] = 4.0;
        assert!((grads.grad_norm() - 5.0).abs() < 1e-6);

        let before = grads.clip(1.0);
        assert!((before - 5.0).abs() < 1e-6);
        assert!((grads.grad_norm() - 1.0).abs() < 1e-5);
        let buf = grads.params().as_slice();
        assert!((buf[0] - 0.6).abs() < 1e-6);
        assert!((buf[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_clip_leaves_small_gradients_alone() {
        let mut grads = GradientBuffers::new(&Config::tiny());
        grads.params_mut().as_mut_slice()[3] = 0.5;
        grads.clip(1.0);
        assert_eq!(grads.params().as_slice()[3], 0.5);
    }

    #[test]
    fn test_consume_and_reset_clears_after_reading() {
        let mut grads = GradientBuffers::new(&Config::tiny());
        grads.params_mut().as_mut_slice()[7] = 1.5;
        let seen = grads.consume_and_reset(|g| g[7]);
        assert_eq!(seen, 1.5);
        assert!(grads.params().as_slice().iter().all(|&g| g == 0.0));

        // Reset happens even when the consumer bails out
        grads.params_mut().as_mut_slice()[7] = 1.5;
        let result: Result<()> = grads.consume_and_reset(|_| Err(ModelError::MissingTargets));
        assert!(result.is_err());
        assert_eq!(grads.params().as_slice()[7], 0.0);
    }

    #[test]
    fn test_zero_grad() {
        let mut grads = GradientBuffers::new(&Config::tiny());
        grads.params_mut().as_mut_slice().fill(2.0);
        grads.zero_grad();
        assert!(grads.params().as_slice().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_backward_buffers_fix_batch_shape() {
        let mut grads = GradientBuffers::new(&Config::tiny());
        {
            let (_, acts) = grads.backward_buffers(2, 4).unwrap();
            assert_eq!(acts.batch_size(), 2);
        }
        assert!(matches!(
            grads.backward_buffers(1, 4),
            Err(ModelError::BatchMismatch { .. })
        ));
    }
}
