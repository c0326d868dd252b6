//! AdamW Optimizer Implementation
//!
//! AdamW (Adam with decoupled weight decay) is the standard optimizer for
//! training transformer models like GPT-2. It combines:
//! - **Momentum**: Smooths gradient updates using exponential moving average
//! - **RMSProp**: Adapts learning rate per-parameter based on gradient history
//! - **Decoupled weight decay**: Applied to the weights directly, outside the
//!   adaptive scaling
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g at step t (starting from 1):
//!
//! ```text
//! m = β₁ * m + (1 - β₁) * g        # First moment (momentum)
//! v = β₂ * v + (1 - β₂) * g²       # Second moment (variance)
//! m_hat = m / (1 - β₁^t)           # Bias correction
//! v_hat = v / (1 - β₂^t)           # Bias correction
//! θ = θ - α * (m_hat / (√v_hat + ε) + λ * θ)
//! ```
//!
//! where:
//! - α (alpha/lr) = learning rate
//! - λ (lambda/weight_decay) = weight decay coefficient
//! - β₁ (beta1) = momentum decay rate
//! - β₂ (beta2) = variance decay rate
//! - ε (epsilon) = numerical stability constant
//!
//! ## Bias Correction
//!
//! The bias correction terms `(1 - β^t)` are critical. Without them, m and v
//! are biased toward zero during early training steps. The correction ensures
//! the optimizer works well from the first step.
//!
//! ## Implementation Notes
//!
//! - The moment buffers are flat vectors shaped like the parameter buffer,
//!   allocated (zeroed) on the first update
//! - Each gradient element is read from the shadow buffer exactly once,
//!   and the shadow buffer is zeroed for the next step
//! - Parallel updates using Rayon, with a sequential fallback for small
//!   models
//!
//! ## References
//!
//! - Loshchilov & Hutter (2019): "Decoupled Weight Decay Regularization"
//!   https://arxiv.org/abs/1711.05101
//! - Kingma & Ba (2014): "Adam: A Method for Stochastic Optimization"
//!   https://arxiv.org/abs/1412.6980

use crate::error::{ModelError, Result};
use crate::gradients::GradientBuffers;
use crate::tensor::ParameterTensors;
use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Below this many parameters the update runs on the calling thread
const PARALLEL_THRESHOLD: usize = 1000;

/// AdamW hyperparameters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// AdamW optimizer state
///
/// Maintains first and second moment estimates (m and v) for every element of
/// the parameter buffer, and the step counter used for bias correction.
pub struct AdamW {
    pub config: AdamWConfig,
    m: Option<Vec<f32>>,
    v: Option<Vec<f32>>,
    step: u32,
}

/// One element of the update. Returns the new parameter value.
#[inline]
fn adamw_element(
    param: f32,
    grad: f32,
    m: &mut f32,
    v: &mut f32,
    config: &AdamWConfig,
    beta1_correction: f32,
    beta2_correction: f32,
) -> f32 {
    *m = config.beta1 * *m + (1.0 - config.beta1) * grad;
    *v = config.beta2 * *v + (1.0 - config.beta2) * grad * grad;
    let m_hat = *m / beta1_correction;
    let v_hat = *v / beta2_correction;
    param
        - config.learning_rate
            * (m_hat / (v_hat.sqrt() + config.epsilon) + config.weight_decay * param)
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            m: None,
            v: None,
            step: 0,
        }
    }

    /// Number of updates applied so far
    pub fn step(&self) -> u32 {
        self.step
    }

    /// First moment buffer, once allocated
    pub fn first_moment(&self) -> Option<&[f32]> {
        self.m.as_deref()
    }

    /// Second moment buffer, once allocated
    pub fn second_moment(&self) -> Option<&[f32]> {
        self.v.as_deref()
    }

    /// Apply one AdamW step
    ///
    /// Consumes the parameter gradients in `grads` (each element is read once,
    /// then the whole buffer is zeroed) and updates `params` in place. The
    /// step counter increments before bias correction, so the first call uses
    /// `t = 1`.
    pub fn update(
        &mut self,
        params: &mut ParameterTensors,
        grads: &mut GradientBuffers,
    ) -> Result<()> {
        let n = params.len();
        if self.m.is_none() {
            info!("allocating AdamW state for {} parameters", n);
        }
        let m = self.m.get_or_insert_with(|| vec![0.0; n]);
        let v = self.v.get_or_insert_with(|| vec![0.0; n]);
        if m.len() != n || v.len() != n {
            return Err(ModelError::ShapeMismatch(format!(
                "optimizer state holds {} elements, parameters hold {}",
                m.len(),
                n
            )));
        }
        let step = &mut self.step;
        let config = self.config;
        let param_buf = params.as_mut_slice();

        grads.consume_and_reset(|grad_buf| {
            if grad_buf.len() != n {
                return Err(ModelError::ShapeMismatch(format!(
                    "gradient buffer holds {} elements, parameters hold {}",
                    grad_buf.len(),
                    n
                )));
            }

            *step += 1;
            let t = *step as i32;
            let beta1_correction = 1.0 - config.beta1.powi(t);
            let beta2_correction = 1.0 - config.beta2.powi(t);

            if n > PARALLEL_THRESHOLD {
                param_buf
                    .par_iter_mut()
                    .zip(grad_buf.par_iter())
                    .zip(m.par_iter_mut().zip(v.par_iter_mut()))
                    .for_each(|((p, &g), (m, v))| {
                        *p = adamw_element(
                            *p,
                            g,
                            m,
                            v,
                            &config,
                            beta1_correction,
                            beta2_correction,
                        );
                    });
            } else {
                for ((p, &g), (m, v)) in param_buf
                    .iter_mut()
                    .zip(grad_buf.iter())
                    .zip(m.iter_mut().zip(v.iter_mut()))
                {
                    *p = adamw_element(
                        *p,
                        g,
                        m,
                        v,
                        &config,
                        beta1_correction,
                        beta2_correction,
                    );
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_single_element_first_step() {
        let config = AdamWConfig::default();
        let (mut m, mut v) = (0.0, 0.0);
        let b1 = 1.0 - config.beta1;
        let b2 = 1.0 - config.beta2;
        let new = adamw_element(1.0, 0.1, &mut m, &mut v, &config, b1, b2);

        assert!((m - 0.01).abs() < 1e-7);
        assert!((v - 1e-5).abs() < 1e-9);
        assert!((m / b1 - 0.1).abs() < 1e-5);
        assert!((v / b2 - 0.01).abs() < 1e-5);
        assert!((1.0 - new - 9.9999e-5).abs() < 1e-7);
        assert!((new - 0.99990001).abs() < 1e-6);
    }

    #[test]
    fn test_weight_decay_shrinks_without_gradient() {
        let config = AdamWConfig {
            learning_rate: 0.1,
            weight_decay: 0.5,
            ..AdamWConfig::default()
        };
        let (mut m, mut v) = (0.0, 0.0);
        let new = adamw_element(2.0, 0.0, &mut m, &mut v, &config, 0.1, 0.001);
        assert!((new - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_update_consumes_gradients_and_counts_steps() {
        let model_config = Config::tiny();
        let mut params = ParameterTensors::zeros(&model_config);
        params.as_mut_slice().fill(1.0);
        let mut grads = GradientBuffers::new(&model_config);
        grads.params_mut().as_mut_slice().fill(0.1);

        let mut opt = AdamW::new(AdamWConfig::default());
        assert!(opt.first_moment().is_none());
        opt.update(&mut params, &mut grads).unwrap();

        assert_eq!(opt.step(), 1);
        assert!(grads.params().as_slice().iter().all(|&g| g == 0.0));
        assert!(params
            .as_slice()
            .iter()
            .all(|&p| (p - 0.99990001).abs() < 1e-6));
        let m = opt.first_moment().unwrap();
        assert_eq!(m.len(), params.len());
        assert!((m[0] - 0.01).abs() < 1e-7);

        // A step with zero gradient still moves along the momentum
        opt.update(&mut params, &mut grads).unwrap();
        assert_eq!(opt.step(), 2);
        assert!(params.as_slice()[0] < 0.9999);
    }

    #[test]
    fn test_parallel_and_sequential_paths_agree() {
        let config = AdamWConfig {
            weight_decay: 0.01,
            ..AdamWConfig::default()
        };
        let model_config = Config::tiny();
        assert!(crate::layout::num_parameters(&model_config) > PARALLEL_THRESHOLD);

        let mut params = ParameterTensors::zeros(&model_config);
        let mut grads = GradientBuffers::new(&model_config);
        for (i, (p, g)) in params
            .as_mut_slice()
            .iter_mut()
            .zip(grads.params_mut().as_mut_slice().iter_mut())
            .enumerate()
        {
            *p = (i as f32 * 0.1).sin();
            *g = (i as f32 * 0.3).cos();
        }
        let expected: Vec<f32> = params
            .as_slice()
            .iter()
            .zip(grads.params().as_slice())
            .map(|(&p, &g)| {
                let (mut m, mut v) = (0.0, 0.0);
                adamw_element(p, g, &mut m, &mut v, &config, 1.0 - 0.9, 1.0 - 0.999)
            })
            .collect();

        let mut opt = AdamW::new(config);
        opt.update(&mut params, &mut grads).unwrap();
        for (p, e) in params.as_slice().iter().zip(&expected) {
            assert!((p - e).abs() < 1e-7);
        }
    }
}
