//! GPT-2 Forward Pass
//!
//! Composes the kernels of [`crate::layers`] into the full model:
//!
//! ```text
//! Input tokens (B, T)
//!     ↓
//! Encoder: wte[token] + wpe[position]
//!     ↓
//! L × Transformer Block:
//!     ├─ LayerNorm → QKV matmul → Attention → projection matmul
//!     ├─ Residual add
//!     ├─ LayerNorm → MLP expand matmul → GELU → MLP contract matmul
//!     └─ Residual add
//!     ↓
//! Final LayerNorm
//!     ↓
//! Logits = lnf @ wteᵀ   (weight tying, no bias)
//!     ↓
//! Softmax over the true vocabulary
//!     ↓
//! Cross-entropy and mean (only when targets are given)
//! ```
//!
//! Every intermediate is written into its pre-assigned slice of the
//! activation buffer, so the backward pass can read any of them back. Layer
//! `l` reads the residual stream from layer `l - 1`'s second residual output,
//! or from the encoder output when `l == 0`.
//!
//! Kernels run one after another; each kernel parallelizes internally.

use crate::checkpoint;
use crate::config::Config;
use crate::error::{ModelError, Result};
use crate::layers::{
    attention_forward, crossentropy_forward, encoder_forward, gelu_forward, layernorm_forward,
    matmul_forward, residual_forward, softmax_forward,
};
use crate::layout::{num_activations, num_parameters};
use crate::tensor::{layer, layer_mut, ActivationTensors, ParameterTensors};
use log::{debug, info};
use std::path::Path;

/// One `(B, T)` batch of input ids and next-token targets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub inputs: Vec<u32>,
    pub targets: Vec<u32>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl Batch {
    pub fn new(
        inputs: Vec<u32>,
        targets: Vec<u32>,
        batch_size: usize,
        seq_len: usize,
    ) -> Result<Self> {
        check_batch_dims(batch_size, seq_len)?;
        let expected = batch_size * seq_len;
        if inputs.len() != expected || targets.len() != expected {
            return Err(ModelError::ShapeMismatch(format!(
                "batch of B={} T={} needs {} ids, got {} inputs and {} targets",
                batch_size,
                seq_len,
                expected,
                inputs.len(),
                targets.len()
            )));
        }
        Ok(Self {
            inputs,
            targets,
            batch_size,
            seq_len,
        })
    }
}

/// Reject an empty batch shape
fn check_batch_dims(batch_size: usize, seq_len: usize) -> Result<()> {
    if batch_size == 0 || seq_len == 0 {
        return Err(ModelError::ShapeMismatch(format!(
            "batch dimensions must be non-zero, got B={} T={}",
            batch_size, seq_len
        )));
    }
    Ok(())
}

/// Reject any id outside `[0, vocab_size)`
fn check_ids(
    ids: &[u32],
    vocab_size: usize,
    error: impl Fn(u32, usize) -> ModelError,
) -> Result<()> {
    match ids.iter().position(|&id| id as usize >= vocab_size) {
        Some(position) => Err(error(ids[position], position)),
        None => Ok(()),
    }
}

/// Every precondition of a forward pass that does not depend on the
/// activation buffers, checked before any buffer is allocated or touched
pub(crate) fn check_forward_inputs(
    params: &ParameterTensors,
    config: &Config,
    inputs: &[u32],
    targets: Option<&[u32]>,
    batch_size: usize,
    seq_len: usize,
) -> Result<()> {
    check_batch_dims(batch_size, seq_len)?;
    if seq_len > config.max_seq_len {
        return Err(ModelError::SequenceTooLong {
            seq_len,
            max_seq_len: config.max_seq_len,
        });
    }
    if params.len() != num_parameters(config) {
        return Err(ModelError::ShapeMismatch(format!(
            "parameter buffer holds {} elements, config needs {}",
            params.len(),
            num_parameters(config)
        )));
    }

    let expected = batch_size * seq_len;
    if inputs.len() != expected {
        return Err(ModelError::ShapeMismatch(format!(
            "expected {} input ids, got {}",
            expected,
            inputs.len()
        )));
    }
    let vocab_size = config.vocab_size;
    check_ids(inputs, vocab_size, |id, position| ModelError::TokenOutOfRange {
        id,
        position,
        vocab_size,
    })?;

    if let Some(targets) = targets {
        if targets.len() != expected {
            return Err(ModelError::ShapeMismatch(format!(
                "expected {} target ids, got {}",
                expected,
                targets.len()
            )));
        }
        check_ids(targets, vocab_size, |id, position| ModelError::TargetOutOfRange {
            id,
            position,
            vocab_size,
        })?;
    }
    Ok(())
}

/// Run the full forward pass
///
/// Fills every activation tensor in `acts` and returns the mean
/// cross-entropy loss when `targets` are supplied, `None` otherwise.
///
/// `acts` must have been sized for exactly `(batch_size, seq_len)`.
pub fn gpt2_forward(
    params: &ParameterTensors,
    config: &Config,
    acts: &mut ActivationTensors,
    inputs: &[u32],
    targets: Option<&[u32]>,
    batch_size: usize,
    seq_len: usize,
) -> Result<Option<f32>> {
    check_forward_inputs(params, config, inputs, targets, batch_size, seq_len)?;
    acts.check_dims(batch_size, seq_len)?;

    let (b, t) = (batch_size, seq_len);
    let c = config.channels;
    let nh = config.num_heads;
    let nl = config.num_layers;
    let v = config.vocab_size;
    let vp = config.padded_vocab_size;
    let bt = b * t;
    let btc = bt * c;

    let p = params.views();
    let mut a = acts.views_mut();

    encoder_forward(a.encoded, inputs, p.wte, p.wpe, b, t, c);

    for l in 0..nl {
        let lp = p.layer(l);

        // Layer l writes residual3[l] and reads residual3[l - 1]
        let (done, current) = a.residual3.split_at_mut(l * btc);
        let residual: &[f32] = if l == 0 {
            &a.encoded[..]
        } else {
            &done[(l - 1) * btc..]
        };
        let l_residual3 = &mut current[..btc];

        // Attention sub-block
        layernorm_forward(
            layer_mut(a.ln1, l, nl),
            layer_mut(a.ln1_mean, l, nl),
            layer_mut(a.ln1_rstd, l, nl),
            residual,
            lp.ln1w,
            lp.ln1b,
            bt,
            c,
        );
        matmul_forward(
            layer_mut(a.qkv, l, nl),
            layer(a.ln1, l, nl),
            lp.qkvw,
            Some(lp.qkvb),
            bt,
            c,
            3 * c,
        );
        attention_forward(
            layer_mut(a.atty, l, nl),
            layer_mut(a.preatt, l, nl),
            layer_mut(a.att, l, nl),
            layer(a.qkv, l, nl),
            b,
            t,
            c,
            nh,
        );
        matmul_forward(
            layer_mut(a.attproj, l, nl),
            layer(a.atty, l, nl),
            lp.attprojw,
            Some(lp.attprojb),
            bt,
            c,
            c,
        );
        residual_forward(layer_mut(a.residual2, l, nl), residual, layer(a.attproj, l, nl));

        // MLP sub-block
        layernorm_forward(
            layer_mut(a.ln2, l, nl),
            layer_mut(a.ln2_mean, l, nl),
            layer_mut(a.ln2_rstd, l, nl),
            layer(a.residual2, l, nl),
            lp.ln2w,
            lp.ln2b,
            bt,
            c,
        );
        matmul_forward(
            layer_mut(a.fch, l, nl),
            layer(a.ln2, l, nl),
            lp.fcw,
            Some(lp.fcb),
            bt,
            c,
            4 * c,
        );
        gelu_forward(layer_mut(a.fch_gelu, l, nl), layer(a.fch, l, nl));
        matmul_forward(
            layer_mut(a.fcproj, l, nl),
            layer(a.fch_gelu, l, nl),
            lp.fcprojw,
            Some(lp.fcprojb),
            bt,
            4 * c,
            c,
        );
        residual_forward(l_residual3, layer(a.residual2, l, nl), layer(a.fcproj, l, nl));
    }

    let residual = layer(a.residual3, nl - 1, nl);
    layernorm_forward(a.lnf, a.lnf_mean, a.lnf_rstd, residual, p.lnfw, p.lnfb, bt, c);
    matmul_forward(a.logits, a.lnf, p.wte, None, bt, c, vp);
    softmax_forward(a.probs, a.logits, bt, v, vp);

    match targets {
        Some(targets) => {
            crossentropy_forward(a.losses, a.probs, targets, bt, vp);
            let mean_loss = a.losses.iter().sum::<f32>() / bt as f32;
            debug!("forward B={} T={} mean loss {:.6}", b, t, mean_loss);
            Ok(Some(mean_loss))
        }
        None => Ok(None),
    }
}

/// A GPT-2 model: configuration, parameters, and activation buffers sized
/// for one batch shape
///
/// The activation buffers are allocated by the first forward pass and reused
/// afterwards; calling `forward` with a different `(B, T)` is an error.
pub struct GPT2 {
    config: Config,
    params: ParameterTensors,
    acts: Option<ActivationTensors>,
    mean_loss: Option<f32>,
}

impl GPT2 {
    /// Wrap a parameter buffer that matches `config`
    pub fn new(config: Config, params: ParameterTensors) -> Result<Self> {
        config.validate()?;
        if params.len() != num_parameters(&config) {
            return Err(ModelError::ShapeMismatch(format!(
                "parameter buffer holds {} elements, config needs {}",
                params.len(),
                num_parameters(&config)
            )));
        }
        info!("num_parameters: {}", params.len());
        Ok(Self {
            config,
            params,
            acts: None,
            mean_loss: None,
        })
    }

    /// Load a model from a checkpoint file
    pub fn from_checkpoint(path: impl AsRef<Path>) -> Result<Self> {
        let (config, params) = checkpoint::load(path)?;
        Self::new(config, params)
    }

    /// A freshly initialized model (see [`ParameterTensors::random`])
    pub fn random(config: Config, seed: u64) -> Result<Self> {
        let params = ParameterTensors::random(&config, seed)?;
        Self::new(config, params)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn params(&self) -> &ParameterTensors {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParameterTensors {
        &mut self.params
    }

    pub fn num_parameters(&self) -> usize {
        self.params.len()
    }

    /// Activations of the most recent forward pass
    pub fn activations(&self) -> Option<&ActivationTensors> {
        self.acts.as_ref()
    }

    /// Mean loss of the most recent forward pass, if it had targets
    pub fn mean_loss(&self) -> Option<f32> {
        self.mean_loss
    }

    /// Allocate activation buffers for `(B, T)` on first use, or check that
    /// the existing ones match
    fn ensure_activations(&mut self, batch_size: usize, seq_len: usize) -> Result<()> {
        match &self.acts {
            Some(acts) => acts.check_dims(batch_size, seq_len),
            None => {
                info!(
                    "num_activations: {}",
                    num_activations(&self.config, batch_size, seq_len)
                );
                self.acts = Some(ActivationTensors::zeros(&self.config, batch_size, seq_len));
                Ok(())
            }
        }
    }

    /// Forward pass over a `(B, T)` batch
    ///
    /// Returns the mean loss when `targets` are given. A rejected call
    /// leaves the model as it was: activation buffers are only allocated
    /// once the inputs pass every check.
    pub fn forward(
        &mut self,
        inputs: &[u32],
        targets: Option<&[u32]>,
        batch_size: usize,
        seq_len: usize,
    ) -> Result<Option<f32>> {
        check_forward_inputs(
            &self.params,
            &self.config,
            inputs,
            targets,
            batch_size,
            seq_len,
        )?;
        self.ensure_activations(batch_size, seq_len)?;
        let acts = self
            .acts
            .as_mut()
            .ok_or_else(|| ModelError::ShapeMismatch("activations not allocated".into()))?;
        let loss = gpt2_forward(
            &self.params,
            &self.config,
            acts,
            inputs,
            targets,
            batch_size,
            seq_len,
        )?;
        self.mean_loss = loss;
        Ok(loss)
    }

    /// Next-token distribution over the true vocabulary at `(b, t)` from the
    /// most recent forward pass
    ///
    /// The padded tail of the row is never exposed.
    pub fn probs(&self, b: usize, t: usize) -> Option<&[f32]> {
        let acts = self.acts.as_ref()?;
        if b >= acts.batch_size() || t >= acts.seq_len() {
            return None;
        }
        let vp = self.config.padded_vocab_size;
        let row = (b * acts.seq_len() + t) * vp;
        let probs = acts.views().probs;
        Some(&probs[row..row + self.config.vocab_size])
    }

    /// Split borrow used by the backward pass
    pub(crate) fn parts(&self) -> (&Config, &ParameterTensors, Option<&ActivationTensors>) {
        (&self.config, &self.params, self.acts.as_ref())
    }
}
