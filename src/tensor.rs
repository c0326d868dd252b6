//! Flat Tensor Storage
//!
//! Every parameter and every activation of the model lives in one of two
//! contiguous `Vec<f32>` buffers. The buffer is the sole owner; named tensors
//! are non-owning slices carved out of it in the canonical order of
//! [`crate::layout`], so a tensor's address is stable for a whole training
//! step.
//!
//! ## Core Concepts
//!
//! - **FlatBuffer**: owns the memory plus the element count and start offset
//!   of each tensor
//! - **Views**: structs of named slices (`wte`, `qkvw`, `residual3`, ...)
//!   produced by splitting the buffer, so several tensors can be borrowed at
//!   once (some mutably) without any pointer arithmetic
//! - **Layer slicing**: per-layer tensors store `L` equal blocks back to
//!   back; [`layer`] and [`layer_mut`] pick block `l`
//!
//! ## Example
//!
//! ```rust
//! use flatgpt::{Config, ParameterTensors};
//! use flatgpt::layout::ParamTensor;
//!
//! let config = Config::tiny();
//! let params = ParameterTensors::zeros(&config);
//! assert_eq!(params.len(), 1952);
//!
//! // Layer 1 of the fused QKV weight: (3C, C)
//! let qkvw = params.layer(ParamTensor::Qkvw, 1);
//! assert_eq!(qkvw.len(), 3 * 8 * 8);
//! ```

use crate::config::Config;
use crate::error::{ModelError, Result};
use crate::layout::{
    activation_sizes, offsets, parameter_sizes, ActTensor, ParamTensor, NUM_ACTIVATION_TENSORS,
    NUM_PARAMETER_TENSORS,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

/// Standard deviation of the GPT-2 weight initialization
const INIT_STD: f32 = 0.02;

/// One contiguous allocation holding `N` tensors end to end
#[derive(Clone, Debug)]
pub struct FlatBuffer<const N: usize> {
    memory: Vec<f32>,
    sizes: [usize; N],
    offsets: [usize; N],
}

impl<const N: usize> FlatBuffer<N> {
    /// Allocate a zeroed buffer for the given tensor sizes
    pub fn zeros(sizes: [usize; N]) -> Self {
        let total = sizes.iter().sum();
        Self {
            memory: vec![0.0; total],
            sizes,
            offsets: offsets(&sizes),
        }
    }

    /// Wrap existing memory; its length must equal the sum of `sizes`
    pub fn from_vec(sizes: [usize; N], memory: Vec<f32>) -> Result<Self> {
        let total: usize = sizes.iter().sum();
        if memory.len() != total {
            return Err(ModelError::ShapeMismatch(format!(
                "buffer holds {} elements, layout needs {}",
                memory.len(),
                total
            )));
        }
        Ok(Self {
            memory,
            sizes,
            offsets: offsets(&sizes),
        })
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn sizes(&self) -> &[usize; N] {
        &self.sizes
    }

    pub fn offsets(&self) -> &[usize; N] {
        &self.offsets
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.memory
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.memory
    }

    /// Tensor `index` as a slice
    pub fn tensor(&self, index: usize) -> &[f32] {
        let start = self.offsets[index];
        &self.memory[start..start + self.sizes[index]]
    }

    pub fn tensor_mut(&mut self, index: usize) -> &mut [f32] {
        let start = self.offsets[index];
        &mut self.memory[start..start + self.sizes[index]]
    }

    /// Reset every element to zero
    pub fn zero(&mut self) {
        self.memory.par_iter_mut().for_each(|x| *x = 0.0);
    }

    /// Split into `N` disjoint read-only slices
    pub fn carve(&self) -> [&[f32]; N] {
        let mut rest: &[f32] = &self.memory;
        let empty: &[f32] = &[];
        let mut out = [empty; N];
        for (slot, &size) in out.iter_mut().zip(&self.sizes) {
            let (head, tail) = rest.split_at(size);
            *slot = head;
            rest = tail;
        }
        out
    }

    /// Split into `N` disjoint mutable slices
    pub fn carve_mut(&mut self) -> [&mut [f32]; N] {
        let sizes = self.sizes;
        let mut rest: &mut [f32] = &mut self.memory;
        std::array::from_fn(|i| {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(sizes[i]);
            rest = tail;
            head
        })
    }
}

/// Block `l` of a tensor that stores `num_layers` equal blocks
pub fn layer(data: &[f32], l: usize, num_layers: usize) -> &[f32] {
    assert!(l < num_layers, "layer {} out of range ({} layers)", l, num_layers);
    let stride = data.len() / num_layers;
    &data[l * stride..(l + 1) * stride]
}

/// Mutable block `l` of a per-layer tensor
pub fn layer_mut(data: &mut [f32], l: usize, num_layers: usize) -> &mut [f32] {
    assert!(l < num_layers, "layer {} out of range ({} layers)", l, num_layers);
    let stride = data.len() / num_layers;
    &mut data[l * stride..(l + 1) * stride]
}

//
// ============================================================================
// PARAMETERS
// ============================================================================
//

/// The model weights: sixteen tensors in one buffer
///
/// The same type doubles as the gradient ("shadow") buffer, since gradients
/// share the parameter layout exactly.
#[derive(Clone, Debug)]
pub struct ParameterTensors {
    buffer: FlatBuffer<NUM_PARAMETER_TENSORS>,
    num_layers: usize,
}

impl ParameterTensors {
    /// All-zero parameters for a configuration
    pub fn zeros(config: &Config) -> Self {
        Self {
            buffer: FlatBuffer::zeros(parameter_sizes(config)),
            num_layers: config.num_layers,
        }
    }

    /// Wrap a flat parameter vector read from disk
    pub fn from_vec(config: &Config, memory: Vec<f32>) -> Result<Self> {
        Ok(Self {
            buffer: FlatBuffer::from_vec(parameter_sizes(config), memory)?,
            num_layers: config.num_layers,
        })
    }

    /// Fresh GPT-2 initialization
    ///
    /// - Weight matrices and embeddings ~ N(0, 0.02)
    /// - Residual projections (attention output, MLP contraction) scaled by
    ///   1/√(2L) so the residual stream does not grow with depth
    /// - LayerNorm weights 1, all biases 0
    /// - Padded vocabulary rows of `wte` left at 0
    pub fn random(config: &Config, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut params = Self::zeros(config);
        let mut rng = StdRng::seed_from_u64(seed);

        let normal = Normal::new(0.0, INIT_STD)
            .map_err(|e| ModelError::InvalidConfig(e.to_string()))?;
        let residual_std = INIT_STD / (2.0 * config.num_layers as f32).sqrt();
        let residual_normal = Normal::new(0.0, residual_std)
            .map_err(|e| ModelError::InvalidConfig(e.to_string()))?;

        let real_rows = config.vocab_size * config.channels;
        for tensor in ParamTensor::ALL {
            let data = params.tensor_mut(tensor);
            match tensor {
                ParamTensor::Wte => {
                    for x in data[..real_rows].iter_mut() {
                        *x = normal.sample(&mut rng);
                    }
                }
                ParamTensor::Wpe | ParamTensor::Qkvw | ParamTensor::Fcw => {
                    for x in data.iter_mut() {
                        *x = normal.sample(&mut rng);
                    }
                }
                ParamTensor::Attprojw | ParamTensor::Fcprojw => {
                    for x in data.iter_mut() {
                        *x = residual_normal.sample(&mut rng);
                    }
                }
                ParamTensor::Ln1w | ParamTensor::Ln2w | ParamTensor::Lnfw => data.fill(1.0),
                _ => {}
            }
        }

        Ok(params)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn sizes(&self) -> &[usize; NUM_PARAMETER_TENSORS] {
        self.buffer.sizes()
    }

    pub fn offset(&self, tensor: ParamTensor) -> usize {
        self.buffer.offsets()[tensor.index()]
    }

    pub fn as_slice(&self) -> &[f32] {
        self.buffer.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        self.buffer.as_mut_slice()
    }

    pub fn tensor(&self, tensor: ParamTensor) -> &[f32] {
        self.buffer.tensor(tensor.index())
    }

    pub fn tensor_mut(&mut self, tensor: ParamTensor) -> &mut [f32] {
        self.buffer.tensor_mut(tensor.index())
    }

    /// Layer `l` of a per-layer parameter tensor
    pub fn layer(&self, tensor: ParamTensor, l: usize) -> &[f32] {
        assert!(tensor.is_per_layer(), "{} is not a per-layer tensor", tensor.name());
        layer(self.tensor(tensor), l, self.num_layers)
    }

    pub fn zero(&mut self) {
        self.buffer.zero();
    }

    /// Named read-only views of all sixteen tensors
    pub fn views(&self) -> ParameterViews<'_> {
        let [
            wte,
            wpe,
            ln1w,
            ln1b,
            qkvw,
            qkvb,
            attprojw,
            attprojb,
            ln2w,
            ln2b,
            fcw,
            fcb,
            fcprojw,
            fcprojb,
            lnfw,
            lnfb,
        ] = self.buffer.carve();
        ParameterViews {
            wte,
            wpe,
            ln1w,
            ln1b,
            qkvw,
            qkvb,
            attprojw,
            attprojb,
            ln2w,
            ln2b,
            fcw,
            fcb,
            fcprojw,
            fcprojb,
            lnfw,
            lnfb,
            num_layers: self.num_layers,
        }
    }

    /// Named mutable views of all sixteen tensors
    pub fn views_mut(&mut self) -> ParameterViewsMut<'_> {
        let num_layers = self.num_layers;
        let [
            wte,
            wpe,
            ln1w,
            ln1b,
            qkvw,
            qkvb,
            attprojw,
            attprojb,
            ln2w,
            ln2b,
            fcw,
            fcb,
            fcprojw,
            fcprojb,
            lnfw,
            lnfb,
        ] = self.buffer.carve_mut();
        ParameterViewsMut {
            wte,
            wpe,
            ln1w,
            ln1b,
            qkvw,
            qkvb,
            attprojw,
            attprojb,
            ln2w,
            ln2b,
            fcw,
            fcb,
            fcprojw,
            fcprojb,
            lnfw,
            lnfb,
            num_layers,
        }
    }
}

/// Read-only named slices into a [`ParameterTensors`] buffer
pub struct ParameterViews<'a> {
    pub wte: &'a [f32],
    pub wpe: &'a [f32],
    pub ln1w: &'a [f32],
    pub ln1b: &'a [f32],
    pub qkvw: &'a [f32],
    pub qkvb: &'a [f32],
    pub attprojw: &'a [f32],
    pub attprojb: &'a [f32],
    pub ln2w: &'a [f32],
    pub ln2b: &'a [f32],
    pub fcw: &'a [f32],
    pub fcb: &'a [f32],
    pub fcprojw: &'a [f32],
    pub fcprojb: &'a [f32],
    pub lnfw: &'a [f32],
    pub lnfb: &'a [f32],
    num_layers: usize,
}

/// The twelve per-layer parameter slices of one transformer block
pub struct LayerParams<'a> {
    pub ln1w: &'a [f32],
    pub ln1b: &'a [f32],
    pub qkvw: &'a [f32],
    pub qkvb: &'a [f32],
    pub attprojw: &'a [f32],
    pub attprojb: &'a [f32],
    pub ln2w: &'a [f32],
    pub ln2b: &'a [f32],
    pub fcw: &'a [f32],
    pub fcb: &'a [f32],
    pub fcprojw: &'a [f32],
    pub fcprojb: &'a [f32],
}

impl<'a> ParameterViews<'a> {
    /// Parameters of block `l`
    pub fn layer(&self, l: usize) -> LayerParams<'a> {
        let n = self.num_layers;
        LayerParams {
            ln1w: layer(self.ln1w, l, n),
            ln1b: layer(self.ln1b, l, n),
            qkvw: layer(self.qkvw, l, n),
            qkvb: layer(self.qkvb, l, n),
            attprojw: layer(self.attprojw, l, n),
            attprojb: layer(self.attprojb, l, n),
            ln2w: layer(self.ln2w, l, n),
            ln2b: layer(self.ln2b, l, n),
            fcw: layer(self.fcw, l, n),
            fcb: layer(self.fcb, l, n),
            fcprojw: layer(self.fcprojw, l, n),
            fcprojb: layer(self.fcprojb, l, n),
        }
    }
}

/// Mutable named slices into a [`ParameterTensors`] buffer (used for
/// gradient accumulation)
pub struct ParameterViewsMut<'a> {
    pub wte: &'a mut [f32],
    pub wpe: &'a mut [f32],
    pub ln1w: &'a mut [f32],
    pub ln1b: &'a mut [f32],
    pub qkvw: &'a mut [f32],
    pub qkvb: &'a mut [f32],
    pub attprojw: &'a mut [f32],
    pub attprojb: &'a mut [f32],
    pub ln2w: &'a mut [f32],
    pub ln2b: &'a mut [f32],
    pub fcw: &'a mut [f32],
    pub fcb: &'a mut [f32],
    pub fcprojw: &'a mut [f32],
    pub fcprojb: &'a mut [f32],
    pub lnfw: &'a mut [f32],
    pub lnfb: &'a mut [f32],
    num_layers: usize,
}

/// Mutable per-layer parameter slices of one transformer block
pub struct LayerParamsMut<'b> {
    pub ln1w: &'b mut [f32],
    pub ln1b: &'b mut [f32],
    pub qkvw: &'b mut [f32],
    pub qkvb: &'b mut [f32],
    pub attprojw: &'b mut [f32],
    pub attprojb: &'b mut [f32],
    pub ln2w: &'b mut [f32],
    pub ln2b: &'b mut [f32],
    pub fcw: &'b mut [f32],
    pub fcb: &'b mut [f32],
    pub fcprojw: &'b mut [f32],
    pub fcprojb: &'b mut [f32],
}

impl<'a> ParameterViewsMut<'a> {
    /// Mutable parameters of block `l`
    pub fn layer_mut(&mut self, l: usize) -> LayerParamsMut<'_> {
        let n = self.num_layers;
        LayerParamsMut {
            ln1w: layer_mut(self.ln1w, l, n),
            ln1b: layer_mut(self.ln1b, l, n),
            qkvw: layer_mut(self.qkvw, l, n),
            qkvb: layer_mut(self.qkvb, l, n),
            attprojw: layer_mut(self.attprojw, l, n),
            attprojb: layer_mut(self.attprojb, l, n),
            ln2w: layer_mut(self.ln2w, l, n),
            ln2b: layer_mut(self.ln2b, l, n),
            fcw: layer_mut(self.fcw, l, n),
            fcb: layer_mut(self.fcb, l, n),
            fcprojw: layer_mut(self.fcprojw, l, n),
            fcprojb: layer_mut(self.fcprojb, l, n),
        }
    }
}

//
// ============================================================================
// ACTIVATIONS
// ============================================================================
//

/// Intermediate values of one forward pass: twenty-three tensors in one
/// buffer, sized for a fixed `(B, T)`
///
/// Also used for activation gradients during the backward pass.
#[derive(Clone, Debug)]
pub struct ActivationTensors {
    buffer: FlatBuffer<NUM_ACTIVATION_TENSORS>,
    num_layers: usize,
    batch_size: usize,
    seq_len: usize,
}

impl ActivationTensors {
    pub fn zeros(config: &Config, batch_size: usize, seq_len: usize) -> Self {
        Self {
            buffer: FlatBuffer::zeros(activation_sizes(config, batch_size, seq_len)),
            num_layers: config.num_layers,
            batch_size,
            seq_len,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Fail unless these buffers were sized for exactly `(B, T)`
    pub fn check_dims(&self, batch_size: usize, seq_len: usize) -> Result<()> {
        if batch_size != self.batch_size || seq_len != self.seq_len {
            return Err(ModelError::BatchMismatch {
                expected_batch: self.batch_size,
                expected_seq_len: self.seq_len,
                batch: batch_size,
                seq_len,
            });
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[f32] {
        self.buffer.as_slice()
    }

    pub fn tensor(&self, tensor: ActTensor) -> &[f32] {
        self.buffer.tensor(tensor.index())
    }

    /// Layer `l` of a per-layer activation tensor
    pub fn layer(&self, tensor: ActTensor, l: usize) -> &[f32] {
        assert!(tensor.is_per_layer(), "{:?} is not a per-layer tensor", tensor);
        layer(self.tensor(tensor), l, self.num_layers)
    }

    pub fn zero(&mut self) {
        self.buffer.zero();
    }

    /// Named read-only views of all twenty-three tensors
    pub fn views(&self) -> ActivationViews<'_> {
        let [
            encoded,
            ln1,
            ln1_mean,
            ln1_rstd,
            qkv,
            atty,
            preatt,
            att,
            attproj,
            residual2,
            ln2,
            ln2_mean,
            ln2_rstd,
            fch,
            fch_gelu,
            fcproj,
            residual3,
            lnf,
            lnf_mean,
            lnf_rstd,
            logits,
            probs,
            losses,
        ] = self.buffer.carve();
        ActivationViews {
            encoded,
            ln1,
            ln1_mean,
            ln1_rstd,
            qkv,
            atty,
            preatt,
            att,
            attproj,
            residual2,
            ln2,
            ln2_mean,
            ln2_rstd,
            fch,
            fch_gelu,
            fcproj,
            residual3,
            lnf,
            lnf_mean,
            lnf_rstd,
            logits,
            probs,
            losses,
        }
    }

    /// Named mutable views of all twenty-three tensors
    pub fn views_mut(&mut self) -> ActivationViewsMut<'_> {
        let [
            encoded,
            ln1,
            ln1_mean,
            ln1_rstd,
            qkv,
            atty,
            preatt,
            att,
            attproj,
            residual2,
            ln2,
            ln2_mean,
            ln2_rstd,
            fch,
            fch_gelu,
            fcproj,
            residual3,
            lnf,
            lnf_mean,
            lnf_rstd,
            logits,
            probs,
            losses,
        ] = self.buffer.carve_mut();
        ActivationViewsMut {
            encoded,
            ln1,
            ln1_mean,
            ln1_rstd,
            qkv,
            atty,
            preatt,
            att,
            attproj,
            residual2,
            ln2,
            ln2_mean,
            ln2_rstd,
            fch,
            fch_gelu,
            fcproj,
            residual3,
            lnf,
            lnf_mean,
            lnf_rstd,
            logits,
            probs,
            losses,
        }
    }
}

/// Read-only named slices into an [`ActivationTensors`] buffer
pub struct ActivationViews<'a> {
    pub encoded: &'a [f32],
    pub ln1: &'a [f32],
    pub ln1_mean: &'a [f32],
    pub ln1_rstd: &'a [f32],
    pub qkv: &'a [f32],
    pub atty: &'a [f32],
    pub preatt: &'a [f32],
    pub att: &'a [f32],
    pub attproj: &'a [f32],
    pub residual2: &'a [f32],
    pub ln2: &'a [f32],
    pub ln2_mean: &'a [f32],
    pub ln2_rstd: &'a [f32],
    pub fch: &'a [f32],
    pub fch_gelu: &'a [f32],
    pub fcproj: &'a [f32],
    pub residual3: &'a [f32],
    pub lnf: &'a [f32],
    pub lnf_mean: &'a [f32],
    pub lnf_rstd: &'a [f32],
    pub logits: &'a [f32],
    pub probs: &'a [f32],
    pub losses: &'a [f32],
}

/// Mutable named slices into an [`ActivationTensors`] buffer
pub struct ActivationViewsMut<'a> {
    pub encoded: &'a mut [f32],
    pub ln1: &'a mut [f32],
    pub ln1_mean: &'a mut [f32],
    pub ln1_rstd: &'a mut [f32],
    pub qkv: &'a mut [f32],
    pub atty: &'a mut [f32],
    pub preatt: &'a mut [f32],
    pub att: &'a mut [f32],
    pub attproj: &'a mut [f32],
    pub residual2: &'a mut [f32],
    pub ln2: &'a mut [f32],
    pub ln2_mean: &'a mut [f32],
    pub ln2_rstd: &'a mut [f32],
    pub fch: &'a mut [f32],
    pub fch_gelu: &'a mut [f32],
    pub fcproj: &'a mut [f32],
    pub residual3: &'a mut [f32],
    pub lnf: &'a mut [f32],
    pub lnf_mean: &'a mut [f32],
    pub lnf_rstd: &'a mut [f32],
    pub logits: &'a mut [f32],
    pub probs: &'a mut [f32],
    pub losses: &'a mut [f32],
}
