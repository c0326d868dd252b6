//! flatgpt: GPT-2 Training Over Flat Buffers
//!
//! A GPT-2 forward pass, a hand-written backward pass and an AdamW optimizer,
//! all operating on two flat `f32` buffers: one holding the 16 parameter
//! tensors, one holding the 23 activation tensors. Every tensor is a fixed
//! contiguous slice of its buffer.
//!
//! # Modules
//!
//! - [`config`] - Model hyperparameters
//! - [`layout`] - Tensor shapes and offsets inside the flat buffers
//! - [`tensor`] - Parameter and activation buffers with named views
//! - [`layers`] - Forward and backward kernels
//! - [`model`] - The forward pass and the [`GPT2`] model
//! - [`autodiff`] - The differentiation seam and the hand-written backward
//! - [`gradients`] - Shadow buffers for gradients
//! - [`optimizer`] - AdamW
//! - [`checkpoint`] - Binary checkpoint load/save
//! - [`sampler`] - Seeded token sampling
//! - [`train`] - Batching and the training loop
//! - [`training_logger`] - CSV metrics
//!
//! # Example
//!
//! ```rust,no_run
//! use flatgpt::{Batch, Config, Trainer, TrainConfig, GPT2};
//!
//! let model = GPT2::random(Config::tiny(), 42)?;
//! let mut trainer = Trainer::new(
//!     model,
//!     TrainConfig {
//!         batch_size: 1,
//!         seq_len: 4,
//!         ..TrainConfig::default()
//!     },
//! );
//! let batch = Batch::new(vec![1, 2, 3, 4], vec![2, 3, 4, 5], 1, 4)?;
//! let stats = trainer.train_step(&batch)?;
//! println!("loss {}", stats.loss);
//! # Ok::<(), flatgpt::ModelError>(())
//! ```

pub mod autodiff;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod gradients;
pub mod layers;
pub mod layout;
pub mod model;
pub mod optimizer;
pub mod sampler;
pub mod tensor;
pub mod train;
pub mod training_logger;

// Re-export main types for convenience
pub use autodiff::{gpt2_backward, Differentiator, HandWrittenBackward};
pub use config::Config;
pub use error::{ModelError, Result};
pub use gradients::GradientBuffers;
pub use layout::{ActTensor, ParamTensor};
pub use model::{gpt2_forward, Batch, GPT2};
pub use optimizer::{AdamW, AdamWConfig};
pub use sampler::{sample_mult, Xorshift};
pub use tensor::{ActivationTensors, ParameterTensors};
pub use train::{BatchSource, StepStats, TokenBatcher, TrainConfig, Trainer};
pub use training_logger::{write_config, TrainingLogger};
