//! Model Configuration
//!
//! The six hyperparameters that fully determine the parameter layout. They
//! are read from the checkpoint header and never change for the lifetime of
//! a model.
//!
//! ## Padded Vocabulary
//!
//! GPT-2's vocabulary has 50257 tokens, an awkward number for the output
//! projection. The checkpoint stores the token embedding padded to 50304 rows
//! (a multiple of 128). The extra rows are never read as embeddings, and the
//! logits they produce are forced to probability zero.

use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};

/// GPT-2 hyperparameters
///
/// # Fields
///
/// - `max_seq_len`: Maximum sequence length (rows of the position embedding)
/// - `vocab_size`: True vocabulary size (V)
/// - `padded_vocab_size`: Vocabulary padded for alignment (Vp >= V)
/// - `num_layers`: Number of transformer blocks (L)
/// - `num_heads`: Attention heads per block (NH)
/// - `channels`: Width of the residual stream (C)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub max_seq_len: usize,
    pub vocab_size: usize,
    pub padded_vocab_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub channels: usize,
}

impl Config {
    /// GPT-2 Small (124M) as exported by the reference training script
    pub fn gpt2_small() -> Self {
        Self {
            max_seq_len: 1024,
            vocab_size: 50257,
            padded_vocab_size: 50304,
            num_layers: 12,
            num_heads: 12,
            channels: 768,
        }
    }

    /// A toy model small enough for exhaustive tests
    ///
    /// 2 layers, 2 heads, 8 channels, 16 tokens, context of 8.
    pub fn tiny() -> Self {
        Self {
            max_seq_len: 8,
            vocab_size: 16,
            padded_vocab_size: 16,
            num_layers: 2,
            num_heads: 2,
            channels: 8,
        }
    }

    /// Size of one attention head (C / NH)
    pub fn head_size(&self) -> usize {
        self.channels / self.num_heads
    }

    /// Check the invariants every other module relies on
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("max_seq_len", self.max_seq_len),
            ("vocab_size", self.vocab_size),
            ("padded_vocab_size", self.padded_vocab_size),
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("channels", self.channels),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, value)| *value == 0) {
            return Err(ModelError::InvalidConfig(format!("{} must be non-zero", name)));
        }
        if self.channels % self.num_heads != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "channels ({}) must be divisible by num_heads ({})",
                self.channels, self.num_heads
            )));
        }
        if self.padded_vocab_size < self.vocab_size {
            return Err(ModelError::InvalidConfig(format!(
                "padded_vocab_size ({}) is smaller than vocab_size ({})",
                self.padded_vocab_size, self.vocab_size
            )));
        }
        if self.checked_parameter_bytes().is_none() {
            return Err(ModelError::InvalidConfig(format!(
                "parameter buffer for {:?} does not fit in memory",
                self
            )));
        }
        Ok(())
    }

    /// Byte size of the parameter buffer, or `None` on overflow
    ///
    /// Per layer: 12·C² weights and 13·C biases and layernorm entries.
    fn checked_parameter_bytes(&self) -> Option<usize> {
        let c = self.channels;
        let per_layer = c
            .checked_mul(c)?
            .checked_mul(12)?
            .checked_add(c.checked_mul(13)?)?;
        self.padded_vocab_size
            .checked_mul(c)?
            .checked_add(self.max_seq_len.checked_mul(c)?)?
            .checked_add(self.num_layers.checked_mul(per_layer)?)?
            .checked_add(c.checked_mul(2)?)?
            .checked_mul(std::mem::size_of::<f32>())
    }
}
