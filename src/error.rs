//! Error types
//!
//! Every precondition the model checks before touching a buffer maps to one
//! variant here. Kernels do not return errors: they assert their declared
//! shapes and panic, so a caller that skipped validation can never read or
//! write out of bounds.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised by checkpoint loading, the forward/backward passes and the
/// optimizer
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic in model file: expected {expected}, found {found}")]
    BadMagic { expected: i32, found: i32 },

    #[error("bad version in model file: expected {expected}, found {found} (re-export the checkpoint)")]
    BadVersion { expected: i32, found: i32 },

    #[error("checkpoint truncated: expected {expected} parameters, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("token id {id} at position {position} is outside the vocabulary (vocab_size = {vocab_size})")]
    TokenOutOfRange {
        id: u32,
        position: usize,
        vocab_size: usize,
    },

    #[error("target id {id} at position {position} is outside the vocabulary (vocab_size = {vocab_size})")]
    TargetOutOfRange {
        id: u32,
        position: usize,
        vocab_size: usize,
    },

    #[error("buffers sized for B={expected_batch} T={expected_seq_len}, got B={batch} T={seq_len}")]
    BatchMismatch {
        expected_batch: usize,
        expected_seq_len: usize,
        batch: usize,
        seq_len: usize,
    },

    #[error("sequence length {seq_len} exceeds max_seq_len {max_seq_len}")]
    SequenceTooLong { seq_len: usize, max_seq_len: usize },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("backward pass requires targets")]
    MissingTargets,
}
