//! Layer Kernels
//!
//! Every layer of the network is a pair of free functions over flat `f32`
//! slices: a forward kernel writing into caller-provided output buffers, and
//! a backward kernel that accumulates (`+=`) into gradient buffers.
//!
//! ## Kernels
//!
//! - **encoder**: token + position embedding lookup
//! - **layer_norm**: layer normalization, caching mean and 1/std
//! - **linear**: matrix multiply with optional bias
//! - **attention**: causal multi-head self-attention over fused QKV
//! - **activation**: GELU (tanh approximation)
//! - **residual**: elementwise sum
//! - **softmax**: logits to probabilities over the real vocabulary
//! - **loss**: cross-entropy and the fused softmax/cross-entropy backward
//!
//! ## Pattern
//!
//! ```rust,ignore
//! pub fn kernel_forward(out: &mut [f32], inp: &[f32], /* weights */, /* dims */);
//! pub fn kernel_backward(dinp: &mut [f32], /* dweights */, dout: &[f32], /* saved */, /* dims */);
//! ```
//!
//! Nothing is allocated inside a kernel: all state lives in the parameter and
//! activation buffers.

pub mod activation;
pub mod attention;
pub mod encoder;
pub mod layer_norm;
pub mod linear;
pub mod loss;
pub mod residual;
pub mod softmax;

pub use activation::{gelu_backward, gelu_forward};
pub use attention::{attention_backward, attention_forward};
pub use encoder::{encoder_backward, encoder_forward};
pub use layer_norm::{layernorm_backward, layernorm_forward, LAYERNORM_EPS};
pub use linear::{
    matmul_backward, matmul_forward, matmul_forward_naive, matmul_forward_tiled, LOOP_UNROLL,
};
pub use loss::{crossentropy_forward, crossentropy_softmax_backward};
pub use residual::{residual_backward, residual_forward};
pub use softmax::softmax_forward;
