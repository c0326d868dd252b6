//! Tensor Layout Planner
//!
//! Maps a [`Config`] (and, for activations, a batch size `B` and sequence
//! length `T`) to the element count of every tensor, in a fixed canonical
//! order. The order is part of the checkpoint format: the parameter buffer
//! on disk is exactly these sixteen tensors laid end to end.
//!
//! ## Parameters (16 tensors)
//!
//! ```text
//! wte       (Vp, C)        token embedding, tied with the output projection
//! wpe       (maxT, C)      position embedding
//! ln1w/b    (L, C)         pre-attention layernorm
//! qkvw      (L, 3C, C)     fused query/key/value projection
//! qkvb      (L, 3C)
//! attprojw  (L, C, C)      attention output projection
//! attprojb  (L, C)
//! ln2w/b    (L, C)         pre-MLP layernorm
//! fcw       (L, 4C, C)     MLP expansion
//! fcb       (L, 4C)
//! fcprojw   (L, C, 4C)     MLP contraction
//! fcprojb   (L, C)
//! lnfw/b    (C)            final layernorm
//! ```
//!
//! ## Activations (23 tensors)
//!
//! Per-layer activations are stored as `L` consecutive blocks, so the slice
//! for layer `l` starts at `l * size / L` within its tensor.

use crate::config::Config;

pub const NUM_PARAMETER_TENSORS: usize = 16;
pub const NUM_ACTIVATION_TENSORS: usize = 23;

/// The sixteen parameter tensors, in canonical (checkpoint) order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamTensor {
    Wte,
    Wpe,
    Ln1w,
    Ln1b,
    Qkvw,
    Qkvb,
    Attprojw,
    Attprojb,
    Ln2w,
    Ln2b,
    Fcw,
    Fcb,
    Fcprojw,
    Fcprojb,
    Lnfw,
    Lnfb,
}

impl ParamTensor {
    pub const ALL: [ParamTensor; NUM_PARAMETER_TENSORS] = [
        ParamTensor::Wte,
        ParamTensor::Wpe,
        ParamTensor::Ln1w,
        ParamTensor::Ln1b,
        ParamTensor::Qkvw,
        ParamTensor::Qkvb,
        ParamTensor::Attprojw,
        ParamTensor::Attprojb,
        ParamTensor::Ln2w,
        ParamTensor::Ln2b,
        ParamTensor::Fcw,
        ParamTensor::Fcb,
        ParamTensor::Fcprojw,
        ParamTensor::Fcprojb,
        ParamTensor::Lnfw,
        ParamTensor::Lnfb,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ParamTensor::Wte => "wte",
            ParamTensor::Wpe => "wpe",
            ParamTensor::Ln1w => "ln1w",
            ParamTensor::Ln1b => "ln1b",
            ParamTensor::Qkvw => "qkvw",
            ParamTensor::Qkvb => "qkvb",
            ParamTensor::Attprojw => "attprojw",
            ParamTensor::Attprojb => "attprojb",
            ParamTensor::Ln2w => "ln2w",
            ParamTensor::Ln2b => "ln2b",
            ParamTensor::Fcw => "fcw",
            ParamTensor::Fcb => "fcb",
            ParamTensor::Fcprojw => "fcprojw",
            ParamTensor::Fcprojb => "fcprojb",
            ParamTensor::Lnfw => "lnfw",
            ParamTensor::Lnfb => "lnfb",
        }
    }

    /// Whether the tensor holds one block per transformer layer
    pub fn is_per_layer(self) -> bool {
        !matches!(
            self,
            ParamTensor::Wte | ParamTensor::Wpe | ParamTensor::Lnfw | ParamTensor::Lnfb
        )
    }
}

/// The twenty-three activation tensors, in canonical order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActTensor {
    Encoded,
    Ln1,
    Ln1Mean,
    Ln1Rstd,
    Qkv,
    Atty,
    Preatt,
    Att,
    Attproj,
    Residual2,
    Ln2,
    Ln2Mean,
    Ln2Rstd,
    Fch,
    FchGelu,
    Fcproj,
    Residual3,
    Lnf,
    LnfMean,
    LnfRstd,
    Logits,
    Probs,
    Losses,
}

impl ActTensor {
    pub const ALL: [ActTensor; NUM_ACTIVATION_TENSORS] = [
        ActTensor::Encoded,
        ActTensor::Ln1,
        ActTensor::Ln1Mean,
        ActTensor::Ln1Rstd,
        ActTensor::Qkv,
        ActTensor::Atty,
        ActTensor::Preatt,
        ActTensor::Att,
        ActTensor::Attproj,
        ActTensor::Residual2,
        ActTensor::Ln2,
        ActTensor::Ln2Mean,
        ActTensor::Ln2Rstd,
        ActTensor::Fch,
        ActTensor::FchGelu,
        ActTensor::Fcproj,
        ActTensor::Residual3,
        ActTensor::Lnf,
        ActTensor::LnfMean,
        ActTensor::LnfRstd,
        ActTensor::Logits,
        ActTensor::Probs,
        ActTensor::Losses,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_per_layer(self) -> bool {
        matches!(
            self,
            ActTensor::Ln1
                | ActTensor::Ln1Mean
                | ActTensor::Ln1Rstd
                | ActTensor::Qkv
                | ActTensor::Atty
                | ActTensor::Preatt
                | ActTensor::Att
                | ActTensor::Attproj
                | ActTensor::Residual2
                | ActTensor::Ln2
                | ActTensor::Ln2Mean
                | ActTensor::Ln2Rstd
                | ActTensor::Fch
                | ActTensor::FchGelu
                | ActTensor::Fcproj
                | ActTensor::Residual3
        )
    }
}

/// Element counts of the parameter tensors, in [`ParamTensor::ALL`] order
pub fn parameter_sizes(config: &Config) -> [usize; NUM_PARAMETER_TENSORS] {
    let vp = config.padded_vocab_size;
    let c = config.channels;
    let max_t = config.max_seq_len;
    let l = config.num_layers;
    [
        vp * c,          // wte
        max_t * c,       // wpe
        l * c,           // ln1w
        l * c,           // ln1b
        l * (3 * c) * c, // qkvw
        l * (3 * c),     // qkvb
        l * c * c,       // attprojw
        l * c,           // attprojb
        l * c,           // ln2w
        l * c,           // ln2b
        l * (4 * c) * c, // fcw
        l * (4 * c),     // fcb
        l * c * (4 * c), // fcprojw
        l * c,           // fcprojb
        c,               // lnfw
        c,               // lnfb
    ]
}

/// Element counts of the activation tensors for a `(B, T)` batch, in
/// [`ActTensor::ALL`] order
pub fn activation_sizes(
    config: &Config,
    batch_size: usize,
    seq_len: usize,
) -> [usize; NUM_ACTIVATION_TENSORS] {
    let c = config.channels;
    let nh = config.num_heads;
    let l = config.num_layers;
    let vp = config.padded_vocab_size;
    let bt = batch_size * seq_len;
    let att = batch_size * nh * seq_len * seq_len;
    [
        bt * c,         // encoded
        l * bt * c,     // ln1
        l * bt,         // ln1_mean
        l * bt,         // ln1_rstd
        l * bt * 3 * c, // qkv
        l * bt * c,     // atty
        l * att,        // preatt
        l * att,        // att
        l * bt * c,     // attproj
        l * bt * c,     // residual2
        l * bt * c,     // ln2
        l * bt,         // ln2_mean
        l * bt,         // ln2_rstd
        l * bt * 4 * c, // fch
        l * bt * 4 * c, // fch_gelu
        l * bt * c,     // fcproj
        l * bt * c,     // residual3
        bt * c,         // lnf
        bt,             // lnf_mean
        bt,             // lnf_rstd
        bt * vp,        // logits
        bt * vp,        // probs
        bt,             // losses
    ]
}

/// Start offset of each tensor when laid end to end
pub fn offsets<const N: usize>(sizes: &[usize; N]) -> [usize; N] {
    let mut out = [0; N];
    let mut running = 0;
    for (offset, &size) in out.iter_mut().zip(sizes) {
        *offset = running;
        running += size;
    }
    out
}

/// Total parameter count for a configuration
pub fn num_parameters(config: &Config) -> usize {
    parameter_sizes(config).iter().sum()
}

/// Total activation count for a configuration and batch shape
pub fn num_activations(config: &Config, batch_size: usize, seq_len: usize) -> usize {
    activation_sizes(config, batch_size, seq_len).iter().sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_gpt2_small_parameter_count() {
        // Matches the count reported by the reference implementation
        assert_eq!(num_parameters(&Config::gpt2_small()), 124_475_904);
    }

    #[test]
    fn test_gpt2_small_activation_count() {
        assert_eq!(num_activations(&Config::gpt2_small(), 4, 64), 73_347_840);
    }

    #[test]
    fn test_tiny_counts() {
        assert_eq!(num_parameters(&Config::tiny()), 1952);
        assert_eq!(num_activations(&Config::tiny(), 2, 4), 3032);
    }

    #[test]
    fn test_enum_order_matches_index() {
        for (i, tensor) in ParamTensor::ALL.iter().enumerate() {
            assert_eq!(tensor.index(), i);
        }
        for (i, tensor) in ActTensor::ALL.iter().enumerate() {
            assert_eq!(tensor.index(), i);
        }
    }

    #[test]
    fn test_per_layer_sizes_divide_evenly() {
        let config = Config::gpt2_small();
        let sizes = parameter_sizes(&config);
        for tensor in ParamTensor::ALL {
            if tensor.is_per_layer() {
                assert_eq!(sizes[tensor.index()] % config.num_layers, 0, "{}", tensor.name());
            }
        }
    }

    fn arb_config() -> impl Strategy<Value = Config> {
        (1usize..64, 1usize..100, 0usize..32, 1usize..6, 1usize..5, 1usize..8).prop_map(
            |(max_seq_len, vocab_size, pad, num_layers, num_heads, head_size)| Config {
                max_seq_len,
                vocab_size,
                padded_vocab_size: vocab_size + pad,
                num_layers,
                num_heads,
                channels: num_heads * head_size,
            },
        )
    }

    proptest! {
        #[test]
        fn prop_parameter_offsets_tile_the_buffer(config in arb_config()) {
            let sizes = parameter_sizes(&config);
            let offs = offsets(&sizes);
            for i in 1..NUM_PARAMETER_TENSORS {
                prop_assert_eq!(offs[i], offs[i - 1] + sizes[i - 1]);
            }
            let last = NUM_PARAMETER_TENSORS - 1;
            prop_assert_eq!(offs[last] + sizes[last], num_parameters(&config));
        }

        #[test]
        fn prop_activation_offsets_tile_the_buffer(
            config in arb_config(),
            batch_size in 1usize..5,
            seq_len in 1usize..16,
        ) {
            let sizes = activation_sizes(&config, batch_size, seq_len);
            let offs = offsets(&sizes);
            let last = NUM_ACTIVATION_TENSORS - 1;
            prop_assert_eq!(
                offs[last] + sizes[last],
                num_activations(&config, batch_size, seq_len)
            );
            for tensor in ActTensor::ALL {
                if tensor.is_per_layer() {
                    prop_assert_eq!(sizes[tensor.index()] % config.num_layers, 0);
                }
            }
        }
    }
}
