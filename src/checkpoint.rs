//! Model Checkpoint Format
//!
//! A checkpoint is a fixed header followed by the raw parameter buffer:
//!
//! ```text
//! header: 256 × i32 (little-endian)
//!   [0] magic   = 20240326
//!   [1] version = 3
//!   [2] max_seq_len
//!   [3] vocab_size
//!   [4] num_layers
//!   [5] num_heads
//!   [6] channels
//!   [7] padded_vocab_size
//!   [8..256] unused, zero
//! body: num_parameters × f32 (little-endian), tensors in canonical order
//! ```
//!
//! The body length is fully determined by the header via
//! [`crate::layout::num_parameters`], so there is nothing else to parse.

use crate::config::Config;
use crate::error::{ModelError, Result};
use crate::layout::num_parameters;
use crate::tensor::ParameterTensors;
use log::{info, warn};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const CHECKPOINT_MAGIC: i32 = 20240326;
pub const CHECKPOINT_VERSION: i32 = 3;
pub const HEADER_LEN: usize = 256;

/// Decode the hyperparameters from a raw header
pub fn parse_header(header: &[i32; HEADER_LEN]) -> Result<Config> {
    if header[0] != CHECKPOINT_MAGIC {
        return Err(ModelError::BadMagic {
            expected: CHECKPOINT_MAGIC,
            found: header[0],
        });
    }
    if header[1] != CHECKPOINT_VERSION {
        return Err(ModelError::BadVersion {
            expected: CHECKPOINT_VERSION,
            found: header[1],
        });
    }

    let dim = |i: usize, name: &str| -> Result<usize> {
        usize::try_from(header[i])
            .map_err(|_| ModelError::InvalidConfig(format!("{} is negative ({})", name, header[i])))
    };
    let config = Config {
        max_seq_len: dim(2, "max_seq_len")?,
        vocab_size: dim(3, "vocab_size")?,
        num_layers: dim(4, "num_layers")?,
        num_heads: dim(5, "num_heads")?,
        channels: dim(6, "channels")?,
        padded_vocab_size: dim(7, "padded_vocab_size")?,
    };
    config.validate()?;
    Ok(config)
}

/// Encode the hyperparameters into a header
pub fn build_header(config: &Config) -> Result<[i32; HEADER_LEN]> {
    let field = |value: usize| -> Result<i32> {
        i32::try_from(value)
            .map_err(|_| ModelError::InvalidConfig(format!("{} does not fit the header", value)))
    };
    let mut header = [0i32; HEADER_LEN];
    header[0] = CHECKPOINT_MAGIC;
    header[1] = CHECKPOINT_VERSION;
    header[2] = field(config.max_seq_len)?;
    header[3] = field(config.vocab_size)?;
    header[4] = field(config.num_layers)?;
    header[5] = field(config.num_heads)?;
    header[6] = field(config.channels)?;
    header[7] = field(config.padded_vocab_size)?;
    Ok(header)
}

/// Read a checkpoint from any byte source
pub fn read_from(mut reader: impl Read) -> Result<(Config, ParameterTensors)> {
    let mut header_bytes = vec![0u8; HEADER_LEN * 4];
    reader.read_exact(&mut header_bytes)?;
    let mut header = [0i32; HEADER_LEN];
    for (h, bytes) in header.iter_mut().zip(header_bytes.chunks_exact(4)) {
        *h = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    let config = parse_header(&header)?;

    info!("[GPT-2]");
    info!("max_seq_len: {}", config.max_seq_len);
    info!("vocab_size: {}", config.vocab_size);
    info!("padded_vocab_size: {}", config.padded_vocab_size);
    info!("num_layers: {}", config.num_layers);
    info!("num_heads: {}", config.num_heads);
    info!("channels: {}", config.channels);

    let expected = num_parameters(&config);
    let mut body = Vec::new();
    reader.read_to_end(&mut body)?;
    let found = body.len() / 4;
    if found < expected {
        return Err(ModelError::Truncated { expected, found });
    }
    if body.len() > expected * 4 {
        warn!(
            "ignoring {} trailing bytes after the parameter buffer",
            body.len() - expected * 4
        );
    }

    let memory: Vec<f32> = body[..expected * 4]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let params = ParameterTensors::from_vec(&config, memory)?;
    Ok((config, params))
}

/// Load a checkpoint file
pub fn load(path: impl AsRef<Path>) -> Result<(Config, ParameterTensors)> {
    let path = path.as_ref();
    info!("loading checkpoint from {}", path.display());
    let file = File::open(path)?;
    read_from(BufReader::new(file))
}

/// Write a checkpoint to any byte sink
pub fn write_to(mut writer: impl Write, config: &Config, params: &ParameterTensors) -> Result<()> {
    if params.len() != num_parameters(config) {
        return Err(ModelError::ShapeMismatch(format!(
            "parameter buffer holds {} elements, config needs {}",
            params.len(),
            num_parameters(config)
        )));
    }
    for value in build_header(config)? {
        writer.write_all(&value.to_le_bytes())?;
    }
    for value in params.as_slice() {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Save a checkpoint file in the same format [`load`] reads
pub fn save(path: impl AsRef<Path>, config: &Config, params: &ParameterTensors) -> Result<()> {
    let path = path.as_ref();
    info!("saving checkpoint to {}", path.display());
    let file = File::create(path)?;
    write_to(BufWriter::new(file), config, params)
}
