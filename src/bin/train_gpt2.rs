//! Train GPT-2 on pre-tokenized data
//!
//! Token files hold whitespace-separated token ids. Without `--val` the last
//! `--val-fraction` of the training stream is held out for validation.
//!
//! ## Usage
//!
//! ```bash
//! # Fine-tune GPT-2 small from a checkpoint
//! RUST_LOG=info cargo run --release --bin train_gpt2 -- \
//!     --checkpoint gpt2_124M.bin --train train.txt --val val.txt
//!
//! # Smoke test with a tiny random model (vocabulary of 16 tokens)
//! RUST_LOG=info cargo run --release --bin train_gpt2 -- \
//!     --random --train tiny.txt --seq-len 8 --batch-size 2 --steps 20
//! ```

use clap::Parser;
use flatgpt::train::{parse_tokens, train_val_split};
use flatgpt::{
    checkpoint, write_config, AdamWConfig, Config, TokenBatcher, TrainConfig, Trainer,
    TrainingLogger, GPT2,
};
use log::{info, warn};
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "train_gpt2", about = "Train GPT-2 over flat parameter buffers")]
struct Args {
    /// Load the model from a checkpoint
    #[arg(long, required_unless_present = "random", conflicts_with = "random")]
    checkpoint: Option<PathBuf>,

    /// Start from a tiny randomly initialized model instead
    #[arg(long)]
    random: bool,

    /// Seed for random initialization and sampling
    #[arg(long, default_value = "1337")]
    seed: u64,

    /// Training token ids
    #[arg(long)]
    train: PathBuf,

    /// Validation token ids
    #[arg(long)]
    val: Option<PathBuf>,

    /// Fraction of the training stream held out when --val is absent
    #[arg(long, default_value = "0.1")]
    val_fraction: f32,

    /// Sequences per batch
    #[arg(long, default_value = "4")]
    batch_size: usize,

    /// Tokens per sequence
    #[arg(long, default_value = "64")]
    seq_len: usize,

    /// Optimizer steps
    #[arg(long, default_value = "40")]
    steps: usize,

    /// Learning rate
    #[arg(long, default_value = "1e-4")]
    lr: f32,

    /// Weight decay
    #[arg(long, default_value = "0.0")]
    weight_decay: f32,

    /// Gradient clipping max norm
    #[arg(long)]
    grad_clip: Option<f32>,

    /// Evaluate every N steps
    #[arg(long, default_value = "10")]
    val_every: usize,

    /// Batches per evaluation
    #[arg(long, default_value = "5")]
    val_batches: usize,

    /// Sample every N steps
    #[arg(long, default_value = "20")]
    sample_every: usize,

    /// Tokens per sample
    #[arg(long, default_value = "64")]
    sample_len: usize,

    /// CSV metrics file; the run configuration is written next to it as JSON
    #[arg(long, default_value = "training_log.csv")]
    log: PathBuf,

    /// Save the trained model to this checkpoint
    #[arg(long)]
    save: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let model = match &args.checkpoint {
        Some(path) => GPT2::from_checkpoint(path)?,
        None => GPT2::random(Config::tiny(), args.seed)?,
    };
    let config = *model.config();

    let mut seq_len = args.seq_len;
    if seq_len > config.max_seq_len {
        warn!(
            "seq_len {} exceeds the model's {}; using {}",
            seq_len, config.max_seq_len, config.max_seq_len
        );
        seq_len = config.max_seq_len;
    }

    let train_tokens = parse_tokens(&fs::read_to_string(&args.train)?)?;
    let (train_tokens, val_tokens) = match &args.val {
        Some(path) => (train_tokens, parse_tokens(&fs::read_to_string(path)?)?),
        None => {
            let (train, val) = train_val_split(&train_tokens, args.val_fraction);
            (train.to_vec(), val.to_vec())
        }
    };
    info!(
        "train tokens: {}, val tokens: {}",
        train_tokens.len(),
        val_tokens.len()
    );

    let mut train = TokenBatcher::new(train_tokens, args.batch_size, seq_len)?;
    let mut val = TokenBatcher::new(val_tokens, args.batch_size, seq_len)?;
    info!(
        "train batches per epoch: {}, val batches per epoch: {}",
        train.num_batches(),
        val.num_batches()
    );

    let train_config = TrainConfig {
        batch_size: args.batch_size,
        seq_len,
        steps: args.steps,
        val_every: args.val_every,
        val_batches: args.val_batches.min(val.num_batches()).max(1),
        sample_every: args.sample_every,
        sample_len: args.sample_len.min(seq_len),
        max_grad_norm: args.grad_clip,
        seed: args.seed,
        optimizer: AdamWConfig {
            learning_rate: args.lr,
            weight_decay: args.weight_decay,
            ..AdamWConfig::default()
        },
    };
    write_config(args.log.with_extension("json"), &config, &train_config)?;
    let mut logger = TrainingLogger::new(&args.log)?;

    let mut trainer = Trainer::new(model, train_config);
    let history = trainer.run(&mut train, Some(&mut val), Some(&mut logger))?;
    if let Some(last) = history.last() {
        info!("final train loss {:.6}", last.loss);
    }

    if let Some(path) = &args.save {
        let model = trainer.into_model();
        checkpoint::save(path, model.config(), model.params())?;
    }
    Ok(())
}
