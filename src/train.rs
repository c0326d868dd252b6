//! Training Loop
//!
//! Batching of token streams and the orchestration of one training run:
//!
//! ```text
//! every step:     zero_grad → differentiate → (clip) → AdamW update
//! every N steps:  mean loss over a few validation batches
//! every M steps:  sample a few tokens from the model
//! ```
//!
//! ## How Batches Are Generated
//!
//! [`TokenBatcher`] walks a token stream in windows of `B*T + 1` tokens. The
//! inputs are the first `B*T`, the targets the same window shifted by one:
//!
//! ```text
//! Tokens: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, ...]
//! B = 2, T = 4
//!
//! Batch 1:
//!   Input:  [1, 2, 3, 4] [5, 6, 7, 8]   Target: [2, 3, 4, 5] [6, 7, 8, 9]
//! Batch 2:
//!   Input:  [9, 10, 11, 12] [13, ...]   Target: [10, 11, 12, 13] [14, ...]
//! ```
//!
//! When fewer than `B*T + 1` tokens remain, the batcher wraps to the start.

use crate::autodiff::{Differentiator, HandWrittenBackward};
use crate::error::{ModelError, Result};
use crate::gradients::GradientBuffers;
use crate::model::{Batch, GPT2};
use crate::optimizer::{AdamW, AdamWConfig};
use crate::sampler::{sample_mult, Xorshift, DEFAULT_SEED};
use crate::training_logger::TrainingLogger;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

/// Anything that yields fixed-size `(B, T)` batches
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<Batch>;

    /// Rewind to the first batch
    fn reset(&mut self);
}

/// Sliding-window batcher over an in-memory token stream
pub struct TokenBatcher {
    tokens: Vec<u32>,
    batch_size: usize,
    seq_len: usize,
    position: usize,
}

impl TokenBatcher {
    /// The stream must hold at least one full window of `B*T + 1` tokens
    pub fn new(tokens: Vec<u32>, batch_size: usize, seq_len: usize) -> Result<Self> {
        let window = batch_size * seq_len + 1;
        if batch_size == 0 || seq_len == 0 || tokens.len() < window {
            return Err(ModelError::ShapeMismatch(format!(
                "need at least {} tokens for B={} T={}, got {}",
                window,
                batch_size,
                seq_len,
                tokens.len()
            )));
        }
        Ok(Self {
            tokens,
            batch_size,
            seq_len,
            position: 0,
        })
    }

    /// Load whitespace-separated token ids from a text file
    pub fn from_file(path: impl AsRef<Path>, batch_size: usize, seq_len: usize) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let tokens = parse_tokens(&text)?;
        info!(
            "loaded {} tokens from {}",
            tokens.len(),
            path.as_ref().display()
        );
        Self::new(tokens, batch_size, seq_len)
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Number of distinct windows in one pass over the stream
    pub fn num_batches(&self) -> usize {
        (self.tokens.len() - 1) / (self.batch_size * self.seq_len)
    }
}

impl BatchSource for TokenBatcher {
    fn next_batch(&mut self) -> Result<Batch> {
        let n = self.batch_size * self.seq_len;
        if self.position + n + 1 > self.tokens.len() {
            self.position = 0;
        }
        let window = &self.tokens[self.position..self.position + n + 1];
        self.position += n;
        Batch::new(
            window[..n].to_vec(),
            window[1..].to_vec(),
            self.batch_size,
            self.seq_len,
        )
    }

    fn reset(&mut self) {
        self.position = 0;
    }
}

/// Parse whitespace-separated token ids
pub fn parse_tokens(text: &str) -> Result<Vec<u32>> {
    text.split_whitespace()
        .map(|word| {
            word.parse::<u32>().map_err(|e| {
                ModelError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad token id {:?}: {}", word, e),
                ))
            })
        })
        .collect()
}

/// Split a token stream into training and validation parts
///
/// The validation part is taken from the end of the stream.
///
/// # Example
///
/// ```rust
/// # use flatgpt::train::train_val_split;
/// let tokens = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
/// let (train, val) = train_val_split(&tokens, 0.2);
/// assert_eq!(train.len(), 8);
/// assert_eq!(val.len(), 2);
/// ```
pub fn train_val_split(tokens: &[u32], val_fraction: f32) -> (&[u32], &[u32]) {
    let split_idx = ((tokens.len() as f32) * (1.0 - val_fraction)) as usize;
    (&tokens[..split_idx], &tokens[split_idx..])
}

/// Training run configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Sequences per batch (B)
    pub batch_size: usize,
    /// Tokens per sequence (T)
    pub seq_len: usize,
    /// Number of optimizer steps
    pub steps: usize,
    /// Evaluate validation loss every N steps (0 disables)
    pub val_every: usize,
    /// Validation batches per evaluation
    pub val_batches: usize,
    /// Sample from the model every N steps (0 disables)
    pub sample_every: usize,
    /// Tokens per sample, at most `seq_len`
    pub sample_len: usize,
    /// Clip the global gradient norm to this value
    pub max_grad_norm: Option<f32>,
    /// Sampler seed
    pub seed: u64,
    pub optimizer: AdamWConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            seq_len: 64,
            steps: 40,
            val_every: 10,
            val_batches: 5,
            sample_every: 20,
            sample_len: 64,
            max_grad_norm: None,
            seed: DEFAULT_SEED,
            optimizer: AdamWConfig::default(),
        }
    }
}

/// Outcome of one training step
#[derive(Clone, Copy, Debug)]
pub struct StepStats {
    pub step: usize,
    pub loss: f32,
    pub grad_norm: f32,
    pub elapsed: Duration,
}

/// Owns everything a training run mutates
pub struct Trainer<D: Differentiator = HandWrittenBackward> {
    model: GPT2,
    grads: GradientBuffers,
    optimizer: AdamW,
    differentiator: D,
    rng: Xorshift,
    config: TrainConfig,
    step: usize,
}

impl Trainer<HandWrittenBackward> {
    pub fn new(model: GPT2, config: TrainConfig) -> Self {
        Self::with_differentiator(model, config, HandWrittenBackward)
    }
}

impl<D: Differentiator> Trainer<D> {
    pub fn with_differentiator(model: GPT2, config: TrainConfig, differentiator: D) -> Self {
        let grads = GradientBuffers::new(model.config());
        Self {
            grads,
            optimizer: AdamW::new(config.optimizer),
            differentiator,
            rng: Xorshift::new(config.seed),
            config,
            model,
            step: 0,
        }
    }

    pub fn model(&self) -> &GPT2 {
        &self.model
    }

    pub fn into_model(self) -> GPT2 {
        self.model
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// One optimizer step on `batch`
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepStats> {
        let start = Instant::now();

        self.grads.zero_grad();
        let loss = self
            .differentiator
            .differentiate(&mut self.model, batch, &mut self.grads)?;
        let grad_norm = match self.config.max_grad_norm {
            Some(max_norm) => self.grads.clip(max_norm),
            None => self.grads.grad_norm(),
        };
        self.optimizer
            .update(self.model.params_mut(), &mut self.grads)?;

        let stats = StepStats {
            step: self.step,
            loss,
            grad_norm,
            elapsed: start.elapsed(),
        };
        info!(
            "step {}: train loss {:.6} (took {:.3} ms)",
            stats.step,
            loss,
            stats.elapsed.as_secs_f64() * 1000.0
        );
        self.step += 1;
        Ok(stats)
    }

    /// Mean loss over `num_batches` batches from the start of `source`
    pub fn evaluate(&mut self, source: &mut dyn BatchSource, num_batches: usize) -> Result<f32> {
        if num_batches == 0 {
            return Err(ModelError::ShapeMismatch(
                "evaluation needs at least one batch".into(),
            ));
        }
        source.reset();
        let mut total = 0.0;
        for _ in 0..num_batches {
            let batch = source.next_batch()?;
            let loss = self
                .model
                .forward(&batch.inputs, Some(&batch.targets), batch.batch_size, batch.seq_len)?
                .ok_or(ModelError::MissingTargets)?;
            total += loss;
        }
        Ok(total / num_batches as f32)
    }

    /// Sample `len - 1` tokens after an end-of-text token
    ///
    /// The whole `(B, T)` activation buffer is reused: row 0 holds the
    /// sequence, every other position is padding with `eot`. At step `t` only
    /// `probs[0, t-1, :V]` is read.
    pub fn generate(&mut self, eot: u32, len: usize) -> Result<Vec<u32>> {
        let (b, t) = (self.config.batch_size, self.config.seq_len);
        if len > t {
            return Err(ModelError::SequenceTooLong {
                seq_len: len,
                max_seq_len: t,
            });
        }
        let mut tokens = vec![eot; b * t];
        for pos in 1..len {
            self.model.forward(&tokens, None, b, t)?;
            let probs = self.model.probs(0, pos - 1).ok_or_else(|| {
                ModelError::ShapeMismatch("no probabilities after forward pass".into())
            })?;
            let coin = self.rng.next_f32();
            tokens[pos] = sample_mult(probs, coin) as u32;
        }
        Ok(tokens[1..len.max(1)].to_vec())
    }

    /// Run the configured number of steps
    ///
    /// Validation loss and samples are computed on their cadence and logged
    /// to `logger` when one is given. Returns the stats of every step.
    pub fn run(
        &mut self,
        train: &mut dyn BatchSource,
        mut val: Option<&mut dyn BatchSource>,
        mut logger: Option<&mut TrainingLogger>,
    ) -> Result<Vec<StepStats>> {
        let eot = (self.model.config().vocab_size - 1) as u32;
        let mut history = Vec::with_capacity(self.config.steps);

        for step in 0..=self.config.steps {
            let mut val_loss = None;
            if let Some(val) = val.as_deref_mut() {
                if self.config.val_every > 0 && step % self.config.val_every == 0 {
                    let loss = self.evaluate(val, self.config.val_batches)?;
                    info!("val loss {:.6}", loss);
                    val_loss = Some(loss);
                }
            }

            let mut sample = None;
            if self.config.sample_every > 0 && step > 0 && step % self.config.sample_every == 0 {
                let tokens = self.generate(eot, self.config.sample_len)?;
                let text = tokens
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                info!("generated: {}", text);
                sample = Some(text);
            }

            if step == self.config.steps {
                break;
            }

            let batch = train.next_batch()?;
            let stats = self.train_step(&batch)?;
            if let Some(logger) = logger.as_deref_mut() {
                logger.log(
                    stats.step,
                    self.config.optimizer.learning_rate,
                    stats.loss,
                    val_loss,
                    stats.grad_norm,
                    sample.as_deref(),
                )?;
            }
            history.push(stats);
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_batcher_shifts_targets_and_wraps() {
        let tokens: Vec<u32> = (0..10).collect();
        let mut batcher = TokenBatcher::new(tokens, 2, 2).unwrap();

        let first = batcher.next_batch().unwrap();
        assert_eq!(first.inputs, vec![0, 1, 2, 3]);
        assert_eq!(first.targets, vec![1, 2, 3, 4]);

        let second = batcher.next_batch().unwrap();
        assert_eq!(second.inputs, vec![4, 5, 6, 7]);
        assert_eq!(second.targets, vec![5, 6, 7, 8]);

        // Only 2 tokens left: wrap to the start
        let third = batcher.next_batch().unwrap();
        assert_eq!(third.inputs, first.inputs);

        batcher.next_batch().unwrap();
        batcher.reset();
        assert_eq!(batcher.next_batch().unwrap(), first);
        assert_eq!(batcher.num_batches(), 2);
    }

    #[test]
    fn test_batcher_needs_one_full_window() {
        assert!(TokenBatcher::new(vec![0; 4], 2, 2).is_err());
        assert!(TokenBatcher::new(vec![0; 5], 2, 2).is_ok());
    }

    #[test]
    fn test_parse_tokens() {
        assert_eq!(parse_tokens("1 2\n3\t4 ").unwrap(), vec![1, 2, 3, 4]);
        assert!(matches!(parse_tokens("1 x 3"), Err(ModelError::Io(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"0 1 2 3 4 5").unwrap();
        let batcher = TokenBatcher::from_file(file.path(), 1, 4).unwrap();
        assert_eq!(batcher.tokens(), &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_train_val_split() {
        let tokens: Vec<u32> = (0..10).collect();
        let (train, val) = train_val_split(&tokens, 0.1);
        assert_eq!(train.len(), 9);
        assert_eq!(val, &[9]);
    }

    fn tiny_trainer(steps: usize) -> Trainer {
        let model = GPT2::random(Config::tiny(), 1).unwrap();
        Trainer::new(
            model,
            TrainConfig {
                batch_size: 2,
                seq_len: 4,
                steps,
                val_every: 2,
                val_batches: 2,
                sample_every: 2,
                sample_len: 4,
                optimizer: AdamWConfig {
                    learning_rate: 1e-2,
                    ..AdamWConfig::default()
                },
                ..TrainConfig::default()
            },
        )
    }

    #[test]
    fn test_train_step_advances_optimizer() {
        let mut trainer = tiny_trainer(1);
        let batch = Batch::new(
            vec![1, 2, 3, 4, 5, 6, 7, 8],
            vec![2, 3, 4, 5, 6, 7, 8, 9],
            2,
            4,
        )
        .unwrap();
        let stats = trainer.train_step(&batch).unwrap();
        assert_eq!(stats.step, 0);
        assert!(stats.loss.is_finite());
        assert!(stats.grad_norm > 0.0);
        assert_eq!(trainer.optimizer().step(), 1);
    }

    #[test]
    fn test_generate_is_seeded_and_in_vocab() {
        let mut a = tiny_trainer(0);
        let mut b = tiny_trainer(0);
        let sa = a.generate(15, 4).unwrap();
        let sb = b.generate(15, 4).unwrap();
        assert_eq!(sa.len(), 3);
        assert_eq!(sa, sb);
        assert!(sa.iter().all(|&t| t < 16));
        assert!(matches!(a.generate(15, 5), Err(ModelError::SequenceTooLong { .. })));
    }

    #[test]
    fn test_run_logs_every_step() {
        let tokens: Vec<u32> = (0..64).map(|i| (i * 7 % 16) as u32).collect();
        let mut train = TokenBatcher::new(tokens.clone(), 2, 4).unwrap();
        let mut val = TokenBatcher::new(tokens, 2, 4).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut logger = TrainingLogger::new(dir.path().join("log.csv")).unwrap();

        let mut trainer = tiny_trainer(4);
        let history = trainer
            .run(&mut train, Some(&mut val), Some(&mut logger))
            .unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(trainer.optimizer().step(), 4);

        let csv = std::fs::read_to_string(dir.path().join("log.csv")).unwrap();
        assert_eq!(csv.lines().count(), 5);
    }
}
