//! Training Logger
//!
//! Records per-step metrics to a CSV file and mirrors a one-line summary of
//! every step through the `log` facade. Alongside the CSV, a JSON snapshot of
//! the model and run configuration makes each log self-describing.
//!
//! ## CSV Format
//!
//! - `step`: Training step number
//! - `elapsed_seconds`: Time since the logger was created
//! - `learning_rate`: Current learning rate
//! - `train_loss`: Training loss (mean cross-entropy)
//! - `val_loss`: Validation loss, empty on steps without evaluation
//! - `grad_norm`: Global L2 norm of the gradient before clipping
//! - `train_perplexity`: exp(train_loss)
//! - `val_perplexity`: exp(val_loss), empty with `val_loss`
//! - `sample`: Generated token ids, quoted
//!
//! ## Perplexity
//!
//! ```text
//! perplexity = exp(loss)
//! ```
//!
//! A perfect model scores 1.0; uniform guessing over a vocabulary of V tokens
//! scores V.

use crate::config::Config;
use crate::error::Result;
use crate::train::TrainConfig;
use log::info;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// CSV metrics logger
pub struct TrainingLogger {
    log_file: File,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingLogger {
    /// Create the CSV file and write its header
    pub fn new(log_path: impl AsRef<Path>) -> Result<Self> {
        let mut log_file = File::create(log_path)?;
        writeln!(
            log_file,
            "step,elapsed_seconds,learning_rate,train_loss,val_loss,grad_norm,train_perplexity,val_perplexity,sample"
        )?;

        let now = Instant::now();
        Ok(Self {
            log_file,
            start_time: now,
            last_log_time: now,
        })
    }

    /// Append one row and flush it
    pub fn log(
        &mut self,
        step: usize,
        learning_rate: f32,
        train_loss: f32,
        val_loss: Option<f32>,
        grad_norm: f32,
        sample: Option<&str>,
    ) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let train_perplexity = train_loss.exp();
        let (val_loss_field, val_perplexity_field) = match val_loss {
            Some(loss) => (format!("{:.4}", loss), format!("{:.2}", loss.exp())),
            None => (String::new(), String::new()),
        };
        let sample_escaped = sample.map(|s| s.replace('"', "\"\"")).unwrap_or_default();

        writeln!(
            self.log_file,
            "{},{:.2},{:.6},{:.4},{},{:.4},{:.2},{},\"{}\"",
            step,
            elapsed,
            learning_rate,
            train_loss,
            val_loss_field,
            grad_norm,
            train_perplexity,
            val_perplexity_field,
            sample_escaped
        )?;
        self.log_file.flush()?;

        let step_time = self.last_log_time.elapsed().as_secs_f32();
        info!(
            "step {:4} | time {:7.1}s (+{:.1}s) | lr {:.6} | train {:.4} | grad norm {:.4} | perplexity {:.2}",
            step, elapsed, step_time, learning_rate, train_loss, grad_norm, train_perplexity
        );
        self.last_log_time = Instant::now();
        Ok(())
    }
}

#[derive(Serialize)]
struct RunSnapshot<'a> {
    model: &'a Config,
    training: &'a TrainConfig,
}

/// Write the model and run configuration as pretty-printed JSON
pub fn write_config(path: impl AsRef<Path>, model: &Config, training: &TrainConfig) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, &RunSnapshot { model, training })
        .map_err(io::Error::from)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut logger = TrainingLogger::new(&path).unwrap();
        logger.log(0, 1e-4, 2.0, Some(2.5), 1.25, None).unwrap();
        logger.log(1, 1e-4, 1.5, None, 0.5, Some("3 \"7\"")).unwrap();

        let csv = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("step,elapsed_seconds,"));

        let first: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(first[0], "0");
        assert_eq!(first[3], "2.0000");
        assert_eq!(first[4], "2.5000");
        assert_eq!(first[5], "1.2500");
        assert_eq!(first[6], "7.39");

        let second: Vec<&str> = lines[2].split(',').collect();
        assert_eq!(second[4], "");
        assert_eq!(second[7], "");
        assert_eq!(second[8], "\"3 \"\"7\"\"\"");
    }

    #[test]
    fn test_write_config_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, &Config::tiny(), &TrainConfig::default()).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["model"]["vocab_size"], 16);
        assert_eq!(json["training"]["steps"], 40);
    }
}
