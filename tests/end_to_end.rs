//! Forward, backward and update on the tiny model, end to end

use flatgpt::{checkpoint, Batch, Config, TrainConfig, Trainer, GPT2};

fn batch() -> Batch {
    Batch::new(
        vec![0, 5, 3, 7, 2, 2, 9, 11],
        vec![5, 3, 7, 2, 2, 9, 11, 15],
        2,
        4,
    )
    .unwrap()
}

fn trainer(seed: u64) -> Trainer {
    Trainer::new(
        GPT2::random(Config::tiny(), seed).unwrap(),
        TrainConfig {
            batch_size: 2,
            seq_len: 4,
            ..TrainConfig::default()
        },
    )
}

#[test]
fn test_training_is_deterministic() {
    let batch = batch();
    let mut a = trainer(99);
    let mut b = trainer(99);
    for _ in 0..3 {
        let sa = a.train_step(&batch).unwrap();
        let sb = b.train_step(&batch).unwrap();
        assert_eq!(sa.loss.to_bits(), sb.loss.to_bits());
        assert_eq!(sa.grad_norm.to_bits(), sb.grad_norm.to_bits());
    }
    assert_eq!(a.model().params().as_slice(), b.model().params().as_slice());
}

#[test]
fn test_initial_loss_near_uniform() {
    let mut model = GPT2::random(Config::tiny(), 3).unwrap();
    let batch = batch();
    let loss = model
        .forward(&batch.inputs, Some(&batch.targets), 2, 4)
        .unwrap()
        .unwrap();
    // Small random weights give nearly uniform predictions over 16 tokens
    assert!((loss - 16f32.ln()).abs() < 0.1, "loss {}", loss);
}

#[test]
fn test_checkpoint_reload_reproduces_loss() {
    let batch = batch();
    let mut trainer = trainer(7);
    trainer.train_step(&batch).unwrap();
    let mut model = trainer.into_model();
    let loss = model
        .forward(&batch.inputs, Some(&batch.targets), 2, 4)
        .unwrap()
        .unwrap();

    let file = tempfile::NamedTempFile::new().unwrap();
    checkpoint::save(file.path(), model.config(), model.params()).unwrap();
    let mut reloaded = GPT2::from_checkpoint(file.path()).unwrap();
    let reloaded_loss = reloaded
        .forward(&batch.inputs, Some(&batch.targets), 2, 4)
        .unwrap()
        .unwrap();
    assert_eq!(loss.to_bits(), reloaded_loss.to_bits());
}
