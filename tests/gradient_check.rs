//! Central finite differences against the hand-written backward pass

use flatgpt::{
    Batch, Config, Differentiator, GradientBuffers, HandWrittenBackward, ParamTensor, GPT2,
};

const H: f32 = 1e-3;

fn batch() -> Batch {
    Batch::new(
        vec![3, 1, 4, 1, 5, 9, 2, 6],
        vec![1, 4, 1, 5, 9, 2, 6, 5],
        2,
        4,
    )
    .unwrap()
}

fn loss_at(model: &mut GPT2, batch: &Batch, index: usize, value: f32) -> f32 {
    let saved = model.params().as_slice()[index];
    model.params_mut().as_mut_slice()[index] = value;
    let loss = model
        .forward(&batch.inputs, Some(&batch.targets), batch.batch_size, batch.seq_len)
        .unwrap()
        .unwrap();
    model.params_mut().as_mut_slice()[index] = saved;
    loss
}

/// Indices (into the whole parameter buffer) of the `k` largest gradients of
/// one tensor
fn largest(grads: &GradientBuffers, model: &GPT2, tensor: ParamTensor, k: usize) -> Vec<usize> {
    let offset = model.params().offset(tensor);
    let mut idx: Vec<usize> = (0..grads.tensor(tensor).len()).collect();
    let g = grads.tensor(tensor);
    idx.sort_by(|&a, &b| g[b].abs().total_cmp(&g[a].abs()));
    idx.truncate(k);
    idx.into_iter().map(|i| offset + i).collect()
}

#[test]
fn test_backward_matches_finite_differences() {
    let mut model = GPT2::random(Config::tiny(), 1234).unwrap();
    let mut grads = GradientBuffers::new(model.config());
    let batch = batch();
    HandWrittenBackward
        .differentiate(&mut model, &batch, &mut grads)
        .unwrap();
    let analytic = grads.params().as_slice().to_vec();

    let tensors = [
        ParamTensor::Wte,
        ParamTensor::Wpe,
        ParamTensor::Ln1w,
        ParamTensor::Qkvw,
        ParamTensor::Attprojw,
        ParamTensor::Ln2b,
        ParamTensor::Fcw,
        ParamTensor::Fcprojb,
        ParamTensor::Lnfw,
        ParamTensor::Lnfb,
    ];
    for tensor in tensors {
        for i in largest(&grads, &model, tensor, 3) {
            let p = model.params().as_slice()[i];
            let plus = loss_at(&mut model, &batch, i, p + H);
            let minus = loss_at(&mut model, &batch, i, p - H);
            let numeric = (plus - minus) / (2.0 * H);
            let g = analytic[i];
            assert!(
                (numeric - g).abs() <= 1e-3 + 5e-2 * g.abs(),
                "{:?}[{}]: analytic {} numeric {}",
                tensor,
                i,
                g,
                numeric
            );
        }
    }
}

#[test]
fn test_untouched_vocabulary_rows_get_only_logit_gradient() {
    // Token 15 never appears as an input; its wte row is reached only
    // through the tied output projection.
    let mut model = GPT2::random(Config::tiny(), 5).unwrap();
    let mut grads = GradientBuffers::new(model.config());
    HandWrittenBackward
        .differentiate(&mut model, &batch(), &mut grads)
        .unwrap();

    let c = model.config().channels;
    let dwte = grads.tensor(ParamTensor::Wte);
    assert!(dwte[15 * c..16 * c].iter().any(|&g| g != 0.0));
    assert!(dwte[15 * c..16 * c].iter().all(|g| g.is_finite()));
}
