//! Class-weighted cross-entropy.

use candle_core::{DType, Device, Tensor, D};
use mmfusion_core::{FusionError, Result, NUM_CLASSES};

/// `[classes]` f32 tensor of per-class loss weights.
pub fn class_weight_tensor(weights: &[f64], device: &Device) -> Result<Tensor> {
    if weights.len() != NUM_CLASSES {
        return Err(FusionError::Config(format!(
            "expected {NUM_CLASSES} class weights, got {}",
            weights.len()
        )));
    }
    let weights: Vec<f32> = weights.iter().map(|&w| w as f32).collect();
    Ok(Tensor::from_vec(weights, NUM_CLASSES, device)?)
}

/// Mean over the batch of `weight[label] * -log_softmax(logits)[label]`.
///
/// `logits` is `[B, classes]`, `labels` is `[B]` u32.
pub fn weighted_cross_entropy(logits: &Tensor, labels: &Tensor, weights: &Tensor) -> Result<Tensor> {
    let nll = per_sample_nll(logits, labels)?;
    let w = weights.index_select(labels, 0)?;
    Ok((nll * w)?.mean_all()?)
}

fn per_sample_nll(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let picked = log_probs.gather(&labels.unsqueeze(1)?, 1)?.squeeze(1)?;
    Ok(picked.neg()?)
}
