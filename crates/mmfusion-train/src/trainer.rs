//! Training loop for the fusion head with early stopping and plateau decay.

use candle_core::{Tensor, D};
use candle_nn::{Optimizer, VarMap};
use mmfusion_core::{FusionError, Result, TrainingConfig, NUM_CLASSES};
use mmfusion_data::{train_val_split, BatchIterator, FusionDataset};
use mmfusion_model::device::device_name;
use mmfusion_model::{save_fusion, Adam, FusionModel, ParamsAdam};
use std::collections::HashMap;
use std::path::Path;

use crate::loss::{class_weight_tensor, weighted_cross_entropy};
use crate::metrics::{compute_validation_metrics, ValidationMetrics};

/// Minimum validation-loss decrease that resets the plateau counter.
pub const LR_MIN_DELTA: f64 = 1e-4;

/// Per-epoch metrics logged during training.
#[derive(Debug, Clone)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
    pub improved: bool,
    pub val_metrics: ValidationMetrics,
}

/// Stop once the monitored loss has not improved for `patience` epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f64,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// Record an epoch's loss. Returns `true` on a new best.
    pub fn update(&mut self, loss: f64) -> bool {
        if loss < self.best {
            self.best = loss;
            self.wait = 0;
            true
        } else {
            self.wait += 1;
            false
        }
    }

    pub fn should_stop(&self) -> bool {
        self.wait >= self.patience
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

/// Multiply the learning rate by `factor` after `patience` epochs without an
/// improvement larger than `min_delta`.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    patience: usize,
    factor: f64,
    min_delta: f64,
    min_lr: f64,
    best: f64,
    wait: usize,
}

impl PlateauScheduler {
    pub fn new(patience: usize, factor: f64, min_delta: f64) -> Self {
        Self {
            patience,
            factor,
            min_delta,
            min_lr: 0.0,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// Record an epoch's loss. Returns the reduced learning rate when one is due.
    pub fn step(&mut self, loss: f64, lr: f64) -> Option<f64> {
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.wait = 0;
            return None;
        }
        self.wait += 1;
        if self.wait < self.patience {
            return None;
        }
        self.wait = 0;
        let next = (lr * self.factor).max(self.min_lr);
        (next < lr).then_some(next)
    }
}

/// Result of a training run.
#[derive(Debug)]
pub struct TrainOutcome {
    /// Model carrying the best-seen head parameters.
    pub model: FusionModel,
    pub optimizer: Adam,
    pub history: Vec<EpochMetrics>,
    pub best_val_loss: f64,
    pub stopped_early: bool,
    pub train_size: usize,
    pub val_size: usize,
}

impl TrainOutcome {
    /// Persist model and optimizer state to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        save_fusion(&self.model, Some(&self.optimizer), path)
    }
}

/// Fit the trainable head of `model`.
///
/// `varmap` must hold exactly the head variables `model` was built with; it is
/// what the optimizer updates and what the best snapshot is restored into.
pub fn train(model: FusionModel, varmap: &VarMap, dataset: &FusionDataset, config: &TrainingConfig) -> Result<TrainOutcome> {
    config.validate()?;
    let device = dataset.labels.device().clone();
    let split = train_val_split(dataset, config.val_ratio, config.seed)?;

    let mut optimizer = Adam::from_varmap(
        varmap,
        ParamsAdam {
            lr: config.learning_rate,
            ..Default::default()
        },
    )?;
    if optimizer.var_names().is_empty() {
        return Err(FusionError::Training("model has no trainable parameters".to_string()));
    }

    let weights = class_weight_tensor(&config.class_weights, &device)?;
    let mut stopper = EarlyStopping::new(config.early_stopping_patience);
    let mut scheduler = PlateauScheduler::new(config.lr_patience, config.lr_factor, LR_MIN_DELTA);
    let mut best_params = snapshot(varmap)?;
    let mut history: Vec<EpochMetrics> = Vec::new();
    let mut stopped_early = false;

    let mut batch_iter = BatchIterator::new(split.train.clone(), config.batch_size);

    tracing::info!(
        train = split.train.len(),
        val = split.val.len(),
        lr = config.learning_rate,
        batch_size = config.batch_size,
        epochs = config.epochs,
        device = device_name(&device),
        trainable = ?optimizer.var_names(),
        "Training fusion head"
    );

    for epoch in 0..config.epochs {
        batch_iter.reshuffle(config.seed, epoch);
        let lr = optimizer.learning_rate();

        let mut epoch_loss = 0.0;
        let mut batch_count = 0usize;
        while let Some(batch) = batch_iter.next_batch()? {
            let logits = model.forward_logits_t(&batch.images, &batch.audio, true)?;
            let loss = weighted_cross_entropy(&logits, &batch.labels, &weights)?;
            optimizer.backward_step(&loss)?;

            let loss_val = loss.to_scalar::<f32>()? as f64;
            tracing::debug!(epoch = epoch + 1, batch = batch_count, loss = loss_val, "Batch done");
            epoch_loss += loss_val;
            batch_count += 1;
        }
        let train_loss = if batch_count > 0 {
            epoch_loss / batch_count as f64
        } else {
            0.0
        };

        let (val_loss, val_metrics) = validate(&model, &split.val, config.batch_size)?;

        let improved = stopper.update(val_loss);
        if improved {
            best_params = snapshot(varmap)?;
        }
        if let Some(next_lr) = scheduler.step(val_loss, lr) {
            optimizer.set_learning_rate(next_lr);
            tracing::info!(epoch = epoch + 1, from = lr, to = next_lr, "Reducing learning rate");
        }

        tracing::info!(
            epoch = epoch + 1,
            train_loss = format_args!("{train_loss:.4}"),
            val_loss = format_args!("{val_loss:.4}"),
            val_acc = format_args!("{:.4}", val_metrics.accuracy),
            lr,
            marker = if improved { "*" } else { "" },
            "Epoch complete"
        );

        history.push(EpochMetrics {
            epoch: epoch + 1,
            train_loss,
            val_loss,
            learning_rate: lr,
            improved,
            val_metrics,
        });

        if stopper.should_stop() {
            tracing::info!(
                epoch = epoch + 1,
                patience = config.early_stopping_patience,
                "Early stopping"
            );
            stopped_early = true;
            break;
        }
    }

    restore(varmap, &best_params)?;
    tracing::info!(best_val_loss = stopper.best(), "Restored best head parameters");

    Ok(TrainOutcome {
        model,
        optimizer,
        history,
        best_val_loss: stopper.best(),
        stopped_early,
        train_size: split.train.len(),
        val_size: split.val.len(),
    })
}

/// Unweighted mean cross-entropy and metrics over `val`, in inference mode.
fn validate(model: &FusionModel, val: &FusionDataset, batch_size: usize) -> Result<(f64, ValidationMetrics)> {
    let mut iter = BatchIterator::new(val.clone(), batch_size);
    let mut loss_sum = 0.0;
    let mut seen = 0usize;
    let mut preds: Vec<u32> = Vec::with_capacity(val.len());
    let mut labels: Vec<u32> = Vec::with_capacity(val.len());

    while let Some(batch) = iter.next_batch()? {
        let n = batch.labels.dim(0)?;
        let logits = model.forward_logits_t(&batch.images, &batch.audio, false)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
        loss_sum += loss.to_scalar::<f32>()? as f64 * n as f64;
        seen += n;
        preds.extend(logits.argmax(D::Minus1)?.to_vec1::<u32>()?);
        labels.extend(batch.labels.to_vec1::<u32>()?);
    }

    let val_loss = if seen > 0 { loss_sum / seen as f64 } else { 0.0 };
    Ok((val_loss, compute_validation_metrics(&preds, &labels, NUM_CLASSES)))
}

fn snapshot(varmap: &VarMap) -> Result<HashMap<String, Tensor>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| FusionError::Training(format!("VarMap lock poisoned: {e}")))?;
    data.iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
        .collect()
}

fn restore(varmap: &VarMap, params: &HashMap<String, Tensor>) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| FusionError::Training(format!("VarMap lock poisoned: {e}")))?;
    for (name, var) in data.iter() {
        if let Some(saved) = params.get(name) {
            var.set(saved)?;
        }
    }
    Ok(())
}
