//! Fusion training for mmfusion
//!
//! Fits the trainable head of a [`mmfusion_model::FusionModel`] on a
//! [`mmfusion_data::FusionDataset`] and wires the full train, retrain and
//! predict pipelines used by the `train-fusion` binary.

pub mod loss;
pub mod metrics;
pub mod pipeline;
pub mod trainer;

pub use metrics::{compute_validation_metrics, ValidationMetrics};
pub use pipeline::{init_classifier, predict, run_retraining, run_training};
pub use trainer::{train, EarlyStopping, EpochMetrics, PlateauScheduler, TrainOutcome};
