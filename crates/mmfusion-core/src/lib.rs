//! Core types for mmfusion
//!
//! Shared by every crate in the workspace: the error enum and `Result` alias,
//! pipeline-wide constants, the mapping-table record and the pipeline
//! configuration object.

use serde::{Deserialize, Serialize};

pub mod config;

pub use config::{
    load_config, AudioPolicy, BaseModelPaths, PipelineConfig, SpectrogramPaths, TrainingConfig,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Side length of the square single-channel input both branches consume.
pub const INPUT_SIZE: usize = 64;

/// Channel count of every model input.
pub const INPUT_CHANNELS: usize = 1;

/// Number of output classes. Fixed across training and retraining.
pub const NUM_CLASSES: usize = 3;

/// Sample rate raw audio is resampled to before the mel transform.
pub const SAMPLE_RATE_HZ: u32 = 22_050;

/// Number of mel bands in an on-the-fly spectrogram.
pub const MEL_BANDS: usize = 128;

// ---------------------------------------------------------------------------
// Input shape
// ---------------------------------------------------------------------------

/// Height × width × channels of a single model input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl InputShape {
    /// The `(64, 64, 1)` shape shared by the image and audio branches.
    pub const fn modality() -> Self {
        Self {
            height: INPUT_SIZE,
            width: INPUT_SIZE,
            channels: INPUT_CHANNELS,
        }
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.height, self.width, self.channels)
    }
}

impl std::fmt::Display for InputShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.height, self.width, self.channels)
    }
}

// ---------------------------------------------------------------------------
// Mapping records
// ---------------------------------------------------------------------------

/// One row of the mapping table pairing an image and an audio file with a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    /// Path to the grayscale-convertible image file.
    pub image_path: String,
    /// Path to the source audio file (`.wav`).
    pub audio_path: String,
    /// Ground-truth class index.
    pub label: i64,
}

impl MappingRecord {
    /// Check the label against the fixed class domain.
    ///
    /// `row` is the zero-based data row, used only for the error message.
    pub fn validated_label(&self, row: usize) -> Result<u32> {
        if (0..NUM_CLASSES as i64).contains(&self.label) {
            Ok(self.label as u32)
        } else {
            Err(FusionError::InvalidLabel {
                row,
                label: self.label,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that abort a pipeline run.
///
/// Missing modality inputs are not errors: the preprocessor reports them as
/// absent and the loader drops the record.
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    /// Tensor backend failure.
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Filesystem failure outside of per-record preprocessing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error, used for artifact metadata.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The mapping table is missing or malformed.
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// A mapping row carries a label outside the class domain.
    #[error("Invalid label {label} in mapping row {row} (expected 0..{})", NUM_CLASSES)]
    InvalidLabel {
        /// Zero-based data row.
        row: usize,
        /// The offending label.
        label: i64,
    },

    /// Model construction or inference failure.
    #[error("Model error: {0}")]
    Model(String),

    /// Input or layer shapes do not line up.
    #[error("Shape error: {0}")]
    Shape(String),

    /// A model artifact could not be read or written.
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Training cannot proceed.
    #[error("Training error: {0}")]
    Training(String),
}

/// Convenience alias for `std::result::Result<T, FusionError>`.
pub type Result<T> = std::result::Result<T, FusionError>;
