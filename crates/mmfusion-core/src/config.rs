//! Pipeline configuration.
//!
//! [`PipelineConfig`] is passed explicitly to the dataset loader, trainer and
//! pipelines. It is usually loaded from YAML with [`load_config`]; every field
//! except `mapping_path` has a default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{FusionError, Result, NUM_CLASSES};

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// CSV mapping table with `image_path`, `audio_path`, `label` columns.
    pub mapping_path: PathBuf,
    /// Where the trained fusion artifact is written.
    #[serde(default = "default_model_output_path")]
    pub model_output_path: PathBuf,
    /// Pretrained models the pipeline starts from.
    #[serde(default)]
    pub base_model_paths: BaseModelPaths,
    /// How the audio column is turned into a spectrogram tensor.
    #[serde(default)]
    pub audio_policy: AudioPolicy,
    /// Path substitution used by [`AudioPolicy::Precomputed`].
    #[serde(default)]
    pub spectrogram: SpectrogramPaths,
    /// Optimizer, schedule and split settings.
    #[serde(default)]
    pub training: TrainingConfig,
}

impl PipelineConfig {
    /// Config with defaults for everything but the mapping table.
    pub fn new(mapping_path: impl Into<PathBuf>) -> Self {
        Self {
            mapping_path: mapping_path.into(),
            model_output_path: default_model_output_path(),
            base_model_paths: BaseModelPaths::default(),
            audio_policy: AudioPolicy::default(),
            spectrogram: SpectrogramPaths::default(),
            training: TrainingConfig::default(),
        }
    }

    /// Reject settings no run could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.spectrogram.audio_dir_token.is_empty() {
            return Err(FusionError::Config(
                "spectrogram.audio_dir_token must not be empty".to_string(),
            ));
        }
        self.training.validate()
    }
}

/// Pretrained model artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseModelPaths {
    /// Single-modality image classifier (fresh training).
    #[serde(default)]
    pub image: Option<PathBuf>,
    /// Single-modality audio classifier (fresh training).
    #[serde(default)]
    pub audio: Option<PathBuf>,
    /// Existing fused model (retraining).
    #[serde(default)]
    pub fusion: Option<PathBuf>,
}

impl BaseModelPaths {
    pub fn require_image(&self) -> Result<&Path> {
        require(self.image.as_deref(), "base_model_paths.image")
    }

    pub fn require_audio(&self) -> Result<&Path> {
        require(self.audio.as_deref(), "base_model_paths.audio")
    }

    pub fn require_fusion(&self) -> Result<&Path> {
        require(self.fusion.as_deref(), "base_model_paths.fusion")
    }
}

fn require<'a>(path: Option<&'a Path>, field: &str) -> Result<&'a Path> {
    path.ok_or_else(|| FusionError::Config(format!("{field} is required for this command")))
}

/// Source of the audio branch's input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioPolicy {
    /// Load a spectrogram image cached next to the audio file.
    #[default]
    Precomputed,
    /// Decode the WAV and compute a mel spectrogram.
    OnTheFly,
}

/// Path substitution from an audio file to its cached spectrogram image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrogramPaths {
    #[serde(default = "default_audio_dir_token")]
    pub audio_dir_token: String,
    #[serde(default = "default_spectrogram_dir_token")]
    pub spectrogram_dir_token: String,
    #[serde(default = "default_audio_extension")]
    pub audio_extension: String,
    #[serde(default = "default_spectrogram_extension")]
    pub spectrogram_extension: String,
}

impl Default for SpectrogramPaths {
    fn default() -> Self {
        Self {
            audio_dir_token: default_audio_dir_token(),
            spectrogram_dir_token: default_spectrogram_dir_token(),
            audio_extension: default_audio_extension(),
            spectrogram_extension: default_spectrogram_extension(),
        }
    }
}

impl SpectrogramPaths {
    /// Derive the spectrogram path for `audio_path`.
    ///
    /// Every occurrence of both tokens is replaced, so `cleaned/a.wav`
    /// becomes `spectrograms/a.png`.
    pub fn derive(&self, audio_path: &str) -> PathBuf {
        let swapped = audio_path.replace(&self.audio_dir_token, &self.spectrogram_dir_token);
        PathBuf::from(swapped.replace(&self.audio_extension, &self.spectrogram_extension))
    }
}

/// Optimizer, schedule and split settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Fraction of samples held out for validation.
    #[serde(default = "default_val_ratio")]
    pub val_ratio: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Loss weight per class index.
    #[serde(default = "default_class_weights")]
    pub class_weights: Vec<f64>,
    /// Epochs without validation improvement before stopping.
    #[serde(default = "default_early_stopping_patience")]
    pub early_stopping_patience: usize,
    /// Epochs without validation improvement before the learning rate drops.
    #[serde(default = "default_lr_patience")]
    pub lr_patience: usize,
    #[serde(default = "default_lr_factor")]
    pub lr_factor: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            val_ratio: default_val_ratio(),
            seed: default_seed(),
            class_weights: default_class_weights(),
            early_stopping_patience: default_early_stopping_patience(),
            lr_patience: default_lr_patience(),
            lr_factor: default_lr_factor(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(FusionError::Config("training.batch_size must be > 0".into()));
        }
        if !(self.val_ratio > 0.0 && self.val_ratio < 1.0) {
            return Err(FusionError::Config(format!(
                "training.val_ratio must be in (0, 1), got {}",
                self.val_ratio
            )));
        }
        if self.class_weights.len() != NUM_CLASSES {
            return Err(FusionError::Config(format!(
                "training.class_weights must have {NUM_CLASSES} entries, got {}",
                self.class_weights.len()
            )));
        }
        if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            return Err(FusionError::Config(format!(
                "training.lr_factor must be in (0, 1), got {}",
                self.lr_factor
            )));
        }
        Ok(())
    }
}

fn default_model_output_path() -> PathBuf {
    PathBuf::from("models/fusion.safetensors")
}

fn default_audio_dir_token() -> String {
    "cleaned".to_string()
}

fn default_spectrogram_dir_token() -> String {
    "spectrograms".to_string()
}

fn default_audio_extension() -> String {
    ".wav".to_string()
}

fn default_spectrogram_extension() -> String {
    ".png".to_string()
}

fn default_epochs() -> usize {
    10
}

fn default_batch_size() -> usize {
    16
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_val_ratio() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

fn default_class_weights() -> Vec<f64> {
    vec![1.0, 1.0, 2.0]
}

fn default_early_stopping_patience() -> usize {
    5
}

fn default_lr_patience() -> usize {
    3
}

fn default_lr_factor() -> f64 {
    0.5
}

/// Load a [`PipelineConfig`] from a YAML file at `path`.
///
/// # Errors
///
/// Returns [`FusionError::Config`] if the file cannot be read, the YAML is
/// invalid, or the values fail validation.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        FusionError::Config(format!("Failed to read config file {}: {e}", path.display()))
    })?;
    let config: PipelineConfig = serde_yaml::from_str(&contents)
        .map_err(|e| FusionError::Config(format!("Failed to parse config YAML: {e}")))?;
    config.validate()?;
    Ok(config)
}
