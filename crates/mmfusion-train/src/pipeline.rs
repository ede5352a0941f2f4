//! End-to-end pipelines behind the `train-fusion` subcommands.

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use mmfusion_core::{FusionError, PipelineConfig, Result};
use mmfusion_data::{load_data, Preprocessor};
use mmfusion_model::{
    build_fusion_model, load_fusion, retrain_head, Classifier, ClassifierArchitecture, FeatureExtractor,
};
use std::path::Path;

use crate::trainer::{train, TrainOutcome};

/// Fresh fusion training: two pretrained classifiers → fused model.
pub fn run_training(config: &PipelineConfig, device: &Device) -> Result<TrainOutcome> {
    let dataset = load_data(config, device)?;

    let image = Classifier::load(config.base_model_paths.require_image()?, device)?;
    let audio = Classifier::load(config.base_model_paths.require_audio()?, device)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = build_fusion_model(
        FeatureExtractor::from_classifier(&image, device)?,
        FeatureExtractor::from_classifier(&audio, device)?,
        vb,
    )?;

    let outcome = train(model, &varmap, &dataset, &config.training)?;
    outcome.save(&config.model_output_path)?;
    Ok(outcome)
}

/// Retraining: freeze an existing fused model and fit a fresh head on the
/// new mapping table.
pub fn run_retraining(config: &PipelineConfig, device: &Device) -> Result<TrainOutcome> {
    let dataset = load_data(config, device)?;
    let loaded = load_fusion(config.base_model_paths.require_fusion()?, device)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = loaded.model.regraft(&retrain_head(), vb)?;

    let outcome = train(model, &varmap, &dataset, &config.training)?;
    outcome.save(&config.model_output_path)?;
    Ok(outcome)
}

/// Class probabilities for one image/audio pair, preprocessed under the
/// configured audio policy.
pub fn predict(
    model_path: &Path,
    image_path: &Path,
    audio_path: &str,
    config: &PipelineConfig,
    device: &Device,
) -> Result<Vec<f32>> {
    let loaded = load_fusion(model_path, device)?;
    let preprocessor = Preprocessor::new(config.audio_policy, config.spectrogram.clone(), device);

    let image = preprocessor
        .preprocess_image(image_path)
        .ok_or_else(|| FusionError::Model(format!("Could not preprocess image {}", image_path.display())))?;
    let audio = preprocessor
        .preprocess_audio(audio_path)
        .ok_or_else(|| FusionError::Model(format!("Could not preprocess audio {audio_path}")))?;

    let probs = loaded.model.predict(&image, &audio)?;
    Ok(probs.squeeze(0)?.to_vec1::<f32>()?)
}

/// Write a randomly initialized single-modality classifier with the default
/// CNN layout.
pub fn init_classifier(name: &str, output: &Path, device: &Device) -> Result<Classifier> {
    let classifier = Classifier::new_random(ClassifierArchitecture::default_cnn(name), device)?;
    classifier.save(output)?;
    tracing::info!(name, path = %output.display(), "Classifier initialized");
    Ok(classifier)
}
