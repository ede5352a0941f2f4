//! Fusion model behaviour across build, optimization, persistence and regrafting.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use mmfusion_model::{
    build_fusion_model, load_fusion, retrain_head, save_fusion, Adam, Classifier, ClassifierArchitecture,
    FeatureExtractor, FusionModel, ParamsAdam,
};
use std::collections::HashMap;
use tempfile::TempDir;

fn extractors(device: &Device) -> (FeatureExtractor, FeatureExtractor) {
    let image = Classifier::new_random(ClassifierArchitecture::default_cnn("image"), device).unwrap();
    let audio = Classifier::new_random(ClassifierArchitecture::default_cnn("audio"), device).unwrap();
    (
        FeatureExtractor::from_classifier(&image, device).unwrap(),
        FeatureExtractor::from_classifier(&audio, device).unwrap(),
    )
}

fn values(tensors: Vec<(String, Tensor)>) -> HashMap<String, Vec<f32>> {
    tensors
        .into_iter()
        .map(|(name, t)| (name, t.flatten_all().unwrap().to_vec1().unwrap()))
        .collect()
}

fn batch(device: &Device, n: usize) -> (Tensor, Tensor, Tensor) {
    let images = Tensor::rand(0f32, 1f32, (n, 64, 64, 1), device).unwrap();
    let audio = Tensor::rand(0f32, 1f32, (n, 64, 64, 1), device).unwrap();
    let labels = Tensor::from_vec((0..n as u32).map(|i| i % 3).collect::<Vec<_>>(), n, device).unwrap();
    (images, audio, labels)
}

fn one_step(model: &FusionModel, optimizer: &mut Adam, device: &Device) {
    let (images, audio, labels) = batch(device, 6);
    let logits = model.forward_logits_t(&images, &audio, true).unwrap();
    let loss = candle_nn::loss::cross_entropy(&logits, &labels).unwrap();
    optimizer.backward_step(&loss).unwrap();
}

#[test]
fn test_one_step_updates_only_head() {
    let device = Device::Cpu;
    let (image, audio) = extractors(&device);
    let varmap = VarMap::new();
    let model = build_fusion_model(image, audio, VarBuilder::from_varmap(&varmap, DType::F32, &device)).unwrap();
    let mut optimizer = Adam::from_varmap(&varmap, ParamsAdam::default()).unwrap();

    let before = values(model.named_tensors());
    one_step(&model, &mut optimizer, &device);
    let after = values(model.named_tensors());

    for (name, old) in &before {
        let changed = old.iter().zip(&after[name]).any(|(a, b)| a != b);
        if name.starts_with("head.") {
            assert!(changed, "{name} should have been updated");
        } else {
            assert!(!changed, "{name} should be frozen");
        }
    }
}

#[test]
fn test_artifact_round_trip_with_optimizer() {
    let device = Device::Cpu;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("models/fusion.safetensors");

    let (image, audio) = extractors(&device);
    let varmap = VarMap::new();
    let model = build_fusion_model(image, audio, VarBuilder::from_varmap(&varmap, DType::F32, &device)).unwrap();
    let mut optimizer = Adam::from_varmap(&varmap, ParamsAdam::default()).unwrap();
    one_step(&model, &mut optimizer, &device);
    save_fusion(&model, Some(&optimizer), &path).unwrap();

    let loaded = load_fusion(&path, &device).unwrap();
    assert_eq!(loaded.model.architecture(), model.architecture());
    let state = loaded.optimizer.expect("optimizer state stored");
    assert_eq!(state.meta.step, 1);
    assert!(state.first_moments.contains_key("head.0.weight"));
    assert_eq!(state.second_moments.len(), 6);

    let (images, audio, _) = batch(&device, 3);
    let a: Vec<f32> = model.predict(&images, &audio).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    let b: Vec<f32> = loaded.model.predict(&images, &audio).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    for (x, y) in a.iter().zip(&b) {
        assert!((x - y).abs() < 1e-6);
    }
}

#[test]
fn test_retrain_from_artifact_keeps_inputs() {
    let device = Device::Cpu;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fusion.safetensors");

    let (image, audio) = extractors(&device);
    let varmap = VarMap::new();
    let model = build_fusion_model(image, audio, VarBuilder::from_varmap(&varmap, DType::F32, &device)).unwrap();
    save_fusion(&model, None, &path).unwrap();

    let loaded = load_fusion(&path, &device).unwrap();
    assert!(loaded.optimizer.is_none());

    let retrain_map = VarMap::new();
    let retrained = loaded
        .model
        .regraft(&retrain_head(), VarBuilder::from_varmap(&retrain_map, DType::F32, &device))
        .unwrap();
    assert_eq!(retrained.input_shapes(), model.input_shapes());

    let mut optimizer = Adam::from_varmap(&retrain_map, ParamsAdam::default()).unwrap();
    let trunk_before = values(retrained.trunk().named_tensors());
    one_step(&retrained, &mut optimizer, &device);
    assert_eq!(values(retrained.trunk().named_tensors()), trunk_before);

    let (images, audio, _) = batch(&device, 2);
    let probs = retrained.predict(&images, &audio).unwrap();
    assert_eq!(probs.dims(), &[2, 3]);
    for s in probs.sum(1).unwrap().to_vec1::<f32>().unwrap() {
        assert!((s - 1.0).abs() < 1e-5);
    }

    // A retrained model survives its own round trip.
    let again = dir.path().join("retrained.safetensors");
    save_fusion(&retrained, Some(&optimizer), &again).unwrap();
    let reloaded = load_fusion(&again, &device).unwrap();
    assert_eq!(reloaded.model.architecture().trunk.len(), 3);
}

#[test]
fn test_classifier_artifact_is_not_a_fusion_model() {
    let device = Device::Cpu;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("image.safetensors");
    Classifier::new_random(ClassifierArchitecture::default_cnn("image"), &device)
        .unwrap()
        .save(&path)
        .unwrap();
    assert!(load_fusion(&path, &device).is_err());
}
