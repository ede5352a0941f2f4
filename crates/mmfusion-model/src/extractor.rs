//! Frozen feature extractors cut from pretrained classifiers.

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use mmfusion_core::{FusionError, InputShape, Result};
use std::collections::HashMap;

use crate::classifier::{Classifier, ClassifierArchitecture};
use crate::layers::{to_channels_first, FeatureShape, LayerSpec, Sequential};

/// A frozen base with its last layer cut, plus a trainable head on top.
#[derive(Debug, Clone)]
pub struct Grafted {
    pub base: Sequential,
    pub head: Sequential,
}

/// Cut the final layer of `base`, freeze what is left and build `head` on the
/// exposed features with parameters from `vb`.
///
/// An empty `head` gives a plain frozen truncation.
pub fn graft(base: &Sequential, head: &[LayerSpec], vb: VarBuilder) -> Result<Grafted> {
    let base = base.truncate_last()?.frozen()?;
    let head = Sequential::build(head, base.output_shape(), vb)?;
    Ok(Grafted { base, head })
}

/// Penultimate-layer embedding of a single-modality classifier.
///
/// The parameters are constants and [`FeatureExtractor::embed`] detaches its
/// output, so no gradient reaches the extractor.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    arch: ClassifierArchitecture,
    net: Sequential,
}

impl FeatureExtractor {
    pub fn from_classifier(classifier: &Classifier, device: &Device) -> Result<Self> {
        let source = classifier.architecture();
        let input = source.resolve_input_shape()?;
        if input != InputShape::modality() {
            return Err(FusionError::Shape(format!(
                "classifier '{}' takes {input}, expected {}",
                source.name,
                InputShape::modality()
            )));
        }
        if classifier.network().len() < 2 {
            return Err(FusionError::Shape(format!(
                "classifier '{}' has no layer below its output layer",
                source.name
            )));
        }

        let grafted = graft(classifier.network(), &[], VarBuilder::zeros(candle_core::DType::F32, device))?;
        let net = grafted.base;
        let dim = net.output_shape().flat_width().ok_or_else(|| {
            FusionError::Shape(format!(
                "classifier '{}' penultimate output {} is not a flat embedding",
                source.name,
                net.output_shape()
            ))
        })?;

        let arch = ClassifierArchitecture {
            name: source.name.clone(),
            input_shape: Some(input),
            layers: net.specs().to_vec(),
        };
        tracing::info!(name = %arch.name, embedding_dim = dim, "Feature extractor ready");
        Ok(Self { arch, net })
    }

    /// Rebuild a stored extractor from its (already truncated) architecture.
    pub fn from_parts(
        arch: ClassifierArchitecture,
        tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let input = arch.resolve_input_shape()?;
        let net = Sequential::from_tensors(&arch.layers, input.into(), tensors, device)?;
        if net.output_shape().flat_width().is_none() {
            return Err(FusionError::Shape(format!(
                "extractor '{}' does not produce a flat embedding",
                arch.name
            )));
        }
        Ok(Self { arch, net })
    }

    /// `[B, 64, 64, 1]` (or a single `[64, 64, 1]`) → `[B, embedding_dim]`.
    pub fn embed(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.net.forward_logits_t(&to_channels_first(xs)?, false, false)?;
        Ok(ys.detach())
    }

    pub fn embedding_dim(&self) -> usize {
        self.net.output_shape().numel()
    }

    pub fn architecture(&self) -> &ClassifierArchitecture {
        &self.arch
    }

    pub fn input_shape(&self) -> FeatureShape {
        self.net.input_shape()
    }

    pub fn named_tensors(&self) -> Vec<(String, Tensor)> {
        self.net.named_tensors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Activation, Padding};
    use candle_core::DType;
    use candle_nn::VarMap;

    #[test]
    fn test_extractor_exposes_penultimate_width() {
        let device = Device::Cpu;
        let clf = Classifier::new_random(ClassifierArchitecture::default_cnn("image"), &device).unwrap();
        let ext = FeatureExtractor::from_classifier(&clf, &device).unwrap();
        assert_eq!(ext.embedding_dim(), 64);
        assert_eq!(ext.architecture().layers.len(), 6);
        assert_eq!(ext.architecture().input_shape, Some(InputShape::modality()));

        let xs = Tensor::rand(0f32, 1f32, (2, 64, 64, 1), &device).unwrap();
        assert_eq!(ext.embed(&xs).unwrap().dims(), &[2, 64]);
        let single = Tensor::rand(0f32, 1f32, (64, 64, 1), &device).unwrap();
        assert_eq!(ext.embed(&single).unwrap().dims(), &[1, 64]);
    }

    #[test]
    fn test_wrong_input_shape_rejected() {
        let device = Device::Cpu;
        let mut arch = ClassifierArchitecture::default_cnn("image");
        arch.input_shape = Some(InputShape {
            height: 32,
            width: 32,
            channels: 1,
        });
        let clf = Classifier::new_random(arch, &device).unwrap();
        assert!(matches!(
            FeatureExtractor::from_classifier(&clf, &device),
            Err(FusionError::Shape(_))
        ));
    }

    #[test]
    fn test_spatial_penultimate_rejected() {
        let device = Device::Cpu;
        let arch = ClassifierArchitecture {
            name: "audio".to_string(),
            input_shape: Some(InputShape::modality()),
            layers: vec![
                LayerSpec::conv2d(2, 3, Padding::Same, Activation::Relu),
                LayerSpec::MaxPool2d { size: 8 },
                LayerSpec::Flatten { input_shape: None },
            ],
        };
        let clf = Classifier::new_random(arch, &device).unwrap();
        assert!(FeatureExtractor::from_classifier(&clf, &device).is_err());
    }

    #[test]
    fn test_graft_trains_only_head() {
        let device = Device::Cpu;
        let base_map = VarMap::new();
        let base_vb = VarBuilder::from_varmap(&base_map, DType::F32, &device);
        let base = Sequential::build(
            &[
                LayerSpec::dense(6, Activation::Relu),
                LayerSpec::dense(3, Activation::Softmax),
            ],
            FeatureShape::Flat(4),
            base_vb,
        )
        .unwrap();

        let head_map = VarMap::new();
        let head_vb = VarBuilder::from_varmap(&head_map, DType::F32, &device);
        let grafted = graft(&base, &[LayerSpec::dense(2, Activation::Softmax)], head_vb).unwrap();
        assert_eq!(grafted.base.len(), 1);
        assert_eq!(grafted.head.input_shape(), FeatureShape::Flat(6));
        assert_eq!(head_map.all_vars().len(), 2);
    }
}
