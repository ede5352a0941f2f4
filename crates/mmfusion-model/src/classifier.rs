//! Single-modality classifiers.
//!
//! These are the pretrained image and audio models the fusion network is
//! built from. Only their architecture and weights matter here; they are
//! trained elsewhere and stored as `mmfusion-classifier` artifacts.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use mmfusion_core::{FusionError, InputShape, Result, NUM_CLASSES};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::artifact::{Artifact, ARCHITECTURE_KEY, CLASSIFIER_FORMAT, FORMAT_KEY};
use crate::layers::{to_channels_first, Activation, LayerSpec, Padding, Sequential};

/// Architecture of a single-input classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierArchitecture {
    pub name: String,
    /// Explicitly declared model input. Plain stacks leave this unset and
    /// declare the shape on their first layer instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_shape: Option<InputShape>,
    pub layers: Vec<LayerSpec>,
}

impl ClassifierArchitecture {
    /// The model input: the declared input if present, otherwise the first
    /// layer's input.
    pub fn resolve_input_shape(&self) -> Result<InputShape> {
        self.input_shape
            .or_else(|| self.layers.first().and_then(LayerSpec::declared_input))
            .ok_or_else(|| {
                FusionError::Shape(format!(
                    "classifier '{}' declares no input shape on the model or its first layer",
                    self.name
                ))
            })
    }

    /// Two conv/pool blocks and a 64-unit feature layer over a `(64, 64, 1)` input.
    pub fn default_cnn(name: &str) -> Self {
        Self {
            name: name.to_string(),
            input_shape: None,
            layers: vec![
                LayerSpec::Conv2d {
                    filters: 16,
                    kernel_size: 3,
                    padding: Padding::Same,
                    activation: Activation::Relu,
                    input_shape: Some(InputShape::modality()),
                },
                LayerSpec::MaxPool2d { size: 2 },
                LayerSpec::conv2d(32, 3, Padding::Same, Activation::Relu),
                LayerSpec::MaxPool2d { size: 2 },
                LayerSpec::Flatten { input_shape: None },
                LayerSpec::dense(64, Activation::Relu),
                LayerSpec::dense(NUM_CLASSES, Activation::Softmax),
            ],
        }
    }
}

/// A single-input classifier over `[B, H, W, C]` tensors.
#[derive(Debug, Clone)]
pub struct Classifier {
    arch: ClassifierArchitecture,
    net: Sequential,
}

impl Classifier {
    /// Build with parameters drawn from `vb`.
    pub fn new(arch: ClassifierArchitecture, vb: VarBuilder) -> Result<Self> {
        let input = arch.resolve_input_shape()?;
        let net = Sequential::build(&arch.layers, input.into(), vb)?;
        Ok(Self { arch, net })
    }

    /// Build with freshly initialized weights.
    pub fn new_random(arch: ClassifierArchitecture, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        Self::new(arch, vb)
    }

    /// Build from named tensors (`"{i}.weight"`, `"{i}.bias"`).
    pub fn from_tensors(
        arch: ClassifierArchitecture,
        tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let input = arch.resolve_input_shape()?;
        let net = Sequential::from_tensors(&arch.layers, input.into(), tensors, device)?;
        Ok(Self { arch, net })
    }

    /// Load a classifier artifact.
    ///
    /// Returns an error if the file cannot be read or its weights do not fit
    /// the stored architecture.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let artifact = Artifact::read(path, device)?;
        artifact.expect_format(CLASSIFIER_FORMAT)?;
        let arch: ClassifierArchitecture = artifact.metadata_json(ARCHITECTURE_KEY)?;
        let classifier = Self::from_tensors(arch, artifact.tensors, device).map_err(|e| {
            FusionError::Artifact(format!("Incompatible classifier {}: {e}", path.display()))
        })?;
        tracing::info!(
            path = %path.display(),
            name = %classifier.arch.name,
            layers = classifier.net.len(),
            "Classifier loaded"
        );
        Ok(classifier)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let metadata = HashMap::from([
            (FORMAT_KEY.to_string(), CLASSIFIER_FORMAT.to_string()),
            (ARCHITECTURE_KEY.to_string(), serde_json::to_string(&self.arch)?),
        ]);
        Artifact::write(path, &self.net.named_tensors(), metadata)
    }

    pub fn architecture(&self) -> &ClassifierArchitecture {
        &self.arch
    }

    pub fn network(&self) -> &Sequential {
        &self.net
    }

    /// Class probabilities, `[B, classes]`.
    pub fn predict(&self, xs: &Tensor) -> Result<Tensor> {
        let logits = self.net.forward_logits_t(&to_channels_first(xs)?, false, true)?;
        Ok(candle_nn::ops::softmax(&logits, D::Minus1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tiny(name: &str) -> ClassifierArchitecture {
        ClassifierArchitecture {
            name: name.to_string(),
            input_shape: Some(InputShape::modality()),
            layers: vec![
                LayerSpec::MaxPool2d { size: 8 },
                LayerSpec::Flatten { input_shape: None },
                LayerSpec::dense(16, Activation::Relu),
                LayerSpec::dense(3, Activation::Softmax),
            ],
        }
    }

    #[test]
    fn test_declared_input_wins() {
        let mut arch = ClassifierArchitecture::default_cnn("image");
        arch.input_shape = Some(InputShape {
            height: 32,
            width: 32,
            channels: 1,
        });
        assert_eq!(arch.resolve_input_shape().unwrap().dims(), (32, 32, 1));
    }

    #[test]
    fn test_first_layer_fallback() {
        let arch = ClassifierArchitecture::default_cnn("image");
        assert_eq!(arch.resolve_input_shape().unwrap(), InputShape::modality());
    }

    #[test]
    fn test_no_input_shape_is_error() {
        let mut arch = tiny("audio");
        arch.input_shape = None;
        assert!(matches!(arch.resolve_input_shape(), Err(FusionError::Shape(_))));
    }

    #[test]
    fn test_predict_distribution() {
        let device = Device::Cpu;
        let clf = Classifier::new_random(ClassifierArchitecture::default_cnn("image"), &device).unwrap();
        let xs = Tensor::rand(0f32, 1f32, (3, 64, 64, 1), &device).unwrap();
        let probs = clf.predict(&xs).unwrap();
        assert_eq!(probs.dims(), &[3, 3]);
        let sums: Vec<f32> = probs.sum(1).unwrap().to_vec1().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_save_load_preserves_outputs() {
        let device = Device::Cpu;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("models/image.safetensors");
        let clf = Classifier::new_random(tiny("image"), &device).unwrap();
        clf.save(&path).unwrap();

        let loaded = Classifier::load(&path, &device).unwrap();
        assert_eq!(loaded.architecture(), clf.architecture());
        let xs = Tensor::rand(0f32, 1f32, (2, 64, 64, 1), &device).unwrap();
        let a: Vec<f32> = clf.predict(&xs).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = loaded.predict(&xs).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_load_incompatible_weights() {
        let device = Device::Cpu;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audio.safetensors");
        Classifier::new_random(tiny("audio"), &device).unwrap().save(&path).unwrap();

        // Rewrite the metadata with a wider feature layer than the stored weights.
        let artifact = Artifact::read(&path, &device).unwrap();
        let mut arch = tiny("audio");
        arch.layers[2] = LayerSpec::dense(32, Activation::Relu);
        let tensors: Vec<(String, Tensor)> = artifact.tensors.into_iter().collect();
        let metadata = HashMap::from([
            (FORMAT_KEY.to_string(), CLASSIFIER_FORMAT.to_string()),
            (ARCHITECTURE_KEY.to_string(), serde_json::to_string(&arch).unwrap()),
        ]);
        Artifact::write(&path, &tensors, metadata).unwrap();

        assert!(matches!(Classifier::load(&path, &device), Err(FusionError::Artifact(_))));
    }

    #[test]
    fn test_load_nonexistent_path_fails() {
        assert!(Classifier::load(Path::new("/nonexistent/image.safetensors"), &Device::Cpu).is_err());
    }
}
