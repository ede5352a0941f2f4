//! Two-branch fusion network.
//!
//! ```text
//!   image [B,64,64,1] ─▶ image extractor (frozen) ─┐
//!                                                   ├─ concat ─▶ trunk (frozen) ─▶ head (trainable) ─▶ [B,3]
//!   audio [B,64,64,1] ─▶ audio extractor (frozen) ─┘
//! ```
//!
//! A freshly built model has an empty trunk. Retraining moves the previous
//! head, minus its output layer, into the trunk and grows a new head.

use candle_core::{Device, Tensor, D};
use candle_nn::VarBuilder;
use mmfusion_core::{FusionError, Result, NUM_CLASSES};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::artifact::strip_prefix;
use crate::classifier::ClassifierArchitecture;
use crate::extractor::{graft, FeatureExtractor};
use crate::layers::{Activation, FeatureShape, LayerSpec, Sequential};

/// Prefix of trainable head variables in the training `VarMap`.
pub const HEAD_PREFIX: &str = "head";

/// Serializable description of a [`FusionModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionArchitecture {
    pub image: ClassifierArchitecture,
    pub audio: ClassifierArchitecture,
    #[serde(default)]
    pub trunk: Vec<LayerSpec>,
    pub head: Vec<LayerSpec>,
}

/// `Dense(128, relu) → Dropout(0.3) → Dense(64, relu) → Dense(3, softmax)`
pub fn fusion_head() -> Vec<LayerSpec> {
    vec![
        LayerSpec::dense(128, Activation::Relu),
        LayerSpec::dropout(0.3),
        LayerSpec::dense(64, Activation::Relu),
        LayerSpec::dense(NUM_CLASSES, Activation::Softmax),
    ]
}

/// `Dense(128, relu) → Dropout(0.2) → Dense(3, softmax)`
pub fn retrain_head() -> Vec<LayerSpec> {
    vec![
        LayerSpec::dense(128, Activation::Relu),
        LayerSpec::dropout(0.2),
        LayerSpec::dense(NUM_CLASSES, Activation::Softmax),
    ]
}

/// Fuse two extractors under the default [`fusion_head`].
pub fn build_fusion_model(image: FeatureExtractor, audio: FeatureExtractor, vb: VarBuilder) -> Result<FusionModel> {
    FusionModel::new(image, audio, &fusion_head(), vb)
}

#[derive(Debug, Clone)]
pub struct FusionModel {
    image: FeatureExtractor,
    audio: FeatureExtractor,
    trunk: Sequential,
    head: Sequential,
}

impl FusionModel {
    /// Build a model whose head draws its parameters from `vb` under
    /// [`HEAD_PREFIX`].
    pub fn new(image: FeatureExtractor, audio: FeatureExtractor, head: &[LayerSpec], vb: VarBuilder) -> Result<Self> {
        let width = image.embedding_dim() + audio.embedding_dim();
        let trunk = Sequential::empty(FeatureShape::Flat(width));
        let head = Sequential::build(head, trunk.output_shape(), vb.pp(HEAD_PREFIX))?;
        check_classes(&head)?;
        tracing::info!(
            image_dim = image.embedding_dim(),
            audio_dim = audio.embedding_dim(),
            head_layers = head.len(),
            "Fusion model built"
        );
        Ok(Self {
            image,
            audio,
            trunk,
            head,
        })
    }

    /// Freeze the whole model, cut its output layer and grow `head` on the
    /// second-to-last layer. Inputs are unchanged.
    pub fn regraft(&self, head: &[LayerSpec], vb: VarBuilder) -> Result<Self> {
        let base = self.trunk.frozen_concat(&self.head, vb.device())?;
        let grafted = graft(&base, head, vb.pp(HEAD_PREFIX))?;
        check_classes(&grafted.head)?;
        tracing::info!(
            trunk_layers = grafted.base.len(),
            head_layers = grafted.head.len(),
            "Fusion model regrafted"
        );
        Ok(Self {
            image: self.image.clone(),
            audio: self.audio.clone(),
            trunk: grafted.base,
            head: grafted.head,
        })
    }

    /// Rebuild from prefixed tensors (`image.`, `audio.`, `trunk.`, `head.`).
    /// Every parameter comes back as a constant.
    pub fn from_tensors(arch: &FusionArchitecture, tensors: &HashMap<String, Tensor>, device: &Device) -> Result<Self> {
        let image = FeatureExtractor::from_parts(arch.image.clone(), strip_prefix(tensors, "image."), device)?;
        let audio = FeatureExtractor::from_parts(arch.audio.clone(), strip_prefix(tensors, "audio."), device)?;
        let width = image.embedding_dim() + audio.embedding_dim();
        let trunk = Sequential::from_tensors(
            &arch.trunk,
            FeatureShape::Flat(width),
            strip_prefix(tensors, "trunk."),
            device,
        )?;
        let head = Sequential::from_tensors(&arch.head, trunk.output_shape(), strip_prefix(tensors, "head."), device)?;
        check_classes(&head)?;
        Ok(Self {
            image,
            audio,
            trunk,
            head,
        })
    }

    pub fn architecture(&self) -> FusionArchitecture {
        FusionArchitecture {
            image: self.image.architecture().clone(),
            audio: self.audio.architecture().clone(),
            trunk: self.trunk.specs().to_vec(),
            head: self.head.specs().to_vec(),
        }
    }

    /// Every parameter, prefixed by the part it belongs to.
    pub fn named_tensors(&self) -> Vec<(String, Tensor)> {
        let parts = [
            ("image", self.image.named_tensors()),
            ("audio", self.audio.named_tensors()),
            ("trunk", self.trunk.named_tensors()),
            ("head", self.head.named_tensors()),
        ];
        parts
            .into_iter()
            .flat_map(|(prefix, tensors)| {
                tensors
                    .into_iter()
                    .map(move |(name, t)| (format!("{prefix}.{name}"), t))
            })
            .collect()
    }

    /// Raw class scores `[B, 3]`; the head's softmax is left out.
    pub fn forward_logits_t(&self, images: &Tensor, audio: &Tensor, train: bool) -> Result<Tensor> {
        let img = self.image.embed(images)?;
        let aud = self.audio.embed(audio)?;
        let (n_img, n_aud) = (img.dim(0)?, aud.dim(0)?);
        if n_img != n_aud {
            return Err(FusionError::Shape(format!(
                "image batch of {n_img} does not match audio batch of {n_aud}"
            )));
        }
        let joint = Tensor::cat(&[&img, &aud], 1)?;
        let features = self.trunk.forward_logits_t(&joint, false, false)?.detach();
        Ok(self.head.forward_logits_t(&features, train, true)?)
    }

    /// Class probabilities `[B, 3]` for single `(64, 64, 1)` or batched
    /// `(B, 64, 64, 1)` inputs.
    pub fn predict(&self, images: &Tensor, audio: &Tensor) -> Result<Tensor> {
        let logits = self.forward_logits_t(images, audio, false)?;
        Ok(candle_nn::ops::softmax(&logits, D::Minus1)?)
    }

    /// Input shapes of the image and audio branches.
    pub fn input_shapes(&self) -> (FeatureShape, FeatureShape) {
        (self.image.input_shape(), self.audio.input_shape())
    }

    pub fn image_extractor(&self) -> &FeatureExtractor {
        &self.image
    }

    pub fn audio_extractor(&self) -> &FeatureExtractor {
        &self.audio
    }

    pub fn trunk(&self) -> &Sequential {
        &self.trunk
    }

    pub fn head(&self) -> &Sequential {
        &self.head
    }
}

fn check_classes(head: &Sequential) -> Result<()> {
    match head.output_shape() {
        FeatureShape::Flat(n) if n == NUM_CLASSES => Ok(()),
        other => Err(FusionError::Shape(format!(
            "fusion head must end in {NUM_CLASSES} classes, got {other}"
        ))),
    }
}
