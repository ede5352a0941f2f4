//! Models for mmfusion
//!
//! Everything between preprocessed `(64, 64, 1)` tensors and class
//! probabilities:
//!
//! - [`layers`]: serializable layer specs and the `Sequential` runtime
//! - [`classifier`]: pretrained single-modality classifiers
//! - [`extractor`]: frozen penultimate-layer feature extractors and [`graft`]
//! - [`fusion`]: the two-branch fusion network and its retraining variant
//! - [`optim`]: Adam with persistable state
//! - [`artifact`]: safetensors model files
//!
//! # Example
//!
//! ```no_run
//! use candle_core::{DType, Device};
//! use candle_nn::{VarBuilder, VarMap};
//! use mmfusion_model::{build_fusion_model, Classifier, FeatureExtractor};
//!
//! # fn main() -> mmfusion_core::Result<()> {
//! let device = Device::Cpu;
//! let image = Classifier::load("models/image.safetensors".as_ref(), &device)?;
//! let audio = Classifier::load("models/audio.safetensors".as_ref(), &device)?;
//!
//! let varmap = VarMap::new();
//! let model = build_fusion_model(
//!     FeatureExtractor::from_classifier(&image, &device)?,
//!     FeatureExtractor::from_classifier(&audio, &device)?,
//!     VarBuilder::from_varmap(&varmap, DType::F32, &device),
//! )?;
//! # let _ = model;
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod classifier;
pub mod device;
pub mod extractor;
pub mod fusion;
pub mod layers;
pub mod optim;

pub use artifact::{load_fusion, save_fusion, LoadedFusion};
pub use classifier::{Classifier, ClassifierArchitecture};
pub use device::select_device;
pub use extractor::{graft, FeatureExtractor, Grafted};
pub use fusion::{build_fusion_model, fusion_head, retrain_head, FusionArchitecture, FusionModel};
pub use layers::{Activation, FeatureShape, LayerSpec, Padding, Sequential};
pub use optim::{Adam, OptimizerState, ParamsAdam};
