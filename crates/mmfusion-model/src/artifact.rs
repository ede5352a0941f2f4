//! Single-file model artifacts.
//!
//! Tensors are stored as safetensors; the architecture (JSON) and optional
//! optimizer hyperparameters ride along in the safetensors metadata header.

use candle_core::{Device, Tensor};
use mmfusion_core::{FusionError, Result};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;

use crate::fusion::{FusionArchitecture, FusionModel};
use crate::optim::{Adam, OptimizerMeta, OptimizerState};

pub const FORMAT_KEY: &str = "format";
pub const ARCHITECTURE_KEY: &str = "architecture";
pub const OPTIMIZER_KEY: &str = "optimizer";

pub const CLASSIFIER_FORMAT: &str = "mmfusion-classifier";
pub const FUSION_FORMAT: &str = "mmfusion-fusion";

const FIRST_MOMENT_PREFIX: &str = "optimizer.m.";
const SECOND_MOMENT_PREFIX: &str = "optimizer.v.";

/// Raw contents of an artifact file.
#[derive(Debug)]
pub struct Artifact {
    pub tensors: HashMap<String, Tensor>,
    pub metadata: HashMap<String, String>,
}

impl Artifact {
    /// Write `tensors` and `metadata` to `path`, creating parent directories.
    pub fn write(path: &Path, tensors: &[(String, Tensor)], metadata: HashMap<String, String>) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let data = tensors.iter().map(|(name, t)| (name.as_str(), t));
        safetensors::serialize_to_file(data, &Some(metadata), path).map_err(|e| {
            FusionError::Artifact(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// Read every tensor and the metadata header of `path` onto `device`.
    pub fn read(path: &Path, device: &Device) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            FusionError::Artifact(format!("Failed to read {}: {e}", path.display()))
        })?;
        let (_, header) = safetensors::SafeTensors::read_metadata(&bytes).map_err(|e| {
            FusionError::Artifact(format!("Failed to parse {}: {e}", path.display()))
        })?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let tensors = candle_core::safetensors::load_buffer(&bytes, device)?;
        Ok(Self { tensors, metadata })
    }

    /// Fail unless the artifact declares `format`.
    pub fn expect_format(&self, format: &str) -> Result<()> {
        match self.metadata.get(FORMAT_KEY) {
            Some(found) if found == format => Ok(()),
            Some(found) => Err(FusionError::Artifact(format!(
                "expected a {format} artifact, found {found}"
            ))),
            None => Err(FusionError::Artifact(format!(
                "artifact has no '{FORMAT_KEY}' metadata (expected {format})"
            ))),
        }
    }

    /// Parse the JSON metadata entry under `key`.
    pub fn metadata_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self
            .metadata
            .get(key)
            .ok_or_else(|| FusionError::Artifact(format!("artifact has no '{key}' metadata")))?;
        Ok(serde_json::from_str(raw)?)
    }

    /// Tensors whose name starts with `prefix`, with the prefix removed.
    pub fn strip_prefix(&self, prefix: &str) -> HashMap<String, Tensor> {
        strip_prefix(&self.tensors, prefix)
    }
}

pub(crate) fn strip_prefix(tensors: &HashMap<String, Tensor>, prefix: &str) -> HashMap<String, Tensor> {
    tensors
        .iter()
        .filter_map(|(name, t)| name.strip_prefix(prefix).map(|rest| (rest.to_string(), t.clone())))
        .collect()
}

/// A fusion model read back from disk. Every parameter is frozen.
#[derive(Debug)]
pub struct LoadedFusion {
    pub model: FusionModel,
    pub optimizer: Option<OptimizerState>,
}

/// Persist `model` (architecture + weights) and, when given, the optimizer state.
pub fn save_fusion(model: &FusionModel, optimizer: Option<&Adam>, path: &Path) -> Result<()> {
    let mut tensors = model.named_tensors();
    let mut metadata = HashMap::from([
        (FORMAT_KEY.to_string(), FUSION_FORMAT.to_string()),
        (
            ARCHITECTURE_KEY.to_string(),
            serde_json::to_string(&model.architecture())?,
        ),
    ]);

    if let Some(optimizer) = optimizer {
        let state = optimizer.state();
        metadata.insert(OPTIMIZER_KEY.to_string(), serde_json::to_string(&state.meta)?);
        for (name, t) in state.first_moments {
            tensors.push((format!("{FIRST_MOMENT_PREFIX}{name}"), t));
        }
        for (name, t) in state.second_moments {
            tensors.push((format!("{SECOND_MOMENT_PREFIX}{name}"), t));
        }
    }

    Artifact::write(path, &tensors, metadata)?;
    tracing::info!(path = %path.display(), tensors = tensors.len(), "Fusion model saved");
    Ok(())
}

/// Load a fusion artifact written by [`save_fusion`].
pub fn load_fusion(path: &Path, device: &Device) -> Result<LoadedFusion> {
    let artifact = Artifact::read(path, device)?;
    artifact.expect_format(FUSION_FORMAT)?;
    let arch: FusionArchitecture = artifact.metadata_json(ARCHITECTURE_KEY)?;
    let model = FusionModel::from_tensors(&arch, &artifact.tensors, device)?;

    let optimizer = if artifact.metadata.contains_key(OPTIMIZER_KEY) {
        let meta: OptimizerMeta = artifact.metadata_json(OPTIMIZER_KEY)?;
        Some(OptimizerState {
            meta,
            first_moments: artifact.strip_prefix(FIRST_MOMENT_PREFIX),
            second_moments: artifact.strip_prefix(SECOND_MOMENT_PREFIX),
        })
    } else {
        None
    };

    tracing::info!(path = %path.display(), "Fusion model loaded");
    Ok(LoadedFusion { model, optimizer })
}
