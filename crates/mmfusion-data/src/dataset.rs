//! Mapping-table loading.
//!
//! A record contributes to the dataset only if both of its modalities
//! preprocess successfully; otherwise it is dropped from all three outputs at
//! once. Output order is mapping-row order minus dropped rows.

use candle_core::{DType, Device, Tensor};
use mmfusion_core::{
    FusionError, MappingRecord, PipelineConfig, Result, INPUT_CHANNELS, INPUT_SIZE, NUM_CLASSES,
};
use rayon::prelude::*;
use std::path::Path;

use crate::preprocess::Preprocessor;

/// Row-aligned image, audio and label tensors.
#[derive(Debug, Clone)]
pub struct FusionDataset {
    /// `[N, 64, 64, 1]` f32 in `[0, 1]`.
    pub images: Tensor,
    /// `[N, 64, 64, 1]` f32 in `[0, 1]`.
    pub audio: Tensor,
    /// `[N]` u32 class indices.
    pub labels: Tensor,
    /// Rows in the mapping table.
    pub rows_read: usize,
}

impl FusionDataset {
    pub fn len(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows dropped because a modality was missing.
    pub fn dropped(&self) -> usize {
        self.rows_read.saturating_sub(self.len())
    }

    /// Build a dataset from already-preprocessed samples.
    pub fn from_samples(samples: Vec<(Tensor, Tensor, u32)>, rows_read: usize, device: &Device) -> Result<Self> {
        let n = samples.len();
        if n == 0 {
            let empty = || Tensor::zeros((0, INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS), DType::F32, device);
            return Ok(Self {
                images: empty()?,
                audio: empty()?,
                labels: Tensor::from_vec(Vec::<u32>::new(), 0, device)?,
                rows_read,
            });
        }

        let mut images = Vec::with_capacity(n);
        let mut audio = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        for (img, aud, label) in samples {
            images.push(img);
            audio.push(aud);
            labels.push(label);
        }

        Ok(Self {
            images: Tensor::stack(&images, 0)?,
            audio: Tensor::stack(&audio, 0)?,
            labels: Tensor::from_vec(labels, n, device)?,
            rows_read,
        })
    }

    /// Count of samples per class index.
    pub fn class_counts(&self, num_classes: usize) -> Result<Vec<usize>> {
        let labels: Vec<u32> = self.labels.to_vec1()?;
        let mut counts = vec![0usize; num_classes];
        for l in labels {
            if let Some(c) = counts.get_mut(l as usize) {
                *c += 1;
            }
        }
        Ok(counts)
    }
}

/// Read and validate every record of a mapping CSV.
///
/// # Errors
///
/// [`FusionError::Mapping`] if the file is missing or a row is malformed,
/// [`FusionError::InvalidLabel`] for labels outside the class domain.
pub fn read_mapping(path: &Path) -> Result<Vec<(MappingRecord, u32)>> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| {
        FusionError::Mapping(format!("Failed to open mapping {}: {e}", path.display()))
    })?;

    let mut records = Vec::new();
    for (row, result) in reader.deserialize::<MappingRecord>().enumerate() {
        let record = result.map_err(|e| {
            FusionError::Mapping(format!("Malformed mapping row {row} in {}: {e}", path.display()))
        })?;
        let label = record.validated_label(row)?;
        records.push((record, label));
    }
    Ok(records)
}

/// Load the mapping table at `config.mapping_path` into a [`FusionDataset`].
pub fn load_data(config: &PipelineConfig, device: &Device) -> Result<FusionDataset> {
    let preprocessor = Preprocessor::new(config.audio_policy, config.spectrogram.clone(), device);
    load_with(&config.mapping_path, &preprocessor, device)
}

/// Load a mapping table with an explicit [`Preprocessor`].
pub fn load_with(mapping_path: &Path, preprocessor: &Preprocessor, device: &Device) -> Result<FusionDataset> {
    let records = read_mapping(mapping_path)?;
    let rows_read = records.len();
    tracing::info!(
        mapping = %mapping_path.display(),
        rows = rows_read,
        policy = ?preprocessor.policy(),
        "Loading mapping table"
    );

    // Indexed parallel collect keeps mapping-row order.
    let samples: Vec<(Tensor, Tensor, u32)> = records
        .par_iter()
        .filter_map(|(record, label)| {
            let image = preprocessor.preprocess_image(Path::new(&record.image_path));
            let audio = preprocessor.preprocess_audio(&record.audio_path);
            match (image, audio) {
                (Some(image), Some(audio)) => Some((image, audio, *label)),
                _ => {
                    tracing::warn!(
                        image = %record.image_path,
                        audio = %record.audio_path,
                        "Dropping record with a missing modality"
                    );
                    None
                }
            }
        })
        .collect();

    let dataset = FusionDataset::from_samples(samples, rows_read, device)?;
    tracing::info!(
        kept = dataset.len(),
        dropped = dataset.dropped(),
        class_counts = ?dataset.class_counts(NUM_CLASSES)?,
        "Mapping table loaded"
    );
    Ok(dataset)
}
