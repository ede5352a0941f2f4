//! Seeded train/validation split and mini-batch iteration.

use candle_core::Tensor;
use mmfusion_core::{FusionError, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::dataset::FusionDataset;

/// Train/validation partition of a [`FusionDataset`].
#[derive(Debug, Clone)]
pub struct DataSplit {
    pub train: FusionDataset,
    pub val: FusionDataset,
    pub train_indices: Vec<usize>,
    pub val_indices: Vec<usize>,
}

/// Number of validation samples for `n` samples at `val_ratio`.
///
/// Rounds up, so 8 samples at 0.2 give 2 validation and 6 training samples.
pub fn val_count(n: usize, val_ratio: f64) -> usize {
    ((n as f64 * val_ratio).ceil() as usize).min(n)
}

/// Shuffle with `seed` and hold out `ceil(n * val_ratio)` samples for validation.
///
/// # Errors
///
/// [`FusionError::Training`] when the training side would be empty.
pub fn train_val_split(dataset: &FusionDataset, val_ratio: f64, seed: u64) -> Result<DataSplit> {
    let n = dataset.len();
    let n_val = val_count(n, val_ratio);
    if n == 0 || n_val >= n {
        return Err(FusionError::Training(format!(
            "Cannot split {n} samples at val_ratio={val_ratio}: training subset would be empty"
        )));
    }

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let val_indices = indices[..n_val].to_vec();
    let train_indices = indices[n_val..].to_vec();

    let train = gather(dataset, &train_indices)?;
    let val = gather(dataset, &val_indices)?;

    tracing::info!(
        train = train_indices.len(),
        val = val_indices.len(),
        seed,
        "Dataset split"
    );

    Ok(DataSplit {
        train,
        val,
        train_indices,
        val_indices,
    })
}

fn gather(dataset: &FusionDataset, indices: &[usize]) -> Result<FusionDataset> {
    let device = dataset.labels.device();
    let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    let idx = Tensor::from_vec(idx, indices.len(), device)?;
    Ok(FusionDataset {
        images: dataset.images.index_select(&idx, 0)?,
        audio: dataset.audio.index_select(&idx, 0)?,
        labels: dataset.labels.index_select(&idx, 0)?,
        rows_read: indices.len(),
    })
}

/// One mini-batch of row-aligned inputs.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub audio: Tensor,
    pub labels: Tensor,
}

/// Mini-batch iterator over a [`FusionDataset`]. Reshuffles indices each epoch.
pub struct BatchIterator {
    dataset: FusionDataset,
    indices: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl BatchIterator {
    pub fn new(dataset: FusionDataset, batch_size: usize) -> Self {
        let n = dataset.len();
        Self {
            dataset,
            indices: (0..n).collect(),
            batch_size: batch_size.max(1),
            pos: 0,
        }
    }

    /// Reshuffle for a new epoch using a seeded RNG derived from base seed + epoch.
    pub fn reshuffle(&mut self, seed: u64, epoch: usize) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
        self.indices.shuffle(&mut rng);
        self.pos = 0;
    }

    /// Returns the next mini-batch, or `None` once the epoch is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        let n = self.indices.len();
        if self.pos >= n {
            return Ok(None);
        }

        let end = (self.pos + self.batch_size).min(n);
        let batch = gather(&self.dataset, &self.indices[self.pos..end])?;
        self.pos = end;

        Ok(Some(Batch {
            images: batch.images,
            audio: batch.audio,
            labels: batch.labels,
        }))
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn dataset(n: usize) -> FusionDataset {
        let device = Device::Cpu;
        let samples = (0..n)
            .map(|i| {
                let img = Tensor::full(i as f32, (64, 64, 1), &device).unwrap();
                let aud = Tensor::full(-(i as f32), (64, 64, 1), &device).unwrap();
                (img, aud, (i % 3) as u32)
            })
            .collect();
        FusionDataset::from_samples(samples, n, &device).unwrap()
    }

    fn first_pixels(t: &Tensor) -> Vec<f32> {
        let n = t.dim(0).unwrap();
        t.reshape((n, 64 * 64)).unwrap().narrow(1, 0, 1).unwrap().squeeze(1).unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_val_count_rounds_up() {
        assert_eq!(val_count(8, 0.2), 2);
        assert_eq!(val_count(10, 0.2), 2);
        assert_eq!(val_count(11, 0.2), 3);
        assert_eq!(val_count(1, 0.2), 1);
        assert_eq!(val_count(5, 0.0), 0);
    }

    #[test]
    fn test_split_eight_samples() {
        let split = train_val_split(&dataset(8), 0.2, 42).unwrap();
        assert_eq!(split.train.len(), 6);
        assert_eq!(split.val.len(), 2);
        let mut all: Vec<usize> = split.train_indices.iter().chain(&split.val_indices).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_is_deterministic() {
        let a = train_val_split(&dataset(20), 0.2, 42).unwrap();
        let b = train_val_split(&dataset(20), 0.2, 42).unwrap();
        assert_eq!(a.val_indices, b.val_indices);
        let c = train_val_split(&dataset(20), 0.2, 7).unwrap();
        assert_ne!(a.val_indices, c.val_indices);
    }

    #[test]
    fn test_split_keeps_rows_aligned() {
        let split = train_val_split(&dataset(10), 0.2, 42).unwrap();
        let images = first_pixels(&split.train.images);
        let audio = first_pixels(&split.train.audio);
        let labels: Vec<u32> = split.train.labels.to_vec1().unwrap();
        for ((img, aud), label) in images.iter().zip(&audio).zip(&labels) {
            assert_eq!(*img, -*aud);
            assert_eq!((*img as usize % 3) as u32, *label);
        }
    }

    #[test]
    fn test_split_too_small() {
        assert!(train_val_split(&dataset(1), 0.2, 42).is_err());
        assert!(train_val_split(&dataset(0), 0.2, 42).is_err());
    }

    #[test]
    fn test_batch_iterator_exhausts() {
        let mut iter = BatchIterator::new(dataset(10), 3);
        iter.reshuffle(42, 0);
        assert_eq!(iter.batches_per_epoch(), 4);

        let mut count = 0;
        let mut seen = 0;
        while let Some(batch) = iter.next_batch().unwrap() {
            assert_eq!(batch.images.dim(0).unwrap(), batch.labels.dim(0).unwrap());
            assert_eq!(batch.labels.dtype(), DType::U32);
            seen += batch.labels.dim(0).unwrap();
            count += 1;
        }
        assert_eq!(count, 4); // ceil(10/3)
        assert_eq!(seen, 10);
    }
}
