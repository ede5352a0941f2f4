//! Data pipeline for mmfusion
//!
//! Turns a mapping table of `(image_path, audio_path, label)` rows into three
//! row-aligned tensors ready for the two-branch fusion model:
//!
//! - [`preprocess`]: per-file image and audio preprocessing to `(64, 64, 1)`
//! - [`mel`]: on-the-fly mel spectrogram in decibels
//! - [`dataset`]: mapping-table loading with atomic record dropping
//! - [`split`]: seeded train/validation split and mini-batch iteration

pub mod dataset;
pub mod mel;
pub mod preprocess;
pub mod split;

pub use dataset::{load_data, read_mapping, FusionDataset};
pub use preprocess::{preprocess_audio, preprocess_image, Preprocessor};
pub use split::{train_val_split, Batch, BatchIterator, DataSplit};
