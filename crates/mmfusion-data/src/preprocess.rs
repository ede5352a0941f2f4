//! Per-file preprocessing to `(64, 64, 1)` tensors in `[0, 1]`.
//!
//! Missing or unreadable inputs are reported as `None` with a warning; they
//! never abort the run. The dataset loader drops the whole record instead.

use candle_core::{Device, Tensor};
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use mmfusion_core::{AudioPolicy, SpectrogramPaths, INPUT_CHANNELS, INPUT_SIZE, MEL_BANDS, SAMPLE_RATE_HZ};
use std::path::Path;

use crate::mel::{mel_spectrogram, resample_linear};

/// Preprocessing settings shared by every record of a run.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    policy: AudioPolicy,
    spectrogram: SpectrogramPaths,
    device: Device,
}

impl Preprocessor {
    pub fn new(policy: AudioPolicy, spectrogram: SpectrogramPaths, device: &Device) -> Self {
        Self {
            policy,
            spectrogram,
            device: device.clone(),
        }
    }

    pub fn policy(&self) -> AudioPolicy {
        self.policy
    }

    /// Grayscale image → `(64, 64, 1)` in `[0, 1]`, or `None` if unreadable.
    pub fn preprocess_image(&self, path: &Path) -> Option<Tensor> {
        preprocess_image(path, &self.device)
    }

    /// Audio file → `(64, 64, 1)` in `[0, 1]` under the configured policy.
    pub fn preprocess_audio(&self, path: &str) -> Option<Tensor> {
        match self.policy {
            AudioPolicy::Precomputed => {
                let spec_path = self.spectrogram.derive(path);
                if !spec_path.exists() {
                    tracing::warn!(
                        audio = %path,
                        spectrogram = %spec_path.display(),
                        "Spectrogram not found"
                    );
                    return None;
                }
                preprocess_image(&spec_path, &self.device)
            }
            AudioPolicy::OnTheFly => preprocess_audio(Path::new(path), &self.device),
        }
    }
}

/// Load `path` as 8-bit luma, resize to 64×64 and scale to `[0, 1]`.
pub fn preprocess_image(path: &Path, device: &Device) -> Option<Tensor> {
    let gray = match image::open(path) {
        Ok(img) => img.to_luma8(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read image");
            return None;
        }
    };
    match gray_to_tensor(&gray, device) {
        Ok(t) => Some(t),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to build image tensor");
            None
        }
    }
}

fn gray_to_tensor(gray: &GrayImage, device: &Device) -> candle_core::Result<Tensor> {
    let resized = imageops::resize(gray, INPUT_SIZE as u32, INPUT_SIZE as u32, FilterType::Triangle);
    let data: Vec<f32> = resized
        .into_raw()
        .into_iter()
        .map(|p| f32::from(p) / 255.0)
        .collect();
    Tensor::from_vec(data, (INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS), device)
}

/// Decode a WAV file, compute its 128-band mel spectrogram at 22050 Hz and
/// return it as a `(64, 64, 1)` tensor in `[0, 1]`.
///
/// Rows are mel bands (lowest first), columns are time frames.
pub fn preprocess_audio(path: &Path, device: &Device) -> Option<Tensor> {
    let (samples, sample_rate) = match read_wav_mono(path) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to decode audio");
            return None;
        }
    };
    let samples = resample_linear(&samples, sample_rate, SAMPLE_RATE_HZ);
    let Some(mel) = mel_spectrogram(&samples, SAMPLE_RATE_HZ, MEL_BANDS) else {
        tracing::warn!(path = %path.display(), "Audio file has no samples");
        return None;
    };
    let mel = mel.power_to_db().normalized();

    let plane: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(mel.n_frames as u32, mel.n_mels as u32, mel.data)?;
    let resized = imageops::resize(&plane, INPUT_SIZE as u32, INPUT_SIZE as u32, FilterType::Triangle);
    let data: Vec<f32> = resized.into_raw().into_iter().map(|v| v.clamp(0.0, 1.0)).collect();

    match Tensor::from_vec(data, (INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS), device) {
        Ok(t) => Some(t),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to build audio tensor");
            None
        }
    }
}

/// Read a WAV file as mono `f32` samples in `[-1, 1]`.
fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32), hound::Error> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.sample_rate == 0 || spec.channels == 0 {
        return Err(hound::Error::FormatError("zero sample rate or channel count"));
    }
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let channels = usize::from(spec.channels.max(1));
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };
    Ok((mono, spec.sample_rate))
}
