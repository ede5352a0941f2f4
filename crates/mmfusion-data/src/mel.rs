//! Mel power spectrogram in decibels.
//!
//! Parameters follow the usual librosa defaults for `melspectrogram`:
//! - `n_fft = 2048`, hop 512, periodic Hann window
//! - centered frames, zero padded by `n_fft / 2` on both sides
//! - Slaney mel scale with Slaney area normalization
//! - `power_to_db` referenced to the spectrogram maximum, 80 dB floor

use realfft::RealFftPlanner;

pub const N_FFT: usize = 2048;
pub const HOP_LENGTH: usize = 512;
pub const N_FREQ: usize = N_FFT / 2 + 1;

/// Dynamic range kept below the spectrogram maximum.
pub const TOP_DB: f32 = 80.0;

const AMIN: f32 = 1e-10;

/// Row-major `[n_mels × n_frames]` spectrogram.
#[derive(Debug, Clone)]
pub struct MelSpectrogram {
    pub data: Vec<f32>,
    pub n_mels: usize,
    pub n_frames: usize,
}

impl MelSpectrogram {
    /// Convert power values to decibels relative to the maximum, floored at
    /// `max - TOP_DB`.
    #[must_use]
    pub fn power_to_db(mut self) -> Self {
        let max_power = self.data.iter().copied().fold(0.0f32, f32::max);
        let reference = 10.0 * max_power.max(AMIN).log10();
        for v in &mut self.data {
            *v = 10.0 * v.max(AMIN).log10() - reference;
        }
        let max_db = self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let floor = max_db - TOP_DB;
        for v in &mut self.data {
            *v = v.max(floor);
        }
        self
    }

    /// Map a decibel spectrogram onto `[0, 1]`: the floor goes to 0 and the
    /// maximum to 1.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let max_db = self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let floor = max_db - TOP_DB;
        for v in &mut self.data {
            *v = ((*v - floor) / TOP_DB).clamp(0.0, 1.0);
        }
        self
    }
}

#[inline]
fn hertz_to_mel(freq: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
    // ln(6.4) / 27
    const LOGSTEP: f32 = 0.068_751_78;

    if freq >= MIN_LOG_HZ {
        MIN_LOG_MEL + (freq / MIN_LOG_HZ).ln() / LOGSTEP
    } else {
        freq / F_SP
    }
}

#[inline]
fn mel_to_hertz(mels: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
    const LOGSTEP: f32 = 0.068_751_78;

    if mels >= MIN_LOG_MEL {
        MIN_LOG_HZ * (LOGSTEP * (mels - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mels
    }
}

/// Slaney-normalized triangular filters, `[n_mels × N_FREQ]`.
fn build_mel_filters(sample_rate: u32, n_mels: usize) -> Vec<f32> {
    let nyquist = sample_rate as f32 / 2.0;
    let fft_freqs: Vec<f32> = (0..N_FREQ)
        .map(|k| k as f32 * nyquist / (N_FREQ - 1) as f32)
        .collect();

    let mel_min = hertz_to_mel(0.0);
    let mel_max = hertz_to_mel(nyquist);
    let mel_f: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hertz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut filters = vec![0.0f32; n_mels * N_FREQ];
    for m in 0..n_mels {
        let lower_width = (mel_f[m + 1] - mel_f[m]).max(f32::EPSILON);
        let upper_width = (mel_f[m + 2] - mel_f[m + 1]).max(f32::EPSILON);
        let enorm = 2.0 / (mel_f[m + 2] - mel_f[m]);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - mel_f[m]) / lower_width;
            let upper = (mel_f[m + 2] - freq) / upper_width;
            filters[m * N_FREQ + k] = lower.min(upper).max(0.0) * enorm;
        }
    }
    filters
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let angle = 2.0 * std::f32::consts::PI * i as f32 / size as f32;
            0.5 * (1.0 - angle.cos())
        })
        .collect()
}

/// Compute a mel power spectrogram from mono samples at `sample_rate`.
///
/// Returns `None` for empty input.
pub fn mel_spectrogram(samples: &[f32], sample_rate: u32, n_mels: usize) -> Option<MelSpectrogram> {
    if samples.is_empty() || n_mels == 0 {
        return None;
    }

    let pad = N_FFT / 2;
    let mut padded = vec![0.0f32; samples.len() + 2 * pad];
    padded[pad..pad + samples.len()].copy_from_slice(samples);
    let n_frames = 1 + (padded.len() - N_FFT) / HOP_LENGTH;

    let window = hann_window(N_FFT);
    let filters = build_mel_filters(sample_rate, n_mels);

    let mut planner = RealFftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(N_FFT);
    let mut frame = fft.make_input_vec();
    let mut spectrum = fft.make_output_vec();
    let mut power = vec![0.0f32; N_FREQ];

    let mut data = vec![0.0f32; n_mels * n_frames];
    for t in 0..n_frames {
        let start = t * HOP_LENGTH;
        for (i, out) in frame.iter_mut().enumerate() {
            *out = padded[start + i] * window[i];
        }
        // Buffer sizes come from the plan itself.
        if fft.process(&mut frame, &mut spectrum).is_err() {
            return None;
        }
        for (p, c) in power.iter_mut().zip(spectrum.iter()) {
            *p = c.norm_sqr();
        }
        for m in 0..n_mels {
            let filt = &filters[m * N_FREQ..(m + 1) * N_FREQ];
            data[m * n_frames + t] = filt.iter().zip(power.iter()).map(|(f, p)| f * p).sum();
        }
    }

    Some(MelSpectrogram {
        data,
        n_mels,
        n_frames,
    })
}

/// Linear-interpolation resampling. A zero rate on either side leaves the
/// samples unchanged.
pub fn resample_linear(samples: &[f32], from_hz: u32, to_hz: u32) -> Vec<f32> {
    if from_hz == to_hz || from_hz == 0 || to_hz == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from_hz as f64 / to_hz as f64;
    let output_len = (samples.len() as f64 / ratio).floor() as usize;
    (0..output_len)
        .map(|i| {
            let src = i as f64 * ratio;
            let idx = src as usize;
            let frac = (src - idx as f64) as f32;
            match (samples.get(idx), samples.get(idx + 1)) {
                (Some(&a), Some(&b)) => a * (1.0 - frac) + b * frac,
                (Some(&a), None) => a,
                _ => 0.0,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: u32, seconds: f32) -> Vec<f32> {
        let n = (sample_rate as f32 * seconds) as usize;
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn mel_scale_round_trips() {
        for hz in [0.0f32, 440.0, 1000.0, 4000.0, 11025.0] {
            let back = mel_to_hertz(hertz_to_mel(hz));
            assert!((back - hz).abs() < 0.5, "{hz} -> {back}");
        }
    }

    #[test]
    fn frame_count_matches_centered_stft() {
        let samples = vec![0.1f32; 22050];
        let mel = mel_spectrogram(&samples, 22050, 128).unwrap();
        assert_eq!(mel.n_mels, 128);
        assert_eq!(mel.n_frames, 1 + 22050 / HOP_LENGTH);
        assert_eq!(mel.data.len(), 128 * mel.n_frames);
    }

    #[test]
    fn empty_input_is_none() {
        assert!(mel_spectrogram(&[], 22050, 128).is_none());
    }

    #[test]
    fn tone_energy_peaks_in_low_bands() {
        let samples = sine(440.0, 22050, 1.0);
        let mel = mel_spectrogram(&samples, 22050, 128).unwrap();
        let mid = mel.n_frames / 2;
        let (peak_band, _) = (0..mel.n_mels)
            .map(|m| (m, mel.data[m * mel.n_frames + mid]))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        // 440 Hz sits well inside the lower quarter of a 0..11025 Hz Slaney scale.
        assert!(peak_band < 32, "peak band {peak_band}");
    }

    #[test]
    fn db_conversion_references_max() {
        let samples = sine(1000.0, 22050, 0.5);
        let db = mel_spectrogram(&samples, 22050, 64).unwrap().power_to_db();
        let max = db.data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let min = db.data.iter().copied().fold(f32::INFINITY, f32::min);
        assert!(max.abs() < 1e-4);
        assert!(min >= -TOP_DB - 1e-4);
    }

    #[test]
    fn normalized_range() {
        let samples = sine(300.0, 22050, 0.5);
        let norm = mel_spectrogram(&samples, 22050, 64)
            .unwrap()
            .power_to_db()
            .normalized();
        assert!(norm.data.iter().all(|v| (0.0..=1.0).contains(v)));
        let max = norm.data.iter().copied().fold(0.0f32, f32::max);
        assert!((max - 1.0).abs() < 1e-5);
    }

    #[test]
    fn resample_halves_length() {
        let samples: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        let out = resample_linear(&samples, 44100, 22050);
        assert_eq!(out.len(), 500);
        assert!((out[10] - 20.0).abs() < 1e-3);
    }

    #[test]
    fn resample_zero_rate_is_identity() {
        let samples = vec![0.25f32; 16];
        assert_eq!(resample_linear(&samples, 0, 22050), samples);
        assert_eq!(resample_linear(&samples, 44100, 0), samples);
    }

    #[test]
    fn resample_identity() {
        let samples = vec![0.5f32; 10];
        assert_eq!(resample_linear(&samples, 22050, 22050), samples);
    }
}
