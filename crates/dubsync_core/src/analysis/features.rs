//! Time-series feature extraction.
//!
//! Every feature is a sequence of frames on a fixed hop, aligned so that frame
//! `i` describes the audio centered at `i * hop` samples. Master and dub are
//! always extracted with the same parameters, so a frame lag converts to
//! seconds with a single multiplication by the hop.
//!
//! Features:
//! - MFCC (13 coefficients of a 40-band log mel spectrum)
//! - Onset strength (half-wave rectified log-mel flux)
//! - Spectral centroid + 12-bin chroma
//! - RMS energy per hop
//! - Mel embedding (log mel pooled over 0.5s windows every 0.25s)

use std::f64::consts::PI;
use std::fmt;

use parking_lot::Mutex;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

use super::types::{AnalysisError, AnalysisResult, TrackRole};

/// Lowest pitch mapped into chroma bins (A0).
const CHROMA_MIN_HZ: f64 = 27.5;
/// Highest pitch mapped into chroma bins (C8).
const CHROMA_MAX_HZ: f64 = 4186.0;
/// Floor applied before taking logs.
const LOG_FLOOR: f64 = 1e-10;

/// Kind of feature series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Mfcc,
    OnsetStrength,
    ChromaCentroid,
    RmsEnergy,
    MelEmbedding,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::Mfcc => "mfcc",
            FeatureKind::OnsetStrength => "onset_strength",
            FeatureKind::ChromaCentroid => "chroma_centroid",
            FeatureKind::RmsEnergy => "rms_energy",
            FeatureKind::MelEmbedding => "mel_embedding",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-frame feature vectors for one track.
#[derive(Debug, Clone)]
pub struct FeatureSeries {
    pub kind: FeatureKind,
    pub role: TrackRole,
    pub sample_rate: u32,
    /// Hop between frames in samples.
    pub hop_samples: usize,
    /// Frame-major: `frames[t][c]`.
    pub frames: Vec<Vec<f64>>,
}

impl FeatureSeries {
    pub fn hop_seconds(&self) -> f64 {
        self.hop_samples as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn coefficients(&self) -> usize {
        self.frames.first().map(Vec::len).unwrap_or(0)
    }

    /// Collapse frames `[start, end)` to one correlatable signal.
    ///
    /// Each coefficient track is z-scored over the range and the tracks are
    /// summed with descending weights, so low-order coefficients dominate.
    /// Constant tracks contribute nothing.
    pub fn weighted_signal(&self, start: usize, end: usize) -> Vec<f64> {
        let end = end.min(self.frames.len());
        let start = start.min(end);
        let frames = &self.frames[start..end];
        let mut signal = vec![0.0; frames.len()];
        if frames.is_empty() {
            return signal;
        }

        let n = frames.len() as f64;
        for c in 0..self.coefficients() {
            let mean = frames.iter().map(|f| f[c]).sum::<f64>() / n;
            let var = frames.iter().map(|f| (f[c] - mean).powi(2)).sum::<f64>() / n;
            let std = var.sqrt();
            if std < 1e-12 {
                continue;
            }
            let weight = 1.0 / (1.0 + 0.25 * c as f64);
            for (out, frame) in signal.iter_mut().zip(frames) {
                *out += weight * (frame[c] - mean) / std;
            }
        }

        signal
    }
}

/// STFT and feature parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub n_mfcc: usize,
    /// Hop of the embedding series in seconds.
    pub embedding_hop_seconds: f64,
    /// Pooling window of the embedding series in seconds.
    pub embedding_window_seconds: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            n_fft: 2048,
            hop_length: 512,
            n_mels: 40,
            n_mfcc: 13,
            embedding_hop_seconds: 0.25,
            embedding_window_seconds: 0.5,
        }
    }
}

/// Triangular mel filter stored sparsely from its first non-zero bin.
struct MelFilter {
    start_bin: usize,
    weights: Vec<f64>,
}

impl MelFilter {
    fn apply(&self, power: &[f64]) -> f64 {
        power[self.start_bin..]
            .iter()
            .zip(&self.weights)
            .map(|(p, w)| p * w)
            .sum()
    }
}

/// Extracts [`FeatureSeries`] from raw samples.
pub struct FeatureExtractor {
    config: FeatureConfig,
    planner: Mutex<FftPlanner<f64>>,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        Self {
            config,
            planner: Mutex::new(FftPlanner::new()),
        }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Extract one feature series.
    ///
    /// # Arguments
    /// * `samples` - Mono samples of the whole track
    /// * `sample_rate` - Sample rate in Hz
    /// * `kind` - Feature to compute
    /// * `role` - Track role recorded on the series
    ///
    /// # Returns
    /// The series, or `Decode` for empty input or a zero sample rate.
    pub fn extract(
        &self,
        samples: &[f64],
        sample_rate: u32,
        kind: FeatureKind,
        role: TrackRole,
    ) -> AnalysisResult<FeatureSeries> {
        if samples.is_empty() {
            return Err(AnalysisError::Decode(format!(
                "cannot extract {} from empty {} audio",
                kind, role
            )));
        }
        if sample_rate == 0 {
            return Err(AnalysisError::Decode(format!(
                "cannot extract {} at a zero sample rate",
                kind
            )));
        }

        let (frames, hop_samples) = match kind {
            FeatureKind::RmsEnergy => (self.rms_frames(samples), self.config.hop_length),
            FeatureKind::ChromaCentroid => {
                (self.chroma_centroid(samples, sample_rate), self.config.hop_length)
            }
            FeatureKind::Mfcc => {
                let log_mel = self.log_mel(samples, sample_rate);
                (self.mfcc(&log_mel), self.config.hop_length)
            }
            FeatureKind::OnsetStrength => {
                let log_mel = self.log_mel(samples, sample_rate);
                (onset_strength(&log_mel), self.config.hop_length)
            }
            FeatureKind::MelEmbedding => {
                let log_mel = self.log_mel(samples, sample_rate);
                self.embedding(&log_mel, sample_rate)
            }
        };

        Ok(FeatureSeries {
            kind,
            role,
            sample_rate,
            hop_samples,
            frames,
        })
    }

    /// Number of centered frames covering `len` samples.
    fn frame_count(&self, len: usize) -> usize {
        len / self.config.hop_length + 1
    }

    /// Run a centered, zero-padded STFT and hand each frame's power spectrum to `visit`.
    fn for_each_power_frame<F>(&self, samples: &[f64], mut visit: F)
    where
        F: FnMut(usize, &[f64]),
    {
        let n_fft = self.config.n_fft;
        let half = n_fft / 2;
        let n_bins = half + 1;
        let window = hann_window(n_fft);
        let fft = self.planner.lock().plan_fft_forward(n_fft);

        let mut buffer = vec![Complex::new(0.0, 0.0); n_fft];
        let mut power = vec![0.0; n_bins];

        for frame in 0..self.frame_count(samples.len()) {
            let center = frame * self.config.hop_length;
            for (k, slot) in buffer.iter_mut().enumerate() {
                let value = (center + k)
                    .checked_sub(half)
                    .and_then(|idx| samples.get(idx))
                    .copied()
                    .unwrap_or(0.0);
                *slot = Complex::new(value * window[k], 0.0);
            }
            fft.process(&mut buffer);
            for (p, c) in power.iter_mut().zip(&buffer) {
                *p = c.norm_sqr();
            }
            visit(frame, &power);
        }
    }

    /// Log mel spectrogram, frame-major.
    fn log_mel(&self, samples: &[f64], sample_rate: u32) -> Vec<Vec<f64>> {
        let filters = mel_filterbank(self.config.n_fft, self.config.n_mels, sample_rate);
        let mut out = Vec::with_capacity(self.frame_count(samples.len()));
        self.for_each_power_frame(samples, |_, power| {
            out.push(
                filters
                    .iter()
                    .map(|f| f.apply(power).max(LOG_FLOOR).ln())
                    .collect(),
            );
        });
        out
    }

    /// DCT-II (orthonormal) of each log mel frame.
    fn mfcc(&self, log_mel: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let n_mels = self.config.n_mels;
        let n_mfcc = self.config.n_mfcc.min(n_mels);
        let basis: Vec<Vec<f64>> = (0..n_mfcc)
            .map(|k| {
                let scale = if k == 0 {
                    (1.0 / n_mels as f64).sqrt()
                } else {
                    (2.0 / n_mels as f64).sqrt()
                };
                (0..n_mels)
                    .map(|m| scale * (PI * k as f64 * (m as f64 + 0.5) / n_mels as f64).cos())
                    .collect()
            })
            .collect();

        log_mel
            .iter()
            .map(|frame| {
                basis
                    .iter()
                    .map(|row| row.iter().zip(frame).map(|(b, x)| b * x).sum())
                    .collect()
            })
            .collect()
    }

    /// Spectral centroid (normalized to Nyquist) followed by 12 chroma bins.
    fn chroma_centroid(&self, samples: &[f64], sample_rate: u32) -> Vec<Vec<f64>> {
        let n_fft = self.config.n_fft;
        let bin_hz = sample_rate as f64 / n_fft as f64;
        let nyquist = sample_rate as f64 / 2.0;
        let upper = CHROMA_MAX_HZ.min(nyquist);
        let pitch_class: Vec<Option<usize>> = (0..=n_fft / 2)
            .map(|bin| {
                let hz = bin as f64 * bin_hz;
                if hz < CHROMA_MIN_HZ || hz > upper {
                    return None;
                }
                let midi = 69.0 + 12.0 * (hz / 440.0).log2();
                Some((midi.round() as i64).rem_euclid(12) as usize)
            })
            .collect();

        let mut out = Vec::with_capacity(self.frame_count(samples.len()));
        self.for_each_power_frame(samples, |_, power| {
            let mut frame = vec![0.0; 13];
            let mut weighted = 0.0;
            let mut total = 0.0;
            for (bin, p) in power.iter().enumerate() {
                let mag = p.sqrt();
                weighted += bin as f64 * bin_hz * mag;
                total += mag;
                if let Some(pc) = pitch_class[bin] {
                    frame[1 + pc] += mag;
                }
            }
            frame[0] = if total > LOG_FLOOR {
                weighted / total / nyquist
            } else {
                0.0
            };
            let peak = frame[1..].iter().cloned().fold(0.0_f64, f64::max);
            if peak > LOG_FLOOR {
                for v in &mut frame[1..] {
                    *v /= peak;
                }
            }
            out.push(frame);
        });
        out
    }

    /// RMS of a hop-length window centered on each frame.
    fn rms_frames(&self, samples: &[f64]) -> Vec<Vec<f64>> {
        let hop = self.config.hop_length;
        let half = hop / 2;
        (0..self.frame_count(samples.len()))
            .map(|frame| {
                let center = frame * hop;
                let start = center.saturating_sub(half).min(samples.len());
                let end = (center + hop - half).min(samples.len());
                let window = &samples[start..end];
                let rms = if window.is_empty() {
                    0.0
                } else {
                    (window.iter().map(|s| s * s).sum::<f64>() / window.len() as f64).sqrt()
                };
                vec![rms]
            })
            .collect()
    }

    /// Mean log mel over pooled windows, L2-normalized per frame.
    fn embedding(&self, log_mel: &[Vec<f64>], sample_rate: u32) -> (Vec<Vec<f64>>, usize) {
        let stft_hop = self.config.hop_length as f64 / sample_rate as f64;
        let hop_frames = ((self.config.embedding_hop_seconds / stft_hop).round() as usize).max(1);
        let half_window =
            ((self.config.embedding_window_seconds / stft_hop / 2.0).round() as usize).max(1);

        let count = log_mel.len().div_ceil(hop_frames);
        let n_mels = self.config.n_mels;
        let frames = (0..count)
            .map(|e| {
                let center = e * hop_frames;
                let start = center.saturating_sub(half_window);
                let end = (center + half_window).min(log_mel.len());
                let mut pooled = vec![0.0; n_mels];
                for frame in &log_mel[start..end] {
                    for (acc, v) in pooled.iter_mut().zip(frame) {
                        *acc += v;
                    }
                }
                let n = (end - start).max(1) as f64;
                let mean_level = pooled.iter().sum::<f64>() / (n * n_mels as f64);
                for v in &mut pooled {
                    *v = *v / n - mean_level;
                }
                let norm = pooled.iter().map(|v| v * v).sum::<f64>().sqrt();
                if norm > LOG_FLOOR {
                    for v in &mut pooled {
                        *v /= norm;
                    }
                }
                pooled
            })
            .collect();

        (frames, hop_frames * self.config.hop_length)
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(FeatureConfig::default())
    }
}

/// Half-wave rectified frame-to-frame increase in log mel energy.
fn onset_strength(log_mel: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut out = Vec::with_capacity(log_mel.len());
    out.push(vec![0.0]);
    for pair in log_mel.windows(2) {
        let flux: f64 = pair[1]
            .iter()
            .zip(&pair[0])
            .map(|(cur, prev)| (cur - prev).max(0.0))
            .sum();
        out.push(vec![flux]);
    }
    out.truncate(log_mel.len());
    out
}

/// Non-overlapping RMS envelope with `window` samples per value.
///
/// A trailing partial window is kept.
pub fn rms_envelope(samples: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    samples
        .chunks(window)
        .map(|w| (w.iter().map(|s| s * s).sum::<f64>() / w.len() as f64).sqrt())
        .collect()
}

/// Hann window of the given length.
pub fn hann_window(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / size as f64).cos()))
        .collect()
}

fn hz_to_mel(hz: f64) -> f64 {
    1127.0 * (1.0 + hz / 700.0).ln()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * ((mel / 1127.0).exp() - 1.0)
}

/// Slaney-normalized triangular mel filters from 0 Hz to Nyquist.
fn mel_filterbank(n_fft: usize, n_mels: usize, sample_rate: u32) -> Vec<MelFilter> {
    let n_bins = n_fft / 2 + 1;
    let mel_max = hz_to_mel(sample_rate as f64 / 2.0);

    let hz_points: Vec<f64> = (0..=n_mels + 1)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();
    let bin_points: Vec<f64> = hz_points
        .iter()
        .map(|hz| hz * n_fft as f64 / sample_rate as f64)
        .collect();

    (0..n_mels)
        .map(|i| {
            let (lo, mid, hi) = (bin_points[i], bin_points[i + 1], bin_points[i + 2]);
            let bandwidth = hz_points[i + 2] - hz_points[i];
            let norm = if bandwidth > 0.0 { 2.0 / bandwidth } else { 0.0 };

            let start_bin = (lo.ceil() as usize).min(n_bins - 1);
            let end_bin = (hi.floor() as usize).min(n_bins - 1);
            let weights = (start_bin..=end_bin)
                .map(|j| {
                    let bin = j as f64;
                    let w = if bin < mid {
                        (bin - lo) / (mid - lo).max(LOG_FLOOR)
                    } else {
                        (hi - bin) / (hi - mid).max(LOG_FLOOR)
                    };
                    w.max(0.0) * norm
                })
                .collect();

            MelFilter { start_bin, weights }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f64, secs: f64, sr: u32) -> Vec<f64> {
        let n = (secs * sr as f64) as usize;
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / sr as f64).sin())
            .collect()
    }

    #[test]
    fn frames_are_centered_on_hop_multiples() {
        let extractor = FeatureExtractor::default();
        let samples = tone(440.0, 1.0, 8000);
        let series = extractor
            .extract(&samples, 8000, FeatureKind::Mfcc, TrackRole::Master)
            .unwrap();

        assert_eq!(series.len(), 8000 / 512 + 1);
        assert_eq!(series.coefficients(), 13);
        assert!((series.hop_seconds() - 0.064).abs() < 1e-12);
    }

    #[test]
    fn empty_input_is_a_decode_error() {
        let extractor = FeatureExtractor::default();
        let result = extractor.extract(&[], 8000, FeatureKind::OnsetStrength, TrackRole::Dub);
        assert!(matches!(result, Err(AnalysisError::Decode(_))));
    }

    #[test]
    fn onset_strength_peaks_at_note_start() {
        let sr = 8000;
        let mut samples = vec![0.0; 4000];
        samples.extend(tone(660.0, 0.5, sr));
        let extractor = FeatureExtractor::default();
        let series = extractor
            .extract(&samples, sr, FeatureKind::OnsetStrength, TrackRole::Master)
            .unwrap();

        let peak = series
            .frames
            .iter()
            .enumerate()
            .max_by(|a, b| a.1[0].total_cmp(&b.1[0]))
            .map(|(i, _)| i)
            .unwrap();
        let onset_frame = 4000 / 512;
        assert!((peak as isize - onset_frame as isize).abs() <= 3, "peak at {}", peak);
    }

    #[test]
    fn chroma_finds_pitch_class_of_a440() {
        let extractor = FeatureExtractor::default();
        let samples = tone(440.0, 1.0, 16000);
        let series = extractor
            .extract(&samples, 16000, FeatureKind::ChromaCentroid, TrackRole::Master)
            .unwrap();

        let mid = &series.frames[series.len() / 2];
        // Chroma index 9 is A when C is index 0 (MIDI 69 % 12 == 9).
        let strongest = (1..13).max_by(|&a, &b| mid[a].total_cmp(&mid[b])).unwrap() - 1;
        assert_eq!(strongest, 9);
        assert!(mid[0] > 0.0 && mid[0] < 0.2);
    }

    #[test]
    fn embedding_uses_quarter_second_hop() {
        let extractor = FeatureExtractor::default();
        let samples = tone(300.0, 4.0, 16000);
        let series = extractor
            .extract(&samples, 16000, FeatureKind::MelEmbedding, TrackRole::Dub)
            .unwrap();

        assert!((series.hop_seconds() - 0.256).abs() < 1e-9);
        assert_eq!(series.coefficients(), 40);
    }

    #[test]
    fn rms_envelope_keeps_partial_window() {
        let env = rms_envelope(&[1.0, 1.0, 1.0, 2.0, 2.0], 3);
        assert_eq!(env.len(), 2);
        assert!((env[0] - 1.0).abs() < 1e-12);
        assert!((env[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn weighted_signal_ignores_constant_coefficients() {
        let series = FeatureSeries {
            kind: FeatureKind::RmsEnergy,
            role: TrackRole::Master,
            sample_rate: 1000,
            hop_samples: 10,
            frames: vec![vec![1.0, 5.0], vec![3.0, 5.0], vec![1.0, 5.0], vec![3.0, 5.0]],
        };
        let signal = series.weighted_signal(0, 4);
        assert_eq!(signal, vec![-1.0, 1.0, -1.0, 1.0]);
    }
}
