//! Per-chunk content classification.
//!
//! Labels a chunk as dialogue, music, silence or mixed from cheap signal
//! statistics. The label scales method confidences and tightens the
//! reliability bar on silence; it never removes a chunk.

use std::fmt;

use parking_lot::Mutex;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

use super::features::hann_window;
use super::types::Method;

const FLATNESS_FRAME: usize = 1024;
const FLATNESS_MAX_FRAMES: usize = 32;
/// Energy frame used for the variation statistic, in seconds.
const ENERGY_FRAME_SECS: f64 = 0.02;

/// Content label of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentClass {
    Dialogue,
    Music,
    Silence,
    Mixed,
}

impl ContentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentClass::Dialogue => "dialogue",
            ContentClass::Music => "music",
            ContentClass::Silence => "silence",
            ContentClass::Mixed => "mixed",
        }
    }
}

impl fmt::Display for ContentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics the classifier decides on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentStats {
    pub rms_db: f64,
    /// Coefficient of variation of short-frame energy.
    pub energy_variation: f64,
    /// Mean spectral flatness, 0 = tonal, 1 = white noise.
    pub spectral_flatness: f64,
    pub zero_crossing_rate: f64,
}

/// Classification thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Chunks quieter than this are silence.
    pub silence_db: f64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self { silence_db: -50.0 }
    }
}

/// Confidence multipliers per content class and method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentWeights {
    pub silence: f64,
    pub dialogue_cepstral: f64,
    pub music_onset: f64,
    pub music_spectral: f64,
    /// Extra confidence required of silence chunks to count as reliable.
    pub silence_reliability_margin: f64,
}

impl Default for ContentWeights {
    fn default() -> Self {
        Self {
            silence: 0.3,
            dialogue_cepstral: 1.2,
            music_onset: 1.2,
            music_spectral: 1.1,
            silence_reliability_margin: 0.2,
        }
    }
}

impl ContentWeights {
    /// Multiplier applied to a method's confidence on a chunk of this class.
    pub fn factor(&self, class: ContentClass, method: Method) -> f64 {
        match (class, method) {
            (ContentClass::Silence, _) => self.silence,
            (ContentClass::Dialogue, Method::Cepstral) => self.dialogue_cepstral,
            (ContentClass::Music, Method::Onset) => self.music_onset,
            (ContentClass::Music, Method::Spectral) => self.music_spectral,
            _ => 1.0,
        }
    }

    /// Confidence a chunk of this class must reach to be reliable.
    pub fn reliability_threshold(&self, base: f64, class: ContentClass) -> f64 {
        match class {
            ContentClass::Silence => base + self.silence_reliability_margin,
            _ => base,
        }
    }
}

/// Classifies chunks by content.
pub struct ContentClassifier {
    config: ContentConfig,
    planner: Mutex<FftPlanner<f64>>,
}

impl ContentClassifier {
    pub fn new(config: ContentConfig) -> Self {
        Self {
            config,
            planner: Mutex::new(FftPlanner::new()),
        }
    }

    pub fn config(&self) -> &ContentConfig {
        &self.config
    }

    /// Classify a chunk of master audio.
    pub fn classify(&self, samples: &[f64], sample_rate: u32) -> ContentClass {
        let stats = self.stats(samples, sample_rate);
        let class = if stats.rms_db < self.config.silence_db {
            ContentClass::Silence
        } else if stats.spectral_flatness > 0.45 {
            ContentClass::Mixed
        } else if stats.energy_variation >= 0.8
            && (0.02..=0.3).contains(&stats.zero_crossing_rate)
        {
            ContentClass::Dialogue
        } else if stats.energy_variation < 0.5 && stats.spectral_flatness < 0.3 {
            ContentClass::Music
        } else {
            ContentClass::Mixed
        };

        tracing::trace!(
            "Content {:?}: rms={:.1}dB var={:.2} flat={:.2} zcr={:.3}",
            class,
            stats.rms_db,
            stats.energy_variation,
            stats.spectral_flatness,
            stats.zero_crossing_rate
        );
        class
    }

    /// Compute classification statistics.
    pub fn stats(&self, samples: &[f64], sample_rate: u32) -> ContentStats {
        if samples.is_empty() {
            return ContentStats {
                rms_db: f64::NEG_INFINITY,
                energy_variation: 0.0,
                spectral_flatness: 0.0,
                zero_crossing_rate: 0.0,
            };
        }

        let mean_square = samples.iter().map(|s| s * s).sum::<f64>() / samples.len() as f64;
        let rms_db = 10.0 * mean_square.max(1e-20).log10();

        let crossings = samples
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();
        let zero_crossing_rate = crossings as f64 / samples.len().max(2).saturating_sub(1) as f64;

        ContentStats {
            rms_db,
            energy_variation: energy_variation(samples, sample_rate),
            spectral_flatness: self.spectral_flatness(samples),
            zero_crossing_rate,
        }
    }

    /// Mean spectral flatness over up to 32 evenly spaced frames.
    fn spectral_flatness(&self, samples: &[f64]) -> f64 {
        if samples.len() < FLATNESS_FRAME {
            return 0.0;
        }

        let window = hann_window(FLATNESS_FRAME);
        let fft = self.planner.lock().plan_fft_forward(FLATNESS_FRAME);
        let available = samples.len() - FLATNESS_FRAME + 1;
        let frames = FLATNESS_MAX_FRAMES.min(available);
        let stride = (available / frames).max(1);

        let mut buffer = vec![Complex::new(0.0, 0.0); FLATNESS_FRAME];
        let mut total = 0.0;
        let mut counted = 0usize;
        for f in 0..frames {
            let start = f * stride;
            for (slot, (s, w)) in buffer
                .iter_mut()
                .zip(samples[start..start + FLATNESS_FRAME].iter().zip(&window))
            {
                *slot = Complex::new(s * w, 0.0);
            }
            fft.process(&mut buffer);

            let power: Vec<f64> = buffer[1..=FLATNESS_FRAME / 2]
                .iter()
                .map(|c| c.norm_sqr() + 1e-12)
                .collect();
            let arithmetic = power.iter().sum::<f64>() / power.len() as f64;
            if arithmetic <= 1e-10 {
                continue;
            }
            let geometric = (power.iter().map(|p| p.ln()).sum::<f64>() / power.len() as f64).exp();
            total += geometric / arithmetic;
            counted += 1;
        }

        if counted == 0 {
            0.0
        } else {
            total / counted as f64
        }
    }
}

impl Default for ContentClassifier {
    fn default() -> Self {
        Self::new(ContentConfig::default())
    }
}

/// Coefficient of variation of 20 ms frame RMS.
fn energy_variation(samples: &[f64], sample_rate: u32) -> f64 {
    let frame = ((ENERGY_FRAME_SECS * sample_rate as f64) as usize).max(1);
    let levels: Vec<f64> = samples
        .chunks(frame)
        .map(|w| (w.iter().map(|s| s * s).sum::<f64>() / w.len() as f64).sqrt())
        .collect();
    let n = levels.len() as f64;
    let mean = levels.iter().sum::<f64>() / n;
    if mean <= 1e-12 {
        return 0.0;
    }
    let std = (levels.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n).sqrt();
    std / mean
}
