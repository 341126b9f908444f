//! Coarse pre-alignment over whole-file energy envelopes.
//!
//! Long files can be offset by far more than a chunk can see. A cheap RMS
//! envelope correlation finds the gross offset first; when it is confident
//! enough, chunk analysis searches only around it.

use serde::{Deserialize, Serialize};

use super::correlation::{CorrelationOutcome, CorrelationWindow, PairwiseCorrelator};
use super::features::rms_envelope;
use super::types::{AnalysisError, AnalysisResult, AudioTrack};

/// Coarse pre-alignment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoarseConfig {
    /// RMS window length in seconds.
    pub window_seconds: f64,
    /// Confidence at or above which the estimate guides chunk analysis.
    pub min_confidence: f64,
    /// Shortest file (seconds) for which the stage runs at all.
    pub min_duration_seconds: f64,
}

impl Default for CoarseConfig {
    fn default() -> Self {
        Self {
            window_seconds: 0.1,
            min_confidence: 0.2,
            min_duration_seconds: 60.0,
        }
    }
}

/// Whole-file offset estimate from the envelope correlation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoarseEstimate {
    pub offset_seconds: f64,
    pub confidence: f64,
    /// Whether the estimate passed the confidence gate and is used as a guide.
    pub accepted: bool,
    pub window_seconds: f64,
}

impl CoarseEstimate {
    /// The offset to guide chunks with, if the estimate was accepted.
    pub fn guide(&self) -> Option<f64> {
        self.accepted.then_some(self.offset_seconds)
    }
}

/// Runs the coarse envelope correlation.
pub struct CoarsePreAligner<'a> {
    config: CoarseConfig,
    correlator: &'a PairwiseCorrelator,
}

impl<'a> CoarsePreAligner<'a> {
    pub fn new(config: CoarseConfig, correlator: &'a PairwiseCorrelator) -> Self {
        Self { config, correlator }
    }

    /// Whether a file of this duration gets a coarse pass.
    pub fn should_run(&self, duration_secs: f64) -> bool {
        duration_secs >= self.config.min_duration_seconds
    }

    /// Estimate the gross offset between two tracks.
    ///
    /// # Returns
    /// The estimate with `accepted` set from the confidence gate, or
    /// `InsufficientSignal` when either envelope has no variation.
    pub fn estimate(&self, master: &AudioTrack, dub: &AudioTrack) -> AnalysisResult<CoarseEstimate> {
        let (hop_seconds, master_env, dub_env) = self.envelopes(master, dub)?;

        let outcome = self.correlator.correlate(
            &standardize(&master_env)?,
            &standardize(&dub_env)?,
            CorrelationWindow::aligned(hop_seconds),
        )?;

        Ok(self.gate("Coarse envelope correlation", outcome, hop_seconds))
    }

    /// Estimate the offset of one stretch of the master against the whole dub.
    ///
    /// Used after drift is seen, when a single whole-file offset no longer
    /// describes every part of the pair.
    ///
    /// # Arguments
    /// * `start_secs`, `end_secs` - Master region, clamped to the track
    pub fn estimate_region(
        &self,
        master: &AudioTrack,
        dub: &AudioTrack,
        start_secs: f64,
        end_secs: f64,
    ) -> AnalysisResult<CoarseEstimate> {
        let (hop_seconds, master_env, dub_env) = self.envelopes(master, dub)?;

        let to_frame = |secs: f64| ((secs / hop_seconds).round().max(0.0) as usize).min(master_env.len());
        let (lo, hi) = (to_frame(start_secs), to_frame(end_secs));
        if hi <= lo {
            return Err(AnalysisError::InsufficientSignal(format!(
                "region {:.1}s..{:.1}s is outside the master",
                start_secs, end_secs
            )));
        }

        let window = CorrelationWindow {
            hop_seconds,
            origin_seconds: -(lo as f64) * hop_seconds,
            guide: None,
        };
        let outcome = self.correlator.correlate(
            &standardize(&master_env[lo..hi])?,
            &standardize(&dub_env)?,
            window,
        )?;

        Ok(self.gate(
            &format!("Envelope correlation {:.1}s..{:.1}s", start_secs, end_secs),
            outcome,
            hop_seconds,
        ))
    }

    fn envelopes(
        &self,
        master: &AudioTrack,
        dub: &AudioTrack,
    ) -> AnalysisResult<(f64, Vec<f64>, Vec<f64>)> {
        if master.sample_rate() != dub.sample_rate() {
            return Err(AnalysisError::Correlation(
                "coarse alignment needs matching sample rates".to_string(),
            ));
        }

        let window = ((self.config.window_seconds * master.sample_rate() as f64).round() as usize).max(1);
        let hop_seconds = window as f64 / master.sample_rate() as f64;
        Ok((
            hop_seconds,
            rms_envelope(master.samples(), window),
            rms_envelope(dub.samples(), window),
        ))
    }

    fn gate(&self, label: &str, outcome: CorrelationOutcome, hop_seconds: f64) -> CoarseEstimate {
        let accepted = outcome.confidence >= self.config.min_confidence;
        tracing::debug!(
            "{}: {:+.3}s (confidence {:.3}, {})",
            label,
            outcome.offset_seconds,
            outcome.confidence,
            if accepted { "accepted" } else { "rejected" }
        );

        CoarseEstimate {
            offset_seconds: outcome.offset_seconds,
            confidence: outcome.confidence,
            accepted,
            window_seconds: hop_seconds,
        }
    }
}

/// Z-score an envelope; a flat envelope is insufficient signal.
fn standardize(envelope: &[f64]) -> AnalysisResult<Vec<f64>> {
    let n = envelope.len() as f64;
    if envelope.len() < 2 {
        return Err(AnalysisError::InsufficientSignal(
            "envelope too short for coarse alignment".to_string(),
        ));
    }

    let mean = envelope.iter().sum::<f64>() / n;
    let std = (envelope.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std < 1e-9 {
        return Err(AnalysisError::InsufficientSignal(
            "energy envelope is flat".to_string(),
        ));
    }

    Ok(envelope.iter().map(|v| (v - mean) / std).collect())
}
