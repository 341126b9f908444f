//! Single chunk, single method measurement.
//!
//! Maps a chunk of the master timeline onto index windows of the cached
//! series (or raw samples), positions the dub window around the expected
//! offset and runs one correlation.

use super::correlation::{CorrelationPeak, CorrelationWindow, PairwiseCorrelator, SearchGuide};
use super::features::FeatureSeries;
use super::types::{AnalysisError, AnalysisResult, AudioTrack, Chunk, Method, OffsetEstimate};

/// Fewest values a window may hold and still be correlated.
const MIN_WINDOW_VALUES: usize = 8;

/// Data a method correlates for one pair.
#[derive(Debug, Clone, Copy)]
pub enum MethodInput<'a> {
    /// Whole-track feature series of the same kind.
    Features {
        master: &'a FeatureSeries,
        dub: &'a FeatureSeries,
    },
    /// Raw samples.
    Waveform {
        master: &'a AudioTrack,
        dub: &'a AudioTrack,
    },
}

impl MethodInput<'_> {
    fn hop_seconds(&self) -> f64 {
        match self {
            MethodInput::Features { master, .. } => master.hop_seconds(),
            MethodInput::Waveform { master, .. } => 1.0 / master.sample_rate() as f64,
        }
    }

    fn sample_rate(&self) -> u32 {
        match self {
            MethodInput::Features { master, .. } => master.sample_rate,
            MethodInput::Waveform { master, .. } => master.sample_rate(),
        }
    }

    fn lengths(&self) -> (usize, usize) {
        match self {
            MethodInput::Features { master, dub } => (master.len(), dub.len()),
            MethodInput::Waveform { master, dub } => (master.len(), dub.len()),
        }
    }

    fn check(&self) -> AnalysisResult<()> {
        let matched = match self {
            MethodInput::Features { master, dub } => {
                master.hop_samples == dub.hop_samples
                    && master.sample_rate == dub.sample_rate
                    && master.kind == dub.kind
            }
            MethodInput::Waveform { master, dub } => master.sample_rate() == dub.sample_rate(),
        };
        if matched {
            Ok(())
        } else {
            Err(AnalysisError::Correlation(
                "master and dub inputs are not on the same grid".to_string(),
            ))
        }
    }

    fn master_window(&self, start: usize, end: usize) -> Vec<f64> {
        match self {
            MethodInput::Features { master, .. } => master.weighted_signal(start, end),
            MethodInput::Waveform { master, .. } => master.samples()[start..end].to_vec(),
        }
    }

    fn dub_window(&self, start: usize, end: usize) -> Vec<f64> {
        match self {
            MethodInput::Features { dub, .. } => dub.weighted_signal(start, end),
            MethodInput::Waveform { dub, .. } => dub.samples()[start..end].to_vec(),
        }
    }
}

/// Raw result of one chunk measurement, before content weighting.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeasurement {
    /// Offset estimate; confidence is the raw correlation peak magnitude.
    pub estimate: OffsetEstimate,
    pub peak: CorrelationPeak,
    /// Guide offset the search was centered on, if any.
    pub guide_seconds: Option<f64>,
}

/// Measures one chunk with one method.
pub struct ChunkAnalyzer<'a> {
    correlator: &'a PairwiseCorrelator,
    /// Half-width of the range a guide vouches for, in seconds.
    search_radius_seconds: f64,
}

impl<'a> ChunkAnalyzer<'a> {
    pub fn new(correlator: &'a PairwiseCorrelator, search_radius_seconds: f64) -> Self {
        Self {
            correlator,
            search_radius_seconds,
        }
    }

    /// Measure the offset of one chunk.
    ///
    /// # Arguments
    /// * `chunk` - Window of the master timeline
    /// * `method` - Method being measured
    /// * `input` - Series or samples for the method
    /// * `guide` - Expected offset; the dub window is centered on it and peaks
    ///   within the search radius of it are preferred
    ///
    /// # Returns
    /// The measurement, or an error when the window is too short to
    /// correlate or carries no signal.
    pub fn analyze(
        &self,
        chunk: &Chunk,
        method: Method,
        input: MethodInput<'_>,
        guide: Option<f64>,
    ) -> AnalysisResult<ChunkMeasurement> {
        input.check()?;

        let hop = input.hop_seconds();
        let (master_len, dub_len) = input.lengths();
        let to_index = |secs: f64, len: usize| ((secs / hop).round().max(0.0) as usize).min(len);

        let m_start = to_index(chunk.start_time, master_len);
        let m_end = to_index(chunk.end_time, master_len);
        if m_end.saturating_sub(m_start) < MIN_WINDOW_VALUES {
            return Err(AnalysisError::InsufficientSignal(format!(
                "chunk {} is too short for {}",
                chunk.index, method
            )));
        }

        let shift = guide.unwrap_or(0.0);
        let margin = match guide {
            Some(_) => self.search_radius_seconds.max(chunk.duration_secs() / 2.0),
            None => chunk.duration_secs() / 2.0,
        };
        let d_start = to_index(chunk.start_time + shift - margin, dub_len);
        let d_end = to_index(chunk.end_time + shift + margin, dub_len);
        if d_end.saturating_sub(d_start) < MIN_WINDOW_VALUES {
            return Err(AnalysisError::InsufficientSignal(format!(
                "dub has no audio near chunk {} for {}",
                chunk.index, method
            )));
        }

        let window = CorrelationWindow {
            hop_seconds: hop,
            origin_seconds: (d_start as f64 - m_start as f64) * hop,
            guide: guide.map(|offset_seconds| SearchGuide {
                offset_seconds,
                radius_seconds: self.search_radius_seconds,
            }),
        };

        let outcome = self.correlator.correlate(
            &input.master_window(m_start, m_end),
            &input.dub_window(d_start, d_end),
            window,
        )?;

        Ok(ChunkMeasurement {
            estimate: OffsetEstimate::new(
                method,
                outcome.offset_seconds,
                outcome.confidence,
                hop,
                input.sample_rate(),
            ),
            peak: outcome.peak,
            guide_seconds: guide,
        })
    }
}
