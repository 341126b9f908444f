//! Core types for offset analysis.
//!
//! Sign convention used by every type in this module and everything built on
//! top of it: a **positive** offset means the dub is behind the master (dub
//! content has to move later to line up), a negative offset means the dub is
//! ahead.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::features::FeatureKind;

/// Offsets with a magnitude below this are reported as "in sync".
const IN_SYNC_EPSILON_SECS: f64 = 0.0005;

/// Resolutions coarser than this stop counting as frame-hop precision.
const FRAME_HOP_LIMIT_SECS: f64 = 0.15;

/// Which side of a pair a track belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackRole {
    /// Reference track.
    Master,
    /// Track being checked against the master.
    Dub,
}

impl TrackRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackRole::Master => "master",
            TrackRole::Dub => "dub",
        }
    }
}

impl fmt::Display for TrackRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded, channel-reduced audio for one side of a pair.
///
/// Immutable once constructed; the session that loaded it owns it.
#[derive(Debug, Clone)]
pub struct AudioTrack {
    role: TrackRole,
    samples: Vec<f64>,
    sample_rate: u32,
    duration_secs: f64,
}

impl AudioTrack {
    /// Create a track from mono samples.
    ///
    /// Fails with [`AnalysisError::Decode`] when the buffer is empty or the
    /// sample rate is zero.
    pub fn new(role: TrackRole, samples: Vec<f64>, sample_rate: u32) -> AnalysisResult<Self> {
        if sample_rate == 0 {
            return Err(AnalysisError::Decode(format!(
                "{} track has a non-positive sample rate",
                role
            )));
        }
        if samples.is_empty() {
            return Err(AnalysisError::Decode(format!("{} track is empty", role)));
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(AnalysisError::Decode(format!(
                "{} track contains non-finite samples",
                role
            )));
        }

        let duration_secs = samples.len() as f64 / sample_rate as f64;
        Ok(Self {
            role,
            samples,
            sample_rate,
            duration_secs,
        })
    }

    pub fn role(&self) -> TrackRole {
        self.role
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples between two times, clipped to the track bounds.
    pub fn segment(&self, start_secs: f64, end_secs: f64) -> &[f64] {
        let rate = self.sample_rate as f64;
        let start = ((start_secs.max(0.0) * rate).round() as usize).min(self.samples.len());
        let end = ((end_secs.max(0.0) * rate).round() as usize).clamp(start, self.samples.len());
        &self.samples[start..end]
    }

    /// Root-mean-square level of the whole track.
    pub fn rms(&self) -> f64 {
        let energy: f64 = self.samples.iter().map(|s| s * s).sum();
        (energy / self.samples.len() as f64).sqrt()
    }
}

/// Resolution ceiling of a detection method, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionClass {
    /// Window/embedding methods; resolution is their analysis hop (hundreds of ms).
    CoarseWindow,
    /// Cepstral, onset and spectral methods; resolution is the feature hop.
    FrameHop,
    /// Raw waveform correlation; resolution is one sample.
    SampleAccurate,
}

impl PrecisionClass {
    /// Classify a lag resolution measured at the given sample rate.
    pub fn from_resolution(resolution_secs: f64, sample_rate: u32) -> Self {
        let sample_period = 1.0 / sample_rate.max(1) as f64;
        if resolution_secs <= sample_period * 1.5 {
            PrecisionClass::SampleAccurate
        } else if resolution_secs <= FRAME_HOP_LIMIT_SECS {
            PrecisionClass::FrameHop
        } else {
            PrecisionClass::CoarseWindow
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PrecisionClass::CoarseWindow => "coarse_window",
            PrecisionClass::FrameHop => "frame_hop",
            PrecisionClass::SampleAccurate => "sample_accurate",
        }
    }
}

impl fmt::Display for PrecisionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Independent offset detection methods.
///
/// The set is closed and precision-ordered; there is no plugin registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// MFCC correlation.
    Cepstral,
    /// Onset-strength envelope correlation.
    Onset,
    /// Chroma + spectral centroid correlation.
    Spectral,
    /// Raw waveform correlation at the full sample rate.
    RawCorrelation,
    /// Pooled log-mel window embedding alignment.
    Embedding,
}

impl Method {
    pub const ALL: [Method; 5] = [
        Method::RawCorrelation,
        Method::Cepstral,
        Method::Onset,
        Method::Spectral,
        Method::Embedding,
    ];

    /// Nominal precision of the method at typical analysis sample rates.
    pub fn precision_class(&self) -> PrecisionClass {
        match self {
            Method::RawCorrelation => PrecisionClass::SampleAccurate,
            Method::Cepstral | Method::Onset | Method::Spectral => PrecisionClass::FrameHop,
            Method::Embedding => PrecisionClass::CoarseWindow,
        }
    }

    /// Feature representation the method correlates, `None` for raw samples.
    pub fn feature_kind(&self) -> Option<FeatureKind> {
        match self {
            Method::Cepstral => Some(FeatureKind::Mfcc),
            Method::Onset => Some(FeatureKind::OnsetStrength),
            Method::Spectral => Some(FeatureKind::ChromaCentroid),
            Method::Embedding => Some(FeatureKind::MelEmbedding),
            Method::RawCorrelation => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Cepstral => "cepstral",
            Method::Onset => "onset",
            Method::Spectral => "spectral",
            Method::RawCorrelation => "raw_correlation",
            Method::Embedding => "embedding",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cepstral" | "mfcc" => Ok(Method::Cepstral),
            "onset" => Ok(Method::Onset),
            "spectral" | "chroma" => Ok(Method::Spectral),
            "raw" | "raw_correlation" | "waveform" => Ok(Method::RawCorrelation),
            "embedding" => Ok(Method::Embedding),
            other => Err(AnalysisError::Config(format!("unknown method '{}'", other))),
        }
    }
}

/// Overall trust level attached to every result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Unreliable,
    Poor,
    Fair,
    Good,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Unreliable => "unreliable",
            Quality::Poor => "poor",
            Quality::Fair => "fair",
            Quality::Good => "good",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One method's offset estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetEstimate {
    pub method: Method,
    /// Signed offset in seconds; positive = dub behind master.
    pub offset_seconds: f64,
    /// Confidence in 0..=1.
    pub confidence: f64,
    pub precision_class: PrecisionClass,
    /// Lag resolution of the measurement in seconds.
    pub resolution_seconds: f64,
}

impl OffsetEstimate {
    pub fn new(
        method: Method,
        offset_seconds: f64,
        confidence: f64,
        resolution_seconds: f64,
        sample_rate: u32,
    ) -> Self {
        Self {
            method,
            offset_seconds,
            confidence: confidence.clamp(0.0, 1.0),
            precision_class: PrecisionClass::from_resolution(resolution_seconds, sample_rate),
            resolution_seconds,
        }
    }

    /// Copy of this estimate with a different confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// User-facing description of the offset.
    pub fn statement(&self) -> String {
        offset_statement(self.offset_seconds)
    }
}

/// Render a signed offset as a sentence.
///
/// Every report path goes through here so the wording can never disagree
/// with the sign of the number.
pub fn offset_statement(offset_seconds: f64) -> String {
    if offset_seconds.abs() < IN_SYNC_EPSILON_SECS {
        "dub is in sync with master".to_string()
    } else if offset_seconds > 0.0 {
        format!("dub is behind master by {:.3}s", offset_seconds)
    } else {
        format!("dub is ahead of master by {:.3}s", -offset_seconds)
    }
}

/// Which analysis pass produced a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkPass {
    Coarse,
    Refine,
}

/// Analysis window over the master timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub pass: ChunkPass,
}

impl Chunk {
    pub fn duration_secs(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn midpoint_secs(&self) -> f64 {
        (self.start_time + self.end_time) / 2.0
    }
}

/// Error types for analysis operations.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// Bad or empty audio input. Fatal for the pair.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Audio too short or silent for meaningful correlation.
    #[error("Insufficient signal: {0}")]
    InsufficientSignal(String),

    /// A single correlation could not be computed.
    #[error("Correlation failed: {0}")]
    Correlation(String),

    /// Invalid analysis configuration.
    #[error("Invalid analysis configuration: {0}")]
    Config(String),

    /// Analysis was cancelled at a chunk boundary.
    #[error("Analysis cancelled")]
    Cancelled,
}

/// Type alias for analysis results.
pub type AnalysisResult<T> = Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_track_rejects_empty_buffer() {
        let result = AudioTrack::new(TrackRole::Master, vec![], 48000);
        assert!(matches!(result, Err(AnalysisError::Decode(_))));
    }

    #[test]
    fn audio_track_rejects_zero_sample_rate() {
        let result = AudioTrack::new(TrackRole::Dub, vec![0.1; 10], 0);
        assert!(matches!(result, Err(AnalysisError::Decode(_))));
    }

    #[test]
    fn segment_is_clipped_to_track() {
        let samples: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let track = AudioTrack::new(TrackRole::Master, samples, 1000).unwrap();

        let seg = track.segment(0.25, 0.5);
        assert_eq!(seg.len(), 250);
        assert_eq!(seg[0], 250.0);

        assert_eq!(track.segment(0.9, 5.0).len(), 100);
        assert!(track.segment(2.0, 3.0).is_empty());
    }

    #[test]
    fn precision_classes_are_ordered() {
        assert!(PrecisionClass::SampleAccurate > PrecisionClass::FrameHop);
        assert!(PrecisionClass::FrameHop > PrecisionClass::CoarseWindow);
    }

    #[test]
    fn precision_class_follows_resolution() {
        assert_eq!(
            PrecisionClass::from_resolution(1.0 / 48000.0, 48000),
            PrecisionClass::SampleAccurate
        );
        assert_eq!(
            PrecisionClass::from_resolution(512.0 / 48000.0, 48000),
            PrecisionClass::FrameHop
        );
        assert_eq!(
            PrecisionClass::from_resolution(0.5, 48000),
            PrecisionClass::CoarseWindow
        );
    }

    #[test]
    fn statement_follows_sign() {
        assert_eq!(offset_statement(1.25), "dub is behind master by 1.250s");
        assert_eq!(offset_statement(-0.5), "dub is ahead of master by 0.500s");
        assert_eq!(offset_statement(0.0001), "dub is in sync with master");
    }

    #[test]
    fn method_parses_aliases() {
        assert_eq!("mfcc".parse::<Method>().unwrap(), Method::Cepstral);
        assert_eq!("RAW".parse::<Method>().unwrap(), Method::RawCorrelation);
        assert!("wavelet".parse::<Method>().is_err());
    }

    #[test]
    fn method_serializes_snake_case() {
        let json = serde_json::to_string(&Method::RawCorrelation).unwrap();
        assert_eq!(json, "\"raw_correlation\"");
        let json = serde_json::to_string(&PrecisionClass::SampleAccurate).unwrap();
        assert_eq!(json, "\"sample_accurate\"");
    }
}
