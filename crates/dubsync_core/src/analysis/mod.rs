//! Offset analysis between a master and a dub track.
//!
//! # Architecture
//!
//! A session composes the stages below. Each stage is usable on its own.
//!
//! 1. **Features** (`features`): MFCC, onset strength, chroma/centroid, RMS
//!    and pooled mel embeddings from an STFT.
//!
//! 2. **Correlation** (`correlation`): Full linear cross-correlation with
//!    per-lag normalization, tie-aware peak picking and sub-bin refinement.
//!
//! 3. **Coarse pre-alignment** (`coarse`): RMS-envelope correlation that
//!    guides chunk search on long files.
//!
//! 4. **Chunk planning** (`chunks`): Overlapping coarse chunks and the
//!    refinement windows placed over weak regions.
//!
//! 5. **Content weighting** (`content`): Dialogue/music/silence detection
//!    and per-method confidence factors.
//!
//! 6. **Drift** (`drift`): Per-method timelines, drift classification and
//!    method summaries.
//!
//! 7. **Consensus** (`consensus`): Precision-first selection of one offset.
//!
//! # Usage
//!
//! ```no_run
//! use dubsync_core::analysis::{analyze_pair, AnalysisConfig, AudioTrack, TrackRole};
//!
//! let master = AudioTrack::new(TrackRole::Master, vec![0.0; 22050 * 10], 22050).unwrap();
//! let dub = AudioTrack::new(TrackRole::Dub, vec![0.0; 22050 * 10], 22050).unwrap();
//! let result = analyze_pair(&master, &dub, &AnalysisConfig::default()).unwrap();
//! println!("{}", result.statement);
//! ```

mod chunk_analyzer;
mod chunks;
mod coarse;
mod config;
mod consensus;
mod content;
mod correlation;
mod drift;
mod features;
mod peak_fit;
mod session;
pub mod types;

pub use types::{
    offset_statement, AnalysisError, AnalysisResult, AudioTrack, Chunk, ChunkPass, Method,
    OffsetEstimate, PrecisionClass, Quality, TrackRole,
};

pub use chunk_analyzer::{ChunkAnalyzer, ChunkMeasurement, MethodInput};
pub use chunks::{merge_regions, ChunkPlanConfig, ChunkPlanner, TimeRegion};
pub use coarse::{CoarseConfig, CoarseEstimate, CoarsePreAligner};
pub use config::AnalysisConfig;
pub use consensus::{ConsensusResult, ConsensusSelector, DriftSummary};
pub use content::{ContentClass, ContentClassifier, ContentConfig, ContentStats, ContentWeights};
pub use correlation::{
    lag_to_offset_seconds, CorrelationOutcome, CorrelationPeak, CorrelationWindow,
    PairwiseCorrelator, SearchGuide, GUIDE_PREFERENCE,
};
pub use drift::{
    ChunkObservation, DriftAggregator, DriftConfig, DriftKind, DriftPoint, DriftTimeline,
    MethodSummary,
};
pub use features::{
    hann_window, rms_envelope, FeatureConfig, FeatureExtractor, FeatureKind, FeatureSeries,
};
pub use peak_fit::{fit_peak, FittedPeak};
pub use session::{analyze_pair, analyze_pair_with_cancel, AnalysisSession, CancelHandle};
