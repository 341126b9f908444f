//! Precision-first consensus across methods.
//!
//! Among the methods whose confidence clears the bar, the one with the best
//! precision class wins; confidence only breaks ties within a class. The
//! winner's offset is reported as-is, never averaged with coarser methods.

use serde::{Deserialize, Serialize};

use super::coarse::CoarseEstimate;
use super::drift::{DriftKind, DriftTimeline, MethodSummary};
use super::types::{offset_statement, Method, OffsetEstimate, Quality};

/// Drift fields of the final result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftSummary {
    pub has_drift: bool,
    pub magnitude_seconds: f64,
    pub kind: DriftKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
}

impl DriftSummary {
    fn none() -> Self {
        Self {
            has_drift: false,
            magnitude_seconds: 0.0,
            kind: DriftKind::Constant,
            rate: None,
        }
    }

    fn from_timeline(timeline: &DriftTimeline) -> Self {
        Self {
            has_drift: timeline.has_drift,
            magnitude_seconds: timeline.drift_magnitude,
            kind: timeline.drift_kind,
            rate: timeline.drift_rate,
        }
    }
}

/// Final result for one master/dub pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Chosen offset in seconds, `None` when no method was trustworthy.
    pub offset_seconds: Option<f64>,
    pub confidence: f64,
    pub quality: Quality,
    /// Method the offset came from.
    pub method: Option<Method>,
    /// Human-readable description of the offset.
    pub statement: String,
    pub drift: DriftSummary,
    /// Every method that produced an estimate, best precision first.
    pub per_method: Vec<OffsetEstimate>,
    pub chunks_analyzed: usize,
    pub reliable_chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coarse: Option<CoarseEstimate>,
    /// Timeline of the chosen method (or the most precise one attempted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline: Option<DriftTimeline>,
    /// Why the result is unreliable, when it is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ConsensusResult {
    /// Unreliable result with no offset.
    pub fn unreliable(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            offset_seconds: None,
            confidence: 0.0,
            quality: Quality::Unreliable,
            method: None,
            statement: format!("offset could not be determined: {}", reason),
            drift: DriftSummary::none(),
            per_method: Vec::new(),
            chunks_analyzed: 0,
            reliable_chunks: 0,
            coarse: None,
            timeline: None,
            reason: Some(reason),
        }
    }

    /// Whether an offset was reported at all.
    pub fn is_reliable(&self) -> bool {
        self.offset_seconds.is_some()
    }
}

/// Chooses the final offset from per-method summaries.
pub struct ConsensusSelector {
    min_confidence: f64,
}

impl ConsensusSelector {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    /// Pick the winning estimate.
    ///
    /// Estimates below the confidence bar are discarded. The rest are ranked
    /// by precision class, then confidence, then method order, so a more
    /// confident coarse method never beats a finer one.
    pub fn select<'e>(&self, estimates: &'e [OffsetEstimate]) -> Option<&'e OffsetEstimate> {
        estimates
            .iter()
            .filter(|e| e.confidence >= self.min_confidence)
            .max_by(|a, b| {
                a.precision_class
                    .cmp(&b.precision_class)
                    .then(a.confidence.total_cmp(&b.confidence))
                    .then(b.method.cmp(&a.method))
            })
    }

    /// Build the final result from per-method summaries.
    pub fn decide(
        &self,
        summaries: Vec<MethodSummary>,
        coarse: Option<CoarseEstimate>,
    ) -> ConsensusResult {
        let mut per_method: Vec<OffsetEstimate> =
            summaries.iter().filter_map(|s| s.estimate.clone()).collect();
        per_method.sort_by(|a, b| {
            b.precision_class
                .cmp(&a.precision_class)
                .then(a.method.cmp(&b.method))
        });

        let chosen = self.select(&per_method).cloned();

        let mut summaries = summaries;
        let reported = match &chosen {
            Some(winner) => summaries.iter().position(|s| s.method == winner.method),
            None => summaries
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.method
                        .precision_class()
                        .cmp(&b.method.precision_class())
                        .then(b.method.cmp(&a.method))
                })
                .map(|(i, _)| i),
        };
        let summary = reported.map(|i| summaries.swap_remove(i));

        let (chunks_analyzed, reliable_chunks, drift) = summary
            .as_ref()
            .map(|s| {
                (
                    s.timeline.chunks_analyzed(),
                    s.timeline.reliable_chunks(),
                    DriftSummary::from_timeline(&s.timeline),
                )
            })
            .unwrap_or((0, 0, DriftSummary::none()));

        match chosen {
            Some(winner) => {
                let quality = summary.as_ref().map_or(Quality::Fair, |s| s.quality);
                tracing::info!(
                    "Consensus: {} at {:+.4}s (confidence {:.3}, {})",
                    winner.method,
                    winner.offset_seconds,
                    winner.confidence,
                    winner.precision_class
                );
                ConsensusResult {
                    offset_seconds: Some(winner.offset_seconds),
                    confidence: winner.confidence,
                    quality,
                    method: Some(winner.method),
                    statement: offset_statement(winner.offset_seconds),
                    drift,
                    per_method,
                    chunks_analyzed,
                    reliable_chunks,
                    coarse,
                    timeline: summary.map(|s| s.timeline),
                    reason: None,
                }
            }
            None => {
                let confidence = per_method
                    .iter()
                    .map(|e| e.confidence)
                    .fold(0.0_f64, f64::max);
                let reason = if per_method.is_empty() {
                    "no method found a reliable chunk".to_string()
                } else {
                    format!(
                        "no method reached the minimum confidence of {:.2}",
                        self.min_confidence
                    )
                };
                tracing::warn!("Consensus: {}", reason);
                ConsensusResult {
                    confidence,
                    drift,
                    per_method,
                    chunks_analyzed,
                    reliable_chunks,
                    coarse,
                    timeline: summary.map(|s| s.timeline),
                    ..ConsensusResult::unreliable(reason)
                }
            }
        }
    }
}
