//! Per-method drift timelines and ensemble weighting.
//!
//! Collects chunk measurements for one method into a time-ordered timeline,
//! marks which chunks are reliable, and summarizes the timeline into one
//! offset estimate. Drift is the spread of reliable chunk offsets; its shape
//! (linear vs. stepped) is diagnosed with regression and 1-D clustering.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::chunk_analyzer::ChunkMeasurement;
use super::content::{ContentClass, ContentWeights};
use super::types::{Chunk, Method, OffsetEstimate, Quality};

/// Drift diagnosis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Ensemble confidence a chunk needs to be reliable.
    pub reliability_threshold: f64,
    /// Spread of reliable offsets (seconds) above which a file drifts.
    pub drift_tolerance_seconds: f64,
    /// R² at which a drifting timeline counts as linear.
    pub linear_r2_threshold: f64,
    /// Minimum points per DBSCAN cluster.
    pub min_cluster_samples: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            reliability_threshold: 0.3,
            drift_tolerance_seconds: 0.1,
            linear_r2_threshold: 0.9,
            min_cluster_samples: 2,
        }
    }
}

/// Shape of the offset timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// Offsets agree within tolerance.
    Constant,
    /// Offsets change steadily over time.
    Linear,
    /// Offsets jump between plateaus.
    Stepped,
}

impl fmt::Display for DriftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftKind::Constant => write!(f, "constant"),
            DriftKind::Linear => write!(f, "linear"),
            DriftKind::Stepped => write!(f, "stepped"),
        }
    }
}

/// Outcome of one chunk for one method, before weighting.
#[derive(Debug, Clone)]
pub struct ChunkObservation {
    pub chunk: Chunk,
    pub content: ContentClass,
    pub outcome: Result<ChunkMeasurement, String>,
}

/// One chunk of a method's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftPoint {
    pub chunk: Chunk,
    /// Chunk estimate; its confidence is the ensemble confidence.
    pub estimate: OffsetEstimate,
    /// Raw correlation peak magnitude.
    pub base_confidence: f64,
    pub content: ContentClass,
    pub reliable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guide_seconds: Option<f64>,
    /// Why the chunk produced no measurement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Time-ordered chunk results of one method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftTimeline {
    pub method: Method,
    pub points: Vec<DriftPoint>,
    pub has_drift: bool,
    /// Max minus min reliable offset, in seconds.
    pub drift_magnitude: f64,
    pub drift_kind: DriftKind,
    /// Seconds of offset change per second of audio, for linear drift.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift_rate: Option<f64>,
}

impl DriftTimeline {
    pub fn chunks_analyzed(&self) -> usize {
        self.points.len()
    }

    pub fn reliable_chunks(&self) -> usize {
        self.points.iter().filter(|p| p.reliable).count()
    }

    pub fn reliable_points(&self) -> impl Iterator<Item = &DriftPoint> {
        self.points.iter().filter(|p| p.reliable)
    }
}

/// One method's aggregate over its timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSummary {
    pub method: Method,
    /// `None` when no chunk was reliable.
    pub estimate: Option<OffsetEstimate>,
    pub quality: Quality,
    pub timeline: DriftTimeline,
}

/// Builds and summarizes drift timelines.
pub struct DriftAggregator {
    config: DriftConfig,
    weights: ContentWeights,
}

impl DriftAggregator {
    pub fn new(config: DriftConfig, weights: ContentWeights) -> Self {
        Self { config, weights }
    }

    /// Weight chunk observations and assemble the timeline.
    ///
    /// Ensemble confidence = peak magnitude × content factor × peak-shape
    /// factor, clamped to 0..=1. A chunk is reliable when that reaches the
    /// content-aware threshold. Failed chunks stay in the timeline as
    /// unreliable points.
    pub fn aggregate(&self, method: Method, observations: Vec<ChunkObservation>) -> DriftTimeline {
        let mut points: Vec<DriftPoint> = observations
            .into_iter()
            .map(|obs| self.weigh(method, obs))
            .collect();
        points.sort_by(|a, b| {
            a.chunk
                .start_time
                .total_cmp(&b.chunk.start_time)
                .then(a.chunk.pass.cmp(&b.chunk.pass))
                .then(a.chunk.index.cmp(&b.chunk.index))
        });

        let reliable: Vec<(f64, f64)> = points
            .iter()
            .filter(|p| p.reliable)
            .map(|p| (p.chunk.midpoint_secs(), p.estimate.offset_seconds))
            .collect();

        let drift_magnitude = spread(reliable.iter().map(|r| r.1));
        let has_drift = drift_magnitude > self.config.drift_tolerance_seconds;
        let (drift_kind, drift_rate) = if has_drift {
            self.diagnose(&reliable)
        } else {
            (DriftKind::Constant, None)
        };

        if has_drift {
            tracing::debug!(
                "[{}] drift of {:.3}s across {} reliable chunks ({})",
                method,
                drift_magnitude,
                reliable.len(),
                drift_kind
            );
        }

        DriftTimeline {
            method,
            points,
            has_drift,
            drift_magnitude,
            drift_kind,
            drift_rate,
        }
    }

    /// Collapse a timeline to a single estimate.
    ///
    /// The offset is the confidence-weighted median of reliable chunks. The
    /// confidence is their mean ensemble confidence scaled by the square root
    /// of the reliable fraction.
    pub fn summarize(&self, timeline: DriftTimeline) -> MethodSummary {
        let reliable: Vec<&DriftPoint> = timeline.reliable_points().collect();
        if reliable.is_empty() {
            return MethodSummary {
                method: timeline.method,
                estimate: None,
                quality: Quality::Poor,
                timeline,
            };
        }

        let weighted: Vec<(f64, f64)> = reliable
            .iter()
            .map(|p| (p.estimate.offset_seconds, p.estimate.confidence))
            .collect();
        let offset = weighted_median(&weighted);

        let fraction = reliable.len() as f64 / timeline.points.len().max(1) as f64;
        let mean_confidence =
            reliable.iter().map(|p| p.estimate.confidence).sum::<f64>() / reliable.len() as f64;
        let confidence = (mean_confidence * fraction.sqrt()).clamp(0.0, 1.0);

        let quality = if fraction >= 0.7 && confidence >= 0.6 {
            Quality::Good
        } else if confidence >= 0.35 {
            Quality::Fair
        } else {
            Quality::Poor
        };

        let template = &reliable[0].estimate;
        let estimate = OffsetEstimate {
            method: timeline.method,
            offset_seconds: offset,
            confidence,
            precision_class: template.precision_class,
            resolution_seconds: template.resolution_seconds,
        };

        MethodSummary {
            method: timeline.method,
            estimate: Some(estimate),
            quality,
            timeline,
        }
    }

    fn weigh(&self, method: Method, obs: ChunkObservation) -> DriftPoint {
        match obs.outcome {
            Ok(measurement) => {
                let base = measurement.estimate.confidence;
                let ensemble = base
                    * self.weights.factor(obs.content, method)
                    * measurement.peak.quality_factor();
                let estimate = measurement.estimate.with_confidence(ensemble);
                let threshold = self
                    .weights
                    .reliability_threshold(self.config.reliability_threshold, obs.content);
                DriftPoint {
                    chunk: obs.chunk,
                    reliable: estimate.confidence >= threshold,
                    estimate,
                    base_confidence: base,
                    content: obs.content,
                    guide_seconds: measurement.guide_seconds,
                    failure: None,
                }
            }
            Err(reason) => DriftPoint {
                chunk: obs.chunk,
                estimate: OffsetEstimate {
                    method,
                    offset_seconds: 0.0,
                    confidence: 0.0,
                    precision_class: method.precision_class(),
                    resolution_seconds: 0.0,
                },
                base_confidence: 0.0,
                content: obs.content,
                reliable: false,
                guide_seconds: None,
                failure: Some(reason),
            },
        }
    }

    /// Classify a drifting timeline as linear or stepped.
    fn diagnose(&self, reliable: &[(f64, f64)]) -> (DriftKind, Option<f64>) {
        let offsets: Vec<f64> = reliable.iter().map(|r| r.1).collect();
        let labels = dbscan_cluster(
            &offsets,
            self.config.drift_tolerance_seconds,
            self.config.min_cluster_samples,
        );
        let clusters = labels.iter().filter(|&&l| l >= 0).max().map_or(0, |m| m + 1);
        if clusters >= 2 {
            return (DriftKind::Stepped, None);
        }

        if reliable.len() >= 3 {
            let times: Vec<f64> = reliable.iter().map(|r| r.0).collect();
            let (slope, _, r_squared) = linear_regression(&times, &offsets);
            if r_squared >= self.config.linear_r2_threshold {
                return (DriftKind::Linear, Some(slope));
            }
        }

        (DriftKind::Stepped, None)
    }
}

fn spread(values: impl Iterator<Item = f64>) -> f64 {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if lo.is_finite() && hi.is_finite() {
        hi - lo
    } else {
        0.0
    }
}

/// Weighted median of `(value, weight)` pairs; equal weights give the lower median.
fn weighted_median(pairs: &[(f64, f64)]) -> f64 {
    let mut sorted: Vec<(f64, f64)> = pairs.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total: f64 = sorted.iter().map(|p| p.1.max(0.0)).sum();
    if total <= 0.0 {
        return sorted[(sorted.len() - 1) / 2].0;
    }

    let mut acc = 0.0;
    for (value, weight) in &sorted {
        acc += weight.max(0.0);
        if acc >= total / 2.0 {
            return *value;
        }
    }
    sorted[sorted.len() - 1].0
}

/// Least-squares fit `y = slope * x + intercept`.
///
/// # Returns
/// `(slope, intercept, r_squared)`.
fn linear_regression(x: &[f64], y: &[f64]) -> (f64, f64, f64) {
    if x.len() < 2 || x.len() != y.len() {
        return (0.0, 0.0, 0.0);
    }

    let n = x.len() as f64;
    let x_mean = x.iter().sum::<f64>() / n;
    let y_mean = y.iter().sum::<f64>() / n;

    let (mut num, mut den) = (0.0, 0.0);
    for (xi, yi) in x.iter().zip(y) {
        num += (xi - x_mean) * (yi - y_mean);
        den += (xi - x_mean).powi(2);
    }
    if den.abs() < 1e-12 {
        return (0.0, y_mean, 0.0);
    }

    let slope = num / den;
    let intercept = y_mean - slope * x_mean;

    let (mut ss_res, mut ss_tot) = (0.0, 0.0);
    for (xi, yi) in x.iter().zip(y) {
        ss_res += (yi - (slope * xi + intercept)).powi(2);
        ss_tot += (yi - y_mean).powi(2);
    }
    let r_squared = if ss_tot.abs() < 1e-12 {
        1.0
    } else {
        1.0 - ss_res / ss_tot
    };

    (slope, intercept, r_squared.max(0.0))
}

/// 1-D DBSCAN. Returns a cluster label per value, -1 for noise.
fn dbscan_cluster(values: &[f64], epsilon: f64, min_samples: usize) -> Vec<i32> {
    let n = values.len();
    let mut labels = vec![-1i32; n];
    let mut visited = vec![false; n];
    let mut cluster = 0i32;

    let neighbors = |i: usize| -> Vec<usize> {
        (0..n)
            .filter(|&j| (values[i] - values[j]).abs() <= epsilon)
            .collect()
    };

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        let seeds = neighbors(i);
        if seeds.len() < min_samples {
            continue;
        }

        labels[i] = cluster;
        let mut queue = seeds;
        let mut head = 0;
        while head < queue.len() {
            let j = queue[head];
            head += 1;
            if labels[j] < 0 {
                labels[j] = cluster;
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;
            let more = neighbors(j);
            if more.len() >= min_samples {
                queue.extend(more.into_iter().filter(|&k| !visited[k]));
            }
        }
        cluster += 1;
    }

    labels
}
