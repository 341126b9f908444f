//! Pair analysis session.
//!
//! Orchestrates the full analysis of one master/dub pair:
//! 1. Validate inputs and short-circuit silent or too-short audio
//! 2. Coarse pre-alignment for long files
//! 3. Extract and cache feature series once per track
//! 4. Coarse chunk pass (all chunk × method tasks in parallel)
//! 5. One refinement pass over unreliable or disagreeing regions, each region
//!    guided by its own envelope correlation when that is confident
//! 6. Per-method drift timelines and summaries
//! 7. Precision-first consensus

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::chunk_analyzer::{ChunkAnalyzer, MethodInput};
use super::chunks::{merge_regions, ChunkPlanner, TimeRegion};
use super::coarse::{CoarseEstimate, CoarsePreAligner};
use super::config::AnalysisConfig;
use super::consensus::{ConsensusResult, ConsensusSelector};
use super::content::{ContentClass, ContentClassifier};
use super::correlation::PairwiseCorrelator;
use super::drift::{ChunkObservation, DriftAggregator, DriftTimeline};
use super::features::{FeatureExtractor, FeatureKind, FeatureSeries};
use super::types::{
    AnalysisError, AnalysisResult, AudioTrack, Chunk, ChunkPass, Method, TrackRole,
};

/// RMS below which a whole track counts as silent (about -100 dBFS).
const SILENT_TRACK_RMS: f64 = 1e-5;

/// Handle for cancelling a running analysis.
///
/// Cloned handles share one flag. Analysis stops at the next chunk boundary
/// and returns [`AnalysisError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Analyze one pair with a fresh session.
///
/// # Arguments
/// * `master` - Reference track
/// * `dub` - Track to measure against the master
/// * `config` - Analysis configuration
///
/// # Returns
/// The consensus result. Too-short or silent audio yields an unreliable
/// result rather than an error; only bad input, bad configuration and
/// cancellation are errors.
pub fn analyze_pair(
    master: &AudioTrack,
    dub: &AudioTrack,
    config: &AnalysisConfig,
) -> AnalysisResult<ConsensusResult> {
    analyze_pair_with_cancel(master, dub, config, &CancelHandle::new())
}

/// Like [`analyze_pair`], stopping early when `cancel` fires.
pub fn analyze_pair_with_cancel(
    master: &AudioTrack,
    dub: &AudioTrack,
    config: &AnalysisConfig,
    cancel: &CancelHandle,
) -> AnalysisResult<ConsensusResult> {
    AnalysisSession::new(master, dub, config.clone())?
        .with_cancel(cancel.clone())
        .run()
}

/// Per-pair analysis state. Owns the feature cache; discarded after `run`.
pub struct AnalysisSession<'a> {
    master: &'a AudioTrack,
    dub: &'a AudioTrack,
    config: AnalysisConfig,
    correlator: PairwiseCorrelator,
    extractor: FeatureExtractor,
    classifier: ContentClassifier,
    cache: HashMap<(TrackRole, FeatureKind), Arc<FeatureSeries>>,
    cancel: CancelHandle,
    pool: ThreadPool,
}

impl<'a> AnalysisSession<'a> {
    /// Create a session after validating the configuration and inputs.
    pub fn new(
        master: &'a AudioTrack,
        dub: &'a AudioTrack,
        config: AnalysisConfig,
    ) -> AnalysisResult<Self> {
        config.validate()?;
        if master.sample_rate() != dub.sample_rate() {
            return Err(AnalysisError::Decode(format!(
                "master is {} Hz but dub is {} Hz; decode both at the same rate",
                master.sample_rate(),
                dub.sample_rate()
            )));
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.parallel_workers)
            .build()
            .map_err(|e| AnalysisError::Config(format!("cannot start analysis workers: {}", e)))?;

        Ok(Self {
            master,
            dub,
            pool,
            correlator: PairwiseCorrelator::new(config.tie_tolerance),
            extractor: FeatureExtractor::new(config.features.clone()),
            classifier: ContentClassifier::new(config.content.clone()),
            cache: HashMap::new(),
            cancel: CancelHandle::new(),
            config,
        })
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the whole analysis.
    ///
    /// Audio without enough signal to correlate yields an unreliable result
    /// instead of an error.
    pub fn run(self) -> AnalysisResult<ConsensusResult> {
        match self.execute() {
            Err(AnalysisError::InsufficientSignal(reason)) => {
                tracing::warn!("Insufficient signal: {}", reason);
                Ok(ConsensusResult::unreliable(reason))
            }
            other => other,
        }
    }

    fn execute(mut self) -> AnalysisResult<ConsensusResult> {
        let duration = self.master.duration_secs().min(self.dub.duration_secs());
        tracing::info!(
            "Analyzing pair: master {:.1}s, dub {:.1}s at {} Hz",
            self.master.duration_secs(),
            self.dub.duration_secs(),
            self.master.sample_rate()
        );

        if duration < self.config.min_analysis_seconds {
            tracing::warn!("Overlap of {:.2}s is too short to analyze", duration);
            return Ok(ConsensusResult::unreliable(format!(
                "audio too short ({:.2}s)",
                duration
            )));
        }
        if self.master.rms() < SILENT_TRACK_RMS || self.dub.rms() < SILENT_TRACK_RMS {
            tracing::warn!("Master or dub is silent; nothing to correlate");
            return Ok(ConsensusResult::unreliable("master or dub is silent"));
        }

        let coarse = self.coarse_estimate(duration);
        let global_guide = coarse.as_ref().and_then(CoarseEstimate::guide);

        let methods = self.config.ordered_methods();
        self.prepare_features(&methods)?;

        let planner = ChunkPlanner::new(self.config.chunks.clone());
        let coarse_chunks = planner.plan_coarse(duration);
        tracing::info!(
            "Coarse pass: {} chunks x {} methods{}",
            coarse_chunks.len(),
            methods.len(),
            match global_guide {
                Some(g) => format!(", guided at {:+.3}s", g),
                None => String::new(),
            }
        );

        let mut observations =
            self.run_pass(&coarse_chunks, &methods, |_, _| global_guide)?;

        let aggregator = DriftAggregator::new(self.config.drift.clone(), self.config.weights.clone());
        let first_pass: Vec<DriftTimeline> = methods
            .iter()
            .map(|m| aggregator.aggregate(*m, observations.get(m).cloned().unwrap_or_default()))
            .collect();

        let regions = merge_regions(
            first_pass
                .iter()
                .flat_map(|t| planner.refinement_regions(&t.points))
                .collect(),
        );
        let refine_chunks = planner.plan_refinement(&regions, coarse_chunks.len());

        if !refine_chunks.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            tracing::info!(
                "Refinement pass: {} chunks over {} region(s)",
                refine_chunks.len(),
                regions.len()
            );

            let anchors: HashMap<Method, Vec<(f64, f64)>> = first_pass
                .iter()
                .map(|t| {
                    let points = t
                        .reliable_points()
                        .map(|p| (p.chunk.midpoint_secs(), p.estimate.offset_seconds))
                        .collect();
                    (t.method, points)
                })
                .collect();
            let regional = self.regional_guides(&regions, duration);
            let guide = |method: Method, chunk: &Chunk| {
                let time = chunk.midpoint_secs();
                regional
                    .iter()
                    .find(|(region, _)| region.start <= time && time <= region.end)
                    .map(|(_, offset)| *offset)
                    .or_else(|| {
                        anchors
                            .get(&method)
                            .and_then(|points| nearest_offset(points, time))
                    })
                    .or(global_guide)
            };

            let refined = self.run_pass(&refine_chunks, &methods, guide)?;
            for (method, obs) in refined {
                observations.entry(method).or_default().extend(obs);
            }
        }

        let summaries = methods
            .iter()
            .map(|m| {
                let timeline = aggregator.aggregate(*m, observations.remove(m).unwrap_or_default());
                let summary = aggregator.summarize(timeline);
                match &summary.estimate {
                    Some(e) => tracing::info!(
                        "[{}] {:+.4}s (confidence {:.3}, {}/{} chunks reliable)",
                        m,
                        e.offset_seconds,
                        e.confidence,
                        summary.timeline.reliable_chunks(),
                        summary.timeline.chunks_analyzed()
                    ),
                    None => tracing::warn!("[{}] no reliable chunks", m),
                }
                summary
            })
            .collect();

        Ok(ConsensusSelector::new(self.config.consensus_min_confidence).decide(summaries, coarse))
    }

    fn coarse_estimate(&self, duration: f64) -> Option<CoarseEstimate> {
        let aligner = CoarsePreAligner::new(self.config.coarse.clone(), &self.correlator);
        if !aligner.should_run(duration) {
            tracing::debug!(
                "Skipping coarse pre-alignment for {:.1}s file (minimum {:.1}s)",
                duration,
                self.config.coarse.min_duration_seconds
            );
            return None;
        }

        match aligner.estimate(self.master, self.dub) {
            Ok(estimate) => {
                tracing::info!(
                    "Coarse pre-alignment: {:+.2}s (confidence {:.3}, {})",
                    estimate.offset_seconds,
                    estimate.confidence,
                    if estimate.accepted { "used as guide" } else { "below gate" }
                );
                Some(estimate)
            }
            Err(e) => {
                tracing::warn!("Coarse pre-alignment unavailable: {}", e);
                None
            }
        }
    }

    /// Envelope offset of each refinement region, for regions where it passes
    /// the coarse confidence gate.
    fn regional_guides(&self, regions: &[TimeRegion], duration: f64) -> Vec<(TimeRegion, f64)> {
        let aligner = CoarsePreAligner::new(self.config.coarse.clone(), &self.correlator);
        if !aligner.should_run(duration) {
            return Vec::new();
        }

        regions
            .iter()
            .filter_map(|region| {
                match aligner.estimate_region(self.master, self.dub, region.start, region.end) {
                    Ok(estimate) => {
                        tracing::debug!(
                            "Region {:.1}s..{:.1}s: envelope offset {:+.3}s (confidence {:.3})",
                            region.start,
                            region.end,
                            estimate.offset_seconds,
                            estimate.confidence
                        );
                        estimate.guide().map(|offset| (*region, offset))
                    }
                    Err(e) => {
                        tracing::debug!(
                            "Region {:.1}s..{:.1}s has no envelope guide: {}",
                            region.start,
                            region.end,
                            e
                        );
                        None
                    }
                }
            })
            .collect()
    }

    /// Extract every feature series the methods need, once per track.
    fn prepare_features(&mut self, methods: &[Method]) -> AnalysisResult<()> {
        let mut jobs: Vec<(TrackRole, FeatureKind)> = Vec::new();
        for kind in methods.iter().filter_map(Method::feature_kind) {
            for role in [TrackRole::Master, TrackRole::Dub] {
                if !self.cache.contains_key(&(role, kind)) && !jobs.contains(&(role, kind)) {
                    jobs.push((role, kind));
                }
            }
        }
        if jobs.is_empty() {
            return Ok(());
        }

        tracing::debug!("Extracting {} feature series", jobs.len());
        let (master, dub, extractor) = (self.master, self.dub, &self.extractor);
        let extracted = self.parallel_map(&jobs, |&(role, kind)| {
            let track = match role {
                TrackRole::Master => master,
                TrackRole::Dub => dub,
            };
            extractor.extract(track.samples(), track.sample_rate(), kind, role)
        })?;

        for (key, series) in jobs.into_iter().zip(extracted) {
            self.cache.insert(key, Arc::new(series?));
        }
        Ok(())
    }

    fn method_input(&self, method: Method) -> AnalysisResult<MethodInput<'_>> {
        match method.feature_kind() {
            None => Ok(MethodInput::Waveform {
                master: self.master,
                dub: self.dub,
            }),
            Some(kind) => {
                let master = self.cache.get(&(TrackRole::Master, kind));
                let dub = self.cache.get(&(TrackRole::Dub, kind));
                match (master, dub) {
                    (Some(master), Some(dub)) => Ok(MethodInput::Features {
                        master: master.as_ref(),
                        dub: dub.as_ref(),
                    }),
                    _ => Err(AnalysisError::Correlation(format!(
                        "{} features were not extracted",
                        kind
                    ))),
                }
            }
        }
    }

    /// Run every chunk × method task of one pass.
    fn run_pass<G>(
        &self,
        chunks: &[Chunk],
        methods: &[Method],
        guide: G,
    ) -> AnalysisResult<HashMap<Method, Vec<ChunkObservation>>>
    where
        G: Fn(Method, &Chunk) -> Option<f64> + Sync,
    {
        let (master, classifier) = (self.master, &self.classifier);
        let contents: Vec<ContentClass> = self.parallel_map(chunks, |chunk| {
            classifier.classify(
                master.segment(chunk.start_time, chunk.end_time),
                master.sample_rate(),
            )
        })?;

        let inputs = methods
            .iter()
            .map(|m| Ok((*m, self.method_input(*m)?)))
            .collect::<AnalysisResult<HashMap<Method, MethodInput<'_>>>>()?;

        let tasks: Vec<(usize, Method)> = (0..chunks.len())
            .flat_map(|c| methods.iter().map(move |m| (c, *m)))
            .collect();

        let analyzer = ChunkAnalyzer::new(&self.correlator, self.config.guided_search_radius_seconds);
        let observations = self.parallel_map(&tasks, |&(c, method)| {
            let chunk = &chunks[c];
            let outcome = match inputs.get(&method) {
                Some(input) => analyzer
                    .analyze(chunk, method, *input, guide(method, chunk))
                    .map_err(|e| e.to_string()),
                None => Err(format!("{} has no input", method)),
            };
            match &outcome {
                Ok(m) => tracing::debug!(
                    "Chunk {} ({:?}) [{}] at {:.1}s: {:+.4}s, peak {:.3}",
                    chunk.index,
                    chunk.pass,
                    method,
                    chunk.start_time,
                    m.estimate.offset_seconds,
                    m.estimate.confidence
                ),
                Err(e) => tracing::debug!(
                    "Chunk {} ({:?}) [{}] at {:.1}s failed: {}",
                    chunk.index,
                    chunk.pass,
                    method,
                    chunk.start_time,
                    e
                ),
            }
            ChunkObservation {
                chunk: *chunk,
                content: contents[c],
                outcome,
            }
        })?;

        let mut grouped: HashMap<Method, Vec<ChunkObservation>> = HashMap::new();
        for (&(_, method), obs) in tasks.iter().zip(observations) {
            grouped.entry(method).or_default().push(obs);
        }

        let failed = grouped
            .values()
            .flatten()
            .filter(|o| o.outcome.is_err())
            .count();
        let refine = chunks.first().map(|c| c.pass) == Some(ChunkPass::Refine);
        tracing::debug!(
            "{} pass finished: {} tasks, {} failed",
            if refine { "Refinement" } else { "Coarse" },
            tasks.len(),
            failed
        );
        Ok(grouped)
    }

    /// Map `f` over `items` on the session's worker pool.
    ///
    /// Results keep the order of `items`. Items not yet started when `cancel`
    /// fires are skipped and `Cancelled` is returned.
    fn parallel_map<T, R, F>(&self, items: &[T], f: F) -> AnalysisResult<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync,
    {
        let cancel = &self.cancel;
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        self.pool.install(|| {
            items
                .par_iter()
                .map(|item| {
                    if cancel.is_cancelled() {
                        Err(AnalysisError::Cancelled)
                    } else {
                        Ok(f(item))
                    }
                })
                .collect()
        })
    }
}

/// Offset of the anchor whose time is closest to `time`.
fn nearest_offset(anchors: &[(f64, f64)], time: f64) -> Option<f64> {
    anchors
        .iter()
        .min_by(|a, b| (a.0 - time).abs().total_cmp(&(b.0 - time).abs()))
        .map(|a| a.1)
}

