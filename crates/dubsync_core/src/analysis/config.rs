//! Runtime analysis configuration.
//!
//! [`AnalysisConfig`] groups the settings of every analysis stage. It is
//! built from the `[analysis]` settings section and validated before a
//! session starts.

use serde::{Deserialize, Serialize};

use super::chunks::ChunkPlanConfig;
use super::coarse::CoarseConfig;
use super::content::{ContentConfig, ContentWeights};
use super::drift::DriftConfig;
use super::features::FeatureConfig;
use super::types::{AnalysisError, AnalysisResult, Method};
use crate::config::AnalysisSettings;

/// Everything a session needs to analyze one pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Methods to run, in any order.
    pub methods: Vec<Method>,
    /// Threads used for chunk tasks.
    pub parallel_workers: usize,
    /// Pairs shorter than this (seconds) are reported unreliable without analysis.
    pub min_analysis_seconds: f64,
    pub tie_tolerance: f64,
    pub guided_search_radius_seconds: f64,
    pub consensus_min_confidence: f64,
    pub features: FeatureConfig,
    pub chunks: ChunkPlanConfig,
    pub coarse: CoarseConfig,
    pub content: ContentConfig,
    pub weights: ContentWeights,
    pub drift: DriftConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self::from(&AnalysisSettings::default())
    }
}

impl From<&AnalysisSettings> for AnalysisConfig {
    fn from(settings: &AnalysisSettings) -> Self {
        Self {
            methods: settings.enabled_methods.clone(),
            parallel_workers: settings.parallel_workers,
            min_analysis_seconds: 1.0,
            tie_tolerance: settings.tie_tolerance,
            guided_search_radius_seconds: settings.guided_search_radius_seconds,
            consensus_min_confidence: settings.consensus_min_confidence,
            features: FeatureConfig::default(),
            chunks: ChunkPlanConfig {
                chunk_seconds: settings.chunk_size_seconds,
                overlap: settings.chunk_overlap,
                refine_chunk_seconds: settings.refine_chunk_seconds,
                refine_overlap: settings.refine_overlap,
                disagreement_seconds: settings.refine_disagreement_seconds,
                ..ChunkPlanConfig::default()
            },
            coarse: CoarseConfig {
                window_seconds: settings.coarse_window_seconds,
                min_confidence: settings.min_confidence_for_coarse,
                min_duration_seconds: settings.min_duration_for_coarse_prealign,
            },
            content: ContentConfig::default(),
            weights: ContentWeights::default(),
            drift: DriftConfig {
                reliability_threshold: settings.reliability_threshold,
                drift_tolerance_seconds: settings.drift_tolerance_seconds,
                ..DriftConfig::default()
            },
        }
    }
}

impl AnalysisConfig {
    /// Restrict the run to the given methods.
    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    /// Methods to run, deduplicated, in precision order (finest first).
    pub fn ordered_methods(&self) -> Vec<Method> {
        let mut methods = self.methods.clone();
        methods.sort_by(|a, b| {
            b.precision_class()
                .cmp(&a.precision_class())
                .then(a.cmp(b))
        });
        methods.dedup();
        methods
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> AnalysisResult<()> {
        fn invalid(msg: impl Into<String>) -> AnalysisResult<()> {
            Err(AnalysisError::Config(msg.into()))
        }

        if self.methods.is_empty() {
            return invalid("at least one method must be enabled");
        }
        if self.parallel_workers == 0 {
            return invalid("parallel_workers must be at least 1");
        }
        if !(self.chunks.chunk_seconds > 0.0) {
            return invalid("chunk_size_seconds must be positive");
        }
        if !(0.0..0.95).contains(&self.chunks.overlap) {
            return invalid("chunk_overlap must be in [0, 0.95)");
        }
        if !(self.chunks.refine_chunk_seconds > 0.0)
            || self.chunks.refine_chunk_seconds > self.chunks.chunk_seconds
        {
            return invalid("refine_chunk_seconds must be positive and no longer than a chunk");
        }
        if !(0.0..0.95).contains(&self.chunks.refine_overlap) {
            return invalid("refine_overlap must be in [0, 0.95)");
        }
        if !(self.coarse.window_seconds > 0.0) {
            return invalid("coarse_window_seconds must be positive");
        }
        if !(self.guided_search_radius_seconds > 0.0) {
            return invalid("guided_search_radius_seconds must be positive");
        }
        if self.tie_tolerance < 0.0 || self.tie_tolerance >= 0.5 {
            return invalid("tie_tolerance must be in [0, 0.5)");
        }
        for (name, value) in [
            ("reliability_threshold", self.drift.reliability_threshold),
            ("consensus_min_confidence", self.consensus_min_confidence),
            ("min_confidence_for_coarse", self.coarse.min_confidence),
        ] {
            if !(0.0..=1.5).contains(&value) {
                return invalid(format!("{} must be between 0 and 1.5", name));
            }
        }
        if self.drift.drift_tolerance_seconds < 0.0 {
            return invalid("drift_tolerance_seconds must not be negative");
        }
        if self.features.hop_length == 0 || self.features.n_fft < self.features.hop_length {
            return invalid("feature hop must be positive and no larger than the FFT");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AnalysisConfig::default().validate().unwrap();
    }

    #[test]
    fn settings_flow_into_stage_configs() {
        let settings = AnalysisSettings {
            chunk_size_seconds: 20.0,
            min_confidence_for_coarse: 0.4,
            drift_tolerance_seconds: 0.05,
            ..AnalysisSettings::default()
        };
        let config = AnalysisConfig::from(&settings);
        assert_eq!(config.chunks.chunk_seconds, 20.0);
        assert_eq!(config.coarse.min_confidence, 0.4);
        assert_eq!(config.drift.drift_tolerance_seconds, 0.05);
    }

    #[test]
    fn rejects_empty_methods_and_zero_workers() {
        let config = AnalysisConfig::default().with_methods(vec![]);
        assert!(matches!(config.validate(), Err(AnalysisError::Config(_))));

        let config = AnalysisConfig {
            parallel_workers: 0,
            ..AnalysisConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn confidence_above_one_is_allowed_as_a_gate() {
        let mut config = AnalysisConfig::default();
        config.coarse.min_confidence = 1.1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn methods_are_ordered_finest_first() {
        let config = AnalysisConfig::default().with_methods(vec![
            Method::Embedding,
            Method::Onset,
            Method::RawCorrelation,
            Method::Onset,
            Method::Cepstral,
        ]);
        assert_eq!(
            config.ordered_methods(),
            vec![
                Method::RawCorrelation,
                Method::Cepstral,
                Method::Onset,
                Method::Embedding,
            ]
        );
    }
}
