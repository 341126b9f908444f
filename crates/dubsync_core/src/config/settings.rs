//! Settings struct with TOML-based sections.
//!
//! Every field carries a serde default, so a partial file (or an empty one)
//! loads with defaults filled in.

use serde::{Deserialize, Serialize};

use crate::analysis::Method;

/// Root settings structure containing all configuration sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Offset analysis settings.
    #[serde(default)]
    pub analysis: AnalysisSettings,

    /// Batch scheduling settings.
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Analysis configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    /// Rate tracks are decoded at, in Hz.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Coarse chunk length in seconds.
    #[serde(default = "default_chunk_size")]
    pub chunk_size_seconds: f64,

    /// Overlap fraction between coarse chunks.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: f64,

    /// Refinement chunk length in seconds.
    #[serde(default = "default_refine_chunk")]
    pub refine_chunk_seconds: f64,

    /// Overlap fraction between refinement chunks.
    #[serde(default = "default_refine_overlap")]
    pub refine_overlap: f64,

    /// Files at least this long (seconds) get a coarse pre-alignment pass.
    #[serde(default = "default_min_duration_for_coarse")]
    pub min_duration_for_coarse_prealign: f64,

    /// Confidence the coarse estimate needs to guide chunk analysis.
    #[serde(default = "default_min_confidence_for_coarse")]
    pub min_confidence_for_coarse: f64,

    /// RMS window of the coarse envelope in seconds.
    #[serde(default = "default_coarse_window")]
    pub coarse_window_seconds: f64,

    /// Methods to run.
    #[serde(default = "default_methods")]
    pub enabled_methods: Vec<Method>,

    /// Threads used for chunk analysis within one pair.
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,

    /// Relative tolerance under which correlation peaks count as tied.
    #[serde(default = "default_tie_tolerance")]
    pub tie_tolerance: f64,

    /// Ensemble confidence a chunk needs to be reliable.
    #[serde(default = "default_reliability_threshold")]
    pub reliability_threshold: f64,

    /// Adjacent chunk offsets differing by more than this get refined.
    #[serde(default = "default_refine_disagreement")]
    pub refine_disagreement_seconds: f64,

    /// Offset spread (seconds) above which a file is reported as drifting.
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance_seconds: f64,

    /// Confidence a method needs to be considered by consensus.
    #[serde(default = "default_consensus_min_confidence")]
    pub consensus_min_confidence: f64,

    /// Half-width of the search around a guide offset, in seconds.
    #[serde(default = "default_guided_search_radius")]
    pub guided_search_radius_seconds: f64,
}

fn default_sample_rate() -> u32 {
    22050
}

fn default_chunk_size() -> f64 {
    30.0
}

fn default_chunk_overlap() -> f64 {
    0.7
}

fn default_refine_chunk() -> f64 {
    10.0
}

fn default_refine_overlap() -> f64 {
    0.8
}

fn default_min_duration_for_coarse() -> f64 {
    60.0
}

fn default_min_confidence_for_coarse() -> f64 {
    0.2
}

fn default_coarse_window() -> f64 {
    0.1
}

fn default_methods() -> Vec<Method> {
    vec![
        Method::RawCorrelation,
        Method::Cepstral,
        Method::Onset,
        Method::Spectral,
    ]
}

fn default_parallel_workers() -> usize {
    4
}

fn default_tie_tolerance() -> f64 {
    1e-6
}

fn default_reliability_threshold() -> f64 {
    0.3
}

fn default_refine_disagreement() -> f64 {
    0.25
}

fn default_drift_tolerance() -> f64 {
    0.1
}

fn default_consensus_min_confidence() -> f64 {
    0.3
}

fn default_guided_search_radius() -> f64 {
    2.0
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            chunk_size_seconds: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            refine_chunk_seconds: default_refine_chunk(),
            refine_overlap: default_refine_overlap(),
            min_duration_for_coarse_prealign: default_min_duration_for_coarse(),
            min_confidence_for_coarse: default_min_confidence_for_coarse(),
            coarse_window_seconds: default_coarse_window(),
            enabled_methods: default_methods(),
            parallel_workers: default_parallel_workers(),
            tie_tolerance: default_tie_tolerance(),
            reliability_threshold: default_reliability_threshold(),
            refine_disagreement_seconds: default_refine_disagreement(),
            drift_tolerance_seconds: default_drift_tolerance(),
            consensus_min_confidence: default_consensus_min_confidence(),
            guided_search_radius_seconds: default_guided_search_radius(),
        }
    }
}

/// Batch scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Worker threads processing pairs (minimum 1).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Memory capacity of each accelerator in MiB. One entry per device.
    #[serde(default = "default_accelerator_memory")]
    pub accelerator_memory_mb: Vec<u64>,

    /// Memory one job reserves on its accelerator, in MiB.
    #[serde(default = "default_job_memory")]
    pub job_memory_mb: u64,

    /// Folder for per-job logs. Empty disables job log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_workers() -> usize {
    2
}

fn default_accelerator_memory() -> Vec<u64> {
    vec![4096]
}

fn default_job_memory() -> u64 {
    1024
}

fn default_log_dir() -> String {
    ".logs".to_string()
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            accelerator_memory_mb: default_accelerator_memory(),
            job_memory_mb: default_job_memory(),
            log_dir: default_log_dir(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default tracing filter when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,

    /// Use compact log format.
    #[serde(default = "default_true")]
    pub compact: bool,

    /// Number of lines kept for the error tail of a failed job.
    #[serde(default = "default_error_tail")]
    pub error_tail: u32,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_error_tail() -> u32 {
    20
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            compact: default_true(),
            error_tail: default_error_tail(),
        }
    }
}

/// Config sections for targeted updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    Analysis,
    Scheduler,
    Logging,
}

impl ConfigSection {
    /// Get the TOML table name for this section.
    pub fn table_name(&self) -> &'static str {
        match self {
            ConfigSection::Analysis => "analysis",
            ConfigSection::Scheduler => "scheduler",
            ConfigSection::Logging => "logging",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_serializes() {
        let settings = Settings::default();
        let toml = toml::to_string_pretty(&settings).unwrap();
        assert!(toml.contains("[analysis]"));
        assert!(toml.contains("[scheduler]"));
        assert!(toml.contains("enabled_methods"));
        assert!(toml.contains("\"raw_correlation\""));
    }

    #[test]
    fn settings_round_trip() {
        let settings = Settings::default();
        let toml = toml::to_string_pretty(&settings).unwrap();
        let parsed: Settings = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let minimal = "[analysis]\nchunk_size_seconds = 20.0\nenabled_methods = [\"onset\"]";
        let parsed: Settings = toml::from_str(minimal).unwrap();
        assert_eq!(parsed.analysis.chunk_size_seconds, 20.0);
        assert_eq!(parsed.analysis.enabled_methods, vec![Method::Onset]);
        assert_eq!(parsed.analysis.chunk_overlap, 0.7);
        assert_eq!(parsed.scheduler.workers, 2);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn unknown_method_is_rejected() {
        let bad = "[analysis]\nenabled_methods = [\"wavelet\"]";
        assert!(toml::from_str::<Settings>(bad).is_err());
    }
}
