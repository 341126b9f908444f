//! End-to-end behavior of `analyze_pair` on synthetic pairs.

mod common;

use common::{bursty_noise, pair, short_config, stepped, SAMPLE_RATE};
use dubsync_core::analysis::{
    analyze_pair, analyze_pair_with_cancel, AnalysisConfig, AnalysisError, AudioTrack,
    CancelHandle, ChunkPass, ConsensusResult, Method, PrecisionClass, Quality, TrackRole,
};
use dubsync_core::config::AnalysisSettings;

const FRAME_METHODS: [Method; 3] = [Method::Cepstral, Method::Onset, Method::Spectral];

/// Half a feature hop at 4 kHz.
const FRAME_TOLERANCE: f64 = 0.065;

fn estimate_for(result: &ConsensusResult, method: Method) -> f64 {
    result
        .per_method
        .iter()
        .find(|e| e.method == method)
        .map(|e| e.offset_seconds)
        .unwrap_or_else(|| panic!("{} produced no estimate", method))
}

#[test]
fn delayed_dub_reports_positive_offset_for_every_method() {
    let (master, dub) = pair(1, 24.0, 0.512);
    let result = analyze_pair(&master, &dub, &short_config()).unwrap();

    let raw = estimate_for(&result, Method::RawCorrelation);
    assert!((raw - 0.512).abs() < 1e-3, "raw estimate {}", raw);
    for method in FRAME_METHODS {
        let offset = estimate_for(&result, method);
        assert!(
            (offset - 0.512).abs() < FRAME_TOLERANCE,
            "{} estimate {}",
            method,
            offset
        );
    }

    assert_eq!(result.method, Some(Method::RawCorrelation));
    assert!(result.statement.contains("behind"));
}

#[test]
fn advanced_dub_reports_negative_offset_for_every_method() {
    let (master, dub) = pair(2, 24.0, -0.512);
    let result = analyze_pair(&master, &dub, &short_config()).unwrap();

    let raw = estimate_for(&result, Method::RawCorrelation);
    assert!((raw + 0.512).abs() < 1e-3, "raw estimate {}", raw);
    for method in FRAME_METHODS {
        let offset = estimate_for(&result, method);
        assert!(
            (offset + 0.512).abs() < FRAME_TOLERANCE,
            "{} estimate {}",
            method,
            offset
        );
    }
    assert!(result.statement.contains("ahead"));
}

#[test]
fn repeated_runs_are_identical() {
    let (master, dub) = pair(3, 20.0, 0.3);
    let config = AnalysisConfig {
        parallel_workers: 4,
        ..short_config()
    };

    let first = analyze_pair(&master, &dub, &config).unwrap();
    let second = analyze_pair(&master, &dub, &config).unwrap();
    assert_eq!(first.offset_seconds, second.offset_seconds);
    assert_eq!(first.confidence, second.confidence);
    assert_eq!(first.per_method, second.per_method);
}

#[test]
fn sample_accurate_method_wins_verbatim() {
    let (master, dub) = pair(4, 24.0, 0.25);
    let config = short_config().with_methods(vec![Method::Embedding, Method::RawCorrelation]);
    let result = analyze_pair(&master, &dub, &config).unwrap();

    assert_eq!(result.method, Some(Method::RawCorrelation));
    let raw = result
        .per_method
        .iter()
        .find(|e| e.method == Method::RawCorrelation)
        .unwrap();
    assert_eq!(raw.precision_class, PrecisionClass::SampleAccurate);
    assert_eq!(result.offset_seconds, Some(raw.offset_seconds));
}

#[test]
fn constant_offset_is_not_drift() {
    let (master, dub) = pair(5, 24.0, 0.512);
    let config = short_config().with_methods(vec![Method::RawCorrelation]);
    let result = analyze_pair(&master, &dub, &config).unwrap();

    assert!(!result.drift.has_drift);
    assert!(result.drift.magnitude_seconds < 0.01);
    assert!(result.reliable_chunks > 0);
    assert!(result.chunks_analyzed >= result.reliable_chunks);
}

#[test]
fn short_file_skips_coarse_prealignment() {
    let (master, dub) = pair(6, 24.0, 0.4);
    let config = short_config().with_methods(vec![Method::RawCorrelation]);
    let result = analyze_pair(&master, &dub, &config).unwrap();

    assert!(result.coarse.is_none());
    let offset = result.offset_seconds.unwrap();
    assert!((offset - 0.4).abs() < 1e-3);
    assert_ne!(result.quality, Quality::Unreliable);
}

#[test]
fn offset_larger_than_a_chunk_is_recovered() {
    let (master, dub) = pair(7, 120.0, 15.0);
    let config = AnalysisConfig::from(&AnalysisSettings {
        sample_rate: SAMPLE_RATE,
        chunk_size_seconds: 30.0,
        ..AnalysisSettings::default()
    });
    let result = analyze_pair(&master, &dub, &config).unwrap();

    let coarse = result.coarse.expect("coarse pass should run on a 120s file");
    assert!(coarse.accepted);
    assert!((coarse.offset_seconds - 15.0).abs() < 1.0);

    let offset = result.offset_seconds.unwrap();
    assert!((offset - 15.0).abs() < 0.05, "offset {}", offset);
}

/// Long-file config measuring raw correlation only.
fn long_file_config() -> AnalysisConfig {
    AnalysisConfig::from(&AnalysisSettings {
        sample_rate: SAMPLE_RATE,
        chunk_size_seconds: 30.0,
        enabled_methods: vec![Method::RawCorrelation],
        ..AnalysisSettings::default()
    })
}

fn stepped_pair(seed: u64, lead: f64, gap: f64) -> (AudioTrack, AudioTrack) {
    let master = bursty_noise(seed, 180.0);
    let dub = stepped(&master, lead, 90.0, gap, seed + 1000);
    (
        AudioTrack::new(TrackRole::Master, master, SAMPLE_RATE).unwrap(),
        AudioTrack::new(TrackRole::Dub, dub, SAMPLE_RATE).unwrap(),
    )
}

fn reliable_offsets(result: &ConsensusResult) -> Vec<f64> {
    result
        .timeline
        .as_ref()
        .unwrap()
        .points
        .iter()
        .filter(|p| p.reliable)
        .map(|p| p.estimate.offset_seconds)
        .collect()
}

#[test]
fn offset_step_under_an_accepted_guide_is_drift() {
    // +1s for the first half, +6s after the split.
    let (master, dub) = stepped_pair(12, 1.0, 5.0);
    let result = analyze_pair(&master, &dub, &long_file_config()).unwrap();

    let coarse = result.coarse.expect("coarse pass should run on a 180s file");
    assert!(coarse.accepted);

    let offsets = reliable_offsets(&result);
    assert!(offsets.iter().any(|o| (o - 1.0).abs() < 1e-3), "{:?}", offsets);
    assert!(offsets.iter().any(|o| (o - 6.0).abs() < 1e-3), "{:?}", offsets);

    assert!(result.drift.has_drift);
    assert!(
        (result.drift.magnitude_seconds - 5.0).abs() < 0.01,
        "magnitude {}",
        result.drift.magnitude_seconds
    );
}

#[test]
fn step_larger_than_a_chunk_is_drift() {
    // -34s for the first half, +26s after the split.
    let (master, dub) = stepped_pair(13, -34.0, 60.0);
    let result = analyze_pair(&master, &dub, &long_file_config()).unwrap();

    let coarse = result.coarse.expect("coarse pass should run on a 180s file");
    assert!(coarse.accepted);

    let offsets = reliable_offsets(&result);
    assert!(offsets.iter().any(|o| (o + 34.0).abs() < 1e-3), "{:?}", offsets);
    assert!(offsets.iter().any(|o| (o - 26.0).abs() < 1e-3), "{:?}", offsets);

    assert!(result.drift.has_drift);
    assert!(
        (result.drift.magnitude_seconds - 60.0).abs() < 0.01,
        "magnitude {}",
        result.drift.magnitude_seconds
    );
}

#[test]
fn low_confidence_coarse_estimate_does_not_guide_chunks() {
    let (master, dub) = pair(8, 70.0, 2.0);
    let config = AnalysisConfig::from(&AnalysisSettings {
        sample_rate: SAMPLE_RATE,
        min_confidence_for_coarse: 1.1,
        enabled_methods: vec![Method::RawCorrelation],
        ..AnalysisSettings::default()
    });
    let result = analyze_pair(&master, &dub, &config).unwrap();

    let coarse = result.coarse.expect("coarse pass should run on a 70s file");
    assert!(!coarse.accepted);

    let timeline = result.timeline.as_ref().unwrap();
    assert!(timeline
        .points
        .iter()
        .filter(|p| p.chunk.pass == ChunkPass::Coarse)
        .all(|p| p.guide_seconds.is_none()));

    let offset = result.offset_seconds.unwrap();
    assert!((offset - 2.0).abs() < 1e-3, "offset {}", offset);
}

#[test]
fn silent_pair_is_unreliable_not_an_error() {
    let silence = vec![0.0; SAMPLE_RATE as usize * 10];
    let master = AudioTrack::new(TrackRole::Master, silence.clone(), SAMPLE_RATE).unwrap();
    let dub = AudioTrack::new(TrackRole::Dub, silence, SAMPLE_RATE).unwrap();
    let result = analyze_pair(&master, &dub, &short_config()).unwrap();

    assert_eq!(result.offset_seconds, None);
    assert_eq!(result.quality, Quality::Unreliable);
    assert_eq!(result.confidence, 0.0);
    assert!(result.reason.is_some());
}

#[test]
fn too_short_pair_is_unreliable() {
    let (master, dub) = pair(9, 0.5, 0.0);
    let result = analyze_pair(&master, &dub, &short_config()).unwrap();
    assert_eq!(result.quality, Quality::Unreliable);
    assert_eq!(result.offset_seconds, None);
}

#[test]
fn mismatched_sample_rates_are_rejected() {
    let master = AudioTrack::new(TrackRole::Master, vec![0.1; 8000], 8000).unwrap();
    let dub = AudioTrack::new(TrackRole::Dub, vec![0.1; 4000], 4000).unwrap();
    assert!(matches!(
        analyze_pair(&master, &dub, &short_config()),
        Err(AnalysisError::Decode(_))
    ));
}

#[test]
fn cancelled_session_stops() {
    let (master, dub) = pair(10, 20.0, 0.2);
    let cancel = CancelHandle::new();
    cancel.cancel();
    assert!(matches!(
        analyze_pair_with_cancel(&master, &dub, &short_config(), &cancel),
        Err(AnalysisError::Cancelled)
    ));
}

#[test]
fn result_serializes_with_stable_field_names() {
    let (master, dub) = pair(11, 16.0, 0.25);
    let config = short_config().with_methods(vec![Method::RawCorrelation, Method::Onset]);
    let result = analyze_pair(&master, &dub, &config).unwrap();

    let json = serde_json::to_value(&result).unwrap();
    for key in [
        "offset_seconds",
        "confidence",
        "method",
        "drift",
        "per_method",
        "chunks_analyzed",
        "reliable_chunks",
    ] {
        assert!(json.get(key).is_some(), "missing {}", key);
    }
    assert_eq!(json["method"], "raw_correlation");
    assert!(json["drift"].get("has_drift").is_some());
    assert!(json["drift"].get("magnitude_seconds").is_some());
    assert!(json["per_method"][0].get("precision_class").is_some());
}
