//! Synthetic audio shared by the integration tests.
//!
//! Signals are generated from fixed seeds so no audio assets live in the
//! repository and every run sees the same samples.

#![allow(dead_code)]

use dubsync_core::analysis::{AnalysisConfig, AudioTrack, TrackRole};
use dubsync_core::config::AnalysisSettings;
use rand::{rngs::StdRng, Rng, SeedableRng};

pub const SAMPLE_RATE: u32 = 4000;

/// Noise bursts of random length and level separated by quiet gaps.
pub fn bursty_noise(seed: u64, seconds: f64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let total = (seconds * SAMPLE_RATE as f64) as usize;
    let mut samples = Vec::with_capacity(total);

    while samples.len() < total {
        let burst = (rng.gen_range(0.1..0.6) * SAMPLE_RATE as f64) as usize;
        let level = rng.gen_range(0.2..1.0);
        for _ in 0..burst {
            samples.push(level * rng.gen_range(-1.0..1.0));
        }
        let gap = (rng.gen_range(0.05..0.4) * SAMPLE_RATE as f64) as usize;
        for _ in 0..gap {
            samples.push(0.01 * rng.gen_range(-1.0..1.0));
        }
    }
    samples.truncate(total);
    samples
}

/// Copy of `master` shifted by `offset_seconds` (positive: dub plays later).
///
/// Samples with no master counterpart are filled with unrelated noise.
pub fn shifted(master: &[f64], offset_seconds: f64, filler_seed: u64) -> Vec<f64> {
    let shift = (offset_seconds * SAMPLE_RATE as f64).round() as i64;
    let filler = bursty_noise(filler_seed, master.len() as f64 / SAMPLE_RATE as f64);

    (0..master.len() as i64)
        .map(|n| {
            let source = n - shift;
            if source >= 0 && (source as usize) < master.len() {
                master[source as usize]
            } else {
                filler[n as usize]
            }
        })
        .collect()
}

/// Dub whose offset jumps partway through.
///
/// The dub starts `lead_seconds` off the master (negative: the first
/// `-lead_seconds` of master are missing) and gains `gap_seconds` of unrelated
/// audio at master time `split_seconds`. The offset is `lead_seconds` before
/// the split and `lead_seconds + gap_seconds` after it.
pub fn stepped(
    master: &[f64],
    lead_seconds: f64,
    split_seconds: f64,
    gap_seconds: f64,
    filler_seed: u64,
) -> Vec<f64> {
    let to_samples = |secs: f64| (secs * SAMPLE_RATE as f64).round() as usize;
    let split = to_samples(split_seconds).min(master.len());
    let lead = to_samples(lead_seconds.max(0.0));
    let gap = to_samples(gap_seconds);
    let filler = bursty_noise(filler_seed, lead_seconds.max(0.0) + gap_seconds + 1.0);

    let head = to_samples((-lead_seconds).max(0.0)).min(split);
    let mut dub = Vec::with_capacity(master.len() + lead + gap);
    dub.extend_from_slice(&filler[..lead]);
    dub.extend_from_slice(&master[head..split]);
    dub.extend_from_slice(&filler[lead..lead + gap]);
    dub.extend_from_slice(&master[split..]);
    dub
}

/// Master and dub tracks with a constant offset.
pub fn pair(seed: u64, seconds: f64, offset_seconds: f64) -> (AudioTrack, AudioTrack) {
    let master = bursty_noise(seed, seconds);
    let dub = shifted(&master, offset_seconds, seed + 1000);
    (
        AudioTrack::new(TrackRole::Master, master, SAMPLE_RATE).unwrap(),
        AudioTrack::new(TrackRole::Dub, dub, SAMPLE_RATE).unwrap(),
    )
}

/// Config with chunks sized for files of a few tens of seconds.
pub fn short_config() -> AnalysisConfig {
    AnalysisConfig::from(&AnalysisSettings {
        sample_rate: SAMPLE_RATE,
        chunk_size_seconds: 8.0,
        refine_chunk_seconds: 4.0,
        ..AnalysisSettings::default()
    })
}
