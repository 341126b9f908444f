//! Media decoding through the ffmpeg and ffprobe executables.
//!
//! Audio is downmixed to mono, resampled to the analysis rate and read back
//! as little-endian f64 PCM from ffmpeg's stdout.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};

use dubsync_core::analysis::{AnalysisError, AnalysisResult, AudioTrack, TrackRole};
use dubsync_core::scheduler::TrackLoader;

/// Decodes tracks at a fixed sample rate.
#[derive(Debug, Clone, Copy)]
pub struct FfmpegLoader {
    sample_rate: u32,
}

impl FfmpegLoader {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl TrackLoader for FfmpegLoader {
    fn load(&self, path: &Path, role: TrackRole) -> AnalysisResult<AudioTrack> {
        let samples = decode_mono(path, self.sample_rate)?;
        let track = AudioTrack::new(role, samples, self.sample_rate)?;

        match probe_duration(path) {
            Ok(container) if (container - track.duration_secs()).abs() > 1.0 => tracing::warn!(
                "{} decoded to {:.2}s but the container reports {:.2}s",
                path.display(),
                track.duration_secs(),
                container
            ),
            Ok(_) => {}
            Err(e) => tracing::debug!("ffprobe unavailable for {}: {}", path.display(), e),
        }
        Ok(track)
    }
}

/// Decode the first audio stream of `input_path` to mono f64 samples.
pub fn decode_mono(input_path: &Path, sample_rate: u32) -> AnalysisResult<Vec<f64>> {
    if !input_path.exists() {
        return Err(AnalysisError::Decode(format!(
            "file not found: {}",
            input_path.display()
        )));
    }

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-nostdin")
        .arg("-i")
        .arg(input_path)
        .arg("-vn")
        .arg("-ac")
        .arg("1")
        .arg("-ar")
        .arg(sample_rate.to_string())
        .arg("-f")
        .arg("f64le")
        .arg("-acodec")
        .arg("pcm_f64le")
        .arg("pipe:1");
    cmd.stderr(Stdio::null()).stdout(Stdio::piped());

    tracing::debug!("Running ffmpeg: {:?}", cmd);

    let mut child = cmd
        .spawn()
        .map_err(|e| AnalysisError::Decode(format!("failed to spawn ffmpeg: {}", e)))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| AnalysisError::Decode("failed to capture ffmpeg stdout".to_string()))?;

    let mut buffer = Vec::new();
    stdout
        .read_to_end(&mut buffer)
        .map_err(|e| AnalysisError::Decode(format!("failed to read ffmpeg output: {}", e)))?;

    let status = child
        .wait()
        .map_err(|e| AnalysisError::Decode(format!("ffmpeg process error: {}", e)))?;
    if !status.success() {
        return Err(AnalysisError::Decode(format!(
            "ffmpeg exited with code {:?} for {}",
            status.code(),
            input_path.display()
        )));
    }

    let samples = bytes_to_f64_samples(&buffer);
    if samples.is_empty() {
        return Err(AnalysisError::Decode(format!(
            "no audio decoded from {}",
            input_path.display()
        )));
    }

    tracing::debug!(
        "Decoded {} samples ({:.2}s) from {}",
        samples.len(),
        samples.len() as f64 / sample_rate as f64,
        input_path.display()
    );
    Ok(samples)
}

/// Container duration in seconds as reported by ffprobe.
pub fn probe_duration(input_path: &Path) -> AnalysisResult<f64> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=noprint_wrappers=1:nokey=1")
        .arg(input_path)
        .output()
        .map_err(|e| AnalysisError::Decode(format!("failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        return Err(AnalysisError::Decode(format!(
            "ffprobe could not read {}",
            input_path.display()
        )));
    }

    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<f64>()
        .map_err(|e| AnalysisError::Decode(format!("unparseable duration: {}", e)))
}

/// Little-endian f64 samples; a trailing partial sample is dropped.
fn bytes_to_f64_samples(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(chunk);
            f64::from_le_bytes(arr)
        })
        .collect()
}
