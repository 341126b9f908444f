//! Pairwise cross-correlation and peak selection.
//!
//! All lag-to-offset conversion goes through [`lag_to_offset_seconds`]. The
//! correlation array is indexed so that `index - (master_len - 1)` is the lag
//! `k` in `c[k] = sum_n master[n] * dub[n + k]`; a peak at positive `k` means
//! the dub content sits later than the master content, i.e. the dub is behind.

use parking_lot::Mutex;
use rustfft::{num_complex::Complex, FftPlanner};

use super::peak_fit::fit_peak;
use super::types::{AnalysisError, AnalysisResult};

/// Mean-square level at or below which an input is treated as flat.
const FLAT_MEAN_SQUARE: f64 = 1e-12;
/// Minimum neighbourhood (in lags) excluded around the peak when looking for a runner-up.
const MIN_PEAK_NEIGHBORHOOD: usize = 3;
/// A peak inside the guide range is kept while it reaches this share of the strongest peak.
pub const GUIDE_PREFERENCE: f64 = 0.8;

/// Convert a correlation index to a signed offset.
///
/// # Arguments
/// * `peak_index` - Position of the peak in the full correlation array (may be fractional)
/// * `master_len` - Length of the master input the array was computed from
/// * `hop_seconds` - Duration of one lag
///
/// # Returns
/// Offset in seconds; positive = dub behind master.
pub fn lag_to_offset_seconds(peak_index: f64, master_len: usize, hop_seconds: f64) -> f64 {
    let center_index = master_len as f64 - 1.0;
    (peak_index - center_index) * hop_seconds
}

/// Selected correlation peak with shape diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationPeak {
    /// Discrete index of the peak.
    pub index: usize,
    /// Parabolically refined index.
    pub refined_index: f64,
    /// Signed correlation value at the discrete peak.
    pub value: f64,
    /// Refined peak magnitude in 0..=1.
    pub magnitude: f64,
    /// How far the correlation falls off one neighbourhood away, 0..=1.
    pub sharpness: f64,
    /// Strongest competing peak outside the neighbourhood, relative to this one.
    pub secondary_ratio: f64,
}

impl CorrelationPeak {
    /// Peak-shape multiplier in 0.5..=1.0; a lone sharp peak scores 1.
    pub fn quality_factor(&self) -> f64 {
        let shape = (self.sharpness * (1.0 - self.secondary_ratio)).clamp(0.0, 1.0);
        0.5 + 0.5 * shape.sqrt()
    }
}

/// Expected offset from an earlier pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchGuide {
    pub offset_seconds: f64,
    /// Half-width of the range the guide vouches for.
    pub radius_seconds: f64,
}

/// Placement of a correlation window on the global timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationWindow {
    /// Seconds per lag.
    pub hop_seconds: f64,
    /// Start of the dub window minus start of the master window, in seconds.
    pub origin_seconds: f64,
    /// Peaks near this offset win unless a clearly stronger peak exists elsewhere.
    pub guide: Option<SearchGuide>,
}

impl CorrelationWindow {
    /// Window with both inputs starting at the same time and no guide.
    pub fn aligned(hop_seconds: f64) -> Self {
        Self {
            hop_seconds,
            origin_seconds: 0.0,
            guide: None,
        }
    }
}

/// Result of correlating two windows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationOutcome {
    /// Global offset in seconds.
    pub offset_seconds: f64,
    /// Normalized peak magnitude in 0..=1.
    pub confidence: f64,
    pub peak: CorrelationPeak,
}

/// FFT cross-correlator shared by every detection method.
pub struct PairwiseCorrelator {
    /// Relative tolerance under which two peaks count as tied.
    tie_tolerance: f64,
    planner: Mutex<FftPlanner<f64>>,
}

impl PairwiseCorrelator {
    pub fn new(tie_tolerance: f64) -> Self {
        Self {
            tie_tolerance: tie_tolerance.max(0.0),
            planner: Mutex::new(FftPlanner::new()),
        }
    }

    /// Full linear normalized cross-correlation.
    ///
    /// Inputs are zero-meaned. Each lag is normalized by the master energy and
    /// the energy of the dub samples it overlaps, so values lie in -1..=1 and a
    /// perfect match scores 1 regardless of how much longer the dub window is.
    ///
    /// # Returns
    /// `len(master) + len(dub) - 1` values, or `InsufficientSignal` when
    /// either input is empty or flat.
    pub fn cross_correlate(&self, master: &[f64], dub: &[f64]) -> AnalysisResult<Vec<f64>> {
        if master.is_empty() || dub.is_empty() {
            return Err(AnalysisError::InsufficientSignal(
                "cannot correlate an empty window".to_string(),
            ));
        }

        let m = zero_mean(master);
        let d = zero_mean(dub);
        let energy_m: f64 = m.iter().map(|x| x * x).sum();
        let energy_d: f64 = d.iter().map(|x| x * x).sum();
        if energy_m <= FLAT_MEAN_SQUARE * m.len() as f64
            || energy_d <= FLAT_MEAN_SQUARE * d.len() as f64
        {
            return Err(AnalysisError::InsufficientSignal(
                "window has no variation to correlate".to_string(),
            ));
        }

        let raw = self.raw_correlation(&m, &d);

        let mut prefix = Vec::with_capacity(d.len() + 1);
        prefix.push(0.0);
        let mut running = 0.0;
        for x in &d {
            running += x * x;
            prefix.push(running);
        }

        let master_len = m.len() as isize;
        let dub_len = d.len() as isize;
        let floor = energy_d * 1e-6;
        let normalized = raw
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let lag = i as isize - (master_len - 1);
                let lo = lag.clamp(0, dub_len) as usize;
                let hi = (lag + master_len).clamp(0, dub_len) as usize;
                let overlap = if hi > lo { prefix[hi] - prefix[lo] } else { 0.0 };
                let value = c / (energy_m * overlap.max(floor)).sqrt();
                value.clamp(-1.0, 1.0)
            })
            .collect();

        Ok(normalized)
    }

    /// `r[k] = sum_n m[n] d[n + k]` for every lag, laid out as the full linear array.
    fn raw_correlation(&self, m: &[f64], d: &[f64]) -> Vec<f64> {
        let full_len = m.len() + d.len() - 1;
        let fft_len = full_len.next_power_of_two();

        let (fft, ifft) = {
            let mut planner = self.planner.lock();
            (
                planner.plan_fft_forward(fft_len),
                planner.plan_fft_inverse(fft_len),
            )
        };

        let mut master_spec: Vec<Complex<f64>> = m.iter().map(|&x| Complex::new(x, 0.0)).collect();
        master_spec.resize(fft_len, Complex::new(0.0, 0.0));
        let mut dub_spec: Vec<Complex<f64>> = d.iter().map(|&x| Complex::new(x, 0.0)).collect();
        dub_spec.resize(fft_len, Complex::new(0.0, 0.0));

        fft.process(&mut master_spec);
        fft.process(&mut dub_spec);

        let mut product: Vec<Complex<f64>> = master_spec
            .iter()
            .zip(&dub_spec)
            .map(|(a, b)| a.conj() * b)
            .collect();
        ifft.process(&mut product);

        let scale = 1.0 / fft_len as f64;
        let center = m.len() as isize - 1;
        (0..full_len)
            .map(|i| {
                let lag = i as isize - center;
                let slot = lag.rem_euclid(fft_len as isize) as usize;
                product[slot].re * scale
            })
            .collect()
    }

    /// Pick the peak of a correlation array.
    ///
    /// The largest absolute value wins. Values within the tie tolerance of it
    /// are resolved toward the anchor, then the lower index. The runner-up is
    /// looked for over the whole array, so a stronger peak outside `range`
    /// shows up in `secondary_ratio`.
    ///
    /// # Arguments
    /// * `values` - Correlation array
    /// * `anchor_index` - Index ties are resolved toward (zero offset or the guide)
    /// * `range` - Inclusive index range to search, `None` for all
    pub fn find_peak(
        &self,
        values: &[f64],
        anchor_index: usize,
        range: Option<(usize, usize)>,
    ) -> AnalysisResult<CorrelationPeak> {
        if values.is_empty() {
            return Err(AnalysisError::Correlation(
                "empty correlation array".to_string(),
            ));
        }
        let (lo, hi) = range.unwrap_or((0, values.len() - 1));
        let hi = hi.min(values.len() - 1);
        if lo > hi {
            return Err(AnalysisError::Correlation(
                "peak search range is empty".to_string(),
            ));
        }

        let max_abs = values[lo..=hi].iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let cutoff = max_abs - self.tie_tolerance * max_abs;

        let mut best: Option<usize> = None;
        for i in lo..=hi {
            if values[i].abs() < cutoff {
                continue;
            }
            let distance = i.abs_diff(anchor_index);
            match best {
                Some(b) if b.abs_diff(anchor_index) <= distance => {}
                _ => best = Some(i),
            }
        }
        let index = best.unwrap_or(lo);

        let magnitudes: Vec<f64> = values.iter().map(|v| v.abs()).collect();
        let fitted = fit_peak(&magnitudes, index);
        let magnitude = fitted.value.clamp(0.0, 1.0);

        let neighborhood = peak_neighborhood(values.len());
        let sharpness = if magnitude > 0.0 {
            let left = index
                .checked_sub(neighborhood)
                .map(|i| magnitudes[i])
                .unwrap_or(0.0);
            let right = magnitudes.get(index + neighborhood).copied().unwrap_or(0.0);
            (1.0 - (left + right) / (2.0 * magnitude)).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let secondary = (0..values.len())
            .filter(|&i| i.abs_diff(index) > neighborhood)
            .map(|i| magnitudes[i])
            .fold(0.0_f64, f64::max);
        let secondary_ratio = if magnitude > 0.0 {
            (secondary / magnitude).clamp(0.0, 1.0)
        } else {
            1.0
        };

        Ok(CorrelationPeak {
            index,
            refined_index: fitted.position,
            value: values[index],
            magnitude,
            sharpness,
            secondary_ratio,
        })
    }

    /// Correlate two windows and convert the peak to a global offset.
    ///
    /// With a guide, the strongest peak inside the guide range is taken as
    /// long as it reaches [`GUIDE_PREFERENCE`] of the strongest peak overall;
    /// otherwise the stronger peak wins wherever it is.
    ///
    /// # Arguments
    /// * `master` - Master window values
    /// * `dub` - Dub window values, sampled on the same hop
    /// * `window` - Hop, window origin and optional guide
    pub fn correlate(
        &self,
        master: &[f64],
        dub: &[f64],
        window: CorrelationWindow,
    ) -> AnalysisResult<CorrelationOutcome> {
        if window.hop_seconds <= 0.0 {
            return Err(AnalysisError::Correlation(
                "non-positive correlation hop".to_string(),
            ));
        }

        let values = self.cross_correlate(master, dub)?;
        let center_index = master.len() - 1;
        let last = (values.len() - 1) as f64;
        let to_index = |offset: f64| {
            (offset - window.origin_seconds) / window.hop_seconds + center_index as f64
        };

        let anchor_offset = window.guide.map_or(0.0, |g| g.offset_seconds);
        let anchor_index = to_index(anchor_offset).round().clamp(0.0, last) as usize;

        let strongest = self.find_peak(&values, anchor_index, None)?;
        let peak = match window.guide {
            Some(guide) => {
                let lo = to_index(guide.offset_seconds - guide.radius_seconds)
                    .ceil()
                    .max(0.0);
                let hi = to_index(guide.offset_seconds + guide.radius_seconds)
                    .floor()
                    .min(last);
                if lo <= hi {
                    let local =
                        self.find_peak(&values, anchor_index, Some((lo as usize, hi as usize)))?;
                    // A local pick next to the strongest peak is its flank, not a rival.
                    let flank = local.index != strongest.index
                        && local.index.abs_diff(strongest.index) <= peak_neighborhood(values.len());
                    if !flank && local.magnitude >= GUIDE_PREFERENCE * strongest.magnitude {
                        local
                    } else {
                        strongest
                    }
                } else {
                    strongest
                }
            }
            None => strongest,
        };

        let offset_seconds =
            lag_to_offset_seconds(peak.refined_index, master.len(), window.hop_seconds)
                + window.origin_seconds;

        Ok(CorrelationOutcome {
            offset_seconds,
            confidence: peak.magnitude,
            peak,
        })
    }
}

/// Lags around a peak that belong to it.
fn peak_neighborhood(len: usize) -> usize {
    (len / 100).max(MIN_PEAK_NEIGHBORHOOD)
}

fn zero_mean(values: &[f64]) -> Vec<f64> {
    let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
    values.iter().map(|v| v - mean).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn noise(len: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn delayed(signal: &[f64], delay: usize) -> Vec<f64> {
        let mut out = vec![0.0; delay];
        out.extend_from_slice(signal);
        out
    }

    #[test]
    fn full_correlation_has_expected_length() {
        let correlator = PairwiseCorrelator::new(1e-6);
        let values = correlator
            .cross_correlate(&noise(100, 1), &noise(250, 2))
            .unwrap();
        assert_eq!(values.len(), 349);
    }

    #[test]
    fn delayed_dub_gives_positive_offset() {
        let correlator = PairwiseCorrelator::new(1e-6);
        let master = noise(2000, 3);
        let dub = delayed(&master, 137);

        let outcome = correlator
            .correlate(&master, &dub, CorrelationWindow::aligned(0.001))
            .unwrap();

        assert!((outcome.offset_seconds - 0.137).abs() < 2e-4);
        assert!(outcome.confidence > 0.99);
    }

    #[test]
    fn advanced_dub_gives_negative_offset() {
        let correlator = PairwiseCorrelator::new(1e-6);
        let master = noise(2000, 4);
        let dub = master[250..].to_vec();

        let outcome = correlator
            .correlate(&master, &dub, CorrelationWindow::aligned(0.001))
            .unwrap();

        assert!((outcome.offset_seconds + 0.250).abs() < 2e-4);
    }

    #[test]
    fn inverted_polarity_still_aligns() {
        let correlator = PairwiseCorrelator::new(1e-6);
        let master = noise(1500, 5);
        let dub: Vec<f64> = delayed(&master, 40).iter().map(|v| -v).collect();

        let outcome = correlator
            .correlate(&master, &dub, CorrelationWindow::aligned(1.0))
            .unwrap();

        assert!((outcome.offset_seconds - 40.0).abs() < 0.2);
        assert!(outcome.peak.value < 0.0);
    }

    #[test]
    fn origin_shifts_offset() {
        let correlator = PairwiseCorrelator::new(1e-6);
        let master = noise(500, 6);
        let dub = delayed(&master, 30);

        // Dub window pretends to start 2 lags later than the master window.
        let window = CorrelationWindow {
            hop_seconds: 1.0,
            origin_seconds: 2.0,
            guide: None,
        };
        let outcome = correlator.correlate(&master, &dub, window).unwrap();
        assert!((outcome.offset_seconds - 32.0).abs() < 0.2);
    }

    #[test]
    fn stronger_peak_outside_guide_wins() {
        let correlator = PairwiseCorrelator::new(1e-6);
        let master = noise(500, 6);
        let dub = delayed(&master, 30);

        let window = CorrelationWindow {
            hop_seconds: 1.0,
            origin_seconds: 0.0,
            guide: Some(SearchGuide {
                offset_seconds: 0.0,
                radius_seconds: 10.0,
            }),
        };
        let outcome = correlator.correlate(&master, &dub, window).unwrap();
        assert!((outcome.offset_seconds - 30.0).abs() < 0.2);
        assert!(outcome.confidence > 0.9);
    }

    #[test]
    fn guide_picks_between_comparable_peaks() {
        let correlator = PairwiseCorrelator::new(1e-6);
        let master = noise(200, 9);
        // The same content appears twice in the dub, at +50 and +400.
        let mut dub = vec![0.0; 50];
        dub.extend_from_slice(&master);
        dub.extend(vec![0.0; 150]);
        dub.extend_from_slice(&master);

        for expected in [50.0, 400.0] {
            let window = CorrelationWindow {
                hop_seconds: 1.0,
                origin_seconds: 0.0,
                guide: Some(SearchGuide {
                    offset_seconds: expected + 3.0,
                    radius_seconds: 10.0,
                }),
            };
            let outcome = correlator.correlate(&master, &dub, window).unwrap();
            assert!(
                (outcome.offset_seconds - expected).abs() < 0.5,
                "guide {} gave {}",
                expected + 3.0,
                outcome.offset_seconds
            );
        }
    }

    #[test]
    fn flat_input_is_insufficient_signal() {
        let correlator = PairwiseCorrelator::new(1e-6);
        let result = correlator.cross_correlate(&vec![0.5; 64], &noise(64, 7));
        assert!(matches!(result, Err(AnalysisError::InsufficientSignal(_))));
    }

    #[test]
    fn tie_prefers_smallest_absolute_lag() {
        let correlator = PairwiseCorrelator::new(1e-6);
        let values = [0.9, 0.1, 0.0, 0.3, 0.0, 0.1, 0.9, 0.0, 0.0];
        let peak = correlator.find_peak(&values, 4, None).unwrap();
        assert_eq!(peak.index, 6);

        let symmetric = [0.0, 1.0, 0.2, 0.5, 0.2, 1.0, 0.0];
        let peak = correlator.find_peak(&symmetric, 3, None).unwrap();
        assert_eq!(peak.index, 1);
    }

    #[test]
    fn peak_shape_diagnostics() {
        let correlator = PairwiseCorrelator::new(1e-6);
        let mut values = vec![0.0; 101];
        values[50] = 1.0;
        values[49] = 0.5;
        values[51] = 0.5;
        values[90] = 0.4;

        let peak = correlator.find_peak(&values, 50, None).unwrap();
        assert_eq!(peak.index, 50);
        assert!((peak.sharpness - 1.0).abs() < 1e-9);
        assert!((peak.secondary_ratio - 0.4).abs() < 0.01);
        assert!(peak.quality_factor() > 0.5 && peak.quality_factor() < 1.0);
    }

    #[test]
    fn lag_conversion_is_centered_on_master_length() {
        assert_eq!(lag_to_offset_seconds(9.0, 10, 0.5), 0.0);
        assert_eq!(lag_to_offset_seconds(12.0, 10, 0.5), 1.5);
        assert_eq!(lag_to_offset_seconds(5.0, 10, 0.5), -2.0);
    }
}
