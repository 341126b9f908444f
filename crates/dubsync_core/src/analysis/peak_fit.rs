//! Parabolic peak refinement.
//!
//! Fits a parabola through a discrete peak and its two neighbours to locate
//! the true maximum between lags.

/// Sub-lag position and height of a refined peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FittedPeak {
    /// Refined position in array index units (fractional).
    pub position: f64,
    /// Interpolated peak height.
    pub value: f64,
    /// Whether interpolation was applied.
    pub fitted: bool,
}

/// Refine a discrete peak with quadratic interpolation.
///
/// # Arguments
/// * `values` - Peak-shaped array (correlation magnitudes)
/// * `peak_index` - Index of the discrete maximum
///
/// # Returns
/// The refined peak. At the array edges the discrete peak is returned
/// unchanged, and the fractional shift is clamped to one lag.
pub fn fit_peak(values: &[f64], peak_index: usize) -> FittedPeak {
    let discrete = FittedPeak {
        position: peak_index as f64,
        value: values.get(peak_index).copied().unwrap_or(0.0),
        fitted: false,
    };

    if peak_index == 0 || peak_index + 1 >= values.len() {
        return discrete;
    }

    let y0 = values[peak_index - 1];
    let y1 = values[peak_index];
    let y2 = values[peak_index + 1];

    // y = a x^2 + b x + c through (-1, y0), (0, y1), (1, y2)
    let a = (y0 + y2) / 2.0 - y1;
    let b = (y2 - y0) / 2.0;

    if a.abs() <= 1e-12 {
        return discrete;
    }

    let delta = (-b / (2.0 * a)).clamp(-1.0, 1.0);
    FittedPeak {
        position: peak_index as f64 + delta,
        value: y1 - (b * b) / (4.0 * a),
        fitted: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_offset_of_true_parabola() {
        let values: Vec<f64> = (0..11)
            .map(|i| {
                let x = i as f64 - 5.3;
                1.0 - x * x
            })
            .collect();

        let peak = fit_peak(&values, 5);
        assert!(peak.fitted);
        assert!((peak.position - 5.3).abs() < 1e-9, "got {}", peak.position);
        assert!((peak.value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn symmetric_peak_stays_put() {
        let peak = fit_peak(&[0.5, 0.8, 1.0, 0.8, 0.5], 2);
        assert!((peak.position - 2.0).abs() < 1e-12);
    }

    #[test]
    fn asymmetric_peak_shifts_toward_larger_neighbour() {
        // a = -0.3, b = 0.1, delta = 1/6
        let peak = fit_peak(&[0.3, 0.6, 1.0, 0.8, 0.4], 2);
        assert!((peak.position - (2.0 + 1.0 / 6.0)).abs() < 1e-9);
        assert!(peak.value > 1.0);
    }

    #[test]
    fn edges_return_discrete_peak() {
        let peak = fit_peak(&[1.0, 0.8, 0.5, 0.3], 0);
        assert!(!peak.fitted);
        assert_eq!(peak.position, 0.0);

        let peak = fit_peak(&[0.1, 0.2, 0.9], 2);
        assert!(!peak.fitted);
        assert_eq!(peak.position, 2.0);
    }

    #[test]
    fn flat_top_is_not_interpolated() {
        let peak = fit_peak(&[1.0, 1.0, 1.0], 1);
        assert!(!peak.fitted);
        assert_eq!(peak.value, 1.0);
    }
}
