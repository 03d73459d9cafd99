use serde::{Deserialize, Serialize};

use super::model::Normalization;

// ---------------------------------------------------------------------------
// Shirley background
// ---------------------------------------------------------------------------

/// Iteration limits for [`shirley`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShirleyParams {
    pub tol: f64,
    pub maxit: usize,
}

impl Default for ShirleyParams {
    fn default() -> Self {
        Self {
            tol: 1e-5,
            maxit: 20,
        }
    }
}

/// How a Shirley computation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShirleyStatus {
    Converged,
    /// `maxit` reached; the last iterate is returned.
    MaxIterations,
    /// The integral vanished (flat or zero-amplitude signal); background is
    /// the constant `intensity[-1]`.
    Flat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShirleyBackground {
    pub curve: Vec<f64>,
    pub iterations: usize,
    pub status: ShirleyStatus,
}

/// Iterative Shirley background of `intensity` over `energy`.
///
/// The integration runs from the high-energy end, so an ascending axis is
/// reversed internally and the curve is reversed back before returning.
/// The output always has the input's length and orientation.
pub fn shirley(energy: &[f64], intensity: &[f64], params: ShirleyParams) -> ShirleyBackground {
    let n = energy.len().min(intensity.len());
    if n < 2 {
        return ShirleyBackground {
            curve: intensity[..n].to_vec(),
            iterations: 0,
            status: ShirleyStatus::Flat,
        };
    }

    let ascending = energy[0] < energy[n - 1];
    let (energy, intensity): (Vec<f64>, Vec<f64>) = if ascending {
        (
            energy[..n].iter().rev().copied().collect(),
            intensity[..n].iter().rev().copied().collect(),
        )
    } else {
        (energy[..n].to_vec(), intensity[..n].to_vec())
    };

    let first = intensity[0];
    let last = intensity[n - 1];
    let spacing = (energy[n - 1] - energy[0]) / (n - 1) as f64;
    let scale = if first != 0.0 { first.abs() } else { 1.0 };

    let mut background = vec![last; n];
    let mut status = ShirleyStatus::MaxIterations;
    let mut iterations = 0;

    while iterations < params.maxit {
        iterations += 1;
        let subtracted: Vec<f64> = intensity
            .iter()
            .zip(&background)
            .map(|(i, b)| i - b)
            .collect();
        let total: f64 = subtracted.iter().sum();
        let tail = subtracted[n - 1];

        let mut cumsum = 0.0;
        let integral: Vec<f64> = subtracted
            .iter()
            .map(|&s| {
                cumsum += s;
                spacing * (total - cumsum - 0.5 * (s + tail))
            })
            .collect();

        if integral[0] == 0.0 || !integral[0].is_finite() {
            log::warn!("shirley: vanishing integral, using flat background");
            background = vec![last; n];
            status = ShirleyStatus::Flat;
            break;
        }

        let new_background: Vec<f64> = integral
            .iter()
            .map(|v| (first - last) * v / integral[0] + last)
            .collect();

        let delta = new_background
            .iter()
            .zip(&background)
            .map(|(nb, b)| ((nb - b) / scale).powi(2))
            .sum::<f64>()
            .sqrt();

        background = new_background;
        if delta < params.tol {
            status = ShirleyStatus::Converged;
            break;
        }
    }

    if status == ShirleyStatus::MaxIterations {
        log::warn!(
            "shirley: max iterations ({}) exceeded before convergence",
            params.maxit
        );
    }

    if ascending {
        background.reverse();
    }
    ShirleyBackground {
        curve: background,
        iterations,
        status,
    }
}

// ---------------------------------------------------------------------------
// Linear background, smoothing, normalization
// ---------------------------------------------------------------------------

/// Straight line from the first to the last intensity sample.
pub fn linear_background(intensity: &[f64]) -> Vec<f64> {
    let n = intensity.len();
    match n {
        0 => Vec::new(),
        1 => vec![intensity[0]],
        _ => {
            let first = intensity[0];
            let step = (intensity[n - 1] - first) / (n - 1) as f64;
            (0..n).map(|k| first + step * k as f64).collect()
        }
    }
}

/// Centered moving average over `window` samples.
///
/// Windows of 0 and 1 are the identity. Longer windows keep the input length
/// by repeating the first/last averaged value at the edges; an even window
/// puts the extra padding sample on the right.
pub fn moving_average(x: &[f64], window: usize) -> Vec<f64> {
    let n = x.len();
    if window <= 1 || n == 0 {
        return x.to_vec();
    }
    let window = window.min(n);

    let mut averaged = Vec::with_capacity(n - window + 1);
    let mut acc: f64 = x[..window].iter().sum();
    averaged.push(acc / window as f64);
    for k in window..n {
        acc += x[k] - x[k - window];
        averaged.push(acc / window as f64);
    }

    let left = (window - 1) / 2;
    let right = window - 1 - left;
    let head = averaged[0];
    let tail = averaged[averaged.len() - 1];

    let mut out = Vec::with_capacity(n);
    out.extend(std::iter::repeat(head).take(left));
    out.extend_from_slice(&averaged);
    out.extend(std::iter::repeat(tail).take(right));
    out
}

/// Scale intensities according to `norm`.
///
/// `Off` is the identity, `Value(v)` with `v > 0` divides by `v`, anything
/// else divides by the maximum. A zero or non-finite maximum leaves the data
/// unchanged.
pub fn normalize(x: &[f64], norm: Normalization) -> Vec<f64> {
    let divisor = match norm {
        Normalization::Off => return x.to_vec(),
        Normalization::Value(v) if v > 0.0 => v,
        _ => x.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    };
    if divisor == 0.0 || !divisor.is_finite() {
        log::warn!("normalize: maximum is {divisor}, leaving intensity unscaled");
        return x.to_vec();
    }
    x.iter().map(|v| v / divisor).collect()
}

// ---------------------------------------------------------------------------
// Axis lookups
// ---------------------------------------------------------------------------

/// Index of `value` on a monotonic axis of either direction, clamped to the
/// valid index range. Returns the first sample at or beyond `value` in the
/// axis' own direction.
pub fn search_sorted(axis: &[f64], value: f64) -> usize {
    if axis.is_empty() {
        return 0;
    }
    let last = axis.len() - 1;
    let idx = if axis[0] <= axis[last] {
        axis.partition_point(|&e| e < value)
    } else {
        axis.partition_point(|&e| e > value)
    };
    idx.min(last)
}

/// Inclusive, ascending index range covering `[a, b]` on `axis`.
pub fn index_range(axis: &[f64], a: f64, b: f64) -> (usize, usize) {
    let i = search_sorted(axis, a);
    let j = search_sorted(axis, b);
    (i.min(j), i.max(j))
}

/// Index of the sample closest to `value`.
pub fn nearest_index(axis: &[f64], value: f64) -> Option<usize> {
    axis.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - value).abs().total_cmp(&(*b - value).abs()))
        .map(|(i, _)| i)
}

/// Energy of the highest intensity sample whose energy lies within `span`
/// (bounds in either order, inclusive).
pub fn energy_at_maximum(energy: &[f64], intensity: &[f64], span: (f64, f64)) -> Option<f64> {
    let (lo, hi) = if span.0 <= span.1 {
        span
    } else {
        (span.1, span.0)
    };
    energy
        .iter()
        .zip(intensity)
        .filter(|(e, _)| **e >= lo && **e <= hi)
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(e, _)| *e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &[f64], b: &[f64], tol: f64) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tol)
    }

    /// Gaussian peak on a step: high background on the high-energy side.
    fn synthetic_peak() -> (Vec<f64>, Vec<f64>) {
        let energy: Vec<f64> = (0..200).map(|i| 300.0 - i as f64 * 0.1).collect();
        let intensity = energy
            .iter()
            .map(|e| {
                let peak = 1000.0 * (-(e - 290.0_f64).powi(2) / 2.0).exp();
                let step = if *e > 290.0 { 300.0 } else { 100.0 };
                peak + step
            })
            .collect();
        (energy, intensity)
    }

    #[test]
    fn shirley_keeps_length_and_endpoints() {
        let (energy, intensity) = synthetic_peak();
        let bg = shirley(&energy, &intensity, ShirleyParams::default());
        assert_eq!(bg.curve.len(), energy.len());
        assert_eq!(bg.status, ShirleyStatus::Converged);
        assert!((bg.curve[0] - intensity[0]).abs() < 1e-6);
        assert!((bg.curve[199] - intensity[199]).abs() < 1e-6);
        // stays between the two plateaus
        assert!(bg.curve.iter().all(|b| *b > 99.0 && *b < 301.0));
        // and has stepped up well before the high-energy end
        assert!(bg.curve[50] > 250.0);
        assert!(bg.curve[150] < 150.0);
    }

    #[test]
    fn shirley_is_orientation_independent() {
        let (energy, intensity) = synthetic_peak();
        let forward = shirley(&energy, &intensity, ShirleyParams::default());

        let rev_e: Vec<f64> = energy.iter().rev().copied().collect();
        let rev_i: Vec<f64> = intensity.iter().rev().copied().collect();
        let mut backward = shirley(&rev_e, &rev_i, ShirleyParams::default()).curve;
        backward.reverse();

        assert!(close(&forward.curve, &backward, 1e-9));
    }

    #[test]
    fn shirley_flat_signal_falls_back_to_constant() {
        let energy = [5.0, 4.0, 3.0, 2.0, 1.0];
        let intensity = [2.0; 5];
        let bg = shirley(&energy, &intensity, ShirleyParams::default());
        assert_eq!(bg.status, ShirleyStatus::Flat);
        assert_eq!(bg.curve, vec![2.0; 5]);
    }

    #[test]
    fn shirley_reports_exhausted_iterations() {
        let (energy, intensity) = synthetic_peak();
        let params = ShirleyParams { tol: 0.0, maxit: 3 };
        let bg = shirley(&energy, &intensity, params);
        assert_eq!(bg.status, ShirleyStatus::MaxIterations);
        assert_eq!(bg.iterations, 3);
        assert_eq!(bg.curve.len(), energy.len());
    }

    #[test]
    fn shirley_short_inputs() {
        assert!(shirley(&[], &[], ShirleyParams::default()).curve.is_empty());
        assert_eq!(shirley(&[1.0], &[7.0], ShirleyParams::default()).curve, vec![7.0]);
    }

    #[test]
    fn linear_background_spans_endpoints() {
        assert_eq!(linear_background(&[1.0, 5.0, 9.0, 3.0, 4.0]), vec![1.0, 1.75, 2.5, 3.25, 4.0]);
        assert_eq!(linear_background(&[3.0]), vec![3.0]);
        assert!(linear_background(&[]).is_empty());
    }

    #[test]
    fn moving_average_identity_windows() {
        let x = [1.0, 4.0, 2.0, 8.0];
        assert_eq!(moving_average(&x, 0), x.to_vec());
        assert_eq!(moving_average(&x, 1), x.to_vec());
    }

    #[test]
    fn moving_average_odd_window_pads_symmetrically() {
        let x = [0.0, 3.0, 6.0, 9.0, 12.0];
        assert_eq!(moving_average(&x, 3), vec![3.0, 3.0, 6.0, 9.0, 9.0]);
    }

    #[test]
    fn moving_average_even_window_keeps_length() {
        let x = [0.0, 2.0, 4.0, 6.0, 8.0];
        let out = moving_average(&x, 2);
        assert_eq!(out, vec![1.0, 3.0, 5.0, 7.0, 7.0]);
        assert_eq!(moving_average(&x, 4).len(), x.len());
    }

    #[test]
    fn moving_average_window_longer_than_data() {
        let out = moving_average(&[1.0, 2.0, 3.0], 10);
        assert_eq!(out, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn normalize_modes() {
        let x = [1.0, 4.0, 2.0];
        assert_eq!(normalize(&x, Normalization::Off), x.to_vec());
        assert_eq!(normalize(&x, Normalization::Value(2.0)), vec![0.5, 2.0, 1.0]);
        let auto = normalize(&x, Normalization::Max);
        let max = auto.iter().copied().fold(f64::MIN, f64::max);
        assert!((max - 1.0).abs() < 1e-12);
        // non-positive fixed values fall back to the maximum
        assert_eq!(normalize(&x, Normalization::Value(-1.0)), auto);
    }

    #[test]
    fn normalize_all_zero_is_untouched() {
        assert_eq!(normalize(&[0.0, 0.0], Normalization::Max), vec![0.0, 0.0]);
    }

    #[test]
    fn search_sorted_both_directions_with_clamping() {
        let asc = [1.0, 2.0, 3.0, 4.0];
        let desc = [4.0, 3.0, 2.0, 1.0];
        assert_eq!(search_sorted(&asc, 2.0), 1);
        assert_eq!(search_sorted(&desc, 2.0), 2);
        assert_eq!(search_sorted(&asc, 99.0), 3);
        assert_eq!(search_sorted(&desc, -5.0), 3);
        assert_eq!(search_sorted(&desc, 99.0), 0);
        assert_eq!(index_range(&desc, 1.0, 3.0), index_range(&desc, 3.0, 1.0));
    }

    #[test]
    fn nearest_and_maximum_lookups() {
        let energy = [10.0, 9.0, 8.0, 7.0];
        let intensity = [1.0, 3.0, 7.0, 2.0];
        assert_eq!(nearest_index(&energy, 8.4), Some(2));
        assert_eq!(nearest_index(&[], 1.0), None);
        assert_eq!(energy_at_maximum(&energy, &intensity, (9.5, 7.5)), Some(8.0));
        assert_eq!(energy_at_maximum(&energy, &intensity, (9.5, 8.5)), Some(9.0));
        assert_eq!(energy_at_maximum(&energy, &intensity, (20.0, 30.0)), None);
    }
}
