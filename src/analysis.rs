//! Linearity analysis: gain/offset fit, INL, DNL, nonlinearity.
//!
//! Pure computation over a (commanded, measured) series. No I/O, no state;
//! the sequencer hands the scan series in and gets metrics back in memory.

use crate::core::{LinearityMetrics, ScanSeries};

/// `lsb_ideal` substitute when the derived step size evaluates to zero.
const LSB_EPSILON: f64 = 1e-9;

/// Computes linearity metrics for a commanded/measured series.
///
/// Returns `None` when fewer than two points are available: a cancelled or
/// failed scan produces no metrics rather than a division fault.
pub fn analyze(commanded: &[f64], measured: &[f64]) -> Option<LinearityMetrics> {
    let n = commanded.len().min(measured.len());
    if n < 2 {
        return None;
    }
    let x = &commanded[..n];
    let y = &measured[..n];

    let (gain, offset) = least_squares(x, y);

    // Expected output step per input step: mean commanded delta times the
    // fitted gain. Guarded against a degenerate zero step.
    let avg_step = x.windows(2).map(|w| w[1] - w[0]).sum::<f64>() / (n - 1) as f64;
    let mut lsb_ideal = avg_step * gain;
    if lsb_ideal == 0.0 {
        lsb_ideal = LSB_EPSILON;
    }

    let fit: Vec<f64> = x.iter().map(|&xi| gain * xi + offset).collect();
    let inl: Vec<f64> = y
        .iter()
        .zip(&fit)
        .map(|(&yi, &fi)| (yi - fi) / lsb_ideal)
        .collect();

    let mut dnl = vec![0.0; n];
    for i in 1..n {
        dnl[i] = (y[i] - y[i - 1]) / lsb_ideal - 1.0;
    }

    let max_dev = y
        .iter()
        .zip(&fit)
        .map(|(&yi, &fi)| (yi - fi).abs())
        .fold(0.0, f64::max);
    let y_min = y.iter().copied().fold(f64::INFINITY, f64::min);
    let y_max = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let fsr = y_max - y_min;
    let nonlinearity_pct = if fsr > 0.0 { 100.0 * max_dev / fsr } else { 0.0 };

    let max_inl = inl.iter().map(|v| v.abs()).fold(0.0, f64::max);
    let max_dnl = dnl.iter().map(|v| v.abs()).fold(0.0, f64::max);

    Some(LinearityMetrics {
        gain,
        offset,
        lsb_ideal,
        inl,
        dnl,
        max_inl,
        max_dnl,
        nonlinearity_pct,
    })
}

/// Convenience wrapper over a [`ScanSeries`].
pub fn analyze_series(series: &ScanSeries) -> Option<LinearityMetrics> {
    analyze(&series.commanded, &series.measured)
}

/// Ordinary least-squares fit `y ≈ gain * x + offset`.
///
/// Falls back to slope 0 when all x are identical (the caller's epsilon
/// guard handles the resulting zero LSB).
fn least_squares(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let sum_x: f64 = x.iter().sum();
    let sum_y: f64 = y.iter().sum();
    let sum_xx: f64 = x.iter().map(|v| v * v).sum();
    let sum_xy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return (0.0, sum_y / n);
    }
    let gain = (n * sum_xy - sum_x * sum_y) / denom;
    let offset = (sum_y - gain * sum_x) / n;
    (gain, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-9;

    #[test]
    fn test_perfectly_linear_series() {
        // y = 2x + 1
        let x = [-1.0, -0.5, 0.0, 0.5, 1.0];
        let y: Vec<f64> = x.iter().map(|&v| 2.0 * v + 1.0).collect();
        let m = analyze(&x, &y).unwrap();
        assert!((m.gain - 2.0).abs() < TOL);
        assert!((m.offset - 1.0).abs() < TOL);
        assert!(m.max_inl.abs() < TOL);
        assert!(m.max_dnl.abs() < TOL);
        assert!(m.nonlinearity_pct.abs() < TOL);
        // LSB = mean input step (0.5) * gain (2.0).
        assert!((m.lsb_ideal - 1.0).abs() < TOL);
    }

    #[test]
    fn test_dnl_first_point_is_zero() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [0.1, 1.3, 1.9, 3.2];
        let m = analyze(&x, &y).unwrap();
        assert_eq!(m.dnl[0], 0.0);
    }

    #[test]
    fn test_insufficient_data_returns_none() {
        assert!(analyze(&[], &[]).is_none());
        assert!(analyze(&[1.0], &[2.0]).is_none());
    }

    #[test]
    fn test_flat_series_uses_epsilon_lsb() {
        // Zero gain makes the derived LSB zero; the epsilon guard keeps the
        // division defined.
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [5.0, 5.0, 5.0, 5.0];
        let m = analyze(&x, &y).unwrap();
        assert!(m.lsb_ideal > 0.0);
        assert_eq!(m.nonlinearity_pct, 0.0); // fsr == 0
        assert!(m.inl.iter().all(|v| v.is_finite()));
        assert!(m.dnl.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_identical_inputs_do_not_divide_by_zero() {
        let x = [1.0, 1.0, 1.0];
        let y = [0.9, 1.0, 1.1];
        let m = analyze(&x, &y).unwrap();
        assert!(m.gain.is_finite());
        assert!(m.inl.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_known_nonlinearity() {
        // A single half-LSB bump in an otherwise perfect ramp.
        let x: Vec<f64> = (0..11).map(|i| i as f64).collect();
        let mut y = x.clone();
        y[5] += 0.5;
        let m = analyze(&x, &y).unwrap();
        assert!(m.max_inl > 0.4 && m.max_inl < 0.6);
        assert!(m.max_dnl > 0.4 && m.max_dnl < 0.6);
        assert!(m.nonlinearity_pct > 0.0);
    }

    #[test]
    fn test_negative_gain_chain() {
        // Attenuating, inverting stage: y = -0.5x + 0.1.
        let x = [-0.4, -0.2, 0.0, 0.2, 0.4];
        let y: Vec<f64> = x.iter().map(|&v| -0.5 * v + 0.1).collect();
        let m = analyze(&x, &y).unwrap();
        assert!((m.gain + 0.5).abs() < TOL);
        assert!((m.offset - 0.1).abs() < TOL);
        assert!(m.nonlinearity_pct.abs() < 1e-6);
    }

    #[test]
    fn test_series_wrapper() {
        let mut series = ScanSeries::default();
        for i in 0..5 {
            let v = f64::from(i);
            series.push(crate::core::ScanPoint {
                commanded: v,
                measured: 3.0 * v,
            });
        }
        let m = analyze_series(&series).unwrap();
        assert!((m.gain - 3.0).abs() < TOL);
    }
}
