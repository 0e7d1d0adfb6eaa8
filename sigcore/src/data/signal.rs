use std::fmt;
use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::algorithm::baseline::{Baseline, BaselineEstimator};
use crate::algorithm::threshold::{
    over_threshold_runs, points_from_runs, GoodSignalCriteria, MIN_GOOD_POINTS,
};

/// Number of points of a signal created without an explicit length.
pub const DEFAULT_SIGNAL_LENGTH: usize = 512;

/// Digitized samples of one readout channel for one event.
///
/// # Description
///
/// Besides the samples, a `RawSignal` caches the baseline computed by
/// [`RawSignal::calculate_baseline`] and the points found by
/// [`RawSignal::initialize_points_over_threshold`]. Both caches are only
/// refreshed when those methods are called again; every other metric is
/// derived from the samples and the cached baseline on demand.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct RawSignal {
    id: i32,
    samples: Vec<f64>,
    baseline: Baseline,
    baseline_range: Option<(usize, usize)>,
    range: Option<(usize, usize)>,
    points_over_threshold: Vec<usize>,
    threshold_integral: Option<f64>,
}

impl Default for RawSignal {
    fn default() -> Self {
        RawSignal::new(0, DEFAULT_SIGNAL_LENGTH)
    }
}

impl RawSignal {
    /// Creates a signal of `len` zero samples.
    pub fn new(id: i32, len: usize) -> Self {
        RawSignal::from_samples(id, vec![0.0; len])
    }

    /// Creates a signal holding `samples`.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use sigcore::data::signal::RawSignal;
    /// let signal = RawSignal::from_samples(7, vec![1.0, 2.0, 3.0]);
    /// assert_eq!(signal.id(), 7);
    /// assert_eq!(signal.len(), 3);
    /// ```
    pub fn from_samples(id: i32, samples: Vec<f64>) -> Self {
        RawSignal {
            id,
            samples,
            baseline: Baseline::default(),
            baseline_range: None,
            range: None,
            points_over_threshold: Vec::new(),
            threshold_integral: None,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn set_id(&mut self, id: i32) {
        self.id = id;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Raw sample value at `bin`.
    pub fn raw(&self, bin: usize) -> f64 {
        self.samples[bin]
    }

    /// Baseline subtracted sample value at `bin`.
    pub fn data(&self, bin: usize) -> f64 {
        self.samples[bin] - self.baseline.mean
    }

    /// Baseline subtracted copy of all samples.
    pub fn data_vec(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s - self.baseline.mean).collect()
    }

    /// Adds `value` to the sample at `bin`. Returns `false` if `bin` is out of bounds.
    pub fn increase_bin_by(&mut self, bin: usize, value: f64) -> bool {
        match self.samples.get_mut(bin) {
            Some(s) => {
                *s += value;
                true
            }
            None => {
                log::warn!(
                    "signal {}: bin {} is outside of {} points, charge ignored",
                    self.id,
                    bin,
                    self.samples.len()
                );
                false
            }
        }
    }

    /// Appends one sample at the end of the buffer.
    pub fn add_point(&mut self, value: f64) {
        self.samples.push(value);
    }

    /// Computes mean and standard deviation of `samples[start..end]`.
    ///
    /// If the range is empty or out of bounds nothing changes and the
    /// previously stored baseline stays in place.
    ///
    /// # Returns
    ///
    /// `true` if the baseline was updated.
    pub fn calculate_baseline(&mut self, start: usize, end: usize) -> bool {
        match BaselineEstimator::new(start, end).estimate(&self.samples) {
            Some(b) => {
                self.baseline = b;
                self.baseline_range = Some((start, end));
                true
            }
            None => {
                log::debug!(
                    "signal {}: baseline range [{}, {}) invalid for {} points, baseline kept",
                    self.id,
                    start,
                    end,
                    self.samples.len()
                );
                false
            }
        }
    }

    pub fn baseline(&self) -> Baseline {
        self.baseline
    }

    pub fn baseline_mean(&self) -> f64 {
        self.baseline.mean
    }

    pub fn baseline_sigma(&self) -> f64 {
        self.baseline.sigma
    }

    /// Range used by the last successful baseline calculation.
    pub fn baseline_range(&self) -> Option<(usize, usize)> {
        self.baseline_range
    }

    /// Restricts integrals and peak searches to `[start, end)`; `None` uses the whole buffer.
    pub fn set_range(&mut self, range: Option<(usize, usize)>) {
        self.range = range;
    }

    /// Effective analysis range, clamped to the buffer.
    pub fn range(&self) -> (usize, usize) {
        let n = self.samples.len();
        match self.range {
            Some((a, b)) => {
                let hi = b.min(n);
                (a.min(hi), hi)
            }
            None => (0, n),
        }
    }

    /// Scans the signal for points over threshold and caches them.
    ///
    /// # Arguments
    ///
    /// * `point_threshold` - a sample is over threshold if it exceeds the baseline by this
    ///   many sigmas
    /// * `signal_threshold` - a run is kept only if its maximum exceeds this many sigmas
    /// * `min_points_over` - a run is kept only if it has at least this many points
    ///
    /// # Returns
    ///
    /// The accepted sample indices in ascending order.
    pub fn initialize_points_over_threshold(
        &mut self,
        point_threshold: f64,
        signal_threshold: f64,
        min_points_over: usize,
    ) -> &[usize] {
        let criteria = GoodSignalCriteria::new(point_threshold, signal_threshold, min_points_over);
        let runs = over_threshold_runs(&self.samples, self.baseline, criteria, self.range());
        self.points_over_threshold = points_from_runs(&runs);
        let integral = self.points_over_threshold.iter().map(|&i| self.data(i)).sum();
        self.threshold_integral = Some(integral);
        &self.points_over_threshold
    }

    pub fn points_over_threshold(&self) -> &[usize] {
        &self.points_over_threshold
    }

    /// At least two points over threshold were found by the last scan.
    pub fn is_good(&self) -> bool {
        self.points_over_threshold.len() >= MIN_GOOD_POINTS
    }

    /// Sum of baseline subtracted data over the points over threshold, 0 before any scan.
    pub fn threshold_integral(&self) -> f64 {
        self.threshold_integral.unwrap_or(0.0)
    }

    /// Sum of baseline subtracted data over the analysis range.
    pub fn integral(&self) -> f64 {
        let (lo, hi) = self.range();
        self.integral_in_range(lo, hi)
    }

    /// Sum of baseline subtracted data over `[start, end)`, clamped to the buffer.
    pub fn integral_in_range(&self, start: usize, end: usize) -> f64 {
        let hi = end.min(self.samples.len());
        let lo = start.min(hi);
        self.samples[lo..hi].iter().map(|s| s - self.baseline.mean).sum()
    }

    /// Sum of the rising steps between consecutive points over threshold.
    pub fn slope_integral(&self) -> f64 {
        self.points_over_threshold
            .windows(2)
            .filter(|w| w[1] == w[0] + 1)
            .map(|w| self.samples[w[1]] - self.samples[w[0]])
            .filter(|d| *d > 0.0)
            .sum()
    }

    /// Largest integral over three consecutive samples; 0 if no points over threshold were found.
    pub fn triple_max_integral(&self) -> f64 {
        if self.points_over_threshold.is_empty() {
            return 0.0;
        }
        let (lo, hi) = self.range();
        self.samples[lo..hi]
            .windows(3)
            .map(|w| w.iter().map(|s| s - self.baseline.mean).sum::<f64>())
            .fold(f64::NEG_INFINITY, f64::max)
            .max(0.0)
    }

    /// Samples between the start of the over-threshold run holding the
    /// maximum and the maximum itself; 0 if no points over threshold were found.
    pub fn rise_time(&self) -> usize {
        let points = &self.points_over_threshold;
        if points.is_empty() {
            return 0;
        }
        let peak = self.max_peak_bin();
        let start = match points.iter().position(|&p| p == peak) {
            Some(mut k) => {
                while k > 0 && points[k - 1] + 1 == points[k] {
                    k -= 1;
                }
                points[k]
            }
            None => points[0],
        };
        peak.saturating_sub(start)
    }

    /// Bin of the first global maximum within the analysis range.
    pub fn max_peak_bin(&self) -> usize {
        let (lo, hi) = self.range();
        argmax_idx(&self.samples[lo..hi]) + lo
    }

    /// Baseline subtracted value at [`RawSignal::max_peak_bin`], 0 for an empty signal.
    pub fn max_peak_value(&self) -> f64 {
        let (lo, hi) = self.range();
        if lo >= hi {
            return 0.0;
        }
        self.data(self.max_peak_bin())
    }

    /// Width of the maximum, measured at half of its baseline subtracted height.
    pub fn max_peak_width(&self) -> usize {
        self.max_peak_width_above(0.5 * self.max_peak_value())
    }

    /// Length of the contiguous run around the maximum whose baseline
    /// subtracted amplitude exceeds `min_amplitude`.
    pub fn max_peak_width_above(&self, min_amplitude: f64) -> usize {
        let (lo, hi) = self.range();
        if lo >= hi {
            return 0;
        }
        let peak = self.max_peak_bin();
        if self.data(peak) <= min_amplitude {
            return 0;
        }
        let mut left = peak;
        while left > lo && self.data(left - 1) > min_amplitude {
            left -= 1;
        }
        let mut right = peak;
        while right + 1 < hi && self.data(right + 1) > min_amplitude {
            right += 1;
        }
        right - left + 1
    }

    /// Largest baseline subtracted value in the analysis range.
    pub fn max_value(&self) -> f64 {
        self.max_peak_value()
    }

    /// Smallest baseline subtracted value in the analysis range, 0 for an empty signal.
    pub fn min_value(&self) -> f64 {
        let (lo, hi) = self.range();
        self.samples[lo..hi]
            .iter()
            .map(|s| s - self.baseline.mean)
            .reduce(f64::min)
            .unwrap_or(0.0)
    }
}

impl Display for RawSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RawSignal(id: {}, points: {}, ", self.id, self.len())?;
        write!(
            f,
            "baseline: {:.3} +- {:.3}, max: {:.3} @ {}, integral: {:.3})",
            self.baseline.mean,
            self.baseline.sigma,
            self.max_peak_value(),
            self.max_peak_bin(),
            self.integral(),
        )
    }
}

#[inline]
fn argmax_idx(v: &[f64]) -> usize {
    let mut i_max = 0usize;
    let mut best = f64::NEG_INFINITY;
    for (i, &y) in v.iter().enumerate() {
        if y > best {
            best = y;
            i_max = i;
        }
    }
    i_max
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle(id: i32, apex: usize, half_width: usize, height: f64, offset: f64) -> RawSignal {
        let mut samples = vec![offset; DEFAULT_SIGNAL_LENGTH];
        for (i, s) in samples.iter_mut().enumerate() {
            let d = i.abs_diff(apex);
            if d < half_width {
                *s += height * (1.0 - d as f64 / half_width as f64);
            }
        }
        RawSignal::from_samples(id, samples)
    }

    #[test]
    fn test_baseline_is_idempotent() {
        let mut s = triangle(1, 300, 20, 100.0, 250.0);
        for (i, v) in s.samples.iter_mut().enumerate().take(150) {
            *v += if i % 2 == 0 { 2.0 } else { -2.0 };
        }
        assert!(s.calculate_baseline(20, 150));
        let first = s.baseline();
        assert!(s.calculate_baseline(20, 150));
        assert_eq!(first, s.baseline());
        assert!((first.mean - 250.0).abs() < 1e-9);
        assert!((first.sigma - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_baseline_range_keeps_previous_values() {
        let mut s = triangle(1, 300, 20, 100.0, 250.0);
        assert!(s.calculate_baseline(0, 100));
        let before = s.baseline();
        assert!(!s.calculate_baseline(100, 100));
        assert!(!s.calculate_baseline(400, 600));
        assert_eq!(before, s.baseline());
        assert_eq!(s.baseline_range(), Some((0, 100)));
    }

    #[test]
    fn test_peak_metrics() {
        let mut s = triangle(1, 300, 20, 100.0, 50.0);
        s.calculate_baseline(0, 100);
        assert_eq!(s.max_peak_bin(), 300);
        assert_eq!(s.max_peak_value(), 100.0);
        // samples strictly above 50 are those with |d| < 10
        assert_eq!(s.max_peak_width(), 19);
        assert_eq!(s.max_peak_width_above(0.0), 39);
        assert_eq!(s.max_peak_width_above(100.0), 0);
        assert!((s.integral() - 2000.0).abs() < 1e-9);
        assert_eq!(s.min_value(), 0.0);
    }

    #[test]
    fn test_threshold_metrics() {
        let mut s = triangle(3, 300, 20, 100.0, 0.0);
        for (i, v) in s.samples.iter_mut().enumerate() {
            if i < 200 {
                *v += if i % 2 == 0 { 1.0 } else { -1.0 };
            }
        }
        s.calculate_baseline(20, 150);
        assert_eq!(s.rise_time(), 0);
        assert_eq!(s.triple_max_integral(), 0.0);

        let points = s.initialize_points_over_threshold(3.0, 5.0, 5).to_vec();
        // data > 3 means d < 19.4 around the apex
        assert_eq!(points, (281..=319).collect::<Vec<_>>());
        assert!(s.is_good());
        assert_eq!(s.rise_time(), 19);
        assert!((s.triple_max_integral() - 290.0).abs() < 1e-9);
        assert!((s.slope_integral() - 95.0).abs() < 1e-9);
        assert!(s.threshold_integral() > 0.0);
    }

    #[test]
    fn test_increase_bin_by() {
        let mut s = RawSignal::new(5, 16);
        assert!(s.increase_bin_by(3, 2.5));
        assert!(s.increase_bin_by(3, 1.0));
        assert!(!s.increase_bin_by(16, 1.0));
        assert_eq!(s.raw(3), 3.5);
        s.add_point(9.0);
        assert_eq!(s.len(), 17);
    }

    #[test]
    fn test_range_restricts_metrics() {
        let mut s = triangle(1, 300, 20, 100.0, 0.0);
        s.set_range(Some((0, 290)));
        assert_eq!(s.max_peak_bin(), 289);
        s.set_range(Some((400, 9000)));
        assert_eq!(s.range(), (400, 512));
        assert_eq!(s.integral(), 0.0);
    }

    #[test]
    fn test_empty_signal() {
        let s = RawSignal::from_samples(1, Vec::new());
        assert_eq!(s.max_peak_value(), 0.0);
        assert_eq!(s.max_peak_width(), 0);
        assert_eq!(s.min_value(), 0.0);
        assert_eq!(s.integral(), 0.0);
    }
}
