use serde::{Deserialize, Serialize};

use crate::algorithm::baseline::Baseline;
use crate::data::signal::RawSignal;

/// Minimum number of accepted points for a signal to be considered good.
pub const MIN_GOOD_POINTS: usize = 2;

/// Parameters of the points-over-threshold scan, in units of baseline sigma.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GoodSignalCriteria {
    pub point_threshold: f64,
    pub signal_threshold: f64,
    pub min_points_over: usize,
}

impl GoodSignalCriteria {
    pub fn new(point_threshold: f64, signal_threshold: f64, min_points_over: usize) -> Self {
        GoodSignalCriteria { point_threshold, signal_threshold, min_points_over }
    }
}

/// A maximal run of consecutive samples above the point threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OverThresholdRun {
    pub start: usize,
    /// exclusive
    pub end: usize,
    pub peak_bin: usize,
    /// baseline subtracted
    pub peak_amplitude: f64,
}

impl OverThresholdRun {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Finds the runs of `data[lo..hi]` over `point_threshold * sigma` that are
/// long enough and whose maximum exceeds `signal_threshold * sigma`.
///
/// Runs are returned in ascending order and never overlap.
pub fn over_threshold_runs(
    data: &[f64],
    baseline: Baseline,
    criteria: GoodSignalCriteria,
    range: (usize, usize),
) -> Vec<OverThresholdRun> {
    let hi = range.1.min(data.len());
    let lo = range.0.min(hi);
    let point_level = criteria.point_threshold * baseline.sigma;
    let signal_level = criteria.signal_threshold * baseline.sigma;

    let mut runs = Vec::new();
    let mut i = lo;
    while i < hi {
        if data[i] - baseline.mean <= point_level {
            i += 1;
            continue;
        }

        let start = i;
        let mut peak_bin = i;
        let mut peak_amplitude = data[i] - baseline.mean;
        while i < hi && data[i] - baseline.mean > point_level {
            let v = data[i] - baseline.mean;
            if v > peak_amplitude {
                peak_amplitude = v;
                peak_bin = i;
            }
            i += 1;
        }

        let run = OverThresholdRun { start, end: i, peak_bin, peak_amplitude };
        if run.len() >= criteria.min_points_over && peak_amplitude > signal_level {
            runs.push(run);
        }
    }
    runs
}

/// Flattens accepted runs into their ascending sample indices.
pub fn points_from_runs(runs: &[OverThresholdRun]) -> Vec<usize> {
    runs.iter().flat_map(|r| r.start..r.end).collect()
}

/// Good-signal predicate used to filter channels before fitting.
///
/// Uses the baseline already stored in the signal and does not touch its
/// cached points.
pub fn is_good(
    signal: &RawSignal,
    point_threshold: f64,
    signal_threshold: f64,
    min_points_over: usize,
) -> bool {
    let criteria = GoodSignalCriteria::new(point_threshold, signal_threshold, min_points_over);
    is_good_with(signal, criteria)
}

pub fn is_good_with(signal: &RawSignal, criteria: GoodSignalCriteria) -> bool {
    let runs = over_threshold_runs(signal.samples(), signal.baseline(), criteria, signal.range());
    runs.iter().map(|r| r.len()).sum::<usize>() >= MIN_GOOD_POINTS
}
