use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Baseline range used when no explicit range is configured.
pub const DEFAULT_BASELINE_RANGE: (usize, usize) = (20, 150);

/// Mean level and spread of the signal-free part of a waveform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Baseline {
    pub mean: f64,
    pub sigma: f64,
}

/// Computes a [`Baseline`] over a fixed `[start, end)` sample range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineEstimator {
    pub start: usize,
    pub end: usize,
}

impl Default for BaselineEstimator {
    fn default() -> Self {
        let (start, end) = DEFAULT_BASELINE_RANGE;
        BaselineEstimator { start, end }
    }
}

impl BaselineEstimator {
    pub fn new(start: usize, end: usize) -> Self {
        BaselineEstimator { start, end }
    }

    /// True if the range is non-empty and fits inside a buffer of `len` points.
    pub fn is_valid_for(&self, len: usize) -> bool {
        self.start < self.end && self.end <= len
    }

    /// Mean and population standard deviation of `data[start..end]`.
    ///
    /// # Arguments
    ///
    /// * `data` - raw samples of one channel
    ///
    /// # Returns
    ///
    /// `None` if the range is empty or reaches past the end of `data`.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use sigcore::algorithm::baseline::BaselineEstimator;
    /// let data = vec![10.0, 12.0, 10.0, 12.0, 100.0];
    /// let b = BaselineEstimator::new(0, 4).estimate(&data).unwrap();
    /// assert!((b.mean - 11.0).abs() < 1e-12);
    /// assert!((b.sigma - 1.0).abs() < 1e-12);
    /// ```
    pub fn estimate(&self, data: &[f64]) -> Option<Baseline> {
        if !self.is_valid_for(data.len()) {
            return None;
        }
        let window = &data[self.start..self.end];
        Some(Baseline {
            mean: window.iter().mean(),
            sigma: window.iter().population_std_dev(),
        })
    }
}
