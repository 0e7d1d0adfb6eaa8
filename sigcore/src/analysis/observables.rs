use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SignalError};

pub const SIGMA_MEAN: &str = "FitSigmaMean";
pub const SIGMA_STD_DEV: &str = "FitSigmaStdDev";
pub const CHI_SQUARE_MEAN: &str = "FitChiSquareMean";
pub const RATIO_SIGMA_MAX_PEAK_MEAN: &str = "FitRatioSigmaMaxPeakMean";
pub const MAX_VARIANCE_GAUSS: &str = "FitMaxVarianceGauss";
pub const VARIANCE_GAUSS_W_MEAN: &str = "FitVarianceGaussWMean";
pub const VARIANCE_GAUSS_W_STD_DEV: &str = "FitVarianceGaussWStdDev";

pub const AMPLITUDE_MAP: &str = "FitAmplitude_map";
pub const SHAPING_TIME_MAP: &str = "FitShapingTime_map";
pub const START_POSITION_MAP: &str = "FitStartPosition_map";
pub const VARIANCE_GAUSS_MAP: &str = "FitVarianceGauss_map";
pub const RATIO_SIGMA_MAX_PEAK_MAP: &str = "FitRatioSigmaMaxPeak_map";

pub const SCALAR_NAMES: [&str; 7] = [
    SIGMA_MEAN,
    SIGMA_STD_DEV,
    CHI_SQUARE_MEAN,
    RATIO_SIGMA_MAX_PEAK_MEAN,
    MAX_VARIANCE_GAUSS,
    VARIANCE_GAUSS_W_MEAN,
    VARIANCE_GAUSS_W_STD_DEV,
];

/// Map value of a channel that was not fitted.
pub const EXCLUDED: f64 = -1.0;

/// Receives the observables of one event.
pub trait ObservableSink {
    fn set_scalar(&mut self, name: &str, value: f64);
    fn set_map(&mut self, name: &str, values: &BTreeMap<i32, f64>);
}

/// Observables produced by fitting one event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventObservables {
    pub event_id: i32,
    /// channels that passed the selection
    pub good_signals: usize,
    /// channels whose fit entered the reduction
    pub fitted_signals: usize,
    pub sigma_mean: f64,
    pub sigma_std_dev: f64,
    pub chi_square_mean: f64,
    pub ratio_sigma_max_peak_mean: f64,
    pub max_variance_gauss: f64,
    pub variance_gauss_w_mean: f64,
    pub variance_gauss_w_std_dev: f64,
    pub amplitude: BTreeMap<i32, f64>,
    pub shaping_time: BTreeMap<i32, f64>,
    pub start_position: BTreeMap<i32, f64>,
    pub variance_gauss: BTreeMap<i32, f64>,
    pub ratio_sigma_max_peak: BTreeMap<i32, f64>,
}

impl EventObservables {
    pub fn new(event_id: i32) -> Self {
        EventObservables { event_id, ..Default::default() }
    }

    pub fn scalars(&self) -> [(&'static str, f64); 7] {
        [
            (SIGMA_MEAN, self.sigma_mean),
            (SIGMA_STD_DEV, self.sigma_std_dev),
            (CHI_SQUARE_MEAN, self.chi_square_mean),
            (RATIO_SIGMA_MAX_PEAK_MEAN, self.ratio_sigma_max_peak_mean),
            (MAX_VARIANCE_GAUSS, self.max_variance_gauss),
            (VARIANCE_GAUSS_W_MEAN, self.variance_gauss_w_mean),
            (VARIANCE_GAUSS_W_STD_DEV, self.variance_gauss_w_std_dev),
        ]
    }

    pub fn maps(&self) -> [(&'static str, &BTreeMap<i32, f64>); 5] {
        [
            (AMPLITUDE_MAP, &self.amplitude),
            (SHAPING_TIME_MAP, &self.shaping_time),
            (START_POSITION_MAP, &self.start_position),
            (VARIANCE_GAUSS_MAP, &self.variance_gauss),
            (RATIO_SIGMA_MAX_PEAK_MAP, &self.ratio_sigma_max_peak),
        ]
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.scalars().into_iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    /// Writes every scalar and map into `sink`.
    pub fn publish<S: ObservableSink + ?Sized>(&self, sink: &mut S) {
        for (name, value) in self.scalars() {
            sink.set_scalar(name, value);
        }
        for (name, values) in self.maps() {
            sink.set_map(name, values);
        }
    }
}

/// In-memory sink keeping the last value written under each name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservableStore {
    scalars: BTreeMap<String, f64>,
    maps: BTreeMap<String, BTreeMap<i32, f64>>,
}

impl ObservableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).copied()
    }

    pub fn map(&self, name: &str) -> Option<&BTreeMap<i32, f64>> {
        self.maps.get(name)
    }

    pub fn scalars(&self) -> &BTreeMap<String, f64> {
        &self.scalars
    }
}

impl ObservableSink for ObservableStore {
    fn set_scalar(&mut self, name: &str, value: f64) {
        self.scalars.insert(name.to_string(), value);
    }

    fn set_map(&mut self, name: &str, values: &BTreeMap<i32, f64>) {
        self.maps.insert(name.to_string(), values.clone());
    }
}

/// Keeps an event only if a scalar observable lies within `[min, max]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservableCut {
    observable: String,
    min: f64,
    max: f64,
}

impl ObservableCut {
    /// # Arguments
    ///
    /// * `observable` - one of [`SCALAR_NAMES`]
    /// * `min`, `max` - inclusive bounds of the accepted interval
    pub fn new(observable: &str, min: f64, max: f64) -> Result<Self> {
        if !SCALAR_NAMES.contains(&observable) {
            return Err(SignalError::InvalidConfig(format!(
                "unknown observable `{observable}` in cut"
            )));
        }
        if min.is_nan() || max.is_nan() || min > max {
            return Err(SignalError::InvalidConfig(format!("empty cut interval [{min}, {max}]")));
        }
        Ok(ObservableCut { observable: observable.to_string(), min, max })
    }

    pub fn observable(&self) -> &str {
        &self.observable
    }

    pub fn passes(&self, observables: &EventObservables) -> bool {
        observables
            .scalar(&self.observable)
            .is_some_and(|v| v >= self.min && v <= self.max)
    }
}
