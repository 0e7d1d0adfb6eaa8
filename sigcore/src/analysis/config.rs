use serde::{Deserialize, Serialize};

use crate::algorithm::baseline::DEFAULT_BASELINE_RANGE;
use crate::algorithm::fit::{ParameterSetting, ParameterSettings};
use crate::algorithm::levenberg::LevenbergMarquardt;
use crate::algorithm::response::ResponseModel;
use crate::algorithm::threshold::GoodSignalCriteria;
use crate::error::{Result, SignalError};

/// How the channels of an event are fitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitMode {
    /// every selected channel with the Gaussian convolved response
    Convolution,
    /// every selected channel with the bare AGET response
    Aget,
    /// one fit of the channel sum with the Gaussian convolved response
    SumAll,
}

impl FitMode {
    pub fn model(&self) -> ResponseModel {
        match self {
            FitMode::Aget => ResponseModel::Aget,
            FitMode::Convolution | FitMode::SumAll => ResponseModel::AgetGaussConvolution,
        }
    }
}

/// Static configuration of the event fit.
///
/// Parameter values of `0` mean "not supplied". `startPosition*` values are
/// offsets back from the peak bin and `amplitude*` values multiples of the
/// peak sample, see [`ParameterSetting`].
///
/// # Example
///
/// ```rust
/// # use sigcore::analysis::config::{FitConfig, FitMode};
/// let config = FitConfig::from_json_str(r#"{ "agetFit": true, "shapingFixed": 30.0 }"#).unwrap();
/// assert_eq!(config.mode(), FitMode::Aget);
/// assert!(config.good_signal_criteria().is_none());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FitConfig {
    pub aget_fit: bool,
    /// takes precedence over `aget_fit`
    pub add_all_pulses: bool,
    pub shaping_fixed: f64,
    pub shaping_initial: f64,
    pub start_position_fixed: f64,
    pub start_position_initial: f64,
    pub variance_fixed: f64,
    pub variance_initial: f64,
    pub amplitude_fixed: f64,
    pub amplitude_initial: f64,
    pub base_line_range: (usize, usize),
    pub points_over_threshold: usize,
    pub point_threshold: f64,
    pub signal_threshold: f64,
    /// size of a dedicated thread pool for the channel fits, global pool if unset
    pub num_threads: Option<usize>,
    pub max_iterations: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        FitConfig {
            aget_fit: false,
            add_all_pulses: false,
            shaping_fixed: 0.0,
            shaping_initial: 0.0,
            start_position_fixed: 0.0,
            start_position_initial: 0.0,
            variance_fixed: 0.0,
            variance_initial: 0.0,
            amplitude_fixed: 0.0,
            amplitude_initial: 0.0,
            base_line_range: (0, 0),
            points_over_threshold: 0,
            point_threshold: 0.0,
            signal_threshold: 0.0,
            num_threads: None,
            max_iterations: LevenbergMarquardt::default().max_iterations,
        }
    }
}

fn supplied(value: f64) -> Option<f64> {
    (value != 0.0).then_some(value)
}

impl FitConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: FitConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn mode(&self) -> FitMode {
        if self.add_all_pulses {
            FitMode::SumAll
        } else if self.aget_fit {
            FitMode::Aget
        } else {
            FitMode::Convolution
        }
    }

    /// Whether any of the selection options is set.
    pub fn has_selection(&self) -> bool {
        self.point_threshold != 0.0
            || self.signal_threshold != 0.0
            || self.points_over_threshold != 0
            || self.base_line_range != (0, 0)
    }

    /// Criteria channels must pass to be fitted, `None` if every channel is fitted.
    ///
    /// Selection only applies to the per-channel modes.
    pub fn good_signal_criteria(&self) -> Option<GoodSignalCriteria> {
        (self.has_selection() && self.mode() != FitMode::SumAll).then(|| {
            GoodSignalCriteria::new(
                self.point_threshold,
                self.signal_threshold,
                self.points_over_threshold,
            )
        })
    }

    /// Baseline range used for every channel, the default one if none was given.
    pub fn effective_baseline_range(&self) -> (usize, usize) {
        if self.base_line_range == (0, 0) {
            DEFAULT_BASELINE_RANGE
        } else {
            self.base_line_range
        }
    }

    pub fn parameter_settings(&self) -> ParameterSettings {
        ParameterSettings {
            shaping_time: ParameterSetting::from_options(
                supplied(self.shaping_fixed),
                supplied(self.shaping_initial),
            ),
            start_position: ParameterSetting::from_options(
                supplied(self.start_position_fixed),
                supplied(self.start_position_initial),
            ),
            variance_gauss: ParameterSetting::from_options(
                supplied(self.variance_fixed),
                supplied(self.variance_initial),
            ),
            amplitude: ParameterSetting::from_options(
                supplied(self.amplitude_fixed),
                supplied(self.amplitude_initial),
            ),
        }
    }

    pub fn solver(&self) -> LevenbergMarquardt {
        LevenbergMarquardt {
            max_iterations: self.max_iterations,
            ..Default::default()
        }
    }

    /// Rejects configurations no fit can run with.
    pub fn validate(&self) -> Result<()> {
        let (start, end) = self.base_line_range;
        if self.base_line_range != (0, 0) && start >= end {
            return Err(SignalError::InvalidConfig(format!(
                "baseLineRange ({start}, {end}) is empty"
            )));
        }

        let values = [
            ("shapingFixed", self.shaping_fixed),
            ("shapingInitial", self.shaping_initial),
            ("startPositionFixed", self.start_position_fixed),
            ("startPositionInitial", self.start_position_initial),
            ("varianceFixed", self.variance_fixed),
            ("varianceInitial", self.variance_initial),
            ("amplitudeFixed", self.amplitude_fixed),
            ("amplitudeInitial", self.amplitude_initial),
            ("pointThreshold", self.point_threshold),
            ("signalThreshold", self.signal_threshold),
        ];
        if let Some((name, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(SignalError::InvalidConfig(format!("{name} is not finite: {value}")));
        }
        if self.point_threshold < 0.0 || self.signal_threshold < 0.0 {
            return Err(SignalError::InvalidConfig("thresholds must not be negative".to_string()));
        }
        if self.shaping_fixed < 0.0 || self.variance_fixed < 0.0 {
            return Err(SignalError::InvalidConfig(
                "fixed shaping time and variance must not be negative".to_string(),
            ));
        }
        if self.num_threads == Some(0) {
            return Err(SignalError::InvalidConfig("numThreads must be at least 1".to_string()));
        }
        if self.max_iterations == 0 {
            return Err(SignalError::InvalidConfig("maxIterations must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FitConfig::default();
        assert_eq!(config.mode(), FitMode::Convolution);
        assert!(config.good_signal_criteria().is_none());
        assert_eq!(config.effective_baseline_range(), (20, 150));
        assert_eq!(config.parameter_settings(), ParameterSettings::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "addAllPulses": true,
            "agetFit": true,
            "startPositionFixed": 20.0,
            "varianceInitial": 2.0,
            "baseLineRange": [10, 90],
            "pointThreshold": 3.0,
            "numThreads": 2
        }"#;
        let config = FitConfig::from_json_str(json).unwrap();
        assert_eq!(config.mode(), FitMode::SumAll);
        assert_eq!(config.effective_baseline_range(), (10, 90));
        assert!(config.has_selection());
        assert!(config.good_signal_criteria().is_none());

        let settings = config.parameter_settings();
        assert_eq!(settings.start_position, ParameterSetting::Fixed(20.0));
        assert_eq!(settings.variance_gauss, ParameterSetting::Seeded(2.0));
        assert_eq!(settings.shaping_time, ParameterSetting::Free);
    }

    #[test]
    fn test_criteria_from_thresholds() {
        let config = FitConfig {
            point_threshold: 3.0,
            signal_threshold: 5.0,
            points_over_threshold: 4,
            ..Default::default()
        };
        assert_eq!(config.good_signal_criteria(), Some(GoodSignalCriteria::new(3.0, 5.0, 4)));
    }

    #[test]
    fn test_invalid_configs() {
        let empty_range = FitConfig { base_line_range: (90, 10), ..Default::default() };
        assert!(matches!(empty_range.validate(), Err(SignalError::InvalidConfig(_))));

        let no_threads = FitConfig { num_threads: Some(0), ..Default::default() };
        assert!(no_threads.validate().is_err());

        let nan = FitConfig { shaping_initial: f64::NAN, ..Default::default() };
        assert!(nan.validate().is_err());

        assert!(FitConfig::from_json_str(r#"{ "pointThreshold": -1.0 }"#).is_err());
        assert!(FitConfig::from_json_str("not json").is_err());
    }
}
