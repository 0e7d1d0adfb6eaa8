use serde::{Deserialize, Serialize};

use crate::algorithm::levenberg::LevenbergMarquardt;
use crate::algorithm::response::{
    ResponseModel, AMPLITUDE, N_PARAMETERS, SHAPING_TIME, START_POSITION, VARIANCE_GAUSS,
};
use crate::data::signal::RawSignal;

pub const DEFAULT_SHAPING_TIME: f64 = 32.0;
/// Default start position, as an offset back from the peak bin.
pub const DEFAULT_START_OFFSET: f64 = 25.0;
pub const DEFAULT_VARIANCE_GAUSS: f64 = 1.0;
/// Default amplitude of the convolution model, as a multiple of the peak sample.
pub const DEFAULT_CONVOLUTION_AMPLITUDE_FACTOR: f64 = 10.0;
/// Default amplitude of the bare response model, as a multiple of the peak sample.
pub const DEFAULT_AGET_AMPLITUDE_FACTOR: f64 = 1.0;

/// How the solver treats one parameter.
///
/// Values given for the start position are offsets back from the peak bin
/// (`t0 = peak_bin - value`) and values given for the amplitude are
/// multiples of the baseline subtracted peak sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum ParameterSetting {
    /// free, starting from the default seed
    #[default]
    Free,
    /// free, starting from the given value
    Seeded(f64),
    /// held at the given value
    Fixed(f64),
}

impl ParameterSetting {
    /// Builds a setting from optional fixed and initial values, fixed taking precedence.
    pub fn from_options(fixed: Option<f64>, initial: Option<f64>) -> Self {
        match (fixed, initial) {
            (Some(v), _) => ParameterSetting::Fixed(v),
            (None, Some(v)) => ParameterSetting::Seeded(v),
            (None, None) => ParameterSetting::Free,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, ParameterSetting::Fixed(_))
    }

    fn value_or(&self, default: f64) -> f64 {
        match *self {
            ParameterSetting::Free => default,
            ParameterSetting::Seeded(v) | ParameterSetting::Fixed(v) => v,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSettings {
    pub shaping_time: ParameterSetting,
    pub start_position: ParameterSetting,
    pub variance_gauss: ParameterSetting,
    pub amplitude: ParameterSetting,
}

/// Sample window `[peak - low_margin, peak + high_margin)` around the peak bin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitWindow {
    pub low_margin: usize,
    pub high_margin: usize,
}

impl FitWindow {
    /// Window fitted in every mode, also used for the residual in convolution mode.
    pub const STANDARD: FitWindow = FitWindow { low_margin: 45, high_margin: 70 };
    /// Wider window over which the residual is measured in AGET mode.
    pub const AGET_RESIDUAL: FitWindow = FitWindow { low_margin: 145, high_margin: 165 };

    /// Window bounds around `peak_bin`, clamped to `[0, len)`.
    pub fn bounds(&self, peak_bin: usize, len: usize) -> (usize, usize) {
        let hi = (peak_bin + self.high_margin).min(len);
        let lo = peak_bin.saturating_sub(self.low_margin).min(hi);
        (lo, hi)
    }
}

/// Outcome of fitting one waveform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub model: ResponseModel,
    pub peak_bin: usize,
    /// baseline subtracted sample at the peak bin
    pub peak_value: f64,
    pub amplitude: f64,
    pub shaping_time: f64,
    pub start_position: f64,
    /// only set for the convolution model, never negative
    pub variance_gauss: Option<f64>,
    /// one standard deviation per parameter slot, 0 for fixed or unused slots
    pub errors: [f64; N_PARAMETERS],
    pub chi_square: f64,
    pub ndf: i64,
    /// root mean square of data minus model over the residual window
    pub residual_sigma: f64,
    /// `residual_sigma / peak_value`
    pub ratio_sigma_to_peak: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl FitResult {
    pub fn variance_gauss_error(&self) -> f64 {
        self.errors[VARIANCE_GAUSS]
    }

    pub fn parameters(&self) -> [f64; N_PARAMETERS] {
        [
            self.shaping_time,
            self.start_position,
            self.variance_gauss.unwrap_or(0.0),
            self.amplitude,
        ]
    }
}

/// Fits a waveform with one of the detector response models.
#[derive(Clone, Debug, PartialEq)]
pub struct PulseShapeFitter {
    model: ResponseModel,
    settings: ParameterSettings,
    residual_window: FitWindow,
    solver: LevenbergMarquardt,
}

impl PulseShapeFitter {
    pub fn new(model: ResponseModel) -> Self {
        PulseShapeFitter {
            model,
            settings: ParameterSettings::default(),
            residual_window: FitWindow::STANDARD,
            solver: LevenbergMarquardt::default(),
        }
    }

    pub fn with_settings(mut self, settings: ParameterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_residual_window(mut self, window: FitWindow) -> Self {
        self.residual_window = window;
        self
    }

    pub fn with_solver(mut self, solver: LevenbergMarquardt) -> Self {
        self.solver = solver;
        self
    }

    pub fn model(&self) -> ResponseModel {
        self.model
    }

    pub fn settings(&self) -> &ParameterSettings {
        &self.settings
    }

    pub fn residual_window(&self) -> FitWindow {
        self.residual_window
    }

    /// Starting values and free flags for a pulse peaking at `peak_bin` with height `peak_value`.
    pub fn initial_parameters(
        &self,
        peak_bin: usize,
        peak_value: f64,
    ) -> ([f64; N_PARAMETERS], [bool; N_PARAMETERS]) {
        let s = &self.settings;
        let amplitude_factor = match self.model {
            ResponseModel::Aget => DEFAULT_AGET_AMPLITUDE_FACTOR,
            ResponseModel::AgetGaussConvolution => DEFAULT_CONVOLUTION_AMPLITUDE_FACTOR,
        };

        let mut p = [0.0; N_PARAMETERS];
        p[SHAPING_TIME] = s.shaping_time.value_or(DEFAULT_SHAPING_TIME);
        p[START_POSITION] = peak_bin as f64 - s.start_position.value_or(DEFAULT_START_OFFSET);
        p[VARIANCE_GAUSS] = s.variance_gauss.value_or(DEFAULT_VARIANCE_GAUSS);
        p[AMPLITUDE] = peak_value * s.amplitude.value_or(amplitude_factor);

        let mut free = [false; N_PARAMETERS];
        free[SHAPING_TIME] = !s.shaping_time.is_fixed();
        free[START_POSITION] = !s.start_position.is_fixed();
        free[VARIANCE_GAUSS] = !s.variance_gauss.is_fixed();
        free[AMPLITUDE] = !s.amplitude.is_fixed();
        for (slot, f) in free.iter_mut().enumerate() {
            *f &= self.model.uses(slot);
        }
        (p, free)
    }

    /// Fits the baseline subtracted samples of `signal` around its maximum.
    ///
    /// The baseline of the signal must be up to date. Points are placed at
    /// the bin centres `i + 0.5` over [`FitWindow::STANDARD`] and weighted
    /// with the baseline sigma, or uniformly if the sigma is zero.
    pub fn fit(&self, signal: &RawSignal) -> FitResult {
        let len = signal.len();
        let peak_bin = signal.max_peak_bin();
        let peak_value = signal.max_peak_value();
        let (p0, free) = self.initial_parameters(peak_bin, peak_value);

        let (lo, hi) = FitWindow::STANDARD.bounds(peak_bin, len);
        let x: Vec<f64> = (lo..hi).map(|i| i as f64 + 0.5).collect();
        let y: Vec<f64> = (lo..hi).map(|i| signal.data(i)).collect();
        let sigma = signal.baseline_sigma();
        let weight = if sigma > 0.0 { 1.0 / (sigma * sigma) } else { 1.0 };
        let weights = vec![weight; x.len()];

        let model = self.model;
        let eval = |xi: f64, p: &[f64]| {
            let mut q = [0.0; N_PARAMETERS];
            q.copy_from_slice(p);
            model.eval(xi, &q)
        };
        let out = self.solver.minimize(eval, &x, &y, &weights, &p0, &free);
        if !out.converged {
            log::debug!(
                "signal {}: fit did not converge after {} iterations (chi2 {:.4e})",
                signal.id(),
                out.iterations,
                out.chi_square
            );
        }

        let mut p = [0.0; N_PARAMETERS];
        p.copy_from_slice(&out.parameters);
        // the model only sees |VarianceGauss|, both signs give the same curve
        p[VARIANCE_GAUSS] = p[VARIANCE_GAUSS].abs();
        let residual_sigma = self.residual_sigma(signal, peak_bin, &p);
        let mut errors = [0.0; N_PARAMETERS];
        errors.copy_from_slice(&out.errors);

        FitResult {
            model,
            peak_bin,
            peak_value,
            amplitude: p[AMPLITUDE],
            shaping_time: p[SHAPING_TIME],
            start_position: p[START_POSITION],
            variance_gauss: self.model.uses(VARIANCE_GAUSS).then_some(p[VARIANCE_GAUSS]),
            errors,
            chi_square: out.chi_square,
            ndf: out.ndf,
            residual_sigma,
            ratio_sigma_to_peak: residual_sigma / peak_value,
            iterations: out.iterations,
            converged: out.converged,
        }
    }

    /// Root mean square of data minus model over the residual window; 0 for an empty window.
    pub fn residual_sigma(
        &self,
        signal: &RawSignal,
        peak_bin: usize,
        p: &[f64; N_PARAMETERS],
    ) -> f64 {
        let (lo, hi) = self.residual_window.bounds(peak_bin, signal.len());
        if lo >= hi {
            return 0.0;
        }
        let sum: f64 = (lo..hi)
            .map(|j| {
                let r = signal.data(j) - self.model.eval(j as f64 + 0.5, p);
                r * r
            })
            .sum();
        (sum / (hi - lo) as f64).sqrt()
    }
}
