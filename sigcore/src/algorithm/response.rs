use serde::{Deserialize, Serialize};

/// Steepness of the logistic gate that switches the response on at `t0`.
const GATE_STEEPNESS: f64 = 10000.0;

/// Half-width of the convolution integral, in Gaussian standard deviations.
const CONVOLUTION_SIGMAS: f64 = 6.0;

/// Quadrature nodes on each side of zero for the convolution integral.
const CONVOLUTION_HALF_NODES: usize = 48;

/// Parameter slots shared by both response models.
pub const SHAPING_TIME: usize = 0;
pub const START_POSITION: usize = 1;
pub const VARIANCE_GAUSS: usize = 2;
pub const AMPLITUDE: usize = 3;

/// Number of parameter slots; Model A leaves `VARIANCE_GAUSS` unused.
pub const N_PARAMETERS: usize = 4;

pub const PARAMETER_NAMES: [&str; N_PARAMETERS] =
    ["ShapingTime", "StartPosition", "VarianceGauss", "Amplitude"];

/// Shaper response of the AGET front-end chip, unit amplitude.
///
/// `exp(-3u) * u^3 * sin(u) / (1 + exp(-10000 (x - t0)))` with `u = (x - t0) / tau`.
///
/// # Example
///
/// ```rust
/// # use sigcore::algorithm::response::aget_response;
/// assert_eq!(aget_response(10.0, 32.0, 50.0), 0.0);
/// assert!(aget_response(80.0, 32.0, 50.0) > 0.0);
/// ```
#[inline]
pub fn aget_response(x: f64, shaping_time: f64, start_position: f64) -> f64 {
    let d = x - start_position;
    let gate = 1.0 / (1.0 + (-GATE_STEEPNESS * d).exp());
    if gate == 0.0 {
        return 0.0;
    }
    let u = d / shaping_time;
    (-3.0 * u).exp() * u * u * u * u.sin() * gate
}

/// Response model fitted to a pulse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseModel {
    /// Model A: `Amplitude * aget_response(x)`.
    Aget,
    /// Model B: `aget_response` convolved with `Amplitude * exp(-0.5 x^2 / VarianceGauss)`.
    AgetGaussConvolution,
}

impl ResponseModel {
    /// Parameter slots the model depends on.
    pub fn parameters(&self) -> &'static [usize] {
        match self {
            ResponseModel::Aget => &[SHAPING_TIME, START_POSITION, AMPLITUDE],
            ResponseModel::AgetGaussConvolution => {
                &[SHAPING_TIME, START_POSITION, VARIANCE_GAUSS, AMPLITUDE]
            }
        }
    }

    pub fn uses(&self, slot: usize) -> bool {
        self.parameters().contains(&slot)
    }

    /// Evaluates the model at `x` for the parameter slots `p`.
    pub fn eval(&self, x: f64, p: &[f64; N_PARAMETERS]) -> f64 {
        match self {
            ResponseModel::Aget => {
                p[AMPLITUDE] * aget_response(x, p[SHAPING_TIME], p[START_POSITION])
            }
            ResponseModel::AgetGaussConvolution => {
                let (tau, t0) = (p[SHAPING_TIME], p[START_POSITION]);
                convolved_response(x, tau, t0, p[VARIANCE_GAUSS], p[AMPLITUDE])
            }
        }
    }
}

/// `(aget_response * g)(x)` with `g(s) = amplitude * exp(-0.5 s^2 / variance)`.
///
/// The integral is evaluated with the composite Simpson rule on a fixed
/// number of nodes spread over `±6 sqrt(variance)`, so the result is a
/// smooth function of every parameter.
pub fn convolved_response(
    x: f64,
    shaping_time: f64,
    start_position: f64,
    variance: f64,
    amplitude: f64,
) -> f64 {
    let variance = variance.abs().max(f64::MIN_POSITIVE);
    let sigma = variance.sqrt();
    let n = 2 * CONVOLUTION_HALF_NODES;
    let h = 2.0 * CONVOLUTION_SIGMAS * sigma / n as f64;
    let s0 = -CONVOLUTION_SIGMAS * sigma;

    let mut acc = 0.0;
    for k in 0..=n {
        let s = s0 + k as f64 * h;
        let w = if k == 0 || k == n {
            1.0
        } else if k % 2 == 1 {
            4.0
        } else {
            2.0
        };
        let gauss = (-0.5 * s * s / variance).exp();
        acc += w * aget_response(x - s, shaping_time, start_position) * gauss;
    }
    amplitude * acc * h / 3.0
}
