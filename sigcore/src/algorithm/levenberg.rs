use nalgebra::{DMatrix, DVector};

/// Settings of the Levenberg-Marquardt minimizer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LevenbergMarquardt {
    /// hard upper bound on accepted + rejected steps
    pub max_iterations: usize,
    /// relative chi-square decrease below which the fit is considered converged
    pub tolerance: f64,
    pub initial_lambda: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        LevenbergMarquardt {
            max_iterations: 200,
            tolerance: 1e-10,
            initial_lambda: 1e-3,
        }
    }
}

/// Result of a weighted least-squares minimization.
#[derive(Clone, Debug, PartialEq)]
pub struct SolverOutcome {
    /// all parameters, fixed ones unchanged
    pub parameters: Vec<f64>,
    /// one standard deviation, 0 for fixed parameters or a singular curvature matrix
    pub errors: Vec<f64>,
    pub chi_square: f64,
    pub iterations: usize,
    pub converged: bool,
    /// number of points minus number of free parameters
    pub ndf: i64,
}

const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e12;

impl LevenbergMarquardt {
    /// Minimizes `sum_i w_i (y_i - model(x_i, p))^2` over the free entries of `p`.
    ///
    /// # Arguments
    ///
    /// * `model` - function of the abscissa and the full parameter slice
    /// * `x`, `y` - data points
    /// * `weights` - `1 / sigma_i^2` per point
    /// * `initial` - starting values of all parameters
    /// * `free` - which parameters the minimizer may change
    ///
    /// # Returns
    ///
    /// The outcome as found when the iteration stopped. Non-convergence is
    /// reported through `converged`, never as an error.
    pub fn minimize<F>(
        &self,
        model: F,
        x: &[f64],
        y: &[f64],
        weights: &[f64],
        initial: &[f64],
        free: &[bool],
    ) -> SolverOutcome
    where
        F: Fn(f64, &[f64]) -> f64,
    {
        debug_assert_eq!(x.len(), y.len());
        debug_assert_eq!(x.len(), weights.len());
        debug_assert_eq!(initial.len(), free.len());

        let free_idx: Vec<usize> = (0..initial.len()).filter(|&j| free[j]).collect();
        let ndf = x.len() as i64 - free_idx.len() as i64;
        let mut p = initial.to_vec();
        let mut chi2 = chi_square(&model, x, y, weights, &p);

        if free_idx.is_empty() {
            return SolverOutcome {
                errors: vec![0.0; p.len()],
                parameters: p,
                chi_square: chi2,
                iterations: 0,
                converged: true,
                ndf,
            };
        }

        let mut lambda = self.initial_lambda;
        let mut converged = false;
        let mut iterations = 0;

        while iterations < self.max_iterations {
            iterations += 1;
            if chi2 == 0.0 {
                converged = true;
                break;
            }

            let (alpha, beta) = normal_equations(&model, x, y, weights, &p, &free_idx);
            let mut damped = alpha.clone();
            for k in 0..free_idx.len() {
                damped[(k, k)] += lambda * alpha[(k, k)].max(1e-12);
            }

            let delta = match damped.cholesky() {
                Some(chol) => chol.solve(&beta),
                None => {
                    lambda *= 10.0;
                    if lambda > LAMBDA_MAX {
                        break;
                    }
                    continue;
                }
            };

            let mut trial = p.clone();
            for (k, &j) in free_idx.iter().enumerate() {
                trial[j] += delta[k];
            }
            let trial_chi2 = chi_square(&model, x, y, weights, &trial);
            let small_step = free_idx
                .iter()
                .enumerate()
                .all(|(k, &j)| delta[k].abs() <= 1e-10 * (p[j].abs() + 1e-10));

            if trial_chi2.is_finite() && trial_chi2 < chi2 {
                let decrease = (chi2 - trial_chi2) / chi2;
                p = trial;
                chi2 = trial_chi2;
                lambda = (lambda / 10.0).max(LAMBDA_MIN);
                log::trace!(
                    "lm iteration {}: chi2 {:.6e}, lambda {:.1e}",
                    iterations,
                    chi2,
                    lambda
                );
                if decrease < self.tolerance || small_step {
                    converged = true;
                    break;
                }
            } else if small_step {
                // at the minimum to working precision
                converged = true;
                break;
            } else {
                lambda *= 10.0;
                if lambda > LAMBDA_MAX {
                    log::debug!("lm stalled after {} iterations at chi2 {:.6e}", iterations, chi2);
                    break;
                }
            }
        }

        let errors = parameter_errors(&model, x, y, weights, &p, &free_idx);

        SolverOutcome {
            parameters: p,
            errors,
            chi_square: chi2,
            iterations,
            converged,
            ndf,
        }
    }
}

/// Weighted sum of squared residuals.
pub fn chi_square<F>(model: &F, x: &[f64], y: &[f64], weights: &[f64], p: &[f64]) -> f64
where
    F: Fn(f64, &[f64]) -> f64,
{
    x.iter()
        .zip(y)
        .zip(weights)
        .map(|((&xi, &yi), &wi)| {
            let r = yi - model(xi, p);
            wi * r * r
        })
        .sum()
}

/// Central-difference Jacobian of the model over the free parameters, one row per point.
fn jacobian<F>(model: &F, x: &[f64], p: &[f64], free_idx: &[usize]) -> DMatrix<f64>
where
    F: Fn(f64, &[f64]) -> f64,
{
    let mut jac = DMatrix::<f64>::zeros(x.len(), free_idx.len());
    let mut work = p.to_vec();
    for (k, &j) in free_idx.iter().enumerate() {
        let h = 1e-5 * p[j].abs().max(1.0);
        work[j] = p[j] + h;
        let up: Vec<f64> = x.iter().map(|&xi| model(xi, &work)).collect();
        work[j] = p[j] - h;
        for (i, &xi) in x.iter().enumerate() {
            jac[(i, k)] = (up[i] - model(xi, &work)) / (2.0 * h);
        }
        work[j] = p[j];
    }
    jac
}

/// `J^T W J` and `J^T W r` at `p`.
fn normal_equations<F>(
    model: &F,
    x: &[f64],
    y: &[f64],
    weights: &[f64],
    p: &[f64],
    free_idx: &[usize],
) -> (DMatrix<f64>, DVector<f64>)
where
    F: Fn(f64, &[f64]) -> f64,
{
    let jac = jacobian(model, x, p, free_idx);
    let r = DVector::from_iterator(x.len(), x.iter().zip(y).map(|(&xi, &yi)| yi - model(xi, p)));

    let mut wj = jac.clone();
    for (i, &wi) in weights.iter().enumerate() {
        for k in 0..free_idx.len() {
            wj[(i, k)] *= wi;
        }
    }
    let alpha = jac.transpose() * &wj;
    let beta = wj.transpose() * r;
    (alpha, beta)
}

fn parameter_errors<F>(
    model: &F,
    x: &[f64],
    y: &[f64],
    weights: &[f64],
    p: &[f64],
    free_idx: &[usize],
) -> Vec<f64>
where
    F: Fn(f64, &[f64]) -> f64,
{
    let mut errors = vec![0.0; p.len()];
    let (alpha, _) = normal_equations(model, x, y, weights, p, free_idx);
    match alpha.try_inverse() {
        Some(cov) => {
            for (k, &j) in free_idx.iter().enumerate() {
                let v = cov[(k, k)];
                errors[j] = if v.is_finite() && v > 0.0 { v.sqrt() } else { 0.0 };
            }
        }
        None => log::debug!("curvature matrix is singular, parameter errors set to 0"),
    }
    errors
}
