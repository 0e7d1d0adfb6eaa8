use itertools::{Either, Itertools};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use statrs::statistics::Statistics;

use crate::algorithm::fit::{FitResult, FitWindow, PulseShapeFitter};
use crate::algorithm::response::{ResponseModel, VARIANCE_GAUSS};
use crate::algorithm::threshold::is_good_with;
use crate::analysis::config::{FitConfig, FitMode};
use crate::analysis::observables::{EventObservables, ObservableCut, EXCLUDED};
use crate::data::event::SignalEvent;
use crate::data::signal::{RawSignal, DEFAULT_SIGNAL_LENGTH};
use crate::error::Result;

/// Id given to the channel sum in [`FitMode::SumAll`].
pub const SUMMED_SIGNAL_ID: i32 = 0;

/// Fit outcome of one channel, `None` if the channel was not selected.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelOutcome {
    pub id: i32,
    pub result: Option<FitResult>,
}

/// Fits the channels of an event and reduces the results to event observables.
///
/// # Example
///
/// ```rust
/// # use sigcore::analysis::aggregator::EventFitAggregator;
/// # use sigcore::analysis::config::FitConfig;
/// # use sigcore::data::event::SignalEvent;
/// let aggregator = EventFitAggregator::new(FitConfig::default()).unwrap();
/// let mut event = SignalEvent::new(1);
/// let observables = aggregator.process(&mut event).unwrap();
/// assert_eq!(observables.sigma_mean, 0.0);
/// ```
pub struct EventFitAggregator {
    config: FitConfig,
    fitter: PulseShapeFitter,
    cut: Option<ObservableCut>,
    pool: Option<ThreadPool>,
}

impl EventFitAggregator {
    /// Validates `config` and prepares the fitter, and the thread pool if `num_threads` is set.
    pub fn new(config: FitConfig) -> Result<Self> {
        config.validate()?;
        let mode = config.mode();
        let residual_window = match mode {
            FitMode::Aget => FitWindow::AGET_RESIDUAL,
            FitMode::Convolution | FitMode::SumAll => FitWindow::STANDARD,
        };
        let fitter = PulseShapeFitter::new(mode.model())
            .with_settings(config.parameter_settings())
            .with_residual_window(residual_window)
            .with_solver(config.solver());
        let pool = match config.num_threads {
            Some(n) => Some(ThreadPoolBuilder::new().num_threads(n).build()?),
            None => None,
        };
        Ok(EventFitAggregator { config, fitter, cut: None, pool })
    }

    pub fn with_cut(mut self, cut: ObservableCut) -> Self {
        self.cut = Some(cut);
        self
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn fitter(&self) -> &PulseShapeFitter {
        &self.fitter
    }

    /// Analyzes `event`, returning `None` if the cut rejects it.
    pub fn process(&self, event: &mut SignalEvent) -> Option<EventObservables> {
        let observables = self.analyze(event);
        match &self.cut {
            Some(cut) if !cut.passes(&observables) => {
                log::debug!("event {}: rejected by cut on {}", event.id(), cut.observable());
                None
            }
            _ => Some(observables),
        }
    }

    /// Recomputes the baselines of `event` and fits it according to the fit mode.
    pub fn analyze(&self, event: &mut SignalEvent) -> EventObservables {
        let (start, end) = self.config.effective_baseline_range();
        event.set_baseline_range(Some((start, end)));
        event.calculate_baselines(start, end);

        if event.is_empty() {
            log::debug!("event {}: no signals, observables set to 0", event.id());
            return EventObservables::new(event.id());
        }

        let observables = match self.config.mode() {
            FitMode::SumAll => self.fit_sum(event),
            FitMode::Convolution | FitMode::Aget => {
                let outcomes = self.fit_channels(event);
                reduce(event.id(), self.fitter.model(), &outcomes)
            }
        };
        log::debug!(
            "event {}: {} of {} signals fitted, sigma mean {:.4}, chi2 mean {:.4}",
            event.id(),
            observables.fitted_signals,
            event.number_of_signals(),
            observables.sigma_mean,
            observables.chi_square_mean
        );
        observables
    }

    /// Fits every selected channel of `event` in parallel, in signal order.
    pub fn fit_channels(&self, event: &SignalEvent) -> Vec<ChannelOutcome> {
        let criteria = self.config.good_signal_criteria();
        let fit = |signal: &RawSignal| {
            let selected = criteria.map_or(true, |c| is_good_with(signal, c));
            ChannelOutcome {
                id: signal.id(),
                result: selected.then(|| self.fitter.fit(signal)),
            }
        };
        match &self.pool {
            Some(pool) => {
                pool.install(|| event.signals().par_iter().map(fit).collect::<Vec<_>>())
            }
            None => event.signals().par_iter().map(fit).collect(),
        }
    }

    fn fit_sum(&self, event: &SignalEvent) -> EventObservables {
        let (start, end) = self.config.effective_baseline_range();
        let summed = summed_signal(event, start, end);
        let r = self.fitter.fit(&summed);
        let id = summed.id();
        let variance = r.variance_gauss.unwrap_or(0.0);

        let mut obs = EventObservables::new(event.id());
        obs.good_signals = event.number_of_signals();
        obs.fitted_signals = 1;
        obs.amplitude.insert(id, r.amplitude);
        obs.shaping_time.insert(id, r.shaping_time);
        obs.start_position.insert(id, r.start_position);
        obs.variance_gauss.insert(id, variance);
        obs.ratio_sigma_max_peak.insert(id, r.ratio_sigma_to_peak);

        obs.sigma_mean = r.residual_sigma;
        obs.chi_square_mean = r.chi_square;
        obs.ratio_sigma_max_peak_mean = r.ratio_sigma_to_peak;
        obs.max_variance_gauss = variance;
        obs.variance_gauss_w_mean = variance;
        obs.variance_gauss_w_std_dev = r.variance_gauss_error();
        obs
    }
}

/// Sample-wise sum of the baseline subtracted channels over the default signal length.
///
/// The baselines of the channels must be up to date; the baseline of the
/// sum is computed over `[start, end)`.
pub fn summed_signal(event: &SignalEvent, start: usize, end: usize) -> RawSignal {
    let samples = (0..DEFAULT_SIGNAL_LENGTH)
        .map(|i| {
            event
                .signals()
                .iter()
                .filter_map(|s| s.samples().get(i).map(|v| v - s.baseline_mean()))
                .sum()
        })
        .collect();
    let mut summed = RawSignal::from_samples(SUMMED_SIGNAL_ID, samples);
    summed.calculate_baseline(start, end);
    summed
}

/// Collects per-channel maps and event statistics from the channel outcomes.
///
/// Excluded channels get [`EXCLUDED`] in every map; with no fitted channel
/// all statistics stay 0.
pub fn reduce(
    event_id: i32,
    model: ResponseModel,
    outcomes: &[ChannelOutcome],
) -> EventObservables {
    let mut obs = EventObservables::new(event_id);
    let (fitted, excluded): (Vec<(i32, &FitResult)>, Vec<i32>) =
        outcomes.iter().partition_map(|o| match &o.result {
            Some(r) => Either::Left((o.id, r)),
            None => Either::Right(o.id),
        });

    let has_variance = model.uses(VARIANCE_GAUSS);
    for id in excluded {
        obs.amplitude.insert(id, EXCLUDED);
        obs.shaping_time.insert(id, EXCLUDED);
        obs.start_position.insert(id, EXCLUDED);
        obs.ratio_sigma_max_peak.insert(id, EXCLUDED);
        if has_variance {
            obs.variance_gauss.insert(id, EXCLUDED);
        }
    }
    for (id, r) in &fitted {
        obs.amplitude.insert(*id, r.amplitude);
        obs.shaping_time.insert(*id, r.shaping_time);
        obs.start_position.insert(*id, r.start_position);
        obs.ratio_sigma_max_peak.insert(*id, r.ratio_sigma_to_peak);
        if let Some(v) = r.variance_gauss {
            obs.variance_gauss.insert(*id, v);
        }
    }

    obs.good_signals = fitted.len();
    obs.fitted_signals = fitted.len();
    if fitted.is_empty() {
        return obs;
    }

    let sigmas: Vec<f64> = fitted.iter().map(|(_, r)| r.residual_sigma).collect();
    obs.sigma_mean = (&sigmas).mean();
    obs.sigma_std_dev = (&sigmas).population_std_dev();
    obs.chi_square_mean = fitted.iter().map(|(_, r)| r.chi_square).mean();
    obs.ratio_sigma_max_peak_mean = fitted.iter().map(|(_, r)| r.ratio_sigma_to_peak).mean();

    obs.max_variance_gauss = fitted
        .iter()
        .filter_map(|(_, r)| r.variance_gauss)
        .fold(0.0, f64::max);

    // inverse variance weights, channels without an uncertainty are skipped
    let weighted: Vec<(f64, f64)> = fitted
        .iter()
        .filter_map(|(_, r)| {
            let err = r.variance_gauss_error();
            match r.variance_gauss {
                Some(v) if err > 0.0 && err.is_finite() => Some((v, 1.0 / (err * err))),
                _ => None,
            }
        })
        .collect();
    if !weighted.is_empty() {
        let sum_w: f64 = weighted.iter().map(|(_, w)| w).sum();
        let mean = weighted.iter().map(|(v, w)| v * w).sum::<f64>() / sum_w;
        let var = weighted.iter().map(|(v, w)| w * (v - mean).powi(2)).sum::<f64>() / sum_w;
        obs.variance_gauss_w_mean = mean;
        obs.variance_gauss_w_std_dev = var.sqrt();
    }
    obs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::response::{aget_response, N_PARAMETERS};
    use crate::analysis::observables::SIGMA_MEAN;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn pulse(id: i32, amplitude: f64, t0: f64, rng: &mut StdRng) -> RawSignal {
        let samples = (0..DEFAULT_SIGNAL_LENGTH)
            .map(|i| {
                let signal = amplitude * aget_response(i as f64 + 0.5, 30.0, t0);
                250.0 + signal + rng.gen_range(-2.0..2.0)
            })
            .collect();
        RawSignal::from_samples(id, samples)
    }

    fn flat(id: i32, rng: &mut StdRng) -> RawSignal {
        let samples = (0..DEFAULT_SIGNAL_LENGTH)
            .map(|_| 250.0 + rng.gen_range(-2.0..2.0))
            .collect();
        RawSignal::from_samples(id, samples)
    }

    fn result(variance: Option<f64>, variance_error: f64, sigma: f64) -> FitResult {
        let mut errors = [0.0; N_PARAMETERS];
        errors[VARIANCE_GAUSS] = variance_error;
        FitResult {
            model: ResponseModel::AgetGaussConvolution,
            peak_bin: 200,
            peak_value: 100.0,
            amplitude: 1000.0,
            shaping_time: 30.0,
            start_position: 170.0,
            variance_gauss: variance,
            errors,
            chi_square: 2.0,
            ndf: 111,
            residual_sigma: sigma,
            ratio_sigma_to_peak: sigma / 100.0,
            iterations: 10,
            converged: true,
        }
    }

    #[test]
    fn test_empty_event() {
        let aggregator = EventFitAggregator::new(FitConfig::default()).unwrap();
        let mut event = SignalEvent::new(3);
        let obs = aggregator.analyze(&mut event);
        assert_eq!(obs.fitted_signals, 0);
        assert!(obs.scalars().iter().all(|(_, v)| *v == 0.0));
        assert!(obs.amplitude.is_empty());
    }

    #[test]
    fn test_reduce_statistics() {
        let outcomes = vec![
            ChannelOutcome { id: 1, result: Some(result(Some(1.0), 0.5, 2.0)) },
            ChannelOutcome { id: 2, result: Some(result(Some(3.0), 0.5, 4.0)) },
            ChannelOutcome { id: 5, result: Some(result(Some(9.0), 0.0, 6.0)) },
            ChannelOutcome { id: 7, result: None },
        ];
        let obs = reduce(11, ResponseModel::AgetGaussConvolution, &outcomes);
        assert_eq!(obs.fitted_signals, 3);
        assert!((obs.sigma_mean - 4.0).abs() < 1e-12);
        assert!((obs.sigma_std_dev - (8.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((obs.chi_square_mean - 2.0).abs() < 1e-12);
        assert_eq!(obs.max_variance_gauss, 9.0);
        // channel 5 carries no uncertainty and stays out of the weighted mean
        assert!((obs.variance_gauss_w_mean - 2.0).abs() < 1e-12);
        assert!((obs.variance_gauss_w_std_dev - 1.0).abs() < 1e-12);
        assert_eq!(obs.amplitude[&7], EXCLUDED);
        assert_eq!(obs.variance_gauss[&7], EXCLUDED);
        assert_eq!(obs.ratio_sigma_max_peak[&1], 0.02);
    }

    #[test]
    fn test_reduce_without_fits() {
        let outcomes = vec![
            ChannelOutcome { id: 1, result: None },
            ChannelOutcome { id: 2, result: None },
        ];
        let obs = reduce(1, ResponseModel::AgetGaussConvolution, &outcomes);
        assert!(obs.scalars().iter().all(|(_, v)| *v == 0.0));
        assert_eq!(obs.shaping_time[&2], EXCLUDED);
        assert_eq!(obs.variance_gauss[&2], EXCLUDED);

        let aget = reduce(1, ResponseModel::Aget, &outcomes);
        assert!(aget.variance_gauss.is_empty());
    }

    #[test]
    fn test_selection_excludes_flat_channels() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut event = SignalEvent::new(1);
        event.add_signal(pulse(10, 2500.0, 200.0, &mut rng));
        event.add_signal(flat(11, &mut rng));

        let config = FitConfig {
            point_threshold: 3.0,
            signal_threshold: 5.0,
            points_over_threshold: 3,
            base_line_range: (20, 150),
            ..Default::default()
        };
        let obs = EventFitAggregator::new(config).unwrap().process(&mut event).unwrap();
        assert_eq!(obs.good_signals, 1);
        assert_eq!(obs.amplitude[&11], EXCLUDED);
        assert_eq!(obs.variance_gauss[&11], EXCLUDED);
        assert!(obs.amplitude[&10] > 0.0);
        assert!(obs.variance_gauss.contains_key(&10));
        assert!(obs.sigma_mean > 0.0);
    }

    #[test]
    fn test_aget_mode_has_no_variance() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut event = SignalEvent::new(2);
        event.add_signal(pulse(1, 2000.0, 180.0, &mut rng));
        event.add_signal(pulse(2, 3000.0, 210.0, &mut rng));

        let config = FitConfig { aget_fit: true, ..Default::default() };
        let obs = EventFitAggregator::new(config).unwrap().process(&mut event).unwrap();
        assert_eq!(obs.fitted_signals, 2);
        assert!(obs.variance_gauss.is_empty());
        assert_eq!(obs.max_variance_gauss, 0.0);
        assert!((obs.shaping_time[&1] - 30.0).abs() < 3.0);
    }

    fn rms_over(window: FitWindow, signal: &RawSignal, r: &FitResult) -> f64 {
        let (lo, hi) = window.bounds(r.peak_bin, signal.len());
        let p = r.parameters();
        let sum: f64 = (lo..hi)
            .map(|j| (signal.data(j) - r.model.eval(j as f64 + 0.5, &p)).powi(2))
            .sum();
        (sum / (hi - lo) as f64).sqrt()
    }

    #[test]
    fn test_residual_window_follows_mode() {
        let aget = EventFitAggregator::new(FitConfig { aget_fit: true, ..Default::default() });
        let aget = aget.unwrap();
        assert_eq!(aget.fitter().residual_window(), FitWindow::AGET_RESIDUAL);
        let convolution = EventFitAggregator::new(FitConfig::default()).unwrap();
        assert_eq!(convolution.fitter().residual_window(), FitWindow::STANDARD);

        let mut rng = StdRng::seed_from_u64(17);
        let mut event = SignalEvent::new(6);
        event.add_signal(pulse(1, 2500.0, 200.0, &mut rng));
        let obs = aget.analyze(&mut event);
        let outcomes = aget.fit_channels(&event);
        let r = outcomes[0].result.as_ref().unwrap();
        let signal = event.signal(0).unwrap();

        let wide = rms_over(FitWindow::AGET_RESIDUAL, signal, r);
        let narrow = rms_over(FitWindow::STANDARD, signal, r);
        assert!((r.residual_sigma - wide).abs() <= 1e-9 * wide);
        assert!((r.residual_sigma - narrow).abs() > 1e-9 * wide);
        assert!((obs.sigma_mean - wide).abs() <= 1e-9 * wide);
    }

    #[test]
    fn test_summed_signal_peak() {
        let n = 4;
        let single: Vec<f64> = (0..DEFAULT_SIGNAL_LENGTH)
            .map(|i| 100.0 + 2000.0 * aget_response(i as f64 + 0.5, 30.0, 200.0))
            .collect();
        let mut event = SignalEvent::new(1);
        event.set_baseline_range(Some((20, 150)));
        for id in 0..n {
            event.add_signal(RawSignal::from_samples(id + 1, single.clone()));
        }
        let reference = event.signal(0).unwrap().max_peak_value();

        let summed = summed_signal(&event, 20, 150);
        assert_eq!(summed.id(), SUMMED_SIGNAL_ID);
        assert_eq!(summed.max_peak_bin(), event.signal(0).unwrap().max_peak_bin());
        assert!((summed.max_peak_value() - n as f64 * reference).abs() < 1e-9);
    }

    #[test]
    fn test_sum_mode_observables() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut event = SignalEvent::new(4);
        for id in 1..=3 {
            event.add_signal(pulse(id, 1500.0, 200.0, &mut rng));
        }
        let config = FitConfig { add_all_pulses: true, aget_fit: true, ..Default::default() };
        let obs = EventFitAggregator::new(config).unwrap().process(&mut event).unwrap();
        assert_eq!(obs.fitted_signals, 1);
        assert_eq!(obs.good_signals, 3);
        assert_eq!(obs.amplitude.keys().copied().collect::<Vec<_>>(), vec![SUMMED_SIGNAL_ID]);
        assert_eq!(obs.sigma_std_dev, 0.0);
        assert_eq!(obs.max_variance_gauss, obs.variance_gauss[&SUMMED_SIGNAL_ID]);
        assert_eq!(obs.variance_gauss_w_mean, obs.max_variance_gauss);
    }

    #[test]
    fn test_cut_drops_event() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut event = SignalEvent::new(9);
        event.add_signal(pulse(1, 2500.0, 200.0, &mut rng));

        let cut = ObservableCut::new(SIGMA_MEAN, 1000.0, 2000.0).unwrap();
        let aggregator = EventFitAggregator::new(FitConfig::default()).unwrap().with_cut(cut);
        assert!(aggregator.process(&mut event).is_none());
    }

    #[test]
    fn test_dedicated_pool_matches_global() {
        let mut rng = StdRng::seed_from_u64(13);
        let mut event = SignalEvent::new(1);
        for id in 0..4 {
            event.add_signal(pulse(id, 1000.0 + 500.0 * id as f64, 190.0, &mut rng));
        }
        let config = FitConfig { aget_fit: true, ..Default::default() };
        let global = EventFitAggregator::new(config.clone()).unwrap();
        let pooled = EventFitAggregator::new(FitConfig { num_threads: Some(2), ..config }).unwrap();

        let a = global.analyze(&mut event.clone());
        let b = pooled.analyze(&mut event);
        assert_eq!(a, b);
    }
}
