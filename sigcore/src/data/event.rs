use std::fmt;
use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::data::signal::{RawSignal, DEFAULT_SIGNAL_LENGTH};

/// How [`SignalEvent::low_average_width`] normalizes when fewer channels
/// qualify than requested.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WidthAveraging {
    /// Divide by the number of widths actually averaged.
    #[default]
    Qualifying,
    /// Always divide by the requested count, biasing sparse events toward zero.
    Requested,
}

/// Extreme values over all signals of an event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Extrema {
    pub min_value: f64,
    pub max_value: f64,
    pub min_time: f64,
    pub max_time: f64,
}

/// All channel signals recorded for one event.
///
/// Signals are kept in insertion order and are unique by id. The extrema
/// are recomputed eagerly after every mutation made through this type; code
/// that mutates a signal through [`SignalEvent::signal_by_id_mut`] must call
/// [`SignalEvent::recompute_extrema`] afterwards.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct SignalEvent {
    id: i32,
    signals: Vec<RawSignal>,
    range: Option<(usize, usize)>,
    baseline_range: Option<(usize, usize)>,
    extrema: Extrema,
}

impl SignalEvent {
    pub fn new(id: i32) -> Self {
        let mut event = SignalEvent { id, ..Default::default() };
        event.recompute_extrema();
        event
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn set_id(&mut self, id: i32) {
        self.id = id;
    }

    /// Analysis range applied to signals added from now on.
    pub fn set_range(&mut self, range: Option<(usize, usize)>) {
        self.range = range;
    }

    pub fn range(&self) -> Option<(usize, usize)> {
        self.range
    }

    /// Baseline range used for signals added from now on.
    pub fn set_baseline_range(&mut self, range: Option<(usize, usize)>) {
        self.baseline_range = range;
    }

    pub fn baseline_range(&self) -> Option<(usize, usize)> {
        self.baseline_range
    }

    pub fn number_of_signals(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn signals(&self) -> &[RawSignal] {
        &self.signals
    }

    pub fn signal(&self, index: usize) -> Option<&RawSignal> {
        self.signals.get(index)
    }

    pub fn signal_ids(&self) -> Vec<i32> {
        self.signals.iter().map(|s| s.id()).collect()
    }

    pub fn signal_id_exists(&self, id: i32) -> bool {
        self.signal_index(id).is_some()
    }

    /// Adds a signal, computing its baseline over the event baseline range.
    ///
    /// A signal whose id is already present, or whose length differs from
    /// the signals already stored, is rejected with a warning and the event
    /// is left untouched.
    ///
    /// # Returns
    ///
    /// `true` if the signal was stored.
    pub fn add_signal(&mut self, mut signal: RawSignal) -> bool {
        if self.signal_id_exists(signal.id()) {
            log::warn!(
                "event {}: signal id {} already exists, signal will not be added",
                self.id,
                signal.id()
            );
            return false;
        }
        if let Some(first) = self.signals.first() {
            if first.len() != signal.len() {
                log::warn!(
                    "event {}: signal id {} has {} points, expected {}, signal will not be added",
                    self.id,
                    signal.id(),
                    signal.len(),
                    first.len()
                );
                return false;
            }
        }

        if let Some((start, end)) = self.baseline_range {
            signal.calculate_baseline(start, end);
        }
        signal.set_range(self.range);

        self.signals.push(signal);
        self.recompute_extrema();
        true
    }

    /// Removes the signal with `id`. Returns the removed signal, `None` if absent.
    pub fn remove_signal_with_id(&mut self, id: i32) -> Option<RawSignal> {
        match self.signal_index(id) {
            Some(index) => {
                let removed = self.signals.remove(index);
                self.recompute_extrema();
                Some(removed)
            }
            None => {
                log::warn!("event {}: signal id {} does not exist, nothing removed", self.id, id);
                None
            }
        }
    }

    /// Position of the signal with `id` in insertion order.
    pub fn signal_index(&self, id: i32) -> Option<usize> {
        self.signals.iter().position(|s| s.id() == id)
    }

    pub fn signal_by_id(&self, id: i32) -> Option<&RawSignal> {
        self.signals.iter().find(|s| s.id() == id)
    }

    pub fn signal_by_id_mut(&mut self, id: i32) -> Option<&mut RawSignal> {
        self.signals.iter_mut().find(|s| s.id() == id)
    }

    /// Adds `value` to `bin` of signal `id`, creating a default length
    /// signal if the id is not present yet.
    pub fn add_charge_to_signal(&mut self, id: i32, bin: usize, value: f64) {
        let index = match self.signal_index(id) {
            Some(index) => index,
            None => {
                let len = self.signals.first().map_or(DEFAULT_SIGNAL_LENGTH, |s| s.len());
                if !self.add_signal(RawSignal::new(id, len)) {
                    return;
                }
                self.signals.len() - 1
            }
        };
        self.signals[index].increase_bin_by(bin, value);
        self.recompute_extrema();
    }

    /// Recomputes the baseline of every signal over `[start, end)`.
    pub fn calculate_baselines(&mut self, start: usize, end: usize) {
        for s in &mut self.signals {
            s.calculate_baseline(start, end);
        }
        self.recompute_extrema();
    }

    /// Runs the points-over-threshold scan on every signal.
    pub fn initialize_points_over_threshold(
        &mut self,
        point_threshold: f64,
        signal_threshold: f64,
        min_points_over: usize,
    ) {
        for s in &mut self.signals {
            s.initialize_points_over_threshold(point_threshold, signal_threshold, min_points_over);
        }
    }

    /// Full rescan of the signals to refresh the cached extrema.
    ///
    /// An empty event reports 0 for the values and the default signal
    /// length as its maximum time.
    pub fn recompute_extrema(&mut self) {
        let mut extrema = Extrema {
            min_value: 0.0,
            max_value: 0.0,
            min_time: 0.0,
            max_time: DEFAULT_SIGNAL_LENGTH as f64,
        };
        if let Some(first) = self.signals.first() {
            extrema.min_value = f64::INFINITY;
            extrema.max_value = f64::NEG_INFINITY;
            extrema.max_time = first.len() as f64;
            for s in &self.signals {
                extrema.min_value = extrema.min_value.min(s.min_value());
                extrema.max_value = extrema.max_value.max(s.max_value());
            }
        }
        self.extrema = extrema;
    }

    pub fn extrema(&self) -> Extrema {
        self.extrema
    }

    pub fn min_value(&self) -> f64 {
        self.extrema.min_value
    }

    pub fn max_value(&self) -> f64 {
        self.extrema.max_value
    }

    pub fn min_time(&self) -> f64 {
        self.extrema.min_time
    }

    pub fn max_time(&self) -> f64 {
        self.extrema.max_time
    }

    pub fn integral(&self) -> f64 {
        self.signals.iter().map(|s| s.integral()).sum()
    }

    /// Depends on a previous points-over-threshold scan of the signals.
    pub fn threshold_integral(&self) -> f64 {
        self.signals.iter().map(|s| s.threshold_integral()).sum()
    }

    pub fn slope_integral(&self) -> f64 {
        self.signals.iter().map(|s| s.slope_integral()).sum()
    }

    pub fn triple_max_integral(&self) -> f64 {
        self.signals
            .iter()
            .filter(|s| s.threshold_integral() > 0.0)
            .map(|s| s.triple_max_integral())
            .sum()
    }

    /// Signal with the largest integral; the first one wins on ties.
    pub fn max_signal(&self) -> Option<&RawSignal> {
        self.signals
            .iter()
            .rev()
            .max_by_key(|s| OrderedFloat(s.integral()))
    }

    /// Mean slope integral over signals with a positive threshold integral, 0 if none.
    pub fn rise_slope(&self) -> f64 {
        mean_or_zero(
            self.signals
                .iter()
                .filter(|s| s.threshold_integral() > 0.0)
                .map(|s| s.slope_integral()),
        )
    }

    /// Mean rise time over signals with a positive threshold integral, 0 if none.
    pub fn rise_time(&self) -> f64 {
        mean_or_zero(
            self.signals
                .iter()
                .filter(|s| s.threshold_integral() > 0.0)
                .map(|s| s.rise_time() as f64),
        )
    }

    /// Mean baseline over all signals, 0 for an empty event.
    pub fn baseline_average(&self) -> f64 {
        mean_or_zero(self.signals.iter().map(|s| s.baseline_mean()))
    }

    /// Mean baseline sigma over all signals, 0 for an empty event.
    pub fn baseline_sigma_average(&self) -> f64 {
        mean_or_zero(self.signals.iter().map(|s| s.baseline_sigma()))
    }

    fn qualifying_widths(&self, min_peak_amplitude: f64) -> impl Iterator<Item = usize> + '_ {
        self.signals
            .iter()
            .filter(move |s| s.max_peak_value() > min_peak_amplitude)
            .map(|s| s.max_peak_width())
    }

    /// Smallest peak width among signals whose maximum exceeds `min_peak_amplitude`.
    pub fn lowest_width(&self, min_peak_amplitude: f64) -> Option<usize> {
        self.qualifying_widths(min_peak_amplitude).min()
    }

    /// Mean peak width among signals whose maximum exceeds `min_peak_amplitude`, 0 if none.
    pub fn average_width(&self, min_peak_amplitude: f64) -> f64 {
        mean_or_zero(self.qualifying_widths(min_peak_amplitude).map(|w| w as f64))
    }

    /// Mean of the `n_signals` smallest qualifying widths, 0 if none qualify.
    ///
    /// # Arguments
    ///
    /// * `n_signals` - number of widths to average
    /// * `min_peak_amplitude` - signals with a lower maximum are ignored
    /// * `averaging` - normalization used when fewer than `n_signals` qualify
    pub fn low_average_width(
        &self,
        n_signals: usize,
        min_peak_amplitude: f64,
        averaging: WidthAveraging,
    ) -> f64 {
        let mut widths: Vec<usize> = self.qualifying_widths(min_peak_amplitude).collect();
        if widths.is_empty() || n_signals == 0 {
            return 0.0;
        }
        widths.sort_unstable();
        let used = n_signals.min(widths.len());
        let sum: usize = widths[..used].iter().sum();
        let denominator = match averaging {
            WidthAveraging::Qualifying => used,
            WidthAveraging::Requested => n_signals,
        };
        sum as f64 / denominator as f64
    }
}

impl Display for SignalEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "SignalEvent(id: {}, signals: {})", self.id, self.signals.len())?;
        for s in &self.signals {
            writeln!(f, "  {}", s)?;
        }
        Ok(())
    }
}

fn mean_or_zero(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn box_signal(id: i32, from: usize, to: usize, height: f64) -> RawSignal {
        let mut s = RawSignal::new(id, DEFAULT_SIGNAL_LENGTH);
        for bin in from..to {
            s.increase_bin_by(bin, height);
        }
        s
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let mut event = SignalEvent::new(1);
        assert!(event.add_signal(box_signal(10, 100, 110, 5.0)));
        assert!(event.add_signal(box_signal(11, 100, 110, 7.0)));
        assert!(!event.add_signal(box_signal(10, 0, 512, 99.0)));
        assert_eq!(event.number_of_signals(), 2);
        let first = box_signal(10, 100, 110, 5.0);
        assert_eq!(event.signal_by_id(10).unwrap().samples(), first.samples());
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let mut event = SignalEvent::new(1);
        assert!(event.add_signal(RawSignal::new(1, 512)));
        assert!(!event.add_signal(RawSignal::new(2, 256)));
        assert_eq!(event.number_of_signals(), 1);
    }

    #[test]
    fn test_lookup_of_absent_id() {
        let mut event = SignalEvent::new(1);
        event.add_signal(box_signal(4, 10, 20, 1.0));
        assert_eq!(event.signal_index(4), Some(0));
        assert_eq!(event.signal_index(5), None);
        assert!(event.signal_by_id(5).is_none());
        assert!(event.remove_signal_with_id(5).is_none());
        assert_eq!(event.remove_signal_with_id(4).map(|s| s.id()), Some(4));
        assert!(event.is_empty());
    }

    #[test]
    fn test_baseline_range_is_applied_on_add() {
        let mut event = SignalEvent::new(1);
        event.set_baseline_range(Some((0, 50)));
        let mut s = box_signal(1, 200, 220, 30.0);
        for bin in 0..512 {
            s.increase_bin_by(bin, 100.0);
        }
        event.add_signal(s);
        let stored = event.signal_by_id(1).unwrap();
        assert_eq!(stored.baseline_mean(), 100.0);
        assert_eq!(stored.baseline_range(), Some((0, 50)));
        assert_eq!(event.max_value(), 30.0);
    }

    #[test]
    fn test_add_charge_creates_signal() {
        let mut event = SignalEvent::new(1);
        event.add_charge_to_signal(33, 12, 4.0);
        event.add_charge_to_signal(33, 12, 4.0);
        assert_eq!(event.number_of_signals(), 1);
        let s = event.signal_by_id(33).unwrap();
        assert_eq!(s.len(), DEFAULT_SIGNAL_LENGTH);
        assert_eq!(s.raw(12), 8.0);
        assert_eq!(event.max_value(), 8.0);
        assert_eq!(event.max_time(), DEFAULT_SIGNAL_LENGTH as f64);
    }

    #[test]
    fn test_max_signal_and_widths() {
        let mut event = SignalEvent::new(1);
        event.add_signal(box_signal(1, 100, 104, 10.0));
        event.add_signal(box_signal(2, 100, 110, 10.0));
        event.add_signal(box_signal(3, 100, 120, 1.0));
        assert_eq!(event.max_signal().map(|s| s.id()), Some(2));
        assert_eq!(event.lowest_width(5.0), Some(4));
        assert_eq!(event.average_width(5.0), 7.0);
        assert_eq!(event.low_average_width(1, 5.0, WidthAveraging::Qualifying), 4.0);
        assert_eq!(event.low_average_width(4, 5.0, WidthAveraging::Qualifying), 7.0);
        assert_eq!(event.low_average_width(4, 5.0, WidthAveraging::Requested), 3.5);
        assert_eq!(event.lowest_width(50.0), None);
        assert_eq!(event.average_width(50.0), 0.0);
    }

    #[test]
    fn test_max_signal_prefers_first_on_ties() {
        let mut event = SignalEvent::new(1);
        event.add_signal(box_signal(8, 100, 110, 10.0));
        event.add_signal(box_signal(9, 200, 210, 10.0));
        assert_eq!(event.max_signal().map(|s| s.id()), Some(8));
    }

    #[test]
    fn test_empty_event_aggregates() {
        let event = SignalEvent::new(1);
        assert_eq!(event.integral(), 0.0);
        assert_eq!(event.baseline_average(), 0.0);
        assert_eq!(event.baseline_sigma_average(), 0.0);
        assert_eq!(event.rise_time(), 0.0);
        assert_eq!(event.rise_slope(), 0.0);
        assert_eq!(event.average_width(0.0), 0.0);
        assert_eq!(event.low_average_width(3, 0.0, WidthAveraging::Requested), 0.0);
        assert!(event.max_signal().is_none());
        assert_eq!(event.max_value(), 0.0);
        assert_eq!(event.max_time(), DEFAULT_SIGNAL_LENGTH as f64);
    }

    #[test]
    fn test_rise_time_only_counts_signals_over_threshold() {
        let mut event = SignalEvent::new(1);
        event.set_baseline_range(Some((0, 50)));
        let mut rising = RawSignal::new(1, DEFAULT_SIGNAL_LENGTH);
        for (k, bin) in (300..310).enumerate() {
            rising.increase_bin_by(bin, 10.0 * (k + 1) as f64);
        }
        for bin in 0..50 {
            rising.increase_bin_by(bin, if bin % 2 == 0 { 1.0 } else { -1.0 });
        }
        event.add_signal(rising);
        event.add_signal(RawSignal::new(2, DEFAULT_SIGNAL_LENGTH));
        event.initialize_points_over_threshold(3.0, 5.0, 3);
        assert_eq!(event.rise_time(), 9.0);
        assert_eq!(event.rise_slope(), 90.0);
    }
}
