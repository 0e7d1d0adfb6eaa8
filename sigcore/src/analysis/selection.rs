use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::algorithm::baseline::BaselineEstimator;
use crate::algorithm::threshold::{over_threshold_runs, GoodSignalCriteria, MIN_GOOD_POINTS};
use crate::data::event::SignalEvent;
use crate::data::signal::RawSignal;
use crate::error::{Result, SignalError};

/// Which signal entries a selection starts from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntrySelection {
    #[default]
    All,
    /// positions `first..=last` in insertion order
    Range { first: usize, last: usize },
    /// one signal id, taken as is
    Single(i32),
}

/// Typed form of the colon separated signal selection string
/// `"from-to:onlyGoodSignals[p,s,n]:baseLineRange[a,b]:ids[x,y]:printIDs"`.
///
/// Every option is optional; a leading `n` or `from-to` selects entries by
/// position, `ids[x,y]` (or `ids[x-y]`, `signalRangeID[..]`) keeps ids in
/// `[x, y]`, and `onlyGoodSignals` requires `baseLineRange`.
///
/// # Example
///
/// ```rust
/// # use sigcore::analysis::selection::SignalSelection;
/// let selection: SignalSelection = "onlyGoodSignals[3.5,1.5,7]:baseLineRange[20,150]:ids[800,900]"
///     .parse()
///     .unwrap();
/// assert_eq!(selection.ids, Some((800, 900)));
/// assert!("onlyGoodSignals[3.5,1.5]".parse::<SignalSelection>().is_err());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalSelection {
    pub entries: EntrySelection,
    pub good_signals: Option<GoodSignalCriteria>,
    pub baseline_range: Option<(usize, usize)>,
    /// inclusive id bounds
    pub ids: Option<(i32, i32)>,
    pub print_ids: bool,
}

fn malformed(option: &str, reason: impl Into<String>) -> SignalError {
    SignalError::MalformedOption { option: option.to_string(), reason: reason.into() }
}

/// Arguments of `name[...]`, `None` if `token` is a different option.
fn bracket_args<'a>(token: &'a str, name: &str) -> Result<Option<&'a str>> {
    let Some(rest) = token.strip_prefix(name).and_then(|r| r.strip_prefix('[')) else {
        return Ok(None);
    };
    rest.strip_suffix(']')
        .map(Some)
        .ok_or_else(|| malformed(token, "missing closing `]`"))
}

fn parse_number<T: FromStr>(option: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| malformed(option, format!("`{value}` is not a valid number")))
}

fn split_args<'a>(
    option: &str,
    args: &'a str,
    separators: &[char],
    expected: usize,
) -> Result<Vec<&'a str>> {
    let parts: Vec<&str> = separators
        .iter()
        .find(|sep| args.contains(**sep))
        .map_or_else(|| vec![args], |sep| args.split(*sep).collect());
    if parts.len() != expected {
        return Err(malformed(option, format!("expected {expected} values, got {}", parts.len())));
    }
    Ok(parts)
}

fn parse_entries(token: &str) -> Result<Option<EntrySelection>> {
    if !token.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        return Ok(None);
    }
    if let Ok(id) = token.parse::<i32>() {
        return Ok(Some(EntrySelection::Single(id)));
    }
    let (first, last) = token
        .split_once('-')
        .ok_or_else(|| malformed(token, "expected a signal index or a `from-to` range"))?;
    let first: usize = parse_number(token, first)?;
    let last: usize = parse_number(token, last)?;
    if first > last {
        return Err(malformed(token, "range start is after its end"));
    }
    Ok(Some(EntrySelection::Range { first, last }))
}

impl FromStr for SignalSelection {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self> {
        let mut selection = SignalSelection::default();
        let tokens: Vec<&str> = s.split(':').map(str::trim).filter(|t| !t.is_empty()).collect();

        for (position, token) in tokens.iter().enumerate() {
            if let Some(entries) = parse_entries(token)? {
                if position != 0 {
                    return Err(malformed(token, "entry selection must be the first option"));
                }
                selection.entries = entries;
            } else if let Some(args) = bracket_args(token, "onlyGoodSignals")? {
                let parts = split_args(token, args, &[','], 3)?;
                let point: f64 = parse_number(token, parts[0])?;
                let signal: f64 = parse_number(token, parts[1])?;
                let n_over: usize = parse_number(token, parts[2])?;
                if point < 0.0 || signal < 0.0 {
                    return Err(malformed(token, "thresholds must not be negative"));
                }
                selection.good_signals = Some(GoodSignalCriteria::new(point, signal, n_over));
            } else if let Some(args) = bracket_args(token, "baseLineRange")? {
                let parts = split_args(token, args, &[','], 2)?;
                let start: usize = parse_number(token, parts[0])?;
                let end: usize = parse_number(token, parts[1])?;
                if start >= end {
                    return Err(malformed(token, "baseline range is empty"));
                }
                selection.baseline_range = Some((start, end));
            } else if let Some(args) =
                bracket_args(token, "ids")?.or(bracket_args(token, "signalRangeID")?)
            {
                let parts = split_args(token, args, &[',', '-'], 2)?;
                let lo: i32 = parse_number(token, parts[0])?;
                let hi: i32 = parse_number(token, parts[1])?;
                if lo > hi {
                    return Err(malformed(token, "id range start is after its end"));
                }
                selection.ids = Some((lo, hi));
            } else if *token == "printIDs" {
                selection.print_ids = true;
            } else {
                return Err(malformed(token, "unknown option"));
            }
        }

        if selection.good_signals.is_some() && selection.baseline_range.is_none() {
            return Err(malformed("onlyGoodSignals", "requires a baseLineRange option"));
        }
        Ok(selection)
    }
}

impl SignalSelection {
    fn is_good(&self, signal: &RawSignal) -> bool {
        let Some(criteria) = self.good_signals else {
            return true;
        };
        let baseline = self
            .baseline_range
            .and_then(|(start, end)| BaselineEstimator::new(start, end).estimate(signal.samples()))
            .unwrap_or_else(|| signal.baseline());
        let runs = over_threshold_runs(signal.samples(), baseline, criteria, signal.range());
        runs.iter().map(|r| r.len()).sum::<usize>() >= MIN_GOOD_POINTS
    }

    fn in_id_range(&self, id: i32) -> bool {
        self.ids.map_or(true, |(lo, hi)| id >= lo && id <= hi)
    }

    /// Ids of the signals of `event` matching the selection, in insertion order.
    ///
    /// The event is not modified; good-signal checks use a baseline computed
    /// over the selection's baseline range. A position range reaching past
    /// the last signal is an error.
    pub fn select(&self, event: &SignalEvent) -> Result<Vec<i32>> {
        let candidates: &[RawSignal] = match self.entries {
            EntrySelection::Single(id) => return Ok(vec![id]),
            EntrySelection::All => event.signals(),
            EntrySelection::Range { first, last } => {
                let len = event.number_of_signals();
                if last >= len {
                    return Err(SignalError::InvalidRange { start: first, end: last + 1, len });
                }
                &event.signals()[first..=last]
            }
        };

        let ids: Vec<i32> = candidates
            .iter()
            .filter(|s| self.in_id_range(s.id()) && self.is_good(s))
            .map(|s| s.id())
            .collect();

        if self.print_ids {
            log::info!("event {}: selected signal ids {:?}", event.id(), ids);
        }
        Ok(ids)
    }
}
