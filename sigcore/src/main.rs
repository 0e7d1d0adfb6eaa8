use std::fs;

use clap::Parser;
use sigcore::analysis::aggregator::EventFitAggregator;
use sigcore::analysis::config::FitConfig;
use sigcore::analysis::observables::ObservableCut;
use sigcore::analysis::selection::SignalSelection;
use sigcore::data::io;
use sigcore::error::{Result, SignalError};

#[derive(Parser, Debug)]
#[command(version, about = "Fits the pulse shapes of a stored raw signal event")]
struct Args {
    /// Event file, bincode if it ends in `.bin`, JSON otherwise
    event: String,
    /// JSON fit configuration
    #[clap(long)]
    config: Option<String>,
    /// Signal selection, e.g. `onlyGoodSignals[3.5,1.5,7]:baseLineRange[20,150]:printIDs`
    #[clap(long)]
    select: Option<String>,
    /// Keep the event only if a scalar observable lies within bounds, e.g. `FitSigmaMean:0:50`
    #[clap(long)]
    cut: Option<String>,
}

fn parse_cut(option: &str) -> Result<ObservableCut> {
    let mut parts = option.rsplitn(3, ':');
    let (max, min, name) = (parts.next(), parts.next(), parts.next());
    let malformed = || SignalError::MalformedOption {
        option: option.to_string(),
        reason: "expected `name:min:max`".to_string(),
    };
    match (name, min, max) {
        (Some(name), Some(min), Some(max)) => {
            let min: f64 = min.parse().map_err(|_| malformed())?;
            let max: f64 = max.parse().map_err(|_| malformed())?;
            ObservableCut::new(name, min, max)
        }
        _ => Err(malformed()),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut event = if args.event.ends_with(".bin") {
        io::load_bincode(&args.event)?
    } else {
        io::load_json(&args.event)?
    };
    let config = match &args.config {
        Some(path) => FitConfig::from_json_str(&fs::read_to_string(path)?)?,
        None => FitConfig::default(),
    };
    log::info!(
        "event {}: {} signals, fit mode {:?}",
        event.id(),
        event.number_of_signals(),
        config.mode()
    );

    if let Some(option) = &args.select {
        let selection: SignalSelection = option.parse()?;
        let keep = selection.select(&event)?;
        for id in event.signal_ids() {
            if !keep.contains(&id) {
                event.remove_signal_with_id(id);
            }
        }
    }

    let mut aggregator = EventFitAggregator::new(config)?;
    if let Some(option) = &args.cut {
        aggregator = aggregator.with_cut(parse_cut(option)?);
    }

    match aggregator.process(&mut event) {
        Some(observables) => println!("{}", serde_json::to_string_pretty(&observables)?),
        None => log::info!("event {} rejected by cut", event.id()),
    }
    Ok(())
}
