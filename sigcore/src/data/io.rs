use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::data::event::SignalEvent;
use crate::error::{Result, SignalError};

/// Current version of the on-disk event layout.
pub const FORMAT_VERSION: u32 = 1;

/// Versioned envelope around a stored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct EventFile {
    pub version: u32,
    pub event: SignalEvent,
}

impl EventFile {
    pub fn new(event: SignalEvent) -> Self {
        Self { version: FORMAT_VERSION, event }
    }

    /// Checks the version and the signal invariants, returning the event.
    pub fn into_event(self) -> Result<SignalEvent> {
        if self.version != FORMAT_VERSION {
            return Err(SignalError::UnsupportedVersion {
                expected: FORMAT_VERSION,
                actual: self.version,
            });
        }
        validate_event(&self.event)?;
        Ok(self.event)
    }
}

/// Unique ids and equal signal lengths.
pub fn validate_event(event: &SignalEvent) -> Result<()> {
    let mut seen = HashSet::with_capacity(event.number_of_signals());
    let expected = event.signal(0).map_or(0, |s| s.len());
    for s in event.signals() {
        if !seen.insert(s.id()) {
            return Err(SignalError::DuplicateSignalId(s.id()));
        }
        if s.len() != expected {
            return Err(SignalError::LengthMismatch { expected, actual: s.len() });
        }
    }
    Ok(())
}

// --- JSON ---
pub fn to_json_string(event: &SignalEvent) -> Result<String> {
    Ok(serde_json::to_string_pretty(&EventFile::new(event.clone()))?)
}

pub fn from_json_str(json: &str) -> Result<SignalEvent> {
    let file: EventFile = serde_json::from_str(json)?;
    file.into_event()
}

pub fn save_json(path: &str, event: &SignalEvent) -> Result<()> {
    let f = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(f, &EventFile::new(event.clone()))?;
    Ok(())
}

pub fn load_json(path: &str) -> Result<SignalEvent> {
    let f = BufReader::new(File::open(path)?);
    let file: EventFile = serde_json::from_reader(f)?;
    file.into_event()
}

// --- bincode ---
pub fn to_bytes(event: &SignalEvent) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(EventFile::new(event.clone()), bincode::config::standard())?)
}

pub fn from_bytes(bytes: &[u8]) -> Result<SignalEvent> {
    let (file, _): (EventFile, usize) =
        bincode::decode_from_slice(bytes, bincode::config::standard())?;
    file.into_event()
}

pub fn save_bincode(path: &str, event: &SignalEvent) -> Result<()> {
    let mut bw = BufWriter::new(File::create(path)?);
    let file = EventFile::new(event.clone());
    bincode::encode_into_std_write(file, &mut bw, bincode::config::standard())?;
    Ok(())
}

pub fn load_bincode(path: &str) -> Result<SignalEvent> {
    let mut br = BufReader::new(File::open(path)?);
    let file: EventFile = bincode::decode_from_std_read(&mut br, bincode::config::standard())?;
    file.into_event()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::signal::RawSignal;

    fn sample_event() -> SignalEvent {
        let mut event = SignalEvent::new(42);
        event.set_baseline_range(Some((0, 4)));
        event.add_signal(RawSignal::from_samples(3, vec![1.0, 2.0, 1.0, 2.0, 40.0, 9.0]));
        event.add_signal(RawSignal::from_samples(8, vec![5.0, 5.0, 5.0, 5.0, 5.0, 70.0]));
        event
    }

    #[test]
    fn test_json_keeps_baseline_and_extrema() {
        let event = sample_event();
        let json = to_json_string(&event).unwrap();
        let loaded = from_json_str(&json).unwrap();
        assert_eq!(loaded.signal_ids(), vec![3, 8]);
        assert_eq!(loaded.signal_by_id(3).unwrap().baseline_mean(), 1.5);
        assert_eq!(loaded.extrema(), event.extrema());
    }

    #[test]
    fn test_files() {
        let dir = std::env::temp_dir();
        let json_path = dir.join("sigcore_io_test_event.json");
        let bin_path = dir.join("sigcore_io_test_event.bin");
        let json_path = json_path.to_str().unwrap();
        let bin_path = bin_path.to_str().unwrap();

        let event = sample_event();
        save_json(json_path, &event).unwrap();
        save_bincode(bin_path, &event).unwrap();
        assert_eq!(load_json(json_path).unwrap(), event);
        assert_eq!(load_bincode(bin_path).unwrap(), event);
        assert_eq!(from_bytes(&to_bytes(&event).unwrap()).unwrap(), event);

        std::fs::remove_file(json_path).ok();
        std::fs::remove_file(bin_path).ok();
    }

    #[test]
    fn test_unsupported_version() {
        let file = EventFile { version: 7, event: sample_event() };
        let json = serde_json::to_string(&file).unwrap();
        assert!(matches!(
            from_json_str(&json),
            Err(SignalError::UnsupportedVersion { expected: 1, actual: 7 })
        ));
    }

    #[test]
    fn test_rejects_broken_invariants() {
        let json = to_json_string(&sample_event()).unwrap().replace("\"id\": 8", "\"id\": 3");
        assert!(matches!(from_json_str(&json), Err(SignalError::DuplicateSignalId(3))));
        assert!(from_json_str("{ \"version\": 1 }").is_err());
    }
}
