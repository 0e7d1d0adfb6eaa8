use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid sample range [{start}, {end}) for a signal of {len} points")]
    InvalidRange { start: usize, end: usize, len: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("malformed selection option `{option}`: {reason}")]
    MalformedOption { option: String, reason: String },
    #[error("unsupported event file version: expected {expected}, got {actual}")]
    UnsupportedVersion { expected: u32, actual: u32 },
    #[error("signal length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("duplicate signal id {0}")]
    DuplicateSignalId(i32),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SignalError>;
