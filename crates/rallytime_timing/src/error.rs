use thiserror::Error;

pub type Result<T> = std::result::Result<T, TimingError>;

/// Decoder configuration errors. Decoding itself never fails.
#[derive(Error, Debug)]
pub enum TimingError {
    #[error("Invalid allowed-character pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("At least one terminator key is required")]
    NoTerminators,
}
