//! Error types for the shared protocol.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid gate id {value:?}: {reason}")]
    InvalidGateId { value: String, reason: &'static str },

    #[error("Invalid partition day {0:?}: expected YYYYMMDD")]
    InvalidDay(String),

    #[error("Record has no timestamp")]
    MissingTimestamp,

    #[error("Unreadable timestamp {0}")]
    InvalidTimestamp(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProtocolError {
    pub fn invalid_gate(value: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidGateId {
            value: value.into(),
            reason,
        }
    }
}
