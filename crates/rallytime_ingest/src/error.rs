use rallytime_log::LogError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

/// Upstream transport failures. The worker retries these with backoff.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Subscribe to '{filter}' failed: {message}")]
    Subscribe { filter: String, message: String },

    #[error("Transport closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Append failed: {0}")]
    Log(#[from] LogError),

    #[error("Storage task failed: {0}")]
    Storage(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Invalid topic prefix '{0}'")]
    InvalidPrefix(String),
}
