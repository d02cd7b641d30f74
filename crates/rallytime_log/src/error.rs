//! Error types for the event log.

use rallytime_protocol::{GateId, PartitionKey, ProtocolError};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LogError>;

/// Storage failures surfaced to the caller of append/read/truncate.
///
/// Nothing here is retried automatically.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Record for gate {record} cannot be written to partition {partition}")]
    PartitionMismatch {
        record: GateId,
        partition: PartitionKey,
    },

    #[error("Partition lock poisoned: {0}")]
    LockPoisoned(PartitionKey),
}

impl LogError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
