//! Rallytime shared protocol.
//!
//! Everything that crosses a crate or process boundary lives here:
//!
//! - **Records**: [`LogRecord`] is one NDJSON line in a gate partition
//! - **Partitions**: [`PartitionKey`] is `(gate_id, UTC day)` and maps to
//!   `<data-root>/gates/<gate_id>/pass-<YYYYMMDD>.ndjson`
//!
//! ```text
//! sensor ──▶ ingest ──▶ EventLog.append ──▶ pass-YYYYMMDD.ndjson ──▶ tailer ──▶ observers
//! ```

pub mod defaults;
pub mod error;
pub mod paths;
pub mod types;

pub use error::{ProtocolError, Result};
pub use types::{GateId, LogRecord, PartitionKey};
