//! Rallytime ingestion adapter.
//!
//! Field sensors publish one message per gate pass on
//! `<prefix>/<gate_id>/pass`. The adapter normalises every payload into a
//! [`LogRecord`](rallytime_protocol::LogRecord) of type `pass` and appends
//! it to that gate's partition for the day the message was received.
//!
//! Delivery is at-most-once: while the transport is down nothing is
//! buffered, and the worker simply reconnects with a bounded backoff.

pub mod backoff;
pub mod error;
pub mod mqtt;
pub mod normalize;
pub mod source;
pub mod worker;

pub use backoff::Backoff;
pub use error::{IngestError, Result, TransportError};
pub use mqtt::{MqttSource, MqttSourceConfig};
pub use normalize::{normalize_pass, parse_timestamp, TopicLayout};
pub use source::{PassMessage, PassSource};
pub use worker::{IngestOptions, IngestStats, IngestWorker};
