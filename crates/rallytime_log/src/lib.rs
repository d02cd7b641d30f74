//! Rallytime Event Log
//!
//! Append-only NDJSON storage, one file per `(gate, UTC day)` partition,
//! plus incremental tailing of those files for live observers.
//!
//! # Guarantees
//!
//! - **Single writer per partition**: appends and truncates of one partition
//!   are serialized behind a per-partition lock; different partitions never
//!   contend.
//! - **No torn records**: a record is one `write` of one newline-terminated
//!   line; a failed write is rolled back to the previous length, and tailers
//!   only trust bytes up to the last newline they see.
//! - **Atomic truncation**: clearing a partition renames an empty file over
//!   it, so a failed clear leaves the old contents intact.
//! - **Live-only tailing**: a tailer starts at the end of file and never
//!   re-emits bytes it already delivered.

pub mod cancel;
pub mod error;
pub mod log;
pub mod observer;
pub mod stream;
pub mod tailer;

pub use cancel::CancellationToken;
pub use error::{LogError, Result};
pub use log::{EventLog, EventLogOptions, ReadReport};
pub use observer::{LogChange, ObserverId};
pub use stream::{spawn_tail, TailEvent, TailOptions, TailSubscription};
pub use tailer::{LogTailer, StreamCursor};
