//! Synchronous change notification for in-process observers.

use rallytime_protocol::{LogRecord, PartitionKey};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// A state change of one partition.
#[derive(Debug, Clone, Copy)]
pub enum LogChange<'a> {
    Appended {
        key: &'a PartitionKey,
        record: &'a LogRecord,
        /// File length after the append.
        end_offset: u64,
    },
    Truncated {
        key: &'a PartitionKey,
    },
}

impl LogChange<'_> {
    pub fn key(&self) -> &PartitionKey {
        match self {
            LogChange::Appended { key, .. } | LogChange::Truncated { key } => key,
        }
    }
}

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Callback = Arc<dyn Fn(&LogChange<'_>) + Send + Sync>;

#[derive(Default)]
pub(crate) struct ObserverRegistry {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverId, Callback)>>,
}

impl ObserverRegistry {
    pub(crate) fn register<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&LogChange<'_>) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::SeqCst));
        match self.observers.write() {
            Ok(mut observers) => observers.push((id, Arc::new(callback))),
            Err(poisoned) => poisoned.into_inner().push((id, Arc::new(callback))),
        }
        id
    }

    pub(crate) fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = match self.observers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        match self.observers.read() {
            Ok(observers) => observers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Invoke every observer registered at the time of the call.
    ///
    /// The registry lock is released before callbacks run, so a callback
    /// may register or unregister observers.
    pub(crate) fn notify(&self, change: &LogChange<'_>) {
        let snapshot: Vec<Callback> = match self.observers.read() {
            Ok(observers) => observers.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            Err(poisoned) => {
                warn!("Observer registry lock poisoned; notifying anyway");
                poisoned
                    .into_inner()
                    .iter()
                    .map(|(_, cb)| Arc::clone(cb))
                    .collect()
            }
        };
        for callback in snapshot {
            callback(change);
        }
    }
}
