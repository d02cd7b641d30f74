//! Async tail task: one per live observer.
//!
//! Design principles:
//! - The cursor is positioned before the task is spawned, so anything
//!   appended after `spawn_tail` returns is delivered
//! - `Ready` is always the first event
//! - Each poll runs on the blocking pool and is awaited to completion, so
//!   cancellation can never interrupt it halfway; cancellation is checked
//!   before every poll and before every delivery
//! - Closing, dropping the subscription, or dropping the receiver all stop
//!   the task; no poll runs after that

use futures::Stream;
use rallytime_protocol::defaults::{DEFAULT_TAIL_CHANNEL_CAPACITY, DEFAULT_TAIL_POLL_INTERVAL_MS};
use rallytime_protocol::PartitionKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::log::EventLog;
use crate::tailer::LogTailer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEvent {
    /// Stream is open; sent once before any data.
    Ready,
    /// One raw NDJSON line, without its newline.
    Line(String),
    /// A poll failed; the stream stays open and polling continues.
    Error(String),
}

#[derive(Debug, Clone, Copy)]
pub struct TailOptions {
    pub poll_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_TAIL_POLL_INTERVAL_MS),
            channel_capacity: DEFAULT_TAIL_CHANNEL_CAPACITY,
        }
    }
}

/// Receiving side of a live tail. Dropping it stops the task.
pub struct TailSubscription {
    key: PartitionKey,
    start_offset: u64,
    rx: mpsc::Receiver<TailEvent>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TailSubscription {
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Byte offset the tail started from. Records before it are never delivered.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub async fn recv(&mut self) -> Option<TailEvent> {
        self.rx.recv().await
    }

    /// Stop polling and wait until the task has exited.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Tail task for {} ended abnormally: {}", self.key, e);
            }
        }
    }

    /// Adapt into a `Stream`; dropping the stream closes the tail.
    pub fn into_stream(self) -> impl Stream<Item = TailEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

impl Drop for TailSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start tailing `key` from its current end of file.
pub fn spawn_tail(
    log: Arc<EventLog>,
    key: PartitionKey,
    options: TailOptions,
) -> Result<TailSubscription> {
    let tailer = LogTailer::open(&log, &key)?;
    let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
    let cancel = CancellationToken::new();

    let start_offset = tailer.cursor().offset();
    info!("Live tail on {} from offset {}", key, start_offset);
    let handle = tokio::spawn(run_tail(tailer, tx, cancel.clone(), options.poll_interval));

    Ok(TailSubscription {
        key,
        start_offset,
        rx,
        cancel,
        handle: Some(handle),
    })
}

async fn run_tail(
    tailer: LogTailer,
    tx: mpsc::Sender<TailEvent>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    if !deliver(&tx, &cancel, TailEvent::Ready).await {
        return;
    }

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately, skip it
    ticker.tick().await;

    let key = tailer.key().clone();
    let mut tailer = Some(tailer);
    'poll: loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            _ = ticker.tick() => {}
        }
        if cancel.is_cancelled() {
            break;
        }
        let Some(mut current) = tailer.take() else {
            break;
        };

        let polled = tokio::task::spawn_blocking(move || {
            let polled = current.poll();
            (current, polled)
        })
        .await;
        let polled = match polled {
            Ok((current, polled)) => {
                tailer = Some(current);
                polled
            }
            Err(e) => {
                warn!("Tail poll task on {} failed: {}", key, e);
                let _ = deliver(&tx, &cancel, TailEvent::Error(e.to_string())).await;
                break;
            }
        };

        match polled {
            Ok(lines) => {
                for line in lines {
                    if !deliver(&tx, &cancel, TailEvent::Line(line)).await {
                        break 'poll;
                    }
                }
            }
            Err(e) => {
                warn!("Tail poll on {} failed: {}", key, e);
                if !deliver(&tx, &cancel, TailEvent::Error(e.to_string())).await {
                    break;
                }
            }
        }
    }

    match tailer {
        Some(tailer) => debug!("Tail on {} stopped at offset {}", key, tailer.cursor().offset()),
        None => debug!("Tail on {} stopped", key),
    }
}

/// Send one event unless cancelled first. Returns false when the tail must stop.
async fn deliver(
    tx: &mpsc::Sender<TailEvent>,
    cancel: &CancellationToken,
    event: TailEvent,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}
