//! Ingestion worker
//!
//! Pulls messages from a [`PassSource`] and appends them to the event log.
//!
//! - Biased select: shutdown wins over pending messages
//! - Transport errors back off exponentially, reset on the next delivery
//! - Append failures are logged and counted; the message is not retried

use rallytime_log::EventLog;
use rallytime_protocol::defaults::{DEFAULT_BACKOFF_INITIAL_MS, DEFAULT_BACKOFF_MAX_MS};
use rallytime_protocol::PartitionKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::error::{IngestError, Result};
use crate::normalize::{normalize_pass, TopicLayout};
use crate::source::{PassMessage, PassSource};

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub topics: TopicLayout,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            topics: TopicLayout::default(),
            backoff_initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
        }
    }
}

/// Counters reported when the worker stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub appended: u64,
    /// Messages on topics that are not pass topics
    pub ignored: u64,
    pub failed: u64,
    pub reconnects: u64,
}

pub struct IngestWorker<S> {
    source: S,
    log: Arc<EventLog>,
    topics: TopicLayout,
    backoff: Backoff,
    shutdown_rx: mpsc::Receiver<()>,
    stats: IngestStats,
}

impl<S: PassSource> IngestWorker<S> {
    /// Returns the worker and its shutdown sender. Call [`run`](Self::run) on the worker.
    pub fn new(source: S, log: Arc<EventLog>, options: IngestOptions) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            Self {
                source,
                log,
                topics: options.topics,
                backoff: Backoff::new(options.backoff_initial, options.backoff_max),
                shutdown_rx,
                stats: IngestStats::default(),
            },
            shutdown_tx,
        )
    }

    /// Main loop. Consumes self and runs until shutdown is requested or the
    /// shutdown sender is dropped.
    pub async fn run(mut self) -> IngestStats {
        info!("Ingesting passes under {}", self.topics.filter());

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }

                message = self.source.next_message() => match message {
                    Ok(message) => {
                        self.backoff.reset();
                        self.handle(message).await;
                    }
                    Err(e) => {
                        self.stats.reconnects += 1;
                        let delay = self.backoff.next_delay();
                        warn!("Transport error: {}. Reconnecting in {:?}", e, delay);
                        tokio::select! {
                            biased;
                            _ = self.shutdown_rx.recv() => {
                                info!("Shutdown signal received during backoff");
                                break;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }

        info!(
            "Ingestion stopped: {} received, {} appended, {} ignored, {} failed",
            self.stats.received, self.stats.appended, self.stats.ignored, self.stats.failed
        );
        self.stats
    }

    async fn handle(&mut self, message: PassMessage) {
        self.stats.received += 1;
        match append(Arc::clone(&self.log), &self.topics, &message).await {
            Ok(true) => self.stats.appended += 1,
            Ok(false) => self.stats.ignored += 1,
            Err(e) => {
                self.stats.failed += 1;
                error!("Dropping pass from {}: {}", message.topic, e);
            }
        }
    }
}

/// Append one message. `Ok(false)` if the topic is not a pass topic.
///
/// The write (and its fsync) runs on the blocking pool.
async fn append(log: Arc<EventLog>, topics: &TopicLayout, message: &PassMessage) -> Result<bool> {
    let Some(gate) = topics.gate_from_topic(&message.topic) else {
        debug!("Ignoring message on {}", message.topic);
        return Ok(false);
    };

    let record = normalize_pass(&gate, &message.payload, message.received_at);
    // Partition by receipt day so a device with a skewed clock cannot
    // write into another day's file.
    let key = PartitionKey::for_instant(gate, message.received_at);
    let ts = record.ts;
    let written = key.clone();
    tokio::task::spawn_blocking(move || log.append(&written, &record))
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))??;
    debug!("Pass {} at {}", key, ts);
    Ok(true)
}
