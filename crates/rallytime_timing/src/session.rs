//! One decoder per physical input source, driven by a tokio task.
//!
//! The task owns the [`TagDecoder`], so keystrokes of one source are
//! decoded strictly in arrival order. The idle timer is a real sleep armed
//! after every accepted character; when it fires the capture is discarded.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::decoder::{DecodedTag, DecoderConfig, Key, KeyEvent, TagDecoder};
use crate::error::Result;

const KEY_CHANNEL_CAPACITY: usize = 256;
const TAG_CHANNEL_CAPACITY: usize = 64;

pub struct DecoderSession {
    keys: mpsc::Sender<KeyEvent>,
    tags: mpsc::Receiver<DecodedTag>,
    handle: JoinHandle<()>,
}

impl DecoderSession {
    /// Validate `config` and start the session task.
    pub fn spawn(config: DecoderConfig) -> Result<Self> {
        let decoder = TagDecoder::new(config)?;
        let (keys, key_rx) = mpsc::channel(KEY_CHANNEL_CAPACITY);
        let (tag_tx, tags) = mpsc::channel(TAG_CHANNEL_CAPACITY);
        let handle = tokio::spawn(run_session(decoder, key_rx, tag_tx));
        Ok(Self { keys, tags, handle })
    }

    /// Sender for an input source running on another task.
    pub fn key_sender(&self) -> mpsc::Sender<KeyEvent> {
        self.keys.clone()
    }

    /// Feed a key stamped with the current time. Returns false once the session has stopped.
    pub async fn press(&self, key: Key) -> bool {
        self.send(KeyEvent::new(key, Instant::now().into_std())).await
    }

    pub async fn send(&self, event: KeyEvent) -> bool {
        self.keys.send(event).await.is_ok()
    }

    pub async fn next_tag(&mut self) -> Option<DecodedTag> {
        self.tags.recv().await
    }

    /// Non-blocking variant of [`next_tag`](Self::next_tag).
    pub fn try_next_tag(&mut self) -> Option<DecodedTag> {
        self.tags.try_recv().ok()
    }

    /// Stop accepting keys and wait for the task to drain.
    ///
    /// The task only exits once every sender returned by
    /// [`key_sender`](Self::key_sender) has been dropped too.
    pub async fn shutdown(self) {
        let Self { keys, tags, handle } = self;
        drop(keys);
        drop(tags);
        let _ = handle.await;
    }
}

async fn run_session(
    mut decoder: TagDecoder,
    mut keys: mpsc::Receiver<KeyEvent>,
    tags: mpsc::Sender<DecodedTag>,
) {
    debug!("Decoder session started");
    loop {
        let deadline = decoder.idle_deadline().map(Instant::from_std);

        tokio::select! {
            biased;
            event = keys.recv() => {
                let Some(event) = event else { break };
                if let Some(tag) = decoder.feed(event) {
                    info!("Decoded tag {} ({:?} burst)", tag.value, tag.burst);
                    if tags.send(tag).await.is_err() {
                        break;
                    }
                }
            }
            _ = sleep_until_deadline(deadline) => {
                decoder.expire(Instant::now().into_std());
            }
        }
    }
    debug!("Decoder session stopped");
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
