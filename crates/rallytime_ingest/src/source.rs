use chrono::{DateTime, Utc};
use std::future::Future;

use crate::error::TransportError;

/// One raw message as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Stamped by the source when the message arrived.
    pub received_at: DateTime<Utc>,
}

impl PassMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Upstream delivery of pass messages.
///
/// `next_message` waits for the next message. An error means the
/// connection dropped; calling it again after the backoff delay must
/// reconnect and restore the subscription.
pub trait PassSource: Send {
    fn next_message(
        &mut self,
    ) -> impl Future<Output = std::result::Result<PassMessage, TransportError>> + Send;
}
