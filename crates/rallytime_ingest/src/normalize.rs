//! Payload normalisation.
//!
//! Devices are not consistent about what they publish. Accepted forms:
//!
//! - a JSON object, timestamp in `ts_utc` or `ts` (RFC 3339 string or
//!   epoch milliseconds); other fields are kept
//! - a bare RFC 3339 timestamp, quoted or not
//! - anything else, including an empty body
//!
//! Whatever arrives, a pass is recorded. A missing or unreadable timestamp
//! is replaced by the receipt time.

use chrono::{DateTime, Utc};
use rallytime_protocol::defaults::DEFAULT_MQTT_TOPIC_PREFIX;
use rallytime_protocol::types::timestamp_from_value;
use rallytime_protocol::{GateId, LogRecord};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

pub use rallytime_protocol::types::parse_timestamp;

const TIMESTAMP_FIELDS: [&str; 2] = ["ts_utc", "ts"];

/// Fields owned by the record itself; a payload cannot override them.
const RESERVED_FIELDS: [&str; 2] = ["gate_id", "type"];

/// Build the `pass` record for one message from `gate`.
///
/// The gate always comes from the topic. A `gate_id` inside the payload is
/// ignored.
pub fn normalize_pass(gate: &GateId, payload: &[u8], received_at: DateTime<Utc>) -> LogRecord {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(fields)) => from_object(gate, fields, received_at),
        Ok(Value::String(stamp)) => from_bare(gate, &stamp, received_at),
        _ => from_bare(gate, text, received_at),
    }
}

fn from_object(gate: &GateId, mut fields: Map<String, Value>, received_at: DateTime<Utc>) -> LogRecord {
    let mut ts = None;
    for name in TIMESTAMP_FIELDS {
        if let Some(value) = fields.remove(name) {
            if ts.is_none() {
                ts = timestamp_from_value(&value);
                if ts.is_none() {
                    warn!("Gate {}: unreadable {} {}, using receipt time", gate, name, value);
                }
            }
        }
    }

    for name in RESERVED_FIELDS {
        if let Some(value) = fields.remove(name) {
            if name == "gate_id" && value.as_str() != Some(gate.as_str()) {
                debug!("Gate {}: payload names gate {}, topic wins", gate, value);
            }
        }
    }

    let tag = match fields.remove("tag") {
        Some(Value::String(tag)) if !tag.is_empty() => Some(tag),
        Some(Value::String(_)) | Some(Value::Null) | None => None,
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => {
            warn!("Gate {}: ignoring non-scalar tag {}", gate, other);
            None
        }
    };

    let mut record = LogRecord::pass(gate.clone(), ts.unwrap_or(received_at));
    record.tag = tag;
    record.extra = fields;
    record
}

fn from_bare(gate: &GateId, text: &str, received_at: DateTime<Utc>) -> LogRecord {
    let ts = match parse_timestamp(text) {
        Some(ts) => ts,
        None => {
            if !text.is_empty() {
                warn!("Gate {}: unreadable payload {:?}, using receipt time", gate, text);
            }
            received_at
        }
    };
    LogRecord::pass(gate.clone(), ts)
}

// ============================================================================
// Topics
// ============================================================================

/// Topic layout `<prefix>/<gate_id>/pass`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    prefix: String,
}

impl TopicLayout {
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        if prefix.is_empty() || prefix.contains(['+', '#']) {
            return Err(IngestError::InvalidPrefix(prefix));
        }
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Subscription filter matching every gate.
    pub fn filter(&self) -> String {
        format!("{}/+/pass", self.prefix)
    }

    /// Gate id embedded in `topic`, or `None` if the topic is not a pass topic.
    pub fn gate_from_topic(&self, topic: &str) -> Option<GateId> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let (gate, suffix) = rest.split_once('/')?;
        if suffix != "pass" {
            return None;
        }
        GateId::parse(gate).ok()
    }
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_MQTT_TOPIC_PREFIX.to_string(),
        }
    }
}
