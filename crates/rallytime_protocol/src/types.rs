//! Record and partition types.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::defaults::PASS_EVENT_TYPE;
use crate::error::{ProtocolError, Result};

const MAX_GATE_ID_LEN: usize = 64;
const DAY_STAMP_FORMAT: &str = "%Y%m%d";

// ============================================================================
// Gate identity
// ============================================================================

/// Stable identifier of a timing gate.
///
/// Gate ids become directory names, so only `[A-Za-z0-9_.-]` is accepted
/// and the relative components `.` / `..` are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GateId(String);

impl GateId {
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(ProtocolError::invalid_gate(value, "must not be empty"));
        }
        if value.len() > MAX_GATE_ID_LEN {
            return Err(ProtocolError::invalid_gate(value, "longer than 64 characters"));
        }
        if value == "." || value == ".." {
            return Err(ProtocolError::invalid_gate(value, "relative path component"));
        }
        if !value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        {
            return Err(ProtocolError::invalid_gate(
                value,
                "only A-Z, a-z, 0-9, '-', '_' and '.' are allowed",
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for GateId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<GateId> for String {
    fn from(id: GateId) -> Self {
        id.0
    }
}

impl fmt::Display for GateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Partitions
// ============================================================================

/// One `(gate, UTC day)` unit of log storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub gate_id: GateId,
    pub day: NaiveDate,
}

impl PartitionKey {
    pub fn new(gate_id: GateId, day: NaiveDate) -> Self {
        Self { gate_id, day }
    }

    /// Partition holding records received at `at`.
    pub fn for_instant(gate_id: GateId, at: DateTime<Utc>) -> Self {
        Self::new(gate_id, at.date_naive())
    }

    /// Partition for the current UTC day.
    pub fn today(gate_id: GateId) -> Self {
        Self::for_instant(gate_id, Utc::now())
    }

    /// Parse a `YYYYMMDD` day stamp.
    pub fn parse_day(stamp: &str) -> Result<NaiveDate> {
        if stamp.len() != 8 {
            return Err(ProtocolError::InvalidDay(stamp.to_string()));
        }
        NaiveDate::parse_from_str(stamp, DAY_STAMP_FORMAT)
            .map_err(|_| ProtocolError::InvalidDay(stamp.to_string()))
    }

    pub fn day_stamp(&self) -> String {
        self.day.format(DAY_STAMP_FORMAT).to_string()
    }

    pub fn file_name(&self) -> String {
        format!("pass-{}.ndjson", self.day_stamp())
    }

    /// Path relative to the data root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from("gates")
            .join(self.gate_id.as_str())
            .join(self.file_name())
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.gate_id, self.day_stamp())
    }
}

// ============================================================================
// Records
// ============================================================================

/// Field holding a device's own `ts` when a stored line also carries `ts_utc`.
pub const DEVICE_TS_FIELD: &str = "device_ts";

/// One durable line of a gate partition.
///
/// `ts` is always written as `ts`. On read, `ts_utc` (the archiver's field)
/// wins over `ts`; a device `ts` it displaces is kept as `device_ts`.
/// Fields this type does not model are kept in `extra` and written back
/// out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredRecord")]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub gate_id: GateId,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    pub fn new(gate_id: GateId, ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            gate_id,
            kind: None,
            tag: None,
            extra: serde_json::Map::new(),
        }
    }

    /// A gate pass as written by the ingestion adapter.
    pub fn pass(gate_id: GateId, ts: DateTime<Utc>) -> Self {
        Self {
            kind: Some(PASS_EVENT_TYPE.to_string()),
            ..Self::new(gate_id, ts)
        }
    }

    pub fn is_pass(&self) -> bool {
        self.kind.as_deref() == Some(PASS_EVENT_TYPE)
    }

    /// Serialize as one newline-terminated NDJSON line.
    pub fn to_ndjson_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one NDJSON line (trailing whitespace is ignored).
    pub fn from_ndjson_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

/// Wire shape accepted on read, before the timestamp is settled.
#[derive(Deserialize)]
struct StoredRecord {
    #[serde(default)]
    ts: Option<serde_json::Value>,
    #[serde(default)]
    ts_utc: Option<serde_json::Value>,
    gate_id: GateId,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl TryFrom<StoredRecord> for LogRecord {
    type Error = ProtocolError;

    fn try_from(raw: StoredRecord) -> Result<Self> {
        let mut extra = raw.extra;
        let from_utc = raw.ts_utc.as_ref().and_then(timestamp_from_value);

        let ts = match (from_utc, raw.ts) {
            (Some(ts), device) => {
                if let Some(device) = device {
                    extra.insert(DEVICE_TS_FIELD.to_string(), device);
                }
                ts
            }
            (None, Some(value)) => {
                let ts = timestamp_from_value(&value)
                    .ok_or_else(|| ProtocolError::InvalidTimestamp(value.to_string()))?;
                if let Some(unreadable) = raw.ts_utc {
                    extra.insert("ts_utc".to_string(), unreadable);
                }
                ts
            }
            (None, None) => {
                return Err(match raw.ts_utc {
                    Some(value) => ProtocolError::InvalidTimestamp(value.to_string()),
                    None => ProtocolError::MissingTimestamp,
                })
            }
        };

        Ok(Self {
            ts,
            gate_id: raw.gate_id,
            kind: raw.kind,
            tag: raw.tag,
            extra,
        })
    }
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// A JSON timestamp: RFC 3339 string or epoch milliseconds.
pub fn timestamp_from_value(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => parse_timestamp(s),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
