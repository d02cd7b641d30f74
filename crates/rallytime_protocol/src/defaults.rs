//! Canonical default values shared by the log, tailer, decoder and ingestion.

pub const DEFAULT_HTTP_BIND_ADDR: &str = "127.0.0.1:8080";

pub const DEFAULT_TAIL_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_RETRY_HINT_MS: u64 = 2000;
pub const DEFAULT_TAIL_CHANNEL_CAPACITY: usize = 256;

pub const DEFAULT_MIN_TAG_LENGTH: usize = 5;
pub const DEFAULT_IDLE_RESET_MS: u64 = 120;
pub const DEFAULT_MAX_BURST_MS: u64 = 700;
pub const DEFAULT_ALLOWED_TAG_PATTERN: &str = "^[0-9A-Za-z]$";

pub const DEFAULT_MAX_FINISHES: usize = 200;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTT_TOPIC_PREFIX: &str = "rally/v1/gates";
pub const DEFAULT_MQTT_TOPIC_FILTER: &str = "rally/v1/gates/+/pass";
pub const DEFAULT_MQTT_KEEP_ALIVE_SECS: u64 = 30;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// `type` carried by every ingestion-sourced record.
pub const PASS_EVENT_TYPE: &str = "pass";

/// Body of the readiness event sent when a live stream opens.
pub const READY_BODY: &str = "ok";
