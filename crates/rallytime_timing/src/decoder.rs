//! Keyboard-wedge tag decoder.
//!
//! States: IDLE (empty buffer) and CAPTURING (buffer non-empty).
//!
//! | Input                         | Effect                                        |
//! |-------------------------------|-----------------------------------------------|
//! | allowed character             | append; first one records the start time      |
//! | terminator                    | emit if long and fast enough, then reset      |
//! | any other key while capturing | reset, nothing emitted                        |
//! | composition (IME) event       | ignored                                       |
//! | no input for `idle_reset_ms`  | reset, nothing emitted                        |

use rallytime_protocol::defaults::{
    DEFAULT_ALLOWED_TAG_PATTERN, DEFAULT_IDLE_RESET_MS, DEFAULT_MAX_BURST_MS,
    DEFAULT_MIN_TAG_LENGTH,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::{Result, TimingError};

// ============================================================================
// Input
// ============================================================================

/// A key as reported by the input source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Key {
    Char(char),
    Enter,
    Tab,
    Escape,
    Backspace,
    /// Any other named control key (e.g. "Shift", "ArrowUp").
    Named(String),
}

impl Key {
    /// Parse a key name: a single character, or a control key name.
    pub fn from_name(name: &str) -> Self {
        let mut chars = name.chars();
        if let (Some(ch), None) = (chars.next(), chars.next()) {
            return match ch {
                '\n' | '\r' => Key::Enter,
                '\t' => Key::Tab,
                ch => Key::Char(ch),
            };
        }
        match name {
            "Enter" | "Return" => Key::Enter,
            "Tab" => Key::Tab,
            "Escape" | "Esc" => Key::Escape,
            "Backspace" => Key::Backspace,
            other => Key::Named(other.to_string()),
        }
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::from_name(&name)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.to_string()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Char(ch) => write!(f, "{ch}"),
            Key::Enter => f.write_str("Enter"),
            Key::Tab => f.write_str("Tab"),
            Key::Escape => f.write_str("Escape"),
            Key::Backspace => f.write_str("Backspace"),
            Key::Named(name) => f.write_str(name),
        }
    }
}

/// One keystroke with its monotonic timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: Key,
    pub at: Instant,
    /// Part of an IME composition sequence.
    pub composing: bool,
}

impl KeyEvent {
    pub fn new(key: Key, at: Instant) -> Self {
        Self {
            key,
            at,
            composing: false,
        }
    }

    pub fn composing(key: Key, at: Instant) -> Self {
        Self {
            key,
            at,
            composing: true,
        }
    }
}

/// A tag accepted by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTag {
    pub value: String,
    /// Time of the terminator that completed the capture.
    pub captured_at: Instant,
    /// First to last character.
    pub burst: Duration,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Shortest tag accepted
    #[serde(default = "default_min_length")]
    pub min_length: usize,

    /// Reset the capture if no key arrives within this time
    #[serde(default = "default_idle_reset_ms")]
    pub idle_reset_ms: u64,

    /// Reject captures whose first-to-last character span is longer
    #[serde(default = "default_max_burst_ms")]
    pub max_burst_ms: u64,

    /// Keys that complete a capture
    #[serde(default = "default_terminators")]
    pub terminators: Vec<Key>,

    /// Regex every captured character must match on its own
    #[serde(default = "default_allowed_pattern")]
    pub allowed_pattern: String,
}

fn default_min_length() -> usize {
    DEFAULT_MIN_TAG_LENGTH
}

fn default_idle_reset_ms() -> u64 {
    DEFAULT_IDLE_RESET_MS
}

fn default_max_burst_ms() -> u64 {
    DEFAULT_MAX_BURST_MS
}

fn default_terminators() -> Vec<Key> {
    vec![Key::Enter, Key::Tab]
}

fn default_allowed_pattern() -> String {
    DEFAULT_ALLOWED_TAG_PATTERN.to_string()
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            idle_reset_ms: default_idle_reset_ms(),
            max_burst_ms: default_max_burst_ms(),
            terminators: default_terminators(),
            allowed_pattern: default_allowed_pattern(),
        }
    }
}

impl DecoderConfig {
    pub fn idle_reset(&self) -> Duration {
        Duration::from_millis(self.idle_reset_ms)
    }

    pub fn max_burst(&self) -> Duration {
        Duration::from_millis(self.max_burst_ms)
    }
}

// ============================================================================
// Automaton
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Idle,
    Capturing,
}

#[derive(Debug)]
pub struct TagDecoder {
    config: DecoderConfig,
    allowed: Regex,
    buffer: String,
    start: Option<Instant>,
    last: Option<Instant>,
}

impl TagDecoder {
    pub fn new(config: DecoderConfig) -> Result<Self> {
        if config.terminators.is_empty() {
            return Err(TimingError::NoTerminators);
        }
        let allowed = Regex::new(&config.allowed_pattern)?;
        Ok(Self {
            config,
            allowed,
            buffer: String::new(),
            start: None,
            last: None,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn state(&self) -> DecoderState {
        if self.buffer.is_empty() {
            DecoderState::Idle
        } else {
            DecoderState::Capturing
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// When the idle timer fires if no further key arrives.
    pub fn idle_deadline(&self) -> Option<Instant> {
        match self.state() {
            DecoderState::Idle => None,
            DecoderState::Capturing => self.last.map(|last| last + self.config.idle_reset()),
        }
    }

    /// Apply the idle timer as of `now`. Returns true if a capture was discarded.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.idle_deadline() {
            Some(deadline) if now >= deadline => {
                debug!("Idle reset discarded partial capture of {} chars", self.buffer.len());
                self.reset();
                true
            }
            _ => false,
        }
    }

    pub fn feed(&mut self, event: KeyEvent) -> Option<DecodedTag> {
        if event.composing {
            return None;
        }
        // A key arriving after the deadline means the timer already fired.
        self.expire(event.at);

        match &event.key {
            Key::Char(ch) if self.accepts(*ch) => {
                if self.buffer.is_empty() {
                    self.start = Some(event.at);
                }
                self.last = Some(event.at);
                self.buffer.push(*ch);
                None
            }
            key if self.config.terminators.contains(key) => {
                let tag = self.finish(event.at);
                self.reset();
                tag
            }
            key => {
                if self.state() == DecoderState::Capturing {
                    trace!("Key {} interrupted capture", key);
                    self.reset();
                }
                None
            }
        }
    }

    fn accepts(&self, ch: char) -> bool {
        let mut buf = [0u8; 4];
        self.allowed.is_match(ch.encode_utf8(&mut buf))
    }

    fn finish(&self, now: Instant) -> Option<DecodedTag> {
        let (start, last) = (self.start?, self.last?);
        if self.buffer.chars().count() < self.config.min_length {
            trace!("Capture of {} chars below minimum", self.buffer.len());
            return None;
        }
        let burst = last.saturating_duration_since(start);
        if burst > self.config.max_burst() {
            debug!("Capture rejected: burst {:?} too slow for a reader", burst);
            return None;
        }
        Some(DecodedTag {
            value: self.buffer.clone(),
            captured_at: now,
            burst,
        })
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.start = None;
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Keys {
        decoder: TagDecoder,
        base: Instant,
    }

    impl Keys {
        fn new() -> Self {
            Self {
                decoder: TagDecoder::new(DecoderConfig::default()).unwrap(),
                base: Instant::now(),
            }
        }

        fn at(&mut self, ms: u64, key: Key) -> Option<DecodedTag> {
            self.decoder
                .feed(KeyEvent::new(key, self.base + Duration::from_millis(ms)))
        }

        fn typed(&mut self, text: &str, from_ms: u64, step_ms: u64) -> u64 {
            let mut t = from_ms;
            for ch in text.chars() {
                assert_eq!(self.at(t, Key::Char(ch)), None);
                t += step_ms;
            }
            t
        }
    }

    #[test]
    fn test_fast_burst_is_accepted() {
        let mut keys = Keys::new();
        let t = keys.typed("A1B2C", 0, 10);
        let tag = keys.at(t, Key::Enter).expect("tag");
        assert_eq!(tag.value, "A1B2C");
        assert_eq!(tag.burst, Duration::from_millis(40));
        assert_eq!(keys.decoder.state(), DecoderState::Idle);
    }

    #[test]
    fn test_tab_also_terminates() {
        let mut keys = Keys::new();
        let t = keys.typed("XYZ123", 0, 5);
        assert_eq!(keys.at(t, Key::Tab).map(|t| t.value), Some("XYZ123".to_string()));
    }

    #[test]
    fn test_short_capture_is_dropped() {
        let mut keys = Keys::new();
        let t = keys.typed("AB", 0, 10);
        assert_eq!(keys.at(t, Key::Enter), None);
        assert_eq!(keys.decoder.state(), DecoderState::Idle);
    }

    #[test]
    fn test_idle_gap_restarts_capture() {
        let mut keys = Keys::new();
        keys.typed("A1", 0, 10);
        // 200ms pause after "1" (at 10ms): the capture is gone
        keys.typed("B2C", 210, 10);
        assert_eq!(keys.decoder.buffer(), "B2C");
        assert_eq!(keys.at(240, Key::Enter), None);

        let t = keys.typed("D4E5F", 250, 10);
        assert_eq!(keys.at(t, Key::Enter).map(|t| t.value), Some("D4E5F".to_string()));
    }

    #[test]
    fn test_slow_typing_is_rejected() {
        let mut keys = Keys::new();
        // 100ms per key stays under the idle timer but spans 800ms
        let t = keys.typed("ABCDEFGHI", 0, 100);
        assert_eq!(keys.at(t - 50, Key::Enter), None);
    }

    #[test]
    fn test_burst_limit_is_inclusive() {
        let base = Instant::now();
        let mut decoder = TagDecoder::new(DecoderConfig {
            idle_reset_ms: 1_000,
            ..DecoderConfig::default()
        })
        .unwrap();
        for (ms, ch) in [(0, 'A'), (350, 'B'), (500, 'C'), (650, 'D'), (700, 'E')] {
            decoder.feed(KeyEvent::new(Key::Char(ch), base + Duration::from_millis(ms)));
        }
        let tag = decoder.feed(KeyEvent::new(Key::Enter, base + Duration::from_millis(720)));
        assert_eq!(tag.map(|t| t.value), Some("ABCDE".to_string()));
    }

    #[test]
    fn test_other_key_resets_capture() {
        let mut keys = Keys::new();
        keys.typed("A1B", 0, 10);
        assert_eq!(keys.at(30, Key::Named("Shift".into())), None);
        assert_eq!(keys.decoder.state(), DecoderState::Idle);
        keys.typed("2C", 40, 10);
        assert_eq!(keys.at(60, Key::Enter), None);
    }

    #[test]
    fn test_disallowed_char_resets_capture() {
        let mut keys = Keys::new();
        keys.typed("A1B2", 0, 10);
        assert_eq!(keys.at(40, Key::Char('-')), None);
        assert_eq!(keys.decoder.buffer(), "");
    }

    #[test]
    fn test_composition_events_are_ignored() {
        let mut keys = Keys::new();
        keys.typed("A1B", 0, 10);
        let ev = KeyEvent::composing(Key::Named("Process".into()), keys.base + Duration::from_millis(30));
        assert_eq!(keys.decoder.feed(ev), None);
        assert_eq!(keys.decoder.buffer(), "A1B");
        keys.typed("2C", 40, 10);
        assert_eq!(keys.at(60, Key::Enter).map(|t| t.value), Some("A1B2C".to_string()));
    }

    #[test]
    fn test_expire_reports_discard() {
        let mut keys = Keys::new();
        keys.typed("A1", 0, 10);
        let deadline = keys.decoder.idle_deadline().unwrap();
        assert_eq!(deadline, keys.base + Duration::from_millis(130));
        assert!(!keys.decoder.expire(deadline - Duration::from_millis(1)));
        assert!(keys.decoder.expire(deadline));
        assert_eq!(keys.decoder.idle_deadline(), None);
    }

    #[test]
    fn test_config_validation() {
        let err = TagDecoder::new(DecoderConfig {
            terminators: vec![],
            ..DecoderConfig::default()
        });
        assert!(matches!(err, Err(TimingError::NoTerminators)));

        let err = TagDecoder::new(DecoderConfig {
            allowed_pattern: "[".into(),
            ..DecoderConfig::default()
        });
        assert!(matches!(err, Err(TimingError::InvalidPattern(_))));
    }

    #[test]
    fn test_key_names() {
        assert_eq!(Key::from_name("Enter"), Key::Enter);
        assert_eq!(Key::from_name("\t"), Key::Tab);
        assert_eq!(Key::from_name("a"), Key::Char('a'));
        assert_eq!(Key::from_name("F5"), Key::Named("F5".into()));
        assert_eq!(String::from(Key::Tab), "Tab");
    }
}
