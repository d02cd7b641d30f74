//! Pairing decoded tags with gate passes.
//!
//! Passes queue up oldest first. A decoded tag goes to the oldest pass that
//! has no tag yet, unless an older pass already carries that same tag, in
//! which case the read is a duplicate and nothing changes.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rallytime_protocol::{GateId, LogRecord};
use serde::Serialize;

/// A gate pass waiting for (or holding) a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finish {
    pub ts: DateTime<Utc>,
    pub gate_id: GateId,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
}

impl Finish {
    pub fn new(gate_id: GateId, ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            gate_id,
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn is_tagged(&self) -> bool {
        self.tag.is_some()
    }

    /// Set the tag unless one is already present. Returns whether it was set.
    fn assign(&mut self, tag: &str) -> bool {
        if self.tag.is_some() {
            return false;
        }
        self.tag = Some(tag.to_string());
        true
    }

    pub fn tagged(&self) -> Option<TaggedFinish> {
        self.tag.as_ref().map(|tag| TaggedFinish {
            ts: self.ts,
            gate_id: self.gate_id.clone(),
            tag: tag.clone(),
        })
    }
}

impl From<&LogRecord> for Finish {
    fn from(record: &LogRecord) -> Self {
        Self {
            ts: record.ts,
            gate_id: record.gate_id.clone(),
            tag: record.tag.clone(),
        }
    }
}

/// A finish with its tag attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaggedFinish {
    pub ts: DateTime<Utc>,
    pub gate_id: GateId,
    pub tag: String,
}

/// Outcome of [`FinishQueue::associate_tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Association {
    /// The tag was written onto the finish at `index`.
    Assigned { index: usize },
    /// The finish at `index` already carries this tag; nothing changed.
    AlreadyAssigned { index: usize },
    /// No finish was waiting for a tag.
    Dropped,
}

impl Association {
    pub fn is_assigned(&self) -> bool {
        matches!(self, Association::Assigned { .. })
    }
}

/// Ordered finishes, oldest first.
#[derive(Debug, Default, Clone)]
pub struct FinishQueue {
    entries: VecDeque<Finish>,
}

impl FinishQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an untagged finish for `gate_id` at `ts`.
    pub fn push_finish(&mut self, gate_id: GateId, ts: DateTime<Utc>) {
        self.push(Finish::new(gate_id, ts));
    }

    pub fn push(&mut self, finish: Finish) {
        self.entries.push_back(finish);
    }

    /// Attach `tag` to the oldest untagged finish.
    ///
    /// The scan walks oldest to newest and stops at the first finish that
    /// either already holds `tag` or holds no tag at all. A repeat read of
    /// a tag whose finish sits before the first untagged one is therefore a
    /// no-op. A repeat that sits after it is not detected; the tag lands on
    /// the untagged finish instead.
    pub fn associate_tag(&mut self, tag: &str) -> Association {
        for (index, finish) in self.entries.iter_mut().enumerate() {
            if finish.tag() == Some(tag) {
                return Association::AlreadyAssigned { index };
            }
            if finish.assign(tag) {
                return Association::Assigned { index };
            }
        }
        Association::Dropped
    }

    /// Drop the oldest finishes so that at most `max` remain. Returns how many went.
    pub fn trim(&mut self, max: usize) -> usize {
        let excess = self.entries.len().saturating_sub(max);
        self.entries.drain(..excess);
        excess
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Finish> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Finish> {
        self.entries.iter()
    }

    /// Every tagged finish, oldest first.
    pub fn tagged(&self) -> Vec<TaggedFinish> {
        self.entries.iter().filter_map(Finish::tagged).collect()
    }

    /// Finishes still waiting for a tag.
    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|f| !f.is_tagged()).count()
    }
}

impl FromIterator<Finish> for FinishQueue {
    fn from_iter<I: IntoIterator<Item = Finish>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
