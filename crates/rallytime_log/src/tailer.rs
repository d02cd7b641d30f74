//! Incremental reader for one partition.

use rallytime_protocol::PartitionKey;
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{LogError, Result};
use crate::log::EventLog;

/// Position of a tailer within a partition file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCursor {
    path: PathBuf,
    offset: u64,
}

impl StreamCursor {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Emits only lines appended after it was opened.
///
/// Each [`poll`](Self::poll) reads the bytes between the cursor and the
/// current end of file, keeps everything up to the last newline and leaves
/// a trailing partial line for the next poll. The file is opened and closed
/// inside each poll; no handle is held between polls.
///
/// A partition that shrinks, or is replaced by a different file, was
/// cleared: the cursor restarts at offset 0 of the new file.
#[derive(Debug)]
pub struct LogTailer {
    key: PartitionKey,
    cursor: StreamCursor,
    file_id: Option<u64>,
}

impl LogTailer {
    /// Position a new tailer at the current end of the partition.
    pub fn open(log: &EventLog, key: &PartitionKey) -> Result<Self> {
        let path = log.partition_path(key);
        let (offset, file_id) = match fs::metadata(&path) {
            Ok(meta) => (meta.len(), file_identity(&meta)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (0, None),
            Err(e) => return Err(LogError::io(&path, e)),
        };
        debug!("Tail opened on {} at offset {}", key, offset);
        Ok(Self {
            key: key.clone(),
            cursor: StreamCursor { path, offset },
            file_id,
        })
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn cursor(&self) -> &StreamCursor {
        &self.cursor
    }

    /// Complete lines appended since the previous poll, without their newline.
    pub fn poll(&mut self) -> Result<Vec<String>> {
        let path = self.cursor.path.clone();
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.cursor.offset > 0 {
                    info!("Partition {} removed; tail restarts when it reappears", self.key);
                    self.restart(None);
                }
                return Ok(Vec::new());
            }
            Err(e) => return Err(LogError::io(&path, e)),
        };

        let file_id = file_identity(&meta);
        let replaced = self.file_id.is_some() && file_id.is_some() && self.file_id != file_id;
        if replaced || meta.len() < self.cursor.offset {
            info!("Partition {} was cleared; tail restarts at offset 0", self.key);
            self.restart(file_id);
        } else if self.file_id.is_none() {
            self.file_id = file_id;
        }

        let size = meta.len();
        if size == self.cursor.offset {
            return Ok(Vec::new());
        }

        let delta = read_range(&path, self.cursor.offset, size - self.cursor.offset)
            .map_err(|e| LogError::io(&path, e))?;
        let consumed = match delta.iter().rposition(|b| *b == b'\n') {
            Some(idx) => idx + 1,
            None => return Ok(Vec::new()),
        };

        let mut lines = Vec::new();
        for raw in delta[..consumed].split(|b| *b == b'\n') {
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }
            match std::str::from_utf8(raw) {
                Ok(text) => lines.push(text.to_string()),
                Err(_) => warn!("Skipping non UTF-8 line in {}", self.key),
            }
        }

        self.cursor.offset += consumed as u64;
        Ok(lines)
    }

    fn restart(&mut self, file_id: Option<u64>) {
        self.cursor.offset = 0;
        self.file_id = file_id;
    }
}

fn read_range(path: &Path, offset: u64, len: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(unix)]
fn file_identity(meta: &Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_identity(_meta: &Metadata) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rallytime_protocol::{GateId, LogRecord};
    use std::fs::OpenOptions;
    use std::io::Write;

    fn key() -> PartitionKey {
        PartitionKey::new(
            GateId::parse("G1").unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        )
    }

    fn record(sec: u32) -> LogRecord {
        LogRecord::pass(
            GateId::parse("G1").unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, sec).unwrap(),
        )
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        log.append(&key(), &record(0)).unwrap();
        let mut tailer = LogTailer::open(&log, &key()).unwrap();
        let start = tailer.cursor().offset();

        let line = record(1).to_ndjson_line().unwrap();
        let (head, rest) = line.split_at(10);
        let path = log.partition_path(&key());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();

        file.write_all(head.as_bytes()).unwrap();
        assert!(tailer.poll().unwrap().is_empty());
        assert_eq!(tailer.cursor().offset(), start);

        file.write_all(rest.as_bytes()).unwrap();
        let lines = tailer.poll().unwrap();
        assert_eq!(lines, vec![line.trim_end().to_string()]);
        assert_eq!(tailer.cursor().offset(), start + line.len() as u64);
    }

    #[test]
    fn test_missing_partition_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        let mut tailer = LogTailer::open(&log, &key()).unwrap();
        assert_eq!(tailer.cursor().offset(), 0);
        assert!(tailer.poll().unwrap().is_empty());

        log.append(&key(), &record(0)).unwrap();
        assert_eq!(tailer.poll().unwrap().len(), 1);
        assert!(tailer.poll().unwrap().is_empty());
    }

    #[test]
    fn test_restarts_after_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        for sec in 0..3 {
            log.append(&key(), &record(sec)).unwrap();
        }
        let mut tailer = LogTailer::open(&log, &key()).unwrap();

        log.truncate(&key()).unwrap();
        assert!(tailer.poll().unwrap().is_empty());
        assert_eq!(tailer.cursor().offset(), 0);

        log.append(&key(), &record(9)).unwrap();
        let lines = tailer.poll().unwrap();
        assert_eq!(lines.len(), 1);
        let parsed = LogRecord::from_ndjson_line(&lines[0]).unwrap();
        assert_eq!(parsed, record(9));
    }
}
