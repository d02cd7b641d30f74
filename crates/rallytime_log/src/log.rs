//! File-backed event log.

use rallytime_protocol::paths;
use rallytime_protocol::{LogRecord, PartitionKey};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{LogError, Result};
use crate::observer::{LogChange, ObserverId, ObserverRegistry};

#[derive(Debug, Clone, Copy)]
pub struct EventLogOptions {
    /// `fdatasync` after every append and truncate.
    pub fsync: bool,
}

impl Default for EventLogOptions {
    fn default() -> Self {
        Self { fsync: true }
    }
}

/// Records of one partition plus the number of lines that failed to parse.
#[derive(Debug, Default)]
pub struct ReadReport {
    pub records: Vec<LogRecord>,
    pub skipped: usize,
}

/// Append-only per-partition NDJSON store.
///
/// One instance per process, shared by reference (`Arc<EventLog>`) with the
/// ingestion adapter, the HTTP surface and tailers.
pub struct EventLog {
    root: PathBuf,
    options: EventLogOptions,
    locks: Mutex<HashMap<PartitionKey, Arc<Mutex<()>>>>,
    observers: ObserverRegistry,
}

impl EventLog {
    /// Open (creating if needed) a log rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_options(root, EventLogOptions::default())
    }

    pub fn with_options(root: impl Into<PathBuf>, options: EventLogOptions) -> Result<Self> {
        let root = root.into();
        let gates = paths::gates_dir(&root);
        fs::create_dir_all(&gates).map_err(|e| LogError::io(&gates, e))?;
        info!("Event log at {}", root.display());
        Ok(Self {
            root,
            options,
            locks: Mutex::new(HashMap::new()),
            observers: ObserverRegistry::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        paths::partition_path(&self.root, key)
    }

    /// Current length of a partition in bytes; a missing partition is empty.
    pub fn len(&self, key: &PartitionKey) -> Result<u64> {
        let path = self.partition_path(key);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(LogError::io(&path, e)),
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Append one record as a single NDJSON line.
    ///
    /// Creates the partition and its directory on first use. Returns the
    /// partition length after the write. On failure the partition is rolled
    /// back to its previous length, so there is no half-written success.
    ///
    /// Observers are notified while the partition lock is still held, which
    /// keeps notification order equal to file order. A callback must not
    /// append to or truncate the partition it is being told about.
    pub fn append(&self, key: &PartitionKey, record: &LogRecord) -> Result<u64> {
        if record.gate_id != key.gate_id {
            return Err(LogError::PartitionMismatch {
                record: record.gate_id.clone(),
                partition: key.clone(),
            });
        }
        let line = record.to_ndjson_line()?;

        let lock = self.partition_lock(key)?;
        let _guard = lock
            .lock()
            .map_err(|_| LogError::LockPoisoned(key.clone()))?;

        let path = self.partition_path(key);
        ensure_parent(&path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LogError::io(&path, e))?;
        let start = file.metadata().map_err(|e| LogError::io(&path, e))?.len();

        if let Err(e) = self.write_line(&mut file, line.as_bytes()) {
            if let Err(rollback) = file.set_len(start) {
                warn!(
                    "Failed to roll back partial append to {}: {}",
                    path.display(),
                    rollback
                );
            }
            return Err(LogError::io(&path, e));
        }

        let end_offset = start + line.len() as u64;
        debug!("Appended {} bytes to {}", line.len(), key);

        self.observers.notify(&LogChange::Appended {
            key,
            record,
            end_offset,
        });
        Ok(end_offset)
    }

    fn write_line(&self, file: &mut File, line: &[u8]) -> io::Result<()> {
        file.write_all(line)?;
        if self.options.fsync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Atomically empty a partition.
    ///
    /// An empty file is written beside the partition and renamed over it.
    /// If any step fails the previous contents are untouched. Truncating a
    /// missing or already-empty partition leaves an empty partition.
    pub fn truncate(&self, key: &PartitionKey) -> Result<()> {
        let lock = self.partition_lock(key)?;
        let _guard = lock
            .lock()
            .map_err(|_| LogError::LockPoisoned(key.clone()))?;

        let path = self.partition_path(key);
        ensure_parent(&path)?;
        let staging = path.with_extension("ndjson.clearing");

        let result = File::create(&staging)
            .and_then(|file| {
                if self.options.fsync {
                    file.sync_all()?;
                }
                Ok(())
            })
            .and_then(|()| fs::rename(&staging, &path));

        if let Err(e) = result {
            if staging.exists() {
                let _ = fs::remove_file(&staging);
            }
            return Err(LogError::io(&path, e));
        }

        info!("Cleared partition {}", key);
        self.observers.notify(&LogChange::Truncated { key });
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// All records of a partition in file order.
    pub fn read_all(&self, key: &PartitionKey) -> Result<Vec<LogRecord>> {
        Ok(self.read_all_report(key)?.records)
    }

    /// Like [`read_all`](Self::read_all), also counting malformed lines.
    ///
    /// A malformed line is skipped with a warning. An unterminated final
    /// line that does not parse is a write in progress and is ignored
    /// without counting it.
    pub fn read_all_report(&self, key: &PartitionKey) -> Result<ReadReport> {
        let bytes = self.read_from(key, 0)?;
        Ok(parse_partition(key, &bytes))
    }

    /// Records wholly contained in the first `end` bytes of a partition.
    ///
    /// Paired with a tailer opened at `end`, every record is seen exactly
    /// once: here or on the tail.
    pub fn read_until(&self, key: &PartitionKey, end: u64) -> Result<ReadReport> {
        let mut bytes = self.read_from(key, 0)?;
        bytes.truncate(usize::try_from(end).unwrap_or(usize::MAX));
        let complete_len = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        bytes.truncate(complete_len);
        Ok(parse_partition(key, &bytes))
    }

    /// Raw bytes of a partition from `offset` to the current end.
    pub fn read_from(&self, key: &PartitionKey, offset: u64) -> Result<Vec<u8>> {
        let path = self.partition_path(key);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LogError::io(&path, e)),
        };
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| LogError::io(&path, e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| LogError::io(&path, e))?;
        Ok(buf)
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Register a callback invoked synchronously on every append and truncate.
    pub fn register<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&LogChange<'_>) + Send + Sync + 'static,
    {
        self.observers.register(callback)
    }

    /// Returns false if `id` was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        self.observers.unregister(id)
    }

    fn partition_lock(&self, key: &PartitionKey) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LogError::LockPoisoned(key.clone()))?;
        Ok(Arc::clone(locks.entry(key.clone()).or_default()))
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("root", &self.root)
            .field("options", &self.options)
            .field("observers", &self.observers.len())
            .finish()
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| LogError::io(parent, e))?;
    }
    Ok(())
}

fn parse_partition(key: &PartitionKey, bytes: &[u8]) -> ReadReport {
    let mut report = ReadReport::default();
    if bytes.is_empty() {
        return report;
    }

    let complete_len = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);

    for (line_no, raw) in bytes[..complete_len].split(|b| *b == b'\n').enumerate() {
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match parse_line(raw) {
            Some(record) => report.records.push(record),
            None => {
                warn!("Skipping malformed line {} in {}", line_no + 1, key);
                report.skipped += 1;
            }
        }
    }

    let tail = &bytes[complete_len..];
    if !tail.iter().all(u8::is_ascii_whitespace) {
        match parse_line(tail) {
            Some(record) => report.records.push(record),
            None => debug!("Ignoring incomplete trailing line in {}", key),
        }
    }

    report
}

fn parse_line(raw: &[u8]) -> Option<LogRecord> {
    let text = std::str::from_utf8(raw).ok()?;
    LogRecord::from_ndjson_line(text).ok()
}
