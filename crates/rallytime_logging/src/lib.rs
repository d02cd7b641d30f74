//! Shared logging setup for Rallytime binaries.
//!
//! Two sinks: a human-readable stderr layer and a size-rotated file under
//! the logs directory (`<app>.log`, `<app>.log.1`, ...).

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "rallytime=info,rallytime_log=info,rallytime_ingest=info,rallytime_timing=info";
const VERBOSE_LOG_FILTER: &str =
    "rallytime=debug,rallytime_log=debug,rallytime_ingest=debug,rallytime_timing=debug";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for one binary invocation.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Overrides the default `~/.rallytime/logs`.
    pub log_dir: Option<PathBuf>,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the built-in filter for both sinks; `verbose`
/// only raises the stderr sink when `RUST_LOG` is unset.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = config
        .log_dir
        .unwrap_or_else(rallytime_protocol::paths::default_logs_dir);
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create logs directory: {}", log_dir.display()))?;

    let file_writer = SharedRollingWriter::open(&log_dir, config.app_name)?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if config.verbose => EnvFilter::new(VERBOSE_LOG_FILTER),
        Err(_) => EnvFilter::new(DEFAULT_LOG_FILTER),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

// ============================================================================
// Size-rotated file sink
// ============================================================================

struct RotatingFile {
    dir: PathBuf,
    stem: String,
    keep: usize,
    limit: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingFile {
    fn open(dir: &Path, app_name: &str, keep: usize, limit: u64) -> io::Result<Self> {
        let mut sink = Self {
            dir: dir.to_path_buf(),
            stem: file_stem(app_name),
            keep: keep.max(1),
            limit,
            file: None,
            written: 0,
        };
        sink.reopen()?;
        if sink.written > sink.limit {
            sink.roll()?;
        }
        Ok(sink)
    }

    fn path(&self, generation: usize) -> PathBuf {
        match generation {
            0 => self.dir.join(format!("{}.log", self.stem)),
            n => self.dir.join(format!("{}.log.{}", self.stem, n)),
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(0))?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    /// Shift `<stem>.log.N` up by one, dropping the oldest generation.
    fn roll(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
        let oldest = self.keep.saturating_sub(1);
        if oldest > 0 {
            let last = self.path(oldest);
            if last.exists() {
                fs::remove_file(&last)?;
            }
            for generation in (0..oldest).rev() {
                let src = self.path(generation);
                if src.exists() {
                    fs::rename(&src, self.path(generation + 1))?;
                }
            }
        }
        self.reopen()
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.limit {
            self.roll()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
struct SharedRollingWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl SharedRollingWriter {
    fn open(dir: &Path, app_name: &str) -> Result<Self> {
        let sink = RotatingFile::open(dir, app_name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file for {}", app_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(sink)),
        })
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRollingWriter {
    type Writer = SharedRollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for SharedRollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .flush()
    }
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
