//! Rolling Logger
//!
//! Daily-rotated log files plus an in-memory circular buffer of the most
//! recent lines, installed as the global `tracing` subscriber.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Local, NaiveDate};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Log files kept on disk before the oldest is pruned
pub const DEFAULT_MAX_FILES: usize = 7;
/// Lines mirrored into the in-memory buffer
pub const DEFAULT_BUFFER_LINES: usize = 500;

#[derive(Debug)]
pub enum LoggerError {
    Io(io::Error),
    AlreadyInitialized,
}

impl fmt::Display for LoggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggerError::Io(e) => write!(f, "Log file error: {}", e),
            LoggerError::AlreadyInitialized => write!(f, "Global logger already initialized"),
        }
    }
}

impl std::error::Error for LoggerError {}

impl From<io::Error> for LoggerError {
    fn from(e: io::Error) -> Self {
        LoggerError::Io(e)
    }
}

/// Tunables for [`init_logger_with`]
#[derive(Debug, Clone)]
pub struct LoggerOptions {
    pub max_files: usize,
    pub buffer_lines: usize,
    /// Fallback filter directive when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            buffer_lines: DEFAULT_BUFFER_LINES,
            default_filter: "info".to_string(),
        }
    }
}

struct Inner {
    dir: PathBuf,
    app_name: String,
    max_files: usize,
    capacity: usize,
    current: Option<(NaiveDate, File)>,
    recent: VecDeque<String>,
    partial: String,
}

impl Inner {
    fn file_name(&self, date: NaiveDate) -> String {
        format!("{}.{}.log", self.app_name, date.format("%Y-%m-%d"))
    }

    /// Open (or keep) the file for `date`, pruning old files on rollover
    fn ensure_file(&mut self, date: NaiveDate) -> io::Result<&mut File> {
        let stale = match &self.current {
            Some((current, _)) => *current != date,
            None => true,
        };
        if stale {
            let path = self.dir.join(self.file_name(date));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.current = Some((date, file));
            self.prune()?;
        }
        match self.current.as_mut() {
            Some((_, file)) => Ok(file),
            None => Err(io::Error::new(io::ErrorKind::Other, "log file unavailable")),
        }
    }

    fn prune(&self) -> io::Result<()> {
        let prefix = format!("{}.", self.app_name);
        let mut logs: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".log"))
                    .unwrap_or(false)
            })
            .collect();
        if logs.len() <= self.max_files {
            return Ok(());
        }
        // Dated names sort chronologically
        logs.sort();
        let excess = logs.len() - self.max_files;
        for old in logs.into_iter().take(excess) {
            fs::remove_file(old)?;
        }
        Ok(())
    }

    fn remember(&mut self, chunk: &str) {
        self.partial.push_str(chunk);
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            if self.recent.len() == self.capacity {
                self.recent.pop_front();
            }
            self.recent.push_back(line.trim_end().to_string());
        }
    }

    fn write_at(&mut self, date: NaiveDate, buf: &[u8]) -> io::Result<()> {
        self.ensure_file(date)?.write_all(buf)?;
        self.remember(&String::from_utf8_lossy(buf));
        Ok(())
    }
}

/// Shared writer handed to the fmt layer
#[derive(Clone)]
pub struct RollingWriter {
    inner: Arc<Mutex<Inner>>,
}

impl RollingWriter {
    pub fn new(dir: impl AsRef<Path>, app_name: &str, options: &LoggerOptions) -> Result<Self, LoggerError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                dir,
                app_name: app_name.to_string(),
                max_files: options.max_files.max(1),
                capacity: options.buffer_lines.max(1),
                current: None,
                recent: VecDeque::new(),
                partial: String::new(),
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most recent lines, oldest first
    pub fn recent(&self) -> Vec<String> {
        self.lock().recent.iter().cloned().collect()
    }

    /// Path of today's log file
    pub fn current_file(&self) -> PathBuf {
        let inner = self.lock();
        inner.dir.join(inner.file_name(Local::now().date_naive()))
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write_at(Local::now().date_naive(), buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.lock().current.as_mut() {
            Some((_, file)) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for RollingWriter {
    type Writer = RollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Handle returned by [`init_logger`]; keeps access to the ring buffer
#[derive(Clone)]
pub struct LoggerHandle {
    writer: RollingWriter,
}

impl LoggerHandle {
    pub fn recent(&self) -> Vec<String> {
        self.writer.recent()
    }

    pub fn current_file(&self) -> PathBuf {
        self.writer.current_file()
    }
}

/// Install the global subscriber with default options
pub fn init_logger(dir: impl AsRef<Path>, app_name: &str) -> Result<LoggerHandle, LoggerError> {
    init_logger_with(dir, app_name, LoggerOptions::default())
}

pub fn init_logger_with(
    dir: impl AsRef<Path>,
    app_name: &str,
    options: LoggerOptions,
) -> Result<LoggerHandle, LoggerError> {
    let writer = RollingWriter::new(dir, app_name, &options)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    tracing_subscriber::fmt()
        .with_writer(writer.clone())
        .with_ansi(false)
        .with_env_filter(filter)
        .try_init()
        .map_err(|_| LoggerError::AlreadyInitialized)?;

    Ok(LoggerHandle { writer })
}

pub fn info(msg: &str) {
    tracing::info!("{}", msg);
}

pub fn warn(msg: &str) {
    tracing::warn!("{}", msg);
}

pub fn error(msg: &str) {
    tracing::error!("{}", msg);
}
