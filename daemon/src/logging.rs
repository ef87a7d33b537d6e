/// Tracing setup: the service stream goes to a log file and to stderr, each
/// with its own level, and the `vmotion` and `timeout` targets each go to a
/// dedicated file.  Every file is size-rotated by [`RotatingFile`] behind a
/// non-blocking writer.
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::config::{LogFile, LoggingConfig};

pub const VMOTION_TARGET: &str = "vmotion";
pub const TIMEOUT_TARGET: &str = "timeout";

/// Maps a configured level name to a filter.  Names are case-insensitive;
/// CRITICAL folds into ERROR and anything unrecognised means DEBUG.
pub fn parse_level(name: &str) -> LevelFilter {
    match name.trim().to_ascii_uppercase().as_str() {
        "INFO" => LevelFilter::INFO,
        "WARNING" | "WARN" => LevelFilter::WARN,
        "ERROR" | "CRITICAL" => LevelFilter::ERROR,
        _ => LevelFilter::DEBUG,
    }
}

/// Keeps the background writer threads alive; dropping it flushes every file.
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

/// Installs the global subscriber.  Parent directories must already exist.
pub fn init(config: &LoggingConfig) -> Result<LogGuard> {
    let (service_writer, service_guard) = tracing_appender::non_blocking(open(&config.service_file())?);
    let (vmotion_writer, vmotion_guard) = tracing_appender::non_blocking(open(&config.vmotion_file())?);
    let (timeout_writer, timeout_guard) = tracing_appender::non_blocking(open(&config.timeout_file())?);

    let service_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(service_writer)
        .with_filter(service_filter(parse_level(&config.service_logfile_level)));
    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(service_filter(parse_level(&config.service_console_level)));
    let vmotion_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(vmotion_writer)
        .with_filter(dedicated_filter(VMOTION_TARGET));
    let timeout_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(timeout_writer)
        .with_filter(dedicated_filter(TIMEOUT_TARGET));

    tracing_subscriber::registry()
        .with(service_layer)
        .with(console_layer)
        .with(vmotion_layer)
        .with(timeout_layer)
        .try_init()
        .context("Failed to install the log subscriber")?;

    Ok(LogGuard {
        _guards: vec![service_guard, vmotion_guard, timeout_guard],
    })
}

fn open(log_file: &LogFile) -> Result<RotatingFile> {
    RotatingFile::open(log_file)
        .with_context(|| format!("Failed to open log file: {}", log_file.path.display()))
}

/// Everything at or above `level` except the dedicated streams.
fn service_filter(level: LevelFilter) -> Targets {
    Targets::new()
        .with_default(level)
        .with_target(VMOTION_TARGET, LevelFilter::OFF)
        .with_target(TIMEOUT_TARGET, LevelFilter::OFF)
}

/// Only events logged against `target`, at any level.
fn dedicated_filter(target: &'static str) -> Targets {
    Targets::new().with_target(target, LevelFilter::TRACE)
}

// ── Size-rotated file ─────────────────────────────────────────────────────────

/// Append-only file that rolls over once it would grow past `max_bytes`:
/// `file` becomes `file.1`, `file.1` becomes `file.2`, and so on, keeping at
/// most `count` backups.
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    count: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open(log_file: &LogFile) -> io::Result<Self> {
        let file = append(&log_file.path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: log_file.path.clone(),
            max_bytes: log_file.max_bytes,
            count: log_file.count,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        for index in (1..self.count).rev() {
            let from = backup_path(&self.path, index);
            if from.exists() {
                std::fs::rename(&from, backup_path(&self.path, index + 1))?;
            }
        }
        if self.count > 0 {
            std::fs::rename(&self.path, backup_path(&self.path, 1))?;
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}
