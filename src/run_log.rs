//! Durable per-run experiment log.
//!
//! `ExperimentLogger` appends one line per event to `experiment.log` in the
//! experiment directory:
//!
//! ```text
//! [2026-10-18 14:03:12.481] INFO: Pretrial phase started (3 commands)
//! ```
//!
//! Every line is flushed as it is written and mirrored to `tracing`, so a crash
//! mid-run still leaves a complete record up to the failing command. The logger is
//! shared as `Arc<ExperimentLogger>` between the orchestrator, the dispatcher, the
//! plugin registry and class plugins; writes are serialized by an internal mutex.

use chrono::Local;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

/// Severity of a run log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Upper-case label written to the log file
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(format!(
                "Invalid log level '{}'. Must be one of: DEBUG, INFO, WARNING, ERROR",
                other
            )),
        }
    }
}

/// Append-only, timestamped run log.
pub struct ExperimentLogger {
    path: Option<PathBuf>,
    min_level: LogLevel,
    sink: Mutex<Option<BufWriter<File>>>,
}

impl ExperimentLogger {
    /// Open (or create) the log file at `path` for appending.
    pub fn open(path: impl AsRef<Path>, min_level: LogLevel) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path: Some(path),
            min_level,
            sink: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    /// A logger without a file sink; lines only go to `tracing`.
    ///
    /// Used before the experiment directory exists and in tests.
    pub fn detached(min_level: LogLevel) -> Self {
        Self {
            path: None,
            min_level,
            sink: Mutex::new(None),
        }
    }

    /// Path of the backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write one line at `level`.
    ///
    /// I/O failures are reported through `tracing` and never propagated, so a
    /// full disk cannot turn a logging call into a command failure.
    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        let message = message.as_ref();
        mirror_to_tracing(level, message);

        if level < self.min_level {
            return;
        }

        let line = format_line(level, message);
        let mut guard = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(writer) = guard.as_mut() {
            if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
                tracing::warn!(error = %e, "Failed to write run log line");
            }
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message);
    }

    /// Flush and release the file. Idempotent.
    pub fn close(&self) -> std::io::Result<()> {
        let mut guard = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }

    /// Whether the file sink has been released
    pub fn is_closed(&self) -> bool {
        match self.sink.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl fmt::Debug for ExperimentLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentLogger")
            .field("path", &self.path)
            .field("min_level", &self.min_level)
            .finish()
    }
}

fn format_line(level: LogLevel, message: &str) -> String {
    format!(
        "[{}] {}: {}",
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        level,
        message
    )
}

fn mirror_to_tracing(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(target: "experiment", "{}", message),
        LogLevel::Info => tracing::info!(target: "experiment", "{}", message),
        LogLevel::Warning => tracing::warn!(target: "experiment", "{}", message),
        LogLevel::Error => tracing::error!(target: "experiment", "{}", message),
    }
}
