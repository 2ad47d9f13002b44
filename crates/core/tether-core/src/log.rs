//! Logging infrastructure.
//!
//! Library code logs through the `log` facade, one target per subsystem
//! (`tether::registry`, `tether::lifecycle`, `tether::irq`, ...). This module
//! provides the backend side:
//!
//! - [`LogSink`] -- a dyn-compatible output with its own level cap.
//! - [`SinkLogger`] -- a `log::Log` implementation that formats each record
//!   once and hands it to every sink whose cap admits it.
//! - [`StderrSink`] and [`MemorySink`] -- the two sinks the workspace needs:
//!   one for the demo binary, one for tests that assert on log output.
//!
//! The core never depends on logging for correctness; if no logger is
//! installed, records are silently discarded by the facade.

use std::fmt::Write as _;
use std::io::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Log levels (lower is more severe)
// ---------------------------------------------------------------------------

/// Log severity level.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LogLevel {
    /// Error: something failed but the registry continues.
    Error = 1,
    /// Warning: unexpected condition, not necessarily an error.
    Warn = 2,
    /// Informational: lifecycle transitions.
    #[default]
    Info = 3,
    /// Debug: detailed diagnostic information.
    Debug = 4,
    /// Trace: very verbose, per-resource and per-event tracing.
    Trace = 5,
}

impl LogLevel {
    /// Returns the human-readable name (fixed-width for aligned output).
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Converts to the equivalent facade filter.
    pub const fn to_filter(self) -> ::log::LevelFilter {
        match self {
            Self::Error => ::log::LevelFilter::Error,
            Self::Warn => ::log::LevelFilter::Warn,
            Self::Info => ::log::LevelFilter::Info,
            Self::Debug => ::log::LevelFilter::Debug,
            Self::Trace => ::log::LevelFilter::Trace,
        }
    }
}

impl From<::log::Level> for LogLevel {
    fn from(level: ::log::Level) -> Self {
        match level {
            ::log::Level::Error => Self::Error,
            ::log::Level::Warn => Self::Warn,
            ::log::Level::Info => Self::Info,
            ::log::Level::Debug => Self::Debug,
            ::log::Level::Trace => Self::Trace,
        }
    }
}

/// Error returned when parsing an unknown level name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError(String);

impl std::fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unknown log level '{}' (expected error, warn, info, debug or trace)",
            self.0
        )
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(ParseLevelError(s.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// LogSink trait
// ---------------------------------------------------------------------------

/// A dyn-compatible output sink for [`SinkLogger`].
///
/// Uses `&self` because sinks are shared between every thread that logs;
/// implementations synchronize internally.
pub trait LogSink: Send + Sync {
    /// Write one already-formatted line (including the trailing newline).
    fn write_str(&self, s: &str);
    /// Maximum log level accepted (messages with `level <= max_level` are written).
    fn max_level(&self) -> LogLevel;
    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// StderrSink
// ---------------------------------------------------------------------------

/// A [`LogSink`] that writes to the process's standard error.
pub struct StderrSink {
    max_level: LogLevel,
}

impl StderrSink {
    /// Creates a new stderr sink.
    pub fn new(max_level: LogLevel) -> Self {
        Self { max_level }
    }
}

impl LogSink for StderrSink {
    fn write_str(&self, s: &str) {
        // A closed stderr is not worth failing over.
        let _ = std::io::stderr().lock().write_all(s.as_bytes());
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "stderr"
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// A [`LogSink`] that keeps every line in memory.
///
/// Lines are stored without their trailing newline.
pub struct MemorySink {
    max_level: LogLevel,
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    /// Creates a new, empty memory sink.
    pub fn new(max_level: LogLevel) -> Self {
        Self {
            max_level,
            lines: Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of every captured line.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Returns `true` if any captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }

    /// Discards every captured line.
    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn write_str(&self, s: &str) {
        self.lines
            .lock()
            .push(s.trim_end_matches('\n').to_owned());
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// SinkLogger
// ---------------------------------------------------------------------------

/// A `log::Log` backend that fans records out to a list of [`LogSink`]s.
pub struct SinkLogger {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl SinkLogger {
    /// Creates a logger writing to `sinks`.
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }

    /// Returns the most verbose level any sink accepts, or `None` without sinks.
    pub fn max_level(&self) -> Option<LogLevel> {
        self.sinks.iter().map(|s| s.max_level()).max()
    }

    /// Returns the names of the attached sinks, in order.
    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }
}

impl ::log::Log for SinkLogger {
    fn enabled(&self, metadata: &::log::Metadata<'_>) -> bool {
        let level = LogLevel::from(metadata.level());
        self.sinks.iter().any(|s| level <= s.max_level())
    }

    fn log(&self, record: &::log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = LogLevel::from(record.level());

        let mut line = String::new();
        let _ = writeln!(
            line,
            "[{}] {}: {}",
            level.name(),
            record.target(),
            record.args()
        );

        for sink in &self.sinks {
            if level <= sink.max_level() {
                sink.write_str(&line);
            }
        }
    }

    fn flush(&self) {}
}

/// Installs a [`SinkLogger`] over `sinks` as the global `log` backend.
///
/// The facade's max level is set to the most verbose sink's cap.
///
/// # Errors
///
/// Returns an error if a global logger has already been installed.
pub fn init(sinks: Vec<Arc<dyn LogSink>>) -> Result<(), ::log::SetLoggerError> {
    let logger = SinkLogger::new(sinks);
    let filter = logger
        .max_level()
        .map_or(::log::LevelFilter::Off, LogLevel::to_filter);
    ::log::set_boxed_logger(Box::new(logger))?;
    ::log::set_max_level(filter);
    Ok(())
}
