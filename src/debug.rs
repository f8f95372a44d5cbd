// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! DSM Logging and Diagnostics
//!
//! This module provides logging services for the DSM engine. The engine is a
//! library, so output goes through a registrable sink function; with the
//! `log` feature (default) every message is also forwarded to the `log`
//! crate facade.
//!
//! # Usage
//!
//! ```rust
//! rustux_dsm::log_info!("node[{}] serving connection {}", 0, 1);
//! rustux_dsm::log_warn!("invalid gfn {}", 0x100);
//! ```

use core::sync::atomic::{AtomicU8, Ordering};

use alloc::format;

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Trace-level logging (very verbose)
    Trace = 0,

    /// Debug-level logging (verbose)
    Debug = 1,

    /// Informational logging
    Info = 2,

    /// Warning-level logging
    Warning = 3,

    /// Error-level logging
    Error = 4,

    /// Fatal errors
    Fatal = 5,
}

impl LogLevel {
    /// Get the log level name as a string
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    fn from_u8(raw: u8) -> LogLevel {
        match raw {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warning,
            4 => LogLevel::Error,
            _ => LogLevel::Fatal,
        }
    }
}

/// Sink function receiving every formatted log line
pub type LogSink = fn(&str);

/// Global minimum log level
///
/// Only messages at or above this level are emitted.
static MIN_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Registered output sink
static LOG_SINK: spin::Mutex<Option<LogSink>> = spin::Mutex::new(None);

/// Set the minimum log level
pub fn log_set_min_level(level: LogLevel) {
    MIN_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Get the current minimum log level
pub fn log_get_min_level() -> LogLevel {
    LogLevel::from_u8(MIN_LOG_LEVEL.load(Ordering::Relaxed))
}

/// Register the output sink
///
/// Passing `None` silences sink output; `log`-crate forwarding is
/// unaffected.
pub fn log_set_sink(sink: Option<LogSink>) {
    *LOG_SINK.lock() = sink;
}

/// Core log routine backing the logging macros
pub fn log_print(level: LogLevel, args: core::fmt::Arguments) {
    if level < log_get_min_level() {
        return;
    }

    #[cfg(feature = "log")]
    {
        let lvl = match level {
            LogLevel::Trace => log::Level::Trace,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error | LogLevel::Fatal => log::Level::Error,
        };
        log::log!(target: "dsm", lvl, "{}", args);
    }

    let sink = *LOG_SINK.lock();
    if let Some(sink) = sink {
        let line = format!("[{:5}] dsm: {}", level.as_str(), args);
        sink(&line);
    }
}

/// Log a trace message
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::debug::log_print($crate::debug::LogLevel::Trace, format_args!($($arg)*));
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::debug::log_print($crate::debug::LogLevel::Debug, format_args!($($arg)*));
    };
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::debug::log_print($crate::debug::LogLevel::Info, format_args!($($arg)*));
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::debug::log_print($crate::debug::LogLevel::Warning, format_args!($($arg)*));
    };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::debug::log_print($crate::debug::LogLevel::Error, format_args!($($arg)*));
    };
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Error < LogLevel::Fatal);
    }

    #[test]
    fn test_min_level_round_trip() {
        let saved = log_get_min_level();
        log_set_min_level(LogLevel::Warning);
        assert_eq!(log_get_min_level(), LogLevel::Warning);
        log_set_min_level(saved);
    }

    #[test]
    fn test_level_names() {
        assert_eq!(LogLevel::Warning.as_str(), "WARN");
        assert_eq!(LogLevel::Info.as_str(), "INFO");
    }
}
