//! Level-tagged diagnostics routed to a single process-wide sink.
//!
//! Nothing is printed unless a sink has been installed with
//! [`set_logger`]. The sink can be installed once per process.

use core::{
    fmt, panic,
    sync::atomic::{AtomicU8, Ordering},
};

use snafu::ensure;
use spin::Once;

use crate::{
    ResultCode,
    error::{HeapError, LoggerAlreadySetSnafu},
};

#[macro_export]
macro_rules! log {
    ($level:expr, $code:expr, $($arg:tt)*) => {
        $crate::log::log($level, $code, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! trace {
    ($code:expr, $($arg:tt)*) => {
        $crate::log!($crate::log::LogLevel::Trace, $code, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($code:expr, $($arg:tt)*) => {
        $crate::log!($crate::log::LogLevel::Debug, $code, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($code:expr, $($arg:tt)*) => {
        $crate::log!($crate::log::LogLevel::Info, $code, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($code:expr, $($arg:tt)*) => {
        $crate::log!($crate::log::LogLevel::Warn, $code, $($arg)*)
    };
}

#[macro_export]
macro_rules! error {
    ($code:expr, $($arg:tt)*) => {
        $crate::log!($crate::log::LogLevel::Error, $code, $($arg)*)
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    const fn from_u8(level: u8) -> Self {
        match level {
            0 => Self::Trace,
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warn,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => " INFO",
            Self::Warn => " WARN",
            Self::Error => "ERROR",
        };
        f.write_str(msg)
    }
}

/// A single diagnostic message handed to the installed sink.
pub struct Record<'a> {
    level: LogLevel,
    code: ResultCode,
    message: fmt::Arguments<'a>,
    location: &'static panic::Location<'static>,
}

impl<'a> Record<'a> {
    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// The result code the message relates to.
    #[must_use]
    pub fn code(&self) -> ResultCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> fmt::Arguments<'a> {
        self.message
    }

    /// Where the message was emitted.
    #[must_use]
    pub fn location(&self) -> &'static panic::Location<'static> {
        self.location
    }
}

impl fmt::Display for Record<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) {} at {}",
            self.level,
            self.code.code(),
            self.message,
            self.location
        )
    }
}

pub type Logger = fn(&Record<'_>);

static LOGGER: Once<Logger> = Once::new();
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Trace as u8);

/// Installs the process-wide log sink.
///
/// Returns [`HeapError::LoggerAlreadySet`] if a sink has been installed
/// before.
#[track_caller]
pub fn set_logger(logger: Logger) -> Result<(), HeapError> {
    let mut installed = false;
    LOGGER.call_once(|| {
        installed = true;
        logger
    });
    ensure!(installed, LoggerAlreadySetSnafu);
    Ok(())
}

/// Drops every record less severe than `level`.
pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[must_use]
pub fn max_level() -> LogLevel {
    LogLevel::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level >= max_level() && LOGGER.is_completed()
}

#[track_caller]
pub fn log(level: LogLevel, code: ResultCode, message: fmt::Arguments<'_>) {
    if level < max_level() {
        return;
    }
    let Some(logger) = LOGGER.get() else {
        return;
    };
    logger(&Record {
        level,
        code,
        message,
        location: panic::Location::caller(),
    });
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{string::String, sync::Mutex, vec::Vec};

    use super::*;

    static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    fn capture(record: &Record<'_>) {
        CAPTURED.lock().unwrap().push(record.to_string());
    }

    fn captured_containing(needle: &str) -> Vec<String> {
        CAPTURED
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.contains(needle))
            .cloned()
            .collect()
    }

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert_eq!(LogLevel::from_u8(LogLevel::Info as u8), LogLevel::Info);
        assert_eq!(LogLevel::Warn.to_string(), " WARN");
    }

    #[test]
    fn test_sink_receives_records_once_installed() {
        set_logger(capture).unwrap();
        assert!(set_logger(capture).is_err());
        assert!(enabled(LogLevel::Error));

        crate::warn!(ResultCode::NoMem, "marker {} for sink test", 42);
        let lines = captured_containing("marker 42 for sink test");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with(" WARN (7) "));
        assert!(lines[0].contains("log.rs"));

        // The heap driver reports its own failures through the same sink.
        let heap = crate::testing::CountingHeap::with_capacity(0);
        assert!(
            crate::HeapDriver::allocate(&heap, core::num::NonZeroUsize::new(24).unwrap())
                .is_none()
        );
        assert!(!captured_containing("failed to allocate 24 bytes of memory").is_empty());
    }
}
