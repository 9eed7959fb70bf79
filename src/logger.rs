//! Leveled logging behind a pluggable sink.
//!
//! The library never owns an output device. Whoever links it installs one
//! [`LogSink`] (the x86_64 backend installs a COM1 writer, host tests install
//! an in-memory capture) and every `kinfo!`/`kwarn!`/... call below the
//! current threshold is dropped before formatting.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Once;

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::INFO.priority());
static SINK: Once<&'static dyn LogSink> = Once::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    PANIC,
    FATAL,
    ERROR,
    WARN,
    INFO,
    DEBUG,
    TRACE,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::PANIC => "PANIC",
            LogLevel::FATAL => "FATAL",
            LogLevel::ERROR => "ERROR",
            LogLevel::WARN => "WARN",
            LogLevel::INFO => "INFO",
            LogLevel::DEBUG => "DEBUG",
            LogLevel::TRACE => "TRACE",
        }
    }

    /// ANSI prefix used by terminal sinks.
    pub const fn serial_color(self) -> &'static str {
        match self {
            LogLevel::PANIC | LogLevel::FATAL => "\x1b[1;37;41m",
            LogLevel::ERROR => "\x1b[1;31m",
            LogLevel::WARN => "\x1b[33m",
            LogLevel::INFO => "\x1b[32m",
            LogLevel::DEBUG => "\x1b[36m",
            LogLevel::TRACE => "\x1b[90m",
        }
    }

    const fn priority(self) -> u8 {
        match self {
            LogLevel::PANIC => 0,
            LogLevel::FATAL => 1,
            LogLevel::ERROR => 2,
            LogLevel::WARN => 3,
            LogLevel::INFO => 4,
            LogLevel::DEBUG => 5,
            LogLevel::TRACE => 6,
        }
    }

    fn from_priority(value: u8) -> Self {
        match value {
            0 => LogLevel::PANIC,
            1 => LogLevel::FATAL,
            2 => LogLevel::ERROR,
            3 => LogLevel::WARN,
            4 => LogLevel::INFO,
            5 => LogLevel::DEBUG,
            _ => LogLevel::TRACE,
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("panic") {
            Some(LogLevel::PANIC)
        } else if value.eq_ignore_ascii_case("fatal") {
            Some(LogLevel::FATAL)
        } else if value.eq_ignore_ascii_case("error") {
            Some(LogLevel::ERROR)
        } else if value.eq_ignore_ascii_case("warn") || value.eq_ignore_ascii_case("warning") {
            Some(LogLevel::WARN)
        } else if value.eq_ignore_ascii_case("info") {
            Some(LogLevel::INFO)
        } else if value.eq_ignore_ascii_case("debug") {
            Some(LogLevel::DEBUG)
        } else if value.eq_ignore_ascii_case("trace") {
            Some(LogLevel::TRACE)
        } else {
            None
        }
    }
}

/// Left-padded level badge, `[WARN ]` style.
pub struct LevelDisplay(pub LogLevel);

impl fmt::Display for LevelDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.0.as_str())
    }
}

/// Destination for log lines that passed the level filter.
///
/// Sinks are called from interrupt context (the remote-call stub logs at
/// TRACE), so implementations must not allocate and should keep their own
/// locking short.
pub trait LogSink: Sync {
    fn write_line(&self, level: LogLevel, args: fmt::Arguments<'_>);
}

/// Installs the process-wide sink. Only the first call wins; returns whether
/// this call installed `sink`.
pub fn install_sink(sink: &'static dyn LogSink) -> bool {
    let mut installed = false;
    SINK.call_once(|| {
        installed = true;
        sink
    });
    installed
}

pub fn is_initialized() -> bool {
    SINK.is_completed()
}

pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level.priority() > LOG_LEVEL.load(Ordering::Relaxed) {
        return;
    }

    if let Some(sink) = SINK.get() {
        sink.write_line(level, args);
    }
}

pub fn set_max_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    LogLevel::from_priority(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn enabled(level: LogLevel) -> bool {
    level.priority() <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn parse_level_directive(cmdline: &str) -> Option<LogLevel> {
    for token in cmdline.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            if key.eq_ignore_ascii_case("log") || key.eq_ignore_ascii_case("loglevel") {
                if let Some(level) = LogLevel::from_str(value) {
                    return Some(level);
                }
            }
        }
    }
    None
}
