//! nexa-smp: multiprocessor bring-up and cross-CPU remote execution
//!
//! A small no_std library for bare-metal x86_64 test kernels. It wakes the
//! application processors through a low-memory trampoline, gives every CPU a
//! dense logical index, and lets any CPU run a function on any other CPU
//! through a dedicated inter-processor interrupt.
//!
//! The protocol core in [`smp`] is written against the capability traits in
//! [`smp::platform`]; the bare-metal implementation of those traits lives in
//! `arch::x86_64` and is only built for `target_os = "none"`.

#![no_std]

pub mod config;
pub mod lapic;
pub mod logger;
pub mod smp;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod arch;

pub use config::{ConfigError, SipiPolicy, SmpConfig};
pub use smp::{InterruptController, Platform, Smp};

// ===========================================================================
// Logging macros
// ===========================================================================

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::FATAL, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::ERROR, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::WARN, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::INFO, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::DEBUG, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::TRACE, $($arg)*);
    }};
}
