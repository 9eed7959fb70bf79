//! Bare-metal platform backends.
//!
//! Only x86_64 with an xAPIC is supported; the module is compiled for
//! `target_os = "none"` builds only.

pub mod x86_64;

pub use self::x86_64::{init, smp, X86Platform};
