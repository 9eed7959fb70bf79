//! SMP Tests
//!
//! - `trampoline`: page layout, footer, entry bridges
//! - `bringup`: INIT/STARTUP sequencing against the simulated machine
//! - `dispatch`: on_cpu / on_cpu_async / on_cpus
//! - `init`: smp_init identity setup and smp_reset_apic

mod dispatch;
mod init;
mod trampoline;
