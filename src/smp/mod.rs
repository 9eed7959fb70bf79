//! SMP (Symmetric Multi-Processing) Subsystem
//!
//! Application-processor bring-up and cross-CPU remote execution.
//!
//! # Lifecycle
//!
//! 1. [`Smp::ap_init`] (called by [`Smp::smp_init`] if needed) installs the
//!    trampoline, broadcasts INIT and STARTUP, and waits until every CPU the
//!    firmware reports has registered.
//! 2. [`Smp::smp_init`] installs the remote-call vector, gives every CPU its
//!    logical index in CPU-local storage and establishes the quiescent
//!    baseline of one active CPU.
//! 3. [`Smp::on_cpu`], [`Smp::on_cpu_async`] and [`Smp::on_cpus`] run
//!    functions on other CPUs through [`IPI_VECTOR`].
//!
//! # Module Organization
//!
//! - `types`: constants and the bring-up phase marker
//! - `state`: counters, CPU map and the pending remote-call slot
//! - `platform`: capability traits implemented per machine
//! - `trampoline`: page layout and the entry bridges
//! - `ap_startup`: INIT/STARTUP sequencing and secondary registration
//! - `ipi`: remote-call dispatcher and the handler side of the stub
//! - `init`: vector install, identity setup, APIC reset
//! - `cpu`: queries (cpu_count, smp_id, cpus_active, ...)

mod ap_startup;
mod cpu;
mod init;
mod ipi;
pub mod platform;
mod state;
pub mod trampoline;
pub mod types;

use crate::config::SmpConfig;

use self::state::SharedState;

pub use platform::{InterruptController, Platform};
pub use state::{CpuMap, RemoteCallSnapshot, RemoteCallStats};
pub use trampoline::{
    build_page, CallGateBridge, DirectBridge, EntryBridge, TrampolineError, TrampolineFooter,
    TrampolineKind, TrampolinePage, TrampolineSource,
};
pub use types::{
    BringupPhase, AP_STACK_SIZE, INIT_VECTOR, IPI_VECTOR, MAX_CPUS, TRAMPOLINE_BASE,
    TRAMPOLINE_PAGE_SIZE, TRAMPOLINE_VECTOR,
};

/// One machine's SMP state plus the platform it drives.
///
/// Kernels keep a single instance in a static (the x86_64 backend uses a
/// `spin::Once`) and call into it from every CPU.
pub struct Smp<P: Platform> {
    platform: P,
    config: SmpConfig,
    state: SharedState,
}

impl<P: Platform> Smp<P> {
    pub const fn new(platform: P, config: SmpConfig) -> Self {
        Self {
            platform,
            config,
            state: SharedState::new(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &SmpConfig {
        &self.config
    }
}
