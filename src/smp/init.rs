//! SMP Initialization
//!
//! `smp_init` finishes what `ap_init` started: it routes the remote-call
//! vector, stamps every CPU's logical index into its CPU-local storage and
//! sets the quiescent baseline. `smp_reset_apic` puts every CPU's interrupt
//! controller back into a known state.

use core::sync::atomic::Ordering;

use super::platform::Platform;
use super::types::{BringupPhase, IPI_VECTOR};
use super::Smp;

impl<P: Platform> Smp<P> {
    /// Brings the machine to the ready state. Runs on the primary CPU.
    ///
    /// Performs bring-up first if it has not happened yet. Calling it again
    /// re-stamps the identities and leaves `cpus_active` at 1.
    pub fn smp_init(&self) {
        if self.bringup_phase() != BringupPhase::Complete {
            self.ap_init();
        }

        self.platform.install_vector(IPI_VECTOR);

        self.setup_smp_id();
        let local = self.platform.local_id();
        for cpu in 0..self.cpu_count() {
            if self.state.cpus.hardware_id(cpu) == Some(local) {
                continue;
            }
            self.on_cpu(cpu, &|| self.setup_smp_id());
        }

        self.mark_quiescent_baseline();
        crate::kinfo!(
            "SMP: ready, {} CPUs, remote calls on vector {:#x}",
            self.cpu_count(),
            IPI_VECTOR
        );
    }

    /// Resets the interrupt controller of every CPU, the caller first.
    ///
    /// Before bring-up this touches the caller only.
    pub fn smp_reset_apic(&self) {
        self.adopt_boot_cpu();
        self.platform.reset();

        let local = self.platform.local_id();
        for cpu in 0..self.cpu_count() {
            if self.state.cpus.hardware_id(cpu) == Some(local) {
                continue;
            }
            self.on_cpu(cpu, &|| self.platform.reset());
        }

        self.mark_quiescent_baseline();
        crate::kdebug!("SMP: interrupt controllers reset on {} CPUs", self.cpu_count());
    }

    fn setup_smp_id(&self) {
        let hw_id = self.platform.local_id();
        match self.state.cpus.index_of(hw_id) {
            Some(index) => self.platform.set_cpu_local_index(index),
            None => {
                crate::kfatal!("SMP: APIC {:#x} has no logical index", hw_id);
                panic!("SMP: APIC {:#x} has no logical index", hw_id);
            }
        }
    }

    /// Adds the primary's baseline unit to `active`, once.
    fn mark_quiescent_baseline(&self) {
        if self
            .state
            .baseline_marked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.state.active.fetch_add(1, Ordering::AcqRel);
        }
    }
}
