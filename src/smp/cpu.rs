//! CPU Management Functions
//!
//! Queries over the shared state. All of them are lock-free and callable
//! from any CPU, including from inside a remote call.

use core::sync::atomic::Ordering;

use super::platform::Platform;
use super::state::RemoteCallSnapshot;
use super::types::BringupPhase;
use super::Smp;

impl<P: Platform> Smp<P> {
    /// Total CPUs discovered at bring-up; 1 before bring-up has run.
    pub fn cpu_count(&self) -> usize {
        self.state.cpu_total.load(Ordering::Acquire)
    }

    /// CPUs that completed registration, the primary included.
    pub fn online_cpus(&self) -> usize {
        self.state.online.load(Ordering::Acquire)
    }

    /// Logical index of the calling CPU, read back from CPU-local storage.
    pub fn smp_id(&self) -> usize {
        self.platform.cpu_local_index()
    }

    /// Remote calls in flight plus the quiescent baseline of 1.
    pub fn cpus_active(&self) -> usize {
        self.state.active.load(Ordering::Acquire)
    }

    pub fn hardware_id(&self, cpu: usize) -> Option<u32> {
        self.state.cpus.hardware_id(cpu)
    }

    pub fn logical_index(&self, hw_id: u32) -> Option<usize> {
        self.state.cpus.index_of(hw_id)
    }

    pub fn bringup_phase(&self) -> BringupPhase {
        self.state.phase()
    }

    pub fn remote_call_stats(&self) -> RemoteCallSnapshot {
        self.state.stats.snapshot()
    }

    /// Gives the calling CPU logical index 0 if nobody holds it yet.
    ///
    /// Before bring-up only the primary runs, so the first CPU to use the
    /// remote-call or reset paths is the primary; it then resolves as a
    /// self-target instead of an unregistered one.
    pub(crate) fn adopt_boot_cpu(&self) {
        if self.state.cpus.record_boot(self.platform.local_id()) {
            self.platform.set_cpu_local_index(0);
        }
    }

    /// `active` value that means "no remote call outstanding".
    pub(crate) fn quiescent_level(&self) -> usize {
        usize::from(self.state.baseline_marked.load(Ordering::Acquire))
    }
}
