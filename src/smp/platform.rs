//! Hardware capabilities the SMP core is written against.
//!
//! The core never touches registers, ports or physical memory directly. The
//! bare-metal x86_64 backend implements these traits with xAPIC MMIO, fw_cfg
//! port I/O and GS-based CPU-local storage; the host test suite implements
//! them with a simulated machine.

use crate::lapic::{DeliveryMode, Destination};

use super::trampoline::TrampolineSource;

/// The calling CPU's interrupt controller.
pub trait InterruptController {
    /// Hardware id of the calling CPU.
    fn local_id(&self) -> u32;

    /// Write one interrupt command. Returns once the controller has accepted
    /// it; delivery to the target is asynchronous.
    fn send_ipi(&self, destination: Destination, vector: u8, mode: DeliveryMode);

    /// Acknowledge the interrupt currently in service on the calling CPU.
    fn end_of_interrupt(&self);

    /// Return the calling CPU's controller to a known enabled state.
    /// Must be idempotent.
    fn reset(&self);
}

pub trait Platform: InterruptController + Sync {
    /// Route `vector` on every CPU to the remote-call entry stub.
    fn install_vector(&self, vector: u8);

    /// Total CPU count reported by firmware. Only meaningful after the
    /// STARTUP pulses have gone out.
    fn discovered_cpu_count(&self) -> usize;

    /// Store the calling CPU's logical index in CPU-local storage.
    fn set_cpu_local_index(&self, index: usize);

    fn cpu_local_index(&self) -> usize;

    /// Move the calling secondary CPU off the trampoline's descriptor tables
    /// onto the primary's GDT and IDT, reloading the code and data segments.
    /// Runs before the CPU registers, so before it can take any interrupt.
    fn load_boot_descriptors(&self);

    /// Trampoline image and the long-mode parameters it needs.
    fn trampoline_source(&self) -> TrampolineSource;

    /// Copy `bytes` to identity-mapped physical memory at `phys`.
    fn copy_to_low_memory(&self, phys: u64, bytes: &[u8]);

    fn delay_us(&self, micros: u64);

    /// Called on every iteration of every busy-wait in the core.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}
