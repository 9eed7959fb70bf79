//! x86_64 bare-metal backend
//!
//! Implements [`Platform`] for a QEMU/KVM-style machine:
//!
//! - `lapic`: xAPIC MMIO (ICR writes, EOI, reset)
//! - `fw_cfg`: CPU count from the fw_cfg I/O interface
//! - `entry`: remote-call interrupt stub
//! - `ap_boot`: trampoline image and long-mode AP entry
//! - `serial`: COM1 log sink
//!
//! CPU-local storage is a per-CPU block addressed through IA32_GS_BASE.
//!
//! Usage from a test kernel, on the boot CPU with interrupts enabled:
//!
//! ```ignore
//! let smp = nexa_smp::arch::init(cmdline, idt_set_handler);
//! smp.smp_init();
//! smp.on_cpus(&|| do_something());
//! ```

mod ap_boot;
mod entry;
mod fw_cfg;
mod lapic;
mod serial;

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Once;
use x86_64::registers::model_specific::GsBase;
use x86_64::VirtAddr;

use crate::config::SmpConfig;
use crate::lapic::{DeliveryMode, Destination, Icr};
use crate::logger;
use crate::smp::{InterruptController, Platform, Smp, TrampolineSource, MAX_CPUS};

use self::lapic::XApic;

/// Busy-loop iterations per microsecond; coarse, only used for IPI settling.
const SPINS_PER_US: u64 = 100;

static SMP: Once<Smp<X86Platform>> = Once::new();

/// IDT hook supplied by the kernel: route `vector` to the handler at `addr`
/// on the shared IDT.
pub type InstallVector = fn(vector: u8, addr: u64);

#[repr(C, align(64))]
struct CpuLocal {
    index: AtomicUsize,
}

static CPU_LOCAL: [CpuLocal; MAX_CPUS] = [const {
    CpuLocal {
        index: AtomicUsize::new(0),
    }
}; MAX_CPUS];

pub struct X86Platform {
    apic: XApic,
    install_vector: InstallVector,
}

impl X86Platform {
    fn new(install_vector: InstallVector) -> Self {
        Self {
            apic: XApic::from_msr(),
            install_vector,
        }
    }
}

impl InterruptController for X86Platform {
    fn local_id(&self) -> u32 {
        self.apic.id()
    }

    fn send_ipi(&self, destination: Destination, vector: u8, mode: DeliveryMode) {
        self.apic.send(Icr::new(destination, vector, mode));
    }

    fn end_of_interrupt(&self) {
        self.apic.eoi();
    }

    fn reset(&self) {
        self.apic.reset();
    }
}

impl Platform for X86Platform {
    fn install_vector(&self, vector: u8) {
        (self.install_vector)(vector, entry::entry_address());
    }

    fn discovered_cpu_count(&self) -> usize {
        usize::from(fw_cfg::cpu_count())
    }

    fn set_cpu_local_index(&self, index: usize) {
        let slot = &CPU_LOCAL[index];
        slot.index.store(index, Ordering::Relaxed);
        GsBase::write(VirtAddr::from_ptr(slot));
    }

    fn cpu_local_index(&self) -> usize {
        let base = GsBase::read();
        if base.is_null() {
            return 0;
        }
        // SAFETY: GS base is only ever pointed at a CPU_LOCAL slot.
        unsafe { (*base.as_ptr::<CpuLocal>()).index.load(Ordering::Relaxed) }
    }

    fn load_boot_descriptors(&self) {
        ap_boot::load_boot_descriptors();
    }

    fn trampoline_source(&self) -> TrampolineSource {
        ap_boot::trampoline_source()
    }

    fn copy_to_low_memory(&self, phys: u64, bytes: &[u8]) {
        // SAFETY: low memory is identity-mapped and reserved for the
        // trampoline page.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), phys as *mut u8, bytes.len());
        }
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    fn delay_us(&self, micros: u64) {
        for _ in 0..micros.saturating_mul(SPINS_PER_US) {
            core::hint::spin_loop();
        }
    }
}

/// Sets up logging and the global [`Smp`] instance. Call once, on the boot
/// CPU, before `smp_init`.
pub fn init(cmdline: &str, install_vector: InstallVector) -> &'static Smp<X86Platform> {
    serial::init();
    logger::install_sink(&serial::SERIAL_SINK);

    let config = SmpConfig::from_cmdline(cmdline);
    if let Some(level) = config.log_level {
        logger::set_max_level(level);
    }

    let smp = SMP.call_once(|| Smp::new(X86Platform::new(install_vector), config));
    smp.platform().reset();
    crate::kinfo!(
        "SMP: xAPIC at {:#x}, boot CPU APIC id {:#x}",
        smp.platform().apic.base(),
        smp.platform().local_id()
    );
    smp
}

/// The global instance created by [`init`].
///
/// # Panics
///
/// If [`init`] has not run. The remote-call stub and the AP entry both come
/// through here, so an unrouted vector or an AP woken by someone else fails
/// loudly instead of touching uninitialised state.
pub fn smp() -> &'static Smp<X86Platform> {
    match SMP.get() {
        Some(smp) => smp,
        None => {
            crate::kfatal!("SMP: used before nexa_smp::arch::init");
            panic!("SMP: used before nexa_smp::arch::init");
        }
    }
}
