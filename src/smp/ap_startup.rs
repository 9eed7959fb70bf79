//! AP (Application Processor) Startup
//!
//! Primary side: install the trampoline page, broadcast INIT and STARTUP to
//! all CPUs but self, then wait for every discovered CPU to register.
//! Secondary side: [`Smp::ap_online`], called from the long-mode entry.
//!
//! Bring-up is fail-stop. A CPU that never registers keeps the primary
//! spinning forever, and a trampoline that cannot be built stops the machine
//! before any IPI goes out.

use core::sync::atomic::Ordering;

use crate::config::SipiPolicy;
use crate::lapic::{DeliveryMode, Destination};

use super::platform::Platform;
use super::trampoline::{build_page, TRAMPOLINE_BASE, TRAMPOLINE_VECTOR};
use super::types::{BringupPhase, INIT_VECTOR, MAX_CPUS};
use super::Smp;

impl<P: Platform> Smp<P> {
    /// Wakes all secondary CPUs. Runs on the primary CPU, once.
    ///
    /// Returns after every CPU reported by the platform is online; never
    /// returns if one of them fails to start.
    pub fn ap_init(&self) {
        if self
            .state
            .phase
            .compare_exchange(
                BringupPhase::Idle as u8,
                BringupPhase::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            crate::kwarn!(
                "SMP: ap_init called again (phase {:?}), ignoring",
                self.bringup_phase()
            );
            return;
        }

        let boot_id = self.platform.local_id();
        self.state.cpus.set_boot(boot_id);
        self.platform.set_cpu_local_index(0);
        crate::kinfo!("SMP: boot CPU APIC id {:#x}", boot_id);

        self.install_trampoline();
        self.state.set_phase(BringupPhase::TrampolineInstalled);

        crate::kdebug!("SMP: INIT -> all but self");
        self.platform.send_ipi(
            Destination::AllExcludingSelf,
            INIT_VECTOR,
            DeliveryMode::Init,
        );
        self.state.set_phase(BringupPhase::InitSent);
        self.platform.delay_us(self.config.init_delay_us);

        crate::kdebug!("SMP: STARTUP vector {:#x} -> all but self", TRAMPOLINE_VECTOR);
        self.platform.send_ipi(
            Destination::AllExcludingSelf,
            TRAMPOLINE_VECTOR,
            DeliveryMode::Startup,
        );
        if self.config.sipi == SipiPolicy::Double {
            self.platform.delay_us(self.config.sipi_delay_us);
            self.platform.send_ipi(
                Destination::AllExcludingSelf,
                TRAMPOLINE_VECTOR,
                DeliveryMode::Startup,
            );
        }
        self.state.set_phase(BringupPhase::StartupSent);

        let total = self.platform.discovered_cpu_count();
        assert!(
            (1..=MAX_CPUS).contains(&total),
            "SMP: firmware reports {} CPUs (supported 1..={})",
            total,
            MAX_CPUS
        );
        self.state.cpu_total.store(total, Ordering::Release);
        self.state.set_phase(BringupPhase::WaitingOnline);
        crate::kinfo!("SMP: waiting for {} CPUs to come online", total);

        while self.state.online.load(Ordering::Acquire) != total {
            self.platform.relax();
        }

        self.state.set_phase(BringupPhase::Complete);
        crate::kinfo!("SMP: {} CPUs online", total);
    }

    /// Registers the calling secondary CPU and returns its logical index.
    ///
    /// Called exactly once per secondary, from its long-mode entry, before
    /// it enables interrupts. The CPU switches to the primary's descriptor
    /// tables before it becomes visible as online.
    pub fn ap_online(&self) -> usize {
        self.platform.load_boot_descriptors();

        let hw_id = self.platform.local_id();
        let index = self.state.cpus.claim(hw_id);
        self.platform.set_cpu_local_index(index);

        // Mapping above is published before the primary can see the count.
        self.state.online.fetch_add(1, Ordering::Release);
        crate::kdebug!("SMP: APIC {:#x} online as CPU {}", hw_id, index);
        index
    }

    fn install_trampoline(&self) {
        let source = self.platform.trampoline_source();
        let bridge = self.config.trampoline.bridge();

        let page = match build_page(&source, bridge) {
            Ok(page) => page,
            Err(err) => {
                crate::kfatal!("SMP: cannot install trampoline: {}", err);
                panic!("SMP: cannot install trampoline: {}", err);
            }
        };

        self.platform
            .copy_to_low_memory(TRAMPOLINE_BASE, page.as_bytes());
        crate::kinfo!(
            "SMP: trampoline ({} bytes, {:?} entry {:#x}) installed at {:#x}",
            source.image.len(),
            bridge.kind(),
            source.entry,
            TRAMPOLINE_BASE
        );
    }
}
