//! Remote-call dispatcher
//!
//! Initiators serialize on one lock, publish a single pending call and send
//! a fixed IPI on [`IPI_VECTOR`] to the target. The target's entry stub calls
//! [`Smp::handle_ipi`], which consumes the call and hands completion back
//! through the `done` flag:
//!
//! - synchronous: run, drop `active`, then signal done and EOI
//! - asynchronous: signal done and EOI, then run, then drop `active`
//!
//! `active` counts calls still executing (plus the quiescent baseline set up
//! by `smp_init`), which is what [`Smp::on_cpus`] waits on.

use core::sync::atomic::{fence, Ordering};

use spin::MutexGuard;

use crate::lapic::{DeliveryMode, Destination};

use super::platform::Platform;
use super::state::RemoteCall;
use super::types::{IPI_VECTOR, MAX_CPUS};
use super::Smp;

impl<P: Platform> Smp<P> {
    /// Runs `func` on logical CPU `cpu` and returns after it has finished.
    ///
    /// Targeting the calling CPU runs `func` directly without an IPI.
    pub fn on_cpu<F: Fn() + Sync>(&self, cpu: usize, func: &F) {
        // SAFETY: `dispatch` does not return before the target has run `func`.
        unsafe { self.dispatch(cpu, RemoteCall::borrowed(func, true)) }
    }

    /// Runs `func` on logical CPU `cpu`, returning once the target has taken
    /// the call but possibly before `func` has finished.
    pub fn on_cpu_async<F: Fn() + Sync>(&self, cpu: usize, func: &'static F) {
        // SAFETY: `func` is 'static.
        unsafe { self.dispatch(cpu, RemoteCall::borrowed(func, false)) }
    }

    /// Runs `func` on every CPU except the caller, then waits until all of
    /// those calls have finished.
    ///
    /// Requests go out from the highest logical index down. Only one
    /// `on_cpus` may be in flight machine-wide; the completion barrier counts
    /// every active remote call, not just this caller's.
    pub fn on_cpus<F: Fn() + Sync>(&self, func: &F) {
        self.adopt_boot_cpu();
        let local = self.platform.local_id();

        for cpu in (0..self.cpu_count()).rev() {
            if self.state.cpus.hardware_id(cpu) == Some(local) {
                continue;
            }
            // SAFETY: the barrier below keeps `func` borrowed until every
            // target has decremented `active`.
            unsafe { self.dispatch(cpu, RemoteCall::borrowed(func, false)) };
        }

        let settled = self.quiescent_level();
        while self.state.active.load(Ordering::Acquire) > settled {
            self.platform.relax();
        }
    }

    /// Consumes the pending call on the CPU that received [`IPI_VECTOR`].
    ///
    /// Only the interrupt entry stub may call this, with interrupts disabled.
    pub fn handle_ipi(&self) {
        // SAFETY: the pending call was addressed to this CPU; initiators do
        // not touch the slot again until `done` is set below.
        let Some(call) = (unsafe { self.state.pending.take() }) else {
            self.state.stats.spurious.fetch_add(1, Ordering::Relaxed);
            crate::kwarn!(
                "SMP: spurious remote-call IPI on APIC {:#x}",
                self.platform.local_id()
            );
            self.platform.end_of_interrupt();
            return;
        };

        crate::ktrace!(
            "SMP: remote call on APIC {:#x} (wait={})",
            self.platform.local_id(),
            call.wait
        );

        if !call.wait {
            self.state.pending.complete();
            self.platform.end_of_interrupt();
        }

        // SAFETY: synchronous initiators are still spinning on `done`;
        // asynchronous ones either passed a 'static function or hold it
        // until `active` drops below.
        unsafe { call.run() };
        self.state.active.fetch_sub(1, Ordering::AcqRel);

        if call.wait {
            self.state.pending.complete();
            self.platform.end_of_interrupt();
        }

        self.state.stats.handled.fetch_add(1, Ordering::Relaxed);
    }

    /// # Safety
    /// The function behind `call` must outlive its execution on the target.
    unsafe fn dispatch(&self, cpu: usize, call: RemoteCall) {
        self.adopt_boot_cpu();
        let target = self.target_hardware_id(cpu);
        let _guard = self.lock_ipi();

        if target == self.platform.local_id() {
            self.state.stats.local_calls.fetch_add(1, Ordering::Relaxed);
            unsafe { call.run() };
            return;
        }

        let counter = if call.wait {
            &self.state.stats.sync_sent
        } else {
            &self.state.stats.async_sent
        };
        counter.fetch_add(1, Ordering::Relaxed);

        self.state.active.fetch_add(1, Ordering::AcqRel);
        unsafe { self.state.pending.publish(call) };

        // Descriptor must be globally visible before the interrupt is.
        fence(Ordering::SeqCst);
        self.platform
            .send_ipi(Destination::Physical(target), IPI_VECTOR, DeliveryMode::Fixed);

        while !self.state.pending.is_done() {
            self.platform.relax();
        }
    }

    fn target_hardware_id(&self, cpu: usize) -> u32 {
        assert!(cpu < MAX_CPUS, "SMP: logical CPU {} out of range", cpu);
        match self.state.cpus.hardware_id(cpu) {
            Some(id) => id,
            None => {
                crate::kfatal!("SMP: remote call to unregistered logical CPU {}", cpu);
                panic!("SMP: remote call to unregistered logical CPU {}", cpu);
            }
        }
    }

    fn lock_ipi(&self) -> MutexGuard<'_, ()> {
        loop {
            if let Some(guard) = self.state.ipi_lock.try_lock() {
                return guard;
            }
            self.platform.relax();
        }
    }
}
