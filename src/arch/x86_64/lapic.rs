//! xAPIC MMIO access.
//!
//! Physical memory is identity-mapped, so the register window is used at the
//! address IA32_APIC_BASE reports.

use core::ptr::{read_volatile, write_volatile};

use x86_64::registers::model_specific::Msr;

use crate::lapic::{
    Icr, IcrFlags, DEFAULT_SPURIOUS_VECTOR, LVT_MASKED, REG_EOI, REG_ESR, REG_ICR_HIGH,
    REG_ICR_LOW, REG_ID, REG_LVT_ERROR, REG_LVT_LINT0, REG_LVT_LINT1, REG_LVT_TIMER, REG_SVR,
    REG_TPR, SVR_SOFTWARE_ENABLE,
};

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_GLOBAL_ENABLE: u64 = 1 << 11;
const APIC_BASE_MASK: u64 = 0xFFFF_F000;

pub struct XApic {
    base: u64,
}

impl XApic {
    /// Reads the register window from IA32_APIC_BASE. Every CPU sees the
    /// same physical window; each one addresses its own controller.
    pub fn from_msr() -> Self {
        // SAFETY: IA32_APIC_BASE exists on every CPU with an xAPIC.
        let value = unsafe { Msr::new(IA32_APIC_BASE).read() };
        Self {
            base: value & APIC_BASE_MASK,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn id(&self) -> u32 {
        self.read(REG_ID) >> 24
    }

    pub fn eoi(&self) {
        self.write(REG_EOI, 0);
    }

    pub fn send(&self, icr: Icr) {
        self.wait_for_icr();
        self.write(REG_ICR_HIGH, icr.high);
        self.write(REG_ICR_LOW, icr.low);
        self.wait_for_icr();
    }

    /// Software-enables the controller with all local vectors masked and
    /// any latched error cleared. Safe to repeat.
    pub fn reset(&self) {
        // SAFETY: rewriting the base we read keeps the window in place.
        unsafe {
            let mut msr = Msr::new(IA32_APIC_BASE);
            let value = msr.read();
            msr.write((value & !APIC_BASE_MASK) | self.base | APIC_GLOBAL_ENABLE);
        }

        for lvt in [REG_LVT_TIMER, REG_LVT_LINT0, REG_LVT_LINT1, REG_LVT_ERROR] {
            self.write(lvt, LVT_MASKED);
        }
        self.write(REG_ESR, 0);
        self.write(REG_TPR, 0);

        let mut svr = self.read(REG_SVR);
        svr &= !0xFF;
        svr |= DEFAULT_SPURIOUS_VECTOR as u32 | SVR_SOFTWARE_ENABLE;
        self.write(REG_SVR, svr);
    }

    fn wait_for_icr(&self) {
        while self.read(REG_ICR_LOW) & IcrFlags::DELIVERY_PENDING.bits() != 0 {
            core::hint::spin_loop();
        }
    }

    fn read(&self, offset: u32) -> u32 {
        // SAFETY: `base` is the identity-mapped xAPIC window.
        unsafe { read_volatile((self.base + offset as u64) as *const u32) }
    }

    fn write(&self, offset: u32, value: u32) {
        // SAFETY: as in `read`.
        unsafe { write_volatile((self.base + offset as u64) as *mut u32, value) }
    }
}
