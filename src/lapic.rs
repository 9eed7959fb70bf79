//! Local APIC register layout and interrupt-command encoding.
//!
//! Register access itself is platform work (`arch::x86_64::lapic` does MMIO);
//! this module only knows how an IPI request turns into the two 32-bit ICR
//! words, so the encoding can be checked on the host.

use bitflags::bitflags;

pub const REG_ID: u32 = 0x020;
pub const REG_TPR: u32 = 0x080;
pub const REG_EOI: u32 = 0x0B0;
pub const REG_SVR: u32 = 0x0F0;
pub const REG_ESR: u32 = 0x280;
pub const REG_ICR_LOW: u32 = 0x300;
pub const REG_ICR_HIGH: u32 = 0x310;
pub const REG_LVT_TIMER: u32 = 0x320;
pub const REG_LVT_LINT0: u32 = 0x350;
pub const REG_LVT_LINT1: u32 = 0x360;
pub const REG_LVT_ERROR: u32 = 0x370;

pub const DEFAULT_SPURIOUS_VECTOR: u8 = 0xFF;
pub const SVR_SOFTWARE_ENABLE: u32 = 1 << 8;
pub const LVT_MASKED: u32 = 1 << 16;

const DELIVERY_MODE_SHIFT: u32 = 8;
const SHORTHAND_SHIFT: u32 = 18;
const DESTINATION_SHIFT: u32 = 24;

bitflags! {
    /// Control bits of the low ICR word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IcrFlags: u32 {
        const LOGICAL_DESTINATION = 1 << 11;
        const DELIVERY_PENDING = 1 << 12;
        const LEVEL_ASSERT = 1 << 14;
        const LEVEL_TRIGGERED = 1 << 15;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Deliver `vector` as an ordinary interrupt.
    Fixed,
    /// Reset the target into wait-for-startup.
    Init,
    /// Start executing at physical `vector << 12` in real mode.
    Startup,
}

impl DeliveryMode {
    const fn bits(self) -> u32 {
        let mode = match self {
            DeliveryMode::Fixed => 0b000,
            DeliveryMode::Init => 0b101,
            DeliveryMode::Startup => 0b110,
        };
        mode << DELIVERY_MODE_SHIFT
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    /// One CPU, addressed by hardware APIC id.
    Physical(u32),
    SelfOnly,
    AllIncludingSelf,
    AllExcludingSelf,
}

impl Destination {
    const fn shorthand(self) -> u32 {
        let bits = match self {
            Destination::Physical(_) => 0b00,
            Destination::SelfOnly => 0b01,
            Destination::AllIncludingSelf => 0b10,
            Destination::AllExcludingSelf => 0b11,
        };
        bits << SHORTHAND_SHIFT
    }
}

/// The two ICR words, high written first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Icr {
    pub high: u32,
    pub low: u32,
}

impl Icr {
    pub const fn new(destination: Destination, vector: u8, mode: DeliveryMode) -> Self {
        let high = match destination {
            Destination::Physical(apic_id) => apic_id << DESTINATION_SHIFT,
            _ => 0,
        };

        // STARTUP is edge-only; INIT and fixed requests carry the assert bit.
        let level = match mode {
            DeliveryMode::Startup => IcrFlags::empty(),
            DeliveryMode::Fixed | DeliveryMode::Init => IcrFlags::LEVEL_ASSERT,
        };

        let low = vector as u32 | mode.bits() | level.bits() | destination.shorthand();
        Self { high, low }
    }

    pub const fn flags(&self) -> IcrFlags {
        IcrFlags::from_bits_truncate(self.low)
    }

    pub const fn vector(&self) -> u8 {
        (self.low & 0xFF) as u8
    }
}

/// STARTUP vector that makes an AP begin execution at `base`.
pub const fn startup_vector(base: u64) -> u8 {
    (base >> 12) as u8
}
