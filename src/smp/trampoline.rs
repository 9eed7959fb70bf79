//! AP Trampoline Page
//!
//! Builds the 4 KiB page that secondary CPUs start executing at after the
//! STARTUP pulse. The page holds:
//!
//! - the position-dependent trampoline image at offset 0, linked for
//!   [`TRAMPOLINE_BASE`]
//! - zeroes up to the bridge area (the APs' far-call scratch stack lives
//!   directly after the image)
//! - for the call-gate bridge, a small GDT with a 64-bit call gate
//! - a [`TrampolineFooter`] in the last 48 bytes, which the image reads at
//!   fixed physical addresses to find CR3, the long-mode entry and the
//!   per-AP stack region
//!
//! The last leg of the trampoline (compatibility mode into the 64-bit entry)
//! is pluggable through [`EntryBridge`]: either a direct far jump, which
//! needs the entry below 4 GiB, or a far call through a 64-bit call gate,
//! which reaches any canonical address.

use core::mem::{offset_of, size_of};

use thiserror::Error;
use x86_64::structures::gdt::DescriptorFlags;

use super::types::{TRAMPOLINE_PAGE_SIZE, TRAMPOLINE_SCRATCH};

pub use super::types::{TRAMPOLINE_BASE, TRAMPOLINE_VECTOR};

/// `"SIPI"` in little-endian.
pub const TRAMPOLINE_MAGIC: u32 = u32::from_le_bytes(*b"SIPI");

pub const FOOTER_SIZE: usize = size_of::<TrampolineFooter>();
pub const FOOTER_OFFSET: usize = TRAMPOLINE_PAGE_SIZE - FOOTER_SIZE;

/// Physical address of the footer as seen by the running trampoline.
pub const FOOTER_ADDR: u64 = TRAMPOLINE_BASE + FOOTER_OFFSET as u64;

// ============================================================================
// Selectors shared by the image GDT and the call-gate GDT
// ============================================================================

pub const CODE32_SELECTOR: u16 = 0x08;
pub const DATA32_SELECTOR: u16 = 0x10;
pub const CODE64_SELECTOR: u16 = 0x18;
pub const GATE_SELECTOR: u16 = 0x20;

/// null, code32, data32, code64, plus the two-slot call gate.
pub const GATE_GDT_ENTRIES: usize = 6;
pub const GATE_GDT_BYTES: usize = GATE_GDT_ENTRIES * 8;

/// Offset of the call-gate GDT inside the page (16-byte aligned, directly
/// below the footer).
pub const GATE_GDT_OFFSET: usize = (FOOTER_OFFSET - GATE_GDT_BYTES) & !0xF;

const SYSTEM_TYPE_CALL_GATE_64: u64 = 0xC;
const DESCRIPTOR_PRESENT: u64 = 1 << 47;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrampolineError {
    #[error("trampoline image is {image} bytes but only {capacity} fit in the page")]
    ImageTooLarge { image: usize, capacity: usize },
    #[error("trampoline image is empty")]
    EmptyImage,
    #[error("long-mode entry {entry:#x} is above 4 GiB and cannot be reached by a direct far jump")]
    EntryUnreachable { entry: u64 },
}

// ============================================================================
// Footer
// ============================================================================

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrampolineKind {
    /// Far jump from compatibility mode straight to the entry.
    Direct = 0,
    /// Far call through a 64-bit call gate in the page-local GDT.
    CallGate = 1,
}

impl TrampolineKind {
    pub fn bridge(self) -> &'static dyn EntryBridge {
        match self {
            TrampolineKind::Direct => &DirectBridge,
            TrampolineKind::CallGate => &CallGateBridge,
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("direct") {
            Some(TrampolineKind::Direct)
        } else if value.eq_ignore_ascii_case("callgate") || value.eq_ignore_ascii_case("call-gate") {
            Some(TrampolineKind::CallGate)
        } else {
            None
        }
    }

    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(TrampolineKind::Direct),
            1 => Some(TrampolineKind::CallGate),
            _ => None,
        }
    }
}

/// Parameters the image reads once it runs at [`TRAMPOLINE_BASE`].
///
/// Field offsets are part of the contract with the assembly image; see the
/// assertions below.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrampolineFooter {
    pub magic: u32,
    pub kind: u32,
    /// Physical address of the PML4; must be below 4 GiB (loaded from
    /// 32-bit code).
    pub page_table: u64,
    pub entry: u64,
    pub stack_base: u64,
    pub stack_size: u64,
    pub gdt_offset: u32,
    pub gdt_limit: u16,
    pub gate_selector: u16,
}

pub const FOOTER_KIND: usize = offset_of!(TrampolineFooter, kind);
pub const FOOTER_PAGE_TABLE: usize = offset_of!(TrampolineFooter, page_table);
pub const FOOTER_ENTRY: usize = offset_of!(TrampolineFooter, entry);
pub const FOOTER_STACK_BASE: usize = offset_of!(TrampolineFooter, stack_base);
pub const FOOTER_STACK_SIZE: usize = offset_of!(TrampolineFooter, stack_size);
pub const FOOTER_GDT_OFFSET: usize = offset_of!(TrampolineFooter, gdt_offset);
pub const FOOTER_GDT_LIMIT: usize = offset_of!(TrampolineFooter, gdt_limit);
pub const FOOTER_GATE_SELECTOR: usize = offset_of!(TrampolineFooter, gate_selector);

const _: () = assert!(FOOTER_SIZE == 48);
const _: () = assert!(FOOTER_KIND == 4);
const _: () = assert!(FOOTER_PAGE_TABLE == 8);
const _: () = assert!(FOOTER_ENTRY == 16);
const _: () = assert!(FOOTER_STACK_BASE == 24);
const _: () = assert!(FOOTER_STACK_SIZE == 32);
const _: () = assert!(FOOTER_GDT_OFFSET == 40);
const _: () = assert!(FOOTER_GDT_LIMIT == 44);
const _: () = assert!(FOOTER_GATE_SELECTOR == 46);

impl TrampolineFooter {
    pub fn kind(&self) -> Option<TrampolineKind> {
        TrampolineKind::from_raw(self.kind)
    }

    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut out = [0u8; FOOTER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[FOOTER_KIND..FOOTER_KIND + 4].copy_from_slice(&self.kind.to_le_bytes());
        out[FOOTER_PAGE_TABLE..FOOTER_PAGE_TABLE + 8].copy_from_slice(&self.page_table.to_le_bytes());
        out[FOOTER_ENTRY..FOOTER_ENTRY + 8].copy_from_slice(&self.entry.to_le_bytes());
        out[FOOTER_STACK_BASE..FOOTER_STACK_BASE + 8].copy_from_slice(&self.stack_base.to_le_bytes());
        out[FOOTER_STACK_SIZE..FOOTER_STACK_SIZE + 8].copy_from_slice(&self.stack_size.to_le_bytes());
        out[FOOTER_GDT_OFFSET..FOOTER_GDT_OFFSET + 4].copy_from_slice(&self.gdt_offset.to_le_bytes());
        out[FOOTER_GDT_LIMIT..FOOTER_GDT_LIMIT + 2].copy_from_slice(&self.gdt_limit.to_le_bytes());
        out[FOOTER_GATE_SELECTOR..FOOTER_GATE_SELECTOR + 2]
            .copy_from_slice(&self.gate_selector.to_le_bytes());
        out
    }

    /// Parses a footer, returning `None` unless the magic matches.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; FOOTER_SIZE] = bytes.get(..FOOTER_SIZE)?.try_into().ok()?;
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let u64_at = |at: usize| u64::from(u32_at(at)) | (u64::from(u32_at(at + 4)) << 32);

        let footer = Self {
            magic: u32_at(0),
            kind: u32_at(FOOTER_KIND),
            page_table: u64_at(FOOTER_PAGE_TABLE),
            entry: u64_at(FOOTER_ENTRY),
            stack_base: u64_at(FOOTER_STACK_BASE),
            stack_size: u64_at(FOOTER_STACK_SIZE),
            gdt_offset: u32_at(FOOTER_GDT_OFFSET),
            gdt_limit: u16_at(FOOTER_GDT_LIMIT),
            gate_selector: u16_at(FOOTER_GATE_SELECTOR),
        };
        (footer.magic == TRAMPOLINE_MAGIC).then_some(footer)
    }
}

// ============================================================================
// Source and page
// ============================================================================

/// What the platform hands the builder: the raw image and the values the
/// image needs after it reaches long mode.
#[derive(Clone, Copy, Debug)]
pub struct TrampolineSource {
    pub image: &'static [u8],
    pub entry: u64,
    pub page_table: u64,
    /// Base of the per-AP stack array; AP `n` (by APIC id) uses
    /// `stack_base + n * stack_size .. stack_base + (n + 1) * stack_size`.
    pub stack_base: u64,
    pub stack_size: u64,
}

pub struct TrampolinePage {
    bytes: [u8; TRAMPOLINE_PAGE_SIZE],
}

impl TrampolinePage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn footer(&self) -> Option<TrampolineFooter> {
        TrampolineFooter::from_bytes(&self.bytes[FOOTER_OFFSET..])
    }
}

/// Final leg of the trampoline, from compatibility mode into the entry.
pub trait EntryBridge: Sync {
    fn kind(&self) -> TrampolineKind;

    /// Highest image length that leaves room for the scratch stack and
    /// whatever this bridge places in the page.
    fn image_capacity(&self) -> usize;

    /// Writes bridge structures into `page` and fills the bridge fields of
    /// `footer`.
    fn prepare(
        &self,
        page: &mut [u8; TRAMPOLINE_PAGE_SIZE],
        footer: &mut TrampolineFooter,
    ) -> Result<(), TrampolineError>;
}

pub struct DirectBridge;

impl EntryBridge for DirectBridge {
    fn kind(&self) -> TrampolineKind {
        TrampolineKind::Direct
    }

    fn image_capacity(&self) -> usize {
        FOOTER_OFFSET - TRAMPOLINE_SCRATCH
    }

    fn prepare(
        &self,
        _page: &mut [u8; TRAMPOLINE_PAGE_SIZE],
        footer: &mut TrampolineFooter,
    ) -> Result<(), TrampolineError> {
        if footer.entry > u64::from(u32::MAX) {
            return Err(TrampolineError::EntryUnreachable { entry: footer.entry });
        }
        Ok(())
    }
}

pub struct CallGateBridge;

impl EntryBridge for CallGateBridge {
    fn kind(&self) -> TrampolineKind {
        TrampolineKind::CallGate
    }

    fn image_capacity(&self) -> usize {
        GATE_GDT_OFFSET - TRAMPOLINE_SCRATCH
    }

    fn prepare(
        &self,
        page: &mut [u8; TRAMPOLINE_PAGE_SIZE],
        footer: &mut TrampolineFooter,
    ) -> Result<(), TrampolineError> {
        let [gate_low, gate_high] = call_gate_descriptor(footer.entry, CODE64_SELECTOR);
        let entries: [u64; GATE_GDT_ENTRIES] = [
            0,
            DescriptorFlags::KERNEL_CODE32.bits(),
            DescriptorFlags::KERNEL_DATA.bits(),
            DescriptorFlags::KERNEL_CODE64.bits(),
            gate_low,
            gate_high,
        ];

        for (slot, entry) in page[GATE_GDT_OFFSET..GATE_GDT_OFFSET + GATE_GDT_BYTES]
            .chunks_exact_mut(8)
            .zip(entries)
        {
            slot.copy_from_slice(&entry.to_le_bytes());
        }

        footer.gdt_offset = GATE_GDT_OFFSET as u32;
        footer.gdt_limit = (GATE_GDT_BYTES - 1) as u16;
        footer.gate_selector = GATE_SELECTOR;
        Ok(())
    }
}

/// Encodes a 64-bit call gate (DPL 0) targeting `selector:target`.
pub const fn call_gate_descriptor(target: u64, selector: u16) -> [u64; 2] {
    let low = (target & 0xFFFF)
        | ((selector as u64) << 16)
        | (SYSTEM_TYPE_CALL_GATE_64 << 40)
        | DESCRIPTOR_PRESENT
        | (((target >> 16) & 0xFFFF) << 48);
    let high = target >> 32;
    [low, high]
}

/// Lays out the complete page for `source` using `bridge`.
///
/// Everything outside the image, bridge area and footer is zero, so nothing
/// from a previous page survives the copy.
pub fn build_page(
    source: &TrampolineSource,
    bridge: &dyn EntryBridge,
) -> Result<TrampolinePage, TrampolineError> {
    let image = source.image;
    if image.is_empty() {
        return Err(TrampolineError::EmptyImage);
    }

    let capacity = bridge.image_capacity();
    if image.len() > capacity {
        return Err(TrampolineError::ImageTooLarge {
            image: image.len(),
            capacity,
        });
    }

    let mut page = TrampolinePage {
        bytes: [0; TRAMPOLINE_PAGE_SIZE],
    };
    page.bytes[..image.len()].copy_from_slice(image);

    let mut footer = TrampolineFooter {
        magic: TRAMPOLINE_MAGIC,
        kind: bridge.kind() as u32,
        page_table: source.page_table,
        entry: source.entry,
        stack_base: source.stack_base,
        stack_size: source.stack_size,
        gdt_offset: 0,
        gdt_limit: 0,
        gate_selector: 0,
    };
    bridge.prepare(&mut page.bytes, &mut footer)?;
    page.bytes[FOOTER_OFFSET..].copy_from_slice(&footer.to_bytes());

    Ok(page)
}
