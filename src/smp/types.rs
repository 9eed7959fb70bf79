//! SMP Type Definitions
//!
//! Constants shared by the bring-up sequencer, the trampoline builder and the
//! remote-call dispatcher, plus the bring-up phase marker.

use crate::lapic;

/// Upper bound on logical CPUs; sizes the logical-to-hardware id map.
pub const MAX_CPUS: usize = 256;

/// Vector the remote-call stub is installed on.
pub const IPI_VECTOR: u8 = 0x20;

/// Vector field of the INIT command. The controller ignores it for INIT
/// delivery; zero is what gets written.
pub const INIT_VECTOR: u8 = 0;

/// Trampoline configuration
pub const TRAMPOLINE_BASE: u64 = 0x8000;
pub const TRAMPOLINE_PAGE_SIZE: usize = 4096;
pub const TRAMPOLINE_VECTOR: u8 = lapic::startup_vector(TRAMPOLINE_BASE);

/// Bytes left free after the trampoline image for the APs' shared far-call scratch stack.
pub const TRAMPOLINE_SCRATCH: usize = 64;

/// Per-AP stack handed out by the x86_64 backend.
pub const AP_STACK_SIZE: usize = 4 * 4096;

// STARTUP only carries a page number below 1 MiB.
const _: () = assert!(TRAMPOLINE_BASE % TRAMPOLINE_PAGE_SIZE as u64 == 0);
const _: () = assert!(TRAMPOLINE_BASE < 0x10_0000);
const _: () = assert!(TRAMPOLINE_VECTOR as u64 == TRAMPOLINE_BASE >> 12);

/// Where the primary CPU is in the bring-up sequence.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BringupPhase {
    /// Nothing sent yet.
    Idle = 0,
    /// `ap_init` claimed the sequence; trampoline not yet in place.
    Starting = 1,
    /// Trampoline page copied to low memory.
    TrampolineInstalled = 2,
    /// INIT broadcast sent, settling delay in progress.
    InitSent = 3,
    /// STARTUP pulse(s) sent.
    StartupSent = 4,
    /// Spinning until the online count reaches the discovered count.
    WaitingOnline = 5,
    /// Every discovered CPU registered.
    Complete = 6,
}

impl BringupPhase {
    pub fn from_atomic(val: u8) -> Self {
        match val {
            1 => BringupPhase::Starting,
            2 => BringupPhase::TrampolineInstalled,
            3 => BringupPhase::InitSent,
            4 => BringupPhase::StartupSent,
            5 => BringupPhase::WaitingOnline,
            6 => BringupPhase::Complete,
            _ => BringupPhase::Idle,
        }
    }
}
