//! SMP Shared State
//!
//! Everything the CPUs coordinate through: the online and active counters,
//! the logical-to-hardware id map, the single pending remote-call slot and
//! the lock that serializes initiators. One [`SharedState`] lives inside each
//! [`Smp`](super::Smp) instance.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use super::types::{BringupPhase, MAX_CPUS};

const UNASSIGNED: u32 = u32::MAX;

// ============================================================================
// Logical CPU map
// ============================================================================

/// Dense logical index to hardware APIC id.
///
/// Index 0 is the primary CPU. Secondaries claim the next free index when
/// they register, so indices are handed out in registration order and never
/// reused.
pub struct CpuMap {
    hw_ids: [AtomicU32; MAX_CPUS],
    claimed: AtomicUsize,
}

impl CpuMap {
    pub const fn new() -> Self {
        Self {
            hw_ids: [const { AtomicU32::new(UNASSIGNED) }; MAX_CPUS],
            claimed: AtomicUsize::new(1),
        }
    }

    pub fn set_boot(&self, hw_id: u32) {
        self.hw_ids[0].store(hw_id, Ordering::Release);
    }

    /// Records `hw_id` as the primary if slot 0 is still empty. Returns
    /// whether this call filled it.
    pub fn record_boot(&self, hw_id: u32) -> bool {
        self.hw_ids[0].load(Ordering::Acquire) == UNASSIGNED
            && self.hw_ids[0]
                .compare_exchange(UNASSIGNED, hw_id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Reserves the next logical index for `hw_id` and publishes the mapping.
    pub fn claim(&self, hw_id: u32) -> usize {
        let index = self.claimed.fetch_add(1, Ordering::AcqRel);
        assert!(
            index < MAX_CPUS,
            "SMP: CPU with APIC id {:#x} exceeds MAX_CPUS ({})",
            hw_id,
            MAX_CPUS
        );
        self.hw_ids[index].store(hw_id, Ordering::Release);
        index
    }

    pub fn hardware_id(&self, index: usize) -> Option<u32> {
        let id = self.hw_ids.get(index)?.load(Ordering::Acquire);
        (id != UNASSIGNED).then_some(id)
    }

    pub fn index_of(&self, hw_id: u32) -> Option<usize> {
        let limit = self.claimed.load(Ordering::Acquire).min(MAX_CPUS);
        (0..limit).find(|&index| self.hw_ids[index].load(Ordering::Acquire) == hw_id)
    }

    /// Number of indices handed out so far, the primary included.
    pub fn assigned(&self) -> usize {
        self.claimed.load(Ordering::Acquire).min(MAX_CPUS)
    }
}

impl Default for CpuMap {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Pending remote call
// ============================================================================

/// Type-erased function plus its argument.
#[derive(Clone, Copy)]
pub(crate) struct RemoteCall {
    pub call: unsafe fn(*const ()),
    pub data: *const (),
    pub wait: bool,
}

impl RemoteCall {
    /// Erases `func`. The caller keeps `func` alive until the call has run.
    pub fn borrowed<F: Fn() + Sync>(func: &F, wait: bool) -> Self {
        unsafe fn trampoline<F: Fn()>(data: *const ()) {
            // SAFETY: `data` was produced from `&F` in `borrowed`.
            unsafe { (*data.cast::<F>())() }
        }

        Self {
            call: trampoline::<F>,
            data: (func as *const F).cast(),
            wait,
        }
    }

    /// # Safety
    /// The referent behind `data` must still be alive.
    pub unsafe fn run(self) {
        unsafe { (self.call)(self.data) }
    }
}

/// The one-slot descriptor the initiator fills and the target consumes.
pub(crate) struct PendingCall {
    slot: UnsafeCell<Option<RemoteCall>>,
    done: AtomicBool,
}

// SAFETY: `slot` is written only by the lock holder before the IPI is sent
// and read only by the target after delivery; `done` orders the hand-back.
unsafe impl Sync for PendingCall {}
unsafe impl Send for PendingCall {}

impl PendingCall {
    pub const fn new() -> Self {
        Self {
            slot: UnsafeCell::new(None),
            done: AtomicBool::new(true),
        }
    }

    /// # Safety
    /// Caller holds the IPI lock and the previous call has signalled done.
    pub unsafe fn publish(&self, call: RemoteCall) {
        self.done.store(false, Ordering::Relaxed);
        unsafe { *self.slot.get() = Some(call) };
    }

    /// # Safety
    /// Only the CPU the pending call was addressed to may take it.
    pub unsafe fn take(&self) -> Option<RemoteCall> {
        unsafe { (*self.slot.get()).take() }
    }

    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Default)]
pub struct RemoteCallStats {
    pub sync_sent: AtomicU64,
    pub async_sent: AtomicU64,
    pub local_calls: AtomicU64,
    pub handled: AtomicU64,
    pub spurious: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteCallSnapshot {
    pub sync_sent: u64,
    pub async_sent: u64,
    pub local_calls: u64,
    pub handled: u64,
    pub spurious: u64,
}

impl RemoteCallStats {
    pub const fn new() -> Self {
        Self {
            sync_sent: AtomicU64::new(0),
            async_sent: AtomicU64::new(0),
            local_calls: AtomicU64::new(0),
            handled: AtomicU64::new(0),
            spurious: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> RemoteCallSnapshot {
        RemoteCallSnapshot {
            sync_sent: self.sync_sent.load(Ordering::Relaxed),
            async_sent: self.async_sent.load(Ordering::Relaxed),
            local_calls: self.local_calls.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            spurious: self.spurious.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Aggregate
// ============================================================================

pub(crate) struct SharedState {
    /// Discovered CPU count; 1 until bring-up reads it from the platform.
    pub cpu_total: AtomicUsize,
    /// CPUs that completed registration, the primary included.
    pub online: AtomicUsize,
    /// Remote calls in flight plus 1 for the quiescent baseline.
    pub active: AtomicUsize,
    /// Set once the primary has added itself to `active`.
    pub baseline_marked: AtomicBool,
    pub phase: AtomicU8,
    pub ipi_lock: Mutex<()>,
    pub pending: PendingCall,
    pub cpus: CpuMap,
    pub stats: RemoteCallStats,
}

impl SharedState {
    pub const fn new() -> Self {
        Self {
            cpu_total: AtomicUsize::new(1),
            online: AtomicUsize::new(1),
            active: AtomicUsize::new(0),
            baseline_marked: AtomicBool::new(false),
            phase: AtomicU8::new(BringupPhase::Idle as u8),
            ipi_lock: Mutex::new(()),
            pending: PendingCall::new(),
            cpus: CpuMap::new(),
            stats: RemoteCallStats::new(),
        }
    }

    pub fn phase(&self) -> BringupPhase {
        BringupPhase::from_atomic(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: BringupPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}
