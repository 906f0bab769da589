//! Architecture-neutral primitives the rest of the core builds on.
//!
//! The concrete LEON3/4 register maps, the SRMMU ASI accessors, and the trap
//! table entry for vector 0x9 are board/BSP concerns outside this crate's
//! scope (spec.md §1). What lives here is the narrow interface those
//! concerns are expected to present: an IRQ mask/unmask pair per CPU (used
//! by every spinlock in the allocators, the IRQ dispatcher and the
//! scheduler) and a big-endian MMIO accessor trait (used by the SRMMU table
//! encoder and the SpaceWire driver), per the "hardware I/O accessors"
//! design note in spec.md §9.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Upper bound on `CONFIG_SMP_CPUS_MAX` this build can address; a real
/// board's BSP binds the runtime CPU count below this at boot.
const MAX_CPUS: usize = 8;

/// Number of CPUs this build is configured for (`CONFIG_SMP_CPUS_MAX`).
#[cfg(feature = "smp")]
pub const SMP_CPUS_MAX: usize = 2;
#[cfg(not(feature = "smp"))]
pub const SMP_CPUS_MAX: usize = 1;

/// Per-CPU IRQ mask nesting counter, standing in for the real
/// `local_irq_save`/`local_irq_restore` pair on bare metal. Interrupts are
/// considered masked on a CPU whenever its counter is non-zero; the counter
/// lets the save/restore pair nest, matching every caller in this crate that
/// wraps a critical section in a matched pair of calls.
static IRQ_MASK_DEPTH: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];

/// Opaque token proving interrupts were masked by [`local_irq_save`].
/// Prefer the RAII [`crate::raii::IrqGuard`] wrapper over calling
/// [`local_irq_restore`] manually.
#[derive(Debug, Clone, Copy)]
pub struct IrqFlags {
    cpu: usize,
}

/// Mask all interrupt lines on the calling CPU and return a token to restore
/// the previous state. Nests: a CPU that already holds N masks now holds
/// N+1, and is only truly unmasked once all are restored.
pub fn local_irq_save(cpu: usize) -> IrqFlags {
    let cpu = cpu % MAX_CPUS;
    IRQ_MASK_DEPTH[cpu].fetch_add(1, Ordering::AcqRel);
    IrqFlags { cpu }
}

/// Restore the interrupt mask state captured by `flags`.
pub fn local_irq_restore(flags: IrqFlags) {
    IRQ_MASK_DEPTH[flags.cpu].fetch_sub(1, Ordering::AcqRel);
}

/// True if the calling CPU currently has interrupts masked.
pub fn irqs_masked(cpu: usize) -> bool {
    IRQ_MASK_DEPTH[cpu % MAX_CPUS].load(Ordering::Acquire) != 0
}

/// Monotonic nanosecond counter since boot (glossary "ktime"), backing the
/// per-CPU clock source the tick device and the log service timestamp
/// against. A real board drives this from a free-running hardware counter;
/// here it is an atomic updated by [`ktime_advance_ns`], which the tick
/// device's interrupt handler calls on every programmed event.
static KTIME_NS: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// Current value of the monotonic boot-time nanosecond counter.
pub fn ktime_get_ns() -> u64 {
    KTIME_NS.load(Ordering::Acquire)
}

/// Advance the monotonic counter; called from the tick device's interrupt
/// path (or directly by tests/a host harness).
pub fn ktime_advance_ns(delta_ns: u64) {
    KTIME_NS.fetch_add(delta_ns, Ordering::AcqRel);
}

/// Big-endian MMIO accessor over a device register block.
///
/// All LEON3/4 peripheral registers (SRMMU table words, GRSPW2 descriptors,
/// the IRL controller) are big-endian 32-bit words (spec.md §6). A concrete
/// implementation owns the base pointer to the register block; this crate
/// only ever goes through the trait so the SRMMU and SpaceWire code is
/// testable against an in-memory double instead of real silicon.
///
/// # Safety
/// Implementors must guarantee `offset` is within the mapped register block
/// and naturally aligned for a 32-bit access.
pub unsafe trait MmioBus {
    /// Read a big-endian 32-bit word at byte `offset`.
    fn read_be32(&self, offset: usize) -> u32;
    /// Write a big-endian 32-bit word at byte `offset`.
    fn write_be32(&mut self, offset: usize, value: u32);
}

#[cfg(feature = "alloc")]
pub use host_bus::MemoryBus;

/// A plain byte-buffer-backed [`MmioBus`], used throughout this crate's test
/// suite as the "test double" spec.md §4.4 explicitly allows in place of a
/// real register block (e.g. `release_pages`'s page-deallocator callback, or
/// a GRSPW2 core under test).
#[cfg(feature = "alloc")]
mod host_bus {
    use super::MmioBus;
    use alloc::vec::Vec;

    pub struct MemoryBus {
        words: Vec<u32>,
    }

    impl MemoryBus {
        pub fn new(word_count: usize) -> Self {
            Self {
                words: alloc::vec![0u32; word_count],
            }
        }
    }

    // SAFETY: `words` is a heap Vec sized at construction and every offset
    // used within this crate's tests stays within that range; a panicking
    // index is an acceptable failure mode for a host-only test double.
    unsafe impl MmioBus for MemoryBus {
        fn read_be32(&self, offset: usize) -> u32 {
            self.words[offset / 4]
        }

        fn write_be32(&mut self, offset: usize, value: u32) {
            self.words[offset / 4] = value;
        }
    }
}
