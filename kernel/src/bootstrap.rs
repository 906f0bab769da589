//! Boot sequence (spec.md §2 "Data flow"): wires the memory, interrupt,
//! timer and scheduler layers together in dependency order.
//!
//! Concrete register maps, the boot-time physical memory probe and
//! board-support-package entry points are outside this crate's scope
//! (spec.md §1); what lives here is the ordering the rest of the core
//! depends on: buddy pools are registered into the page map (L0 -> L1)
//! before the scheduler (L6) runs, and the tick device (L5) must already
//! be calibrated before the scheduler core is handed a `tick_min_ns` to
//! clamp timeslices against.

extern crate alloc;

use alloc::boxed::Box;

use crate::error::KernelResult;
use crate::irq::Dispatcher;
use crate::mm::{Edac, PageMap};
use crate::sched::edf::EdfScheduler;
use crate::sched::round_robin::RoundRobinScheduler;
use crate::sched::Core;
use crate::timer::{ClockEventDevice, TickDevice};

/// Priority of the EDF scheduler relative to the round-robin fallback used
/// for kernel-internal housekeeping threads (spec.md §4.7b).
pub const EDF_PRIORITY: u8 = 100;
pub const ROUND_ROBIN_PRIORITY: u8 = 10;
pub const ROUND_ROBIN_PRIORITY_CLASSES: usize = 4;
pub const ROUND_ROBIN_QUANTUM_NS: u64 = 10_000_000;

/// A physical region to register into the page map: `(start, end,
/// page_size)`, per [`PageMap::add`].
pub type MemoryRegion = (usize, usize, usize);

/// Everything [`kernel_init`] assembles. The caller (a board support
/// package's `main`) drives the scheduling loop from here, and registers
/// concrete drivers (SpaceWire cores, proc-nets) against the page map and
/// IRQ dispatcher returned inside.
pub struct Runtime<D: ClockEventDevice> {
    pub page_map: PageMap,
    pub edac: Edac,
    pub irq: Dispatcher,
    pub tick: TickDevice<D>,
    pub core: Core,
}

/// Boot sequence (spec.md §2): register the buddy pools backing physical
/// memory into a fresh page map (L0 -> L1), bring up the IRQ dispatcher
/// (L4) and an already-calibrated tick device (L5), and register the EDF
/// and round-robin scheduler policies (L6) in priority order.
///
/// The SRMMU (L3) and kmalloc (L2) are intentionally not constructed here:
/// both are generic over a `PageSource`/`TablePageSource` that only a
/// concrete board support package can provide (a live register map, or
/// this crate's own page map wired as the page source); callers construct
/// those directly from the `page_map` this returns.
pub fn kernel_init<D: ClockEventDevice>(
    regions: &[MemoryRegion],
    tick: TickDevice<D>,
    cpu: usize,
) -> KernelResult<Runtime<D>> {
    crate::println!("[BOOTSTRAP] stage 1: memory management");
    let mut page_map = PageMap::new();
    for &(start, end, page_size) in regions {
        page_map.add(start, end, page_size)?;
    }
    crate::println!(
        "[BOOTSTRAP] page map: {} region(s), {} bytes free",
        regions.len(),
        page_map.total_free_bytes()
    );

    let edac = Edac::new();

    crate::println!("[BOOTSTRAP] stage 2: interrupt dispatch");
    let irq = Dispatcher::new(cpu);

    crate::println!(
        "[BOOTSTRAP] stage 3: tick device, tick_period_min_ns={}",
        tick.tick_period_min_ns
    );

    crate::println!("[BOOTSTRAP] stage 4: scheduler core");
    let mut core = Core::new(tick.tick_period_min_ns);
    core.register(Box::new(EdfScheduler::new(
        EDF_PRIORITY,
        tick.tick_period_min_ns,
    )));
    core.register(Box::new(RoundRobinScheduler::new(
        ROUND_ROBIN_PRIORITY,
        ROUND_ROBIN_QUANTUM_NS,
        ROUND_ROBIN_PRIORITY_CLASSES,
    )));

    crate::println!("[BOOTSTRAP] boot sequence complete");
    Ok(Runtime {
        page_map,
        edac,
        irq,
        tick,
        core,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::{Policy, SchedAttr, Task};
    use crate::timer::{Features, State};

    use alloc::alloc::{alloc as heap_alloc, Layout};

    struct FakeDevice {
        last_ticks: u64,
    }

    fn backing(size: usize) -> usize {
        let layout = Layout::from_size_align(size, size.next_power_of_two()).unwrap();
        // SAFETY: layout is non-zero sized; leaked for the test's lifetime.
        (unsafe { heap_alloc(layout) }) as usize
    }

    impl ClockEventDevice for FakeDevice {
        fn features(&self) -> Features {
            Features::ONESHOT
        }
        fn min_delta_ns(&self) -> u64 {
            1_000
        }
        fn max_delta_ns(&self) -> u64 {
            1_000_000_000
        }
        fn mult(&self) -> u64 {
            1
        }
        fn set_next_event(&mut self, ticks: u64) {
            self.last_ticks = ticks;
        }
        fn set_state(&mut self, _state: State) -> bool {
            true
        }
    }

    /// End-to-end boot sequence scenario (spec.md §8 scenario 3): a task
    /// set admitted and dispatched without a deadline miss, driven through
    /// the runtime this module assembles rather than the policy directly.
    #[test]
    fn boot_sequence_admits_and_dispatches_edf_tasks() {
        let mut tick = TickDevice::new(FakeDevice { last_ticks: 0 });
        tick.tick_period_min_ns = 1_000;

        let base = backing(1 << 20);
        let mut runtime =
            kernel_init(&[(base, base + (1 << 20), 4096)], tick, 0).expect("boot sequence");

        assert_eq!(
            runtime.page_map.total_free_bytes(),
            runtime.page_map.total_bytes()
        );

        let attr_a = SchedAttr {
            policy: Policy::Edf,
            priority: 10,
            period_ns: 100_000_000,
            wcet_ns: 30_000_000,
            deadline_rel_ns: 99_000_000,
        };
        let edf = runtime.core.scheduler_mut(0);
        assert_eq!(edf.policy_name(), "edf");
        edf.enqueue_task(Task::new("periodic-a", 0, attr_a)).unwrap();

        let dispatch = runtime.core.schedule(0, 0).unwrap();
        assert_eq!(dispatch.scheduler_index, 0);
    }

    #[test]
    fn kernel_init_rejects_overlapping_regions() {
        let mut tick = TickDevice::new(FakeDevice { last_ticks: 0 });
        tick.tick_period_min_ns = 1_000;
        let base = backing(1 << 20);
        let regions = [
            (base, base + (1 << 18), 4096),
            (base + (1 << 17), base + (1 << 19), 4096),
        ];
        assert!(kernel_init(&regions, tick, 0).is_err());
    }
}
