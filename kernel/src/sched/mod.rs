//! Scheduler core (spec.md §4.7, L6): a priority-ordered policy list, a
//! per-CPU current task, `schedule()`/`sched_yield`/`sched_maybe_yield`.

extern crate alloc;

pub mod edf;
pub mod policy;
pub mod round_robin;
pub mod task;

use alloc::boxed::Box;
use alloc::vec::Vec;

use policy::Scheduler;
use task::TaskState;

/// Result of one `schedule()` call: which scheduler/task is now current,
/// and the timeslice programmed into the tick device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub scheduler_index: usize,
    pub task_index: usize,
    pub timeslice_ns: u64,
    pub switched: bool,
}

/// A single CPU's scheduler core: the priority-sorted policy list plus the
/// currently running (scheduler, task) pair.
pub struct Core {
    schedulers: Vec<Box<dyn Scheduler>>,
    current: Option<(usize, usize)>,
    tick_min_ns: u64,
}

impl Core {
    pub fn new(tick_min_ns: u64) -> Self {
        Self {
            schedulers: Vec::new(),
            current: None,
            tick_min_ns,
        }
    }

    /// Register a scheduler, keeping the list sorted by priority
    /// (descending).
    pub fn register(&mut self, scheduler: Box<dyn Scheduler>) {
        let pos = self
            .schedulers
            .iter()
            .position(|s| s.priority() < scheduler.priority())
            .unwrap_or(self.schedulers.len());
        self.schedulers.insert(pos, scheduler);
    }

    /// `schedule()`: runs with interrupts disabled and the per-CPU core
    /// lock held (the caller is expected to hold an
    /// [`crate::raii::IrqGuard`] for the duration).
    pub fn schedule(&mut self, now_ns: u64, elapsed_ns: u64) -> Option<Dispatch> {
        // (a) account the running task's elapsed runtime, demote busy -> run.
        if let Some((sidx, tidx)) = self.current {
            let task = self.schedulers[sidx].task_mut(tidx);
            task.runtime_ns = task.runtime_ns.saturating_sub(elapsed_ns);
            task.total_ns += elapsed_ns;
            if task.state == TaskState::Busy {
                task.state = TaskState::Run;
            }
        }

        for s in &mut self.schedulers {
            s.wake_next_task(now_ns);
        }

        // (b) walk the scheduler list in priority order, stop at first hit.
        let mut chosen: Option<(usize, usize)> = None;
        for (sidx, s) in self.schedulers.iter_mut().enumerate() {
            if let Some(tidx) = s.pick_next_task(now_ns) {
                chosen = Some((sidx, tidx));
                break;
            }
        }
        let (sidx, tidx) = chosen?;

        // (c) nearest task_ready_ns across all schedulers at or above the
        // chosen scheduler's priority, clamping the timeslice.
        let chosen_priority = self.schedulers[sidx].priority();
        let mut slice = self.schedulers[sidx].timeslice_ns(tidx);
        for s in &self.schedulers {
            if s.priority() >= chosen_priority {
                if let Some(ready_ns) = s.task_ready_ns(now_ns) {
                    slice = slice.min(ready_ns);
                }
            }
        }

        // (d) program the tick for slice - tick_min to account for
        // scheduling overhead.
        let programmed = slice.saturating_sub(self.tick_min_ns);

        let switched = self.current != Some((sidx, tidx));
        self.current = Some((sidx, tidx));

        Some(Dispatch {
            scheduler_index: sidx,
            task_index: tidx,
            timeslice_ns: programmed,
            switched,
        })
    }

    /// `sched_yield()`: zero the current task's remaining runtime and
    /// re-schedule.
    pub fn sched_yield(&mut self, now_ns: u64) -> Option<Dispatch> {
        if let Some((sidx, tidx)) = self.current {
            self.schedulers[sidx].task_mut(tidx).runtime_ns = 0;
        }
        self.schedule(now_ns, 0)
    }

    /// `sched_maybe_yield(frac)`: yield only if remaining runtime exceeds
    /// `wcet / frac`.
    pub fn sched_maybe_yield(&mut self, now_ns: u64, frac: u64) -> Option<Dispatch> {
        if let Some((sidx, tidx)) = self.current {
            let task = self.schedulers[sidx].task(tidx);
            if task.runtime_ns > task.attr.wcet_ns / frac.max(1) {
                return self.sched_yield(now_ns);
            }
        }
        None
    }

    pub fn current(&self) -> Option<(usize, usize)> {
        self.current
    }

    pub fn scheduler(&self, index: usize) -> &dyn Scheduler {
        self.schedulers[index].as_ref()
    }

    pub fn scheduler_mut(&mut self, index: usize) -> &mut dyn Scheduler {
        self.schedulers[index].as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edf::EdfScheduler;
    use round_robin::RoundRobinScheduler;
    use task::{Policy, SchedAttr, Task};

    fn rr_attr() -> SchedAttr {
        SchedAttr {
            policy: Policy::RoundRobin,
            priority: 0,
            period_ns: 0,
            wcet_ns: 0,
            deadline_rel_ns: 0,
        }
    }

    #[test]
    fn higher_priority_scheduler_is_consulted_first() {
        let mut core = Core::new(1_000);
        let mut rr = RoundRobinScheduler::new(10, 1_000_000, 1);
        rr.enqueue_task(Task::new("rr-task", 0, rr_attr())).unwrap();
        core.register(Box::new(rr));

        let mut edf = EdfScheduler::new(100, 1_000);
        let edf_attr = SchedAttr {
            policy: Policy::Edf,
            priority: 50,
            period_ns: 1_000_000,
            wcet_ns: 100_000,
            deadline_rel_ns: 900_000,
        };
        let mut t = Task::new("edf-task", 0, edf_attr);
        t.state = TaskState::New;
        edf.enqueue_task(t).unwrap();
        core.register(Box::new(edf));

        let dispatch = core.schedule(0, 0).unwrap();
        assert_eq!(core.scheduler(dispatch.scheduler_index).priority(), 100);
    }

    #[test]
    fn round_robin_falls_back_when_nothing_else_runnable() {
        let mut core = Core::new(1_000);
        let mut rr = RoundRobinScheduler::new(10, 1_000_000, 1);
        rr.enqueue_task(Task::new("rr-task", 0, rr_attr())).unwrap();
        core.register(Box::new(rr));

        let dispatch = core.schedule(0, 0).unwrap();
        assert_eq!(dispatch.scheduler_index, 0);
    }
}
