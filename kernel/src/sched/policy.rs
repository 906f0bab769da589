//! Scheduler strategy object (spec.md §3 "Scheduler", §9 "function
//! pointers as policy" note: encoded here as a trait object with a stable
//! vtable rather than raw function pointers).

extern crate alloc;

use crate::sched::task::Task;

/// A scheduling policy, totally ordered against its siblings by
/// [`Scheduler::priority`] (descending).
pub trait Scheduler: Send {
    fn priority(&self) -> u8;
    fn policy_name(&self) -> &'static str;

    /// Add a task to this scheduler's `new` queue.
    fn enqueue_task(&mut self, task: Task) -> Result<(), Task>;

    /// Pick the next task to run, or `None` if this scheduler has nothing
    /// runnable right now.
    fn pick_next_task(&mut self, now_ns: u64) -> Option<usize>;

    /// Move a task from `new`/blocked state into `run`/`idle`.
    fn wake_next_task(&mut self, now_ns: u64);

    /// Length of the timeslice granted to the task last returned by
    /// `pick_next_task`.
    fn timeslice_ns(&self, task_index: usize) -> u64;

    /// Nearest time at which any currently-idle task in this scheduler
    /// becomes ready, used to clamp the overall timeslice.
    fn task_ready_ns(&self, now_ns: u64) -> Option<u64>;

    fn task(&self, index: usize) -> &Task;
    fn task_mut(&mut self, index: usize) -> &mut Task;
    fn task_count(&self) -> usize;
}
