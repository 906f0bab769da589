//! Round-robin fallback policy (spec.md §4.7b): a static-priority FIFO,
//! timeslice equal to a configured quantum. Used as a fallback and for
//! kernel-internal housekeeping threads.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::sched::policy::Scheduler;
use crate::sched::task::{Task, TaskState};

pub struct RoundRobinScheduler {
    priority: u8,
    quantum_ns: u64,
    tasks: Vec<Task>,
    /// FIFO of task indices per priority class, highest class first.
    classes: Vec<VecDeque<usize>>,
}

impl RoundRobinScheduler {
    pub fn new(priority: u8, quantum_ns: u64, priority_classes: usize) -> Self {
        Self {
            priority,
            quantum_ns,
            tasks: Vec::new(),
            classes: (0..priority_classes).map(|_| VecDeque::new()).collect(),
        }
    }
}

impl Scheduler for RoundRobinScheduler {
    fn priority(&self) -> u8 {
        self.priority
    }

    fn policy_name(&self) -> &'static str {
        "round-robin"
    }

    fn enqueue_task(&mut self, mut task: Task) -> Result<(), Task> {
        let class = (task.attr.priority as usize).min(self.classes.len() - 1);
        task.state = TaskState::Idle;
        let idx = self.tasks.len();
        self.tasks.push(task);
        self.classes[class].push_back(idx);
        Ok(())
    }

    fn wake_next_task(&mut self, _now_ns: u64) {
        // Round-robin tasks are always ready; nothing to wake.
    }

    fn pick_next_task(&mut self, _now_ns: u64) -> Option<usize> {
        for class in self.classes.iter_mut().rev() {
            if let Some(idx) = class.pop_front() {
                class.push_back(idx);
                self.tasks[idx].state = TaskState::Run;
                self.tasks[idx].runtime_ns = self.quantum_ns;
                return Some(idx);
            }
        }
        None
    }

    fn timeslice_ns(&self, _task_index: usize) -> u64 {
        self.quantum_ns
    }

    fn task_ready_ns(&self, _now_ns: u64) -> Option<u64> {
        Some(0)
    }

    fn task(&self, index: usize) -> &Task {
        &self.tasks[index]
    }

    fn task_mut(&mut self, index: usize) -> &mut Task {
        &mut self.tasks[index]
    }

    fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::{Policy, SchedAttr};

    fn attr() -> SchedAttr {
        SchedAttr {
            policy: Policy::RoundRobin,
            priority: 0,
            period_ns: 0,
            wcet_ns: 0,
            deadline_rel_ns: 0,
        }
    }

    #[test]
    fn pick_next_rotates_head_of_highest_class() {
        let mut sched = RoundRobinScheduler::new(10, 1_000_000, 1);
        sched.enqueue_task(Task::new("a", 0, attr())).unwrap();
        sched.enqueue_task(Task::new("b", 0, attr())).unwrap();
        let first = sched.pick_next_task(0).unwrap();
        let second = sched.pick_next_task(0).unwrap();
        assert_ne!(first, second);
        let third = sched.pick_next_task(0).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn task_ready_ns_is_always_zero() {
        let sched = RoundRobinScheduler::new(10, 1_000_000, 1);
        assert_eq!(sched.task_ready_ns(0), Some(0));
    }
}
