//! Task data model (spec.md §3 "Task").

extern crate alloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Idle,
    Run,
    Busy,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Edf,
    RoundRobin,
}

/// Static scheduling attributes, set at `sched_set_attr` time.
#[derive(Debug, Clone, Copy)]
pub struct SchedAttr {
    pub policy: Policy,
    pub priority: u8,
    /// Nanoseconds; 0 means one-shot (period is set equal to `deadline_rel`
    /// internally and `run_once` is set).
    pub period_ns: u64,
    pub wcet_ns: u64,
    pub deadline_rel_ns: u64,
}

/// A schedulable entity (spec.md §3).
#[derive(Debug)]
pub struct Task {
    pub name: &'static str,
    pub entry: usize,
    pub stack_range: (usize, usize),
    pub cpu_affinity: Option<usize>,
    pub attr: SchedAttr,
    pub run_once: bool,

    pub runtime_ns: u64,
    pub total_ns: u64,
    pub wakeup_ns: u64,
    pub deadline_ns: u64,
    pub exec_start_ns: u64,
    pub exec_stop_ns: u64,
    pub slices: u64,
    pub state: TaskState,
}

impl Task {
    pub fn new(name: &'static str, entry: usize, attr: SchedAttr) -> Self {
        let mut period_ns = attr.period_ns;
        let mut run_once = false;
        if period_ns == 0 {
            period_ns = attr.deadline_rel_ns;
            run_once = true;
        }
        let attr = SchedAttr {
            period_ns,
            ..attr
        };
        Self {
            name,
            entry,
            stack_range: (0, 0),
            cpu_affinity: None,
            attr,
            run_once,
            runtime_ns: attr.wcet_ns,
            total_ns: 0,
            wakeup_ns: 0,
            deadline_ns: attr.deadline_rel_ns,
            exec_start_ns: 0,
            exec_stop_ns: 0,
            slices: 0,
            state: TaskState::New,
        }
    }

    pub fn utilisation(&self) -> f64 {
        self.attr.wcet_ns as f64 / self.attr.period_ns as f64
    }
}
