//! Processing network pipeline (spec.md §4.9, §6 "Processing task route",
//! L8): a staged task graph of trackers routed by op-code, used to express
//! on-board science/data-reduction jobs as scheduled work.
//!
//! Trackers and their FIFOs are arena-free here (a plain `Vec`/`VecDeque`
//! suffices at the scale this pipeline runs at); the critical-threshold
//! reordering and round-robin visitation in [`ProcNet::process_next`] follow
//! spec.md §4.9 literally.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

/// Reserved op-codes for the pipeline's input/output sentinel trackers
/// (spec.md §6 "Processing task route").
pub const PN_OP_NODE_IN: u16 = 0xfffe;
pub const PN_OP_NODE_OUT: u16 = 0xffff;

/// A unit of work flowing through the pipeline (spec.md §3 "Processing
/// task (pnet)").
#[derive(Debug, Clone)]
pub struct Task {
    pub payload: Vec<u8>,
    pub nmemb: usize,
    pub type_code: u32,
    pub seq: u64,
    pub todo: VecDeque<u16>,
    pub done: Vec<u16>,
}

impl Task {
    pub fn new(payload: Vec<u8>, nmemb: usize, type_code: u32, seq: u64, route: &[u16]) -> Self {
        Self {
            payload,
            nmemb,
            type_code,
            seq,
            todo: route.iter().copied().collect(),
            done: Vec::new(),
        }
    }
}

/// Return code an op handler yields, dispatched per spec.md §4.9's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Success,
    Stop,
    Detach,
    Resched,
    SortSeq,
    Destroy,
    Other,
}

type OpHandler = Box<dyn FnMut(&mut Task, u16) -> OpResult>;

/// One stage of the pipeline: an op-code, a FIFO of tasks, and the
/// occupancy threshold beyond which it is serviced ahead of its turn.
pub struct Tracker {
    pub op_code: u16,
    queue: VecDeque<Task>,
    critical_threshold: usize,
}

impl Tracker {
    pub fn new(op_code: u16, critical_threshold: usize) -> Self {
        Self {
            op_code,
            queue: VecDeque::new(),
            critical_threshold,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.queue.len() >= self.critical_threshold
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn sort_by_seq(&mut self) {
        let mut items: Vec<Task> = self.queue.drain(..).collect();
        items.sort_by_key(|t| t.seq);
        self.queue = items.into();
    }
}

/// The pipeline: input tracker, ordered intermediate trackers, and an
/// output tracker whose op defaults to destroying the task.
pub struct ProcNet {
    input: Tracker,
    output: Tracker,
    trackers: Vec<Tracker>,
    op_table: BTreeMap<u16, OpHandler>,
    output_op: Option<OpHandler>,
}

impl ProcNet {
    pub fn new() -> Self {
        Self {
            input: Tracker::new(PN_OP_NODE_IN, usize::MAX),
            output: Tracker::new(PN_OP_NODE_OUT, usize::MAX),
            trackers: Vec::new(),
            op_table: BTreeMap::new(),
            output_op: None,
        }
    }

    pub fn add_tracker(&mut self, tracker: Tracker) {
        self.trackers.push(tracker);
    }

    /// Register the handler invoked whenever a task's next op-code matches
    /// a tracker carrying that op-code.
    pub fn register_op(
        &mut self,
        op_code: u16,
        handler: impl FnMut(&mut Task, u16) -> OpResult + 'static,
    ) {
        self.op_table.insert(op_code, Box::new(handler));
    }

    /// Override the output tracker's op; absent an override, output tasks
    /// are simply dropped (spec.md §4.9 "default op simply destroys the
    /// task").
    pub fn set_output_op(&mut self, handler: impl FnMut(&mut Task, u16) -> OpResult + 'static) {
        self.output_op = Some(Box::new(handler));
    }

    /// Submit a task at the front of the pipeline.
    pub fn submit(&mut self, task: Task) {
        self.input.queue.push_back(task);
    }

    /// `process_inputs` (spec.md §4.9): route every task waiting on the
    /// input tracker to the tracker matching its first op-code.
    pub fn process_inputs(&mut self) {
        while let Some(task) = self.input.queue.pop_front() {
            self.route(task);
        }
    }

    /// `process_outputs`: drain the output tracker through its op (user
    /// override or the destroy default).
    pub fn process_outputs(&mut self) {
        while let Some(mut task) = self.output.queue.pop_front() {
            if let Some(op) = &mut self.output_op {
                op(&mut task, PN_OP_NODE_OUT);
            }
            // Default: task is dropped here.
        }
    }

    /// `process_next` (spec.md §4.9): select the next tracker to service
    /// and run its pending tasks until the tracker stalls or empties.
    pub fn process_next(&mut self) -> bool {
        let Some(idx) = self.select_tracker() else {
            return false;
        };
        self.process_tracker(idx);
        true
    }

    fn select_tracker(&mut self) -> Option<usize> {
        if let Some(pos) = self.trackers.iter().position(Tracker::is_critical) {
            let t = self.trackers.remove(pos);
            self.trackers.insert(0, t);
        }
        let n = self.trackers.len();
        for _ in 0..n {
            if self.trackers.first()?.is_empty() {
                let t = self.trackers.remove(0);
                self.trackers.push(t);
            } else {
                return Some(0);
            }
        }
        None
    }

    fn process_tracker(&mut self, idx: usize) {
        loop {
            let Some(mut task) = self.trackers[idx].queue.pop_front() else {
                break;
            };
            let Some(code) = task.todo.front().copied() else {
                self.output.queue.push_back(task);
                continue;
            };

            let result = match self.op_table.get_mut(&code) {
                Some(op) => op(&mut task, code),
                None => OpResult::Other,
            };

            match result {
                OpResult::Success => {
                    task.todo.pop_front();
                    task.done.push(code);
                    self.route(task);
                }
                OpResult::Stop => {
                    task.todo.pop_front();
                    task.done.push(code);
                    self.route(task);
                    break;
                }
                OpResult::Detach => {}
                OpResult::Resched => {
                    self.trackers[idx].queue.push_back(task);
                    break;
                }
                OpResult::SortSeq => {
                    self.trackers[idx].queue.push_back(task);
                    self.trackers[idx].sort_by_seq();
                    break;
                }
                OpResult::Destroy => {
                    task.todo.clear();
                    self.output.queue.push_back(task);
                }
                OpResult::Other => {
                    log::warn!("pnet: unhandled op-code {code}, destroying task");
                    task.todo.clear();
                    self.output.queue.push_back(task);
                }
            }
        }
    }

    /// Route `task` to the tracker matching its next op-code, or to output
    /// if its route is exhausted or the op-code is unknown (spec.md §6).
    fn route(&mut self, task: Task) {
        let Some(code) = task.todo.front().copied() else {
            self.output.queue.push_back(task);
            return;
        };
        if code == PN_OP_NODE_OUT {
            self.output.queue.push_back(task);
            return;
        }
        match self.trackers.iter_mut().find(|t| t.op_code == code) {
            Some(tracker) => tracker.queue.push_back(task),
            None => {
                let mut task = task;
                task.todo.clear();
                self.output.queue.push_back(task);
            }
        }
    }

    pub fn output_len(&self) -> usize {
        self.output.queue.len()
    }

    pub fn tracker_len(&self, op_code: u16) -> Option<usize> {
        self.trackers
            .iter()
            .find(|t| t.op_code == op_code)
            .map(Tracker::len)
    }
}

impl Default for ProcNet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OP_A: u16 = 1;
    const OP_B: u16 = 2;

    #[test]
    fn task_flows_through_two_stages_to_output() {
        let mut net = ProcNet::new();
        net.add_tracker(Tracker::new(OP_A, usize::MAX));
        net.add_tracker(Tracker::new(OP_B, usize::MAX));
        net.register_op(OP_A, |_task, _code| OpResult::Success);
        net.register_op(OP_B, |_task, _code| OpResult::Success);

        net.submit(Task::new(Vec::new(), 0, 0, 1, &[OP_A, OP_B]));
        net.process_inputs();

        while net.process_next() {}
        net.process_outputs();

        assert_eq!(net.output_len(), 0);
    }

    #[test]
    fn resched_keeps_task_on_same_tracker() {
        let mut net = ProcNet::new();
        net.add_tracker(Tracker::new(OP_A, usize::MAX));
        let mut calls = 0;
        net.register_op(OP_A, move |_task, _code| {
            calls += 1;
            if calls < 3 {
                OpResult::Resched
            } else {
                OpResult::Success
            }
        });

        net.submit(Task::new(Vec::new(), 0, 0, 1, &[OP_A]));
        net.process_inputs();
        assert_eq!(net.tracker_len(OP_A), Some(1));

        for _ in 0..3 {
            net.process_next();
        }
        net.process_outputs();
        assert_eq!(net.tracker_len(OP_A), Some(0));
    }

    #[test]
    fn critical_tracker_is_serviced_before_others() {
        let mut net = ProcNet::new();
        net.add_tracker(Tracker::new(OP_A, 2));
        net.add_tracker(Tracker::new(OP_B, usize::MAX));
        let order = alloc::rc::Rc::new(core::cell::RefCell::new(Vec::new()));
        let order_a = order.clone();
        net.register_op(OP_A, move |_task, code| {
            order_a.borrow_mut().push(code);
            OpResult::Destroy
        });
        let order_b = order.clone();
        net.register_op(OP_B, move |_task, code| {
            order_b.borrow_mut().push(code);
            OpResult::Destroy
        });

        net.submit(Task::new(Vec::new(), 0, 0, 1, &[OP_B]));
        net.submit(Task::new(Vec::new(), 0, 0, 2, &[OP_A]));
        net.submit(Task::new(Vec::new(), 0, 0, 3, &[OP_A]));
        net.process_inputs();

        net.process_next();
        assert_eq!(*order.borrow(), alloc::vec![OP_A, OP_A]);
    }

    #[test]
    fn unknown_op_code_destroys_task() {
        let mut net = ProcNet::new();
        net.add_tracker(Tracker::new(OP_A, usize::MAX));
        net.submit(Task::new(Vec::new(), 0, 0, 1, &[0xdead]));
        net.process_inputs();
        assert_eq!(net.output_len(), 1);
    }
}
