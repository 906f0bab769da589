//! EDF (earliest-deadline-first) policy (spec.md §4.7a).

extern crate alloc;

use alloc::vec::Vec;

use crate::error::AdmissionError;
use crate::sched::policy::Scheduler;
use crate::sched::task::{SchedAttr, Task, TaskState};

/// Hard utilisation admission bound (spec.md §4.7a).
pub const UTIL_MAX: f64 = 0.98;
/// Wake overhead margin added when a new task has to follow a currently
/// running task's next wakeup.
const WAKE_OVERHEAD_MARGIN_NS: u64 = 30_000;

/// Validate the static attribute contract for an EDF task
/// (spec.md §4.7a, first paragraph).
pub fn check_attr_contract(attr: &SchedAttr, tick_min_ns: u64) -> Result<(), AdmissionError> {
    if attr.wcet_ns < tick_min_ns {
        return Err(AdmissionError::WcetExceedsDeadline);
    }
    if attr.deadline_rel_ns < attr.wcet_ns + tick_min_ns {
        return Err(AdmissionError::WcetExceedsDeadline);
    }
    if attr.wcet_ns >= attr.deadline_rel_ns {
        return Err(AdmissionError::WcetExceedsDeadline);
    }
    if attr.period_ns > 0 {
        if attr.wcet_ns >= attr.period_ns {
            return Err(AdmissionError::WcetExceedsDeadline);
        }
        if attr.deadline_rel_ns >= attr.period_ns {
            return Err(AdmissionError::WcetExceedsDeadline);
        }
        if attr.period_ns - attr.deadline_rel_ns < tick_min_ns {
            return Err(AdmissionError::WcetExceedsDeadline);
        }
    }
    Ok(())
}

/// Head/tail slack check against the reference task `d0` (the longest-
/// period task in the hyperperiod), per spec.md §4.7a.
fn slack_check(existing: &[SchedAttr], candidate: &SchedAttr) -> Result<(), AdmissionError> {
    let d0 = existing
        .iter()
        .chain(core::iter::once(candidate))
        .max_by_key(|a| a.period_ns)
        .copied()
        .unwrap_or(*candidate);
    let h = 1u64;
    let head_slack = h * (d0.deadline_rel_ns - d0.wcet_ns);
    let tail_slack = h * (d0.period_ns - d0.deadline_rel_ns);

    let mut head_demand = 0u64;
    let mut tail_demand = 0u64;
    for task in existing.iter().chain(core::iter::once(candidate)) {
        if task.period_ns == 0 {
            continue;
        }
        if task.deadline_rel_ns <= d0.deadline_rel_ns {
            head_demand += (h * task.wcet_ns * d0.deadline_rel_ns).div_ceil(task.period_ns);
        }
        tail_demand += h * task.wcet_ns * (d0.period_ns - d0.deadline_rel_ns) / task.period_ns;
    }

    if head_demand > head_slack {
        return Err(AdmissionError::SlackViolation);
    }
    if tail_demand > tail_slack {
        return Err(AdmissionError::SlackViolation);
    }
    Ok(())
}

/// Per-CPU admission bookkeeping: cumulative utilisation plus the
/// attribute set needed for the slack check.
#[derive(Default)]
pub struct CpuAdmission {
    attrs: Vec<SchedAttr>,
}

impl CpuAdmission {
    pub fn new() -> Self {
        Self { attrs: Vec::new() }
    }

    pub fn utilisation(&self) -> f64 {
        self.attrs.iter().map(|a| a.wcet_ns as f64 / a.period_ns as f64).sum()
    }

    /// Try to admit `attr` on this CPU.
    pub fn try_admit(&mut self, attr: SchedAttr, tick_min_ns: u64) -> Result<(), AdmissionError> {
        check_attr_contract(&attr, tick_min_ns)?;
        let projected = self.utilisation() + attr.wcet_ns as f64 / attr.period_ns as f64;
        if projected > UTIL_MAX {
            return Err(AdmissionError::UtilisationExceeded);
        }
        slack_check(&self.attrs, &attr)?;
        self.attrs.push(attr);
        Ok(())
    }
}

/// Best-fit admission across CPUs with no affinity constraint: pick the
/// CPU with the highest utilisation that still admits the task.
pub fn admit_best_fit(
    cpus: &mut [CpuAdmission],
    attr: SchedAttr,
    tick_min_ns: u64,
) -> Result<usize, AdmissionError> {
    check_attr_contract(&attr, tick_min_ns)?;
    let mut order: Vec<usize> = (0..cpus.len()).collect();
    order.sort_by(|&a, &b| {
        cpus[b]
            .utilisation()
            .partial_cmp(&cpus[a].utilisation())
            .unwrap()
    });
    let mut last_err = AdmissionError::NoCpuQualifies;
    for cpu in order {
        match cpus[cpu].try_admit(attr, tick_min_ns) {
            Ok(()) => return Ok(cpu),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Per-CPU EDF run queue, ordered by ascending deadline (index 0 = head).
pub struct EdfScheduler {
    priority: u8,
    tick_min_ns: u64,
    tasks: Vec<Task>,
}

impl EdfScheduler {
    pub fn new(priority: u8, tick_min_ns: u64) -> Self {
        Self {
            priority,
            tick_min_ns,
            tasks: Vec::new(),
        }
    }

    fn reinit(task: &mut Task, now_ns: u64) {
        task.wakeup_ns += task.attr.period_ns;
        task.deadline_ns = task.wakeup_ns + task.attr.deadline_rel_ns;
        task.runtime_ns = task.attr.wcet_ns;
        task.state = TaskState::Idle;
        let _ = now_ns;
    }
}

impl Scheduler for EdfScheduler {
    fn priority(&self) -> u8 {
        self.priority
    }

    fn policy_name(&self) -> &'static str {
        "edf"
    }

    fn enqueue_task(&mut self, mut task: Task) -> Result<(), Task> {
        task.state = TaskState::Idle;
        self.tasks.push(task);
        Ok(())
    }

    fn wake_next_task(&mut self, now_ns: u64) {
        for i in 0..self.tasks.len() {
            if self.tasks[i].state != TaskState::New {
                continue;
            }
            let deadline_rel = self.tasks[i].attr.deadline_rel_ns;
            // Avoid colliding with a currently-running task's unused
            // timeslice; fall back to immediately after the longest
            // running task's wakeup plus a fixed overhead margin.
            let running_conflict = self
                .tasks
                .iter()
                .filter(|t| t.state == TaskState::Run || t.state == TaskState::Busy)
                .map(|t| t.deadline_ns)
                .filter(|&d| d < now_ns + deadline_rel)
                .max();
            let wakeup = match running_conflict {
                Some(_) => self
                    .tasks
                    .iter()
                    .max_by_key(|t| t.attr.period_ns)
                    .map(|t| t.wakeup_ns + WAKE_OVERHEAD_MARGIN_NS)
                    .unwrap_or(now_ns),
                None => now_ns,
            };
            self.tasks[i].wakeup_ns = wakeup;
            self.tasks[i].deadline_ns = wakeup + deadline_rel;
            self.tasks[i].runtime_ns = self.tasks[i].attr.wcet_ns;
            self.tasks[i].state = TaskState::Idle;
        }
    }

    fn pick_next_task(&mut self, now_ns: u64) -> Option<usize> {
        let two_tick = 2 * self.tick_min_ns;

        // Reap dead one-shots and missed-deadline live tasks first.
        self.tasks.retain(|t| t.state != TaskState::Dead);

        let mut head: Option<usize> = None;
        for i in 0..self.tasks.len() {
            if self.tasks[i].state == TaskState::Dead {
                continue;
            }
            let ready = self.tasks[i].wakeup_ns <= now_ns + two_tick;
            if !ready {
                continue;
            }
            let cannot_meet_deadline = (self.tasks[i].state == TaskState::Run
                || self.tasks[i].state == TaskState::Busy)
                && self.tasks[i].runtime_ns > 0
                && now_ns + self.tasks[i].runtime_ns > self.tasks[i].deadline_ns;
            if cannot_meet_deadline {
                if self.tasks[i].run_once {
                    self.tasks[i].state = TaskState::Dead;
                    continue;
                }
                Self::reinit(&mut self.tasks[i], now_ns);
            }
            head = match head {
                None => Some(i),
                Some(h) if self.tasks[i].deadline_ns < self.tasks[h].deadline_ns => Some(i),
                Some(h) => Some(h),
            };
        }

        if let Some(h) = head {
            self.tasks[h].state = TaskState::Run;
            return Some(h);
        }
        None
    }

    fn timeslice_ns(&self, task_index: usize) -> u64 {
        self.tasks[task_index].runtime_ns
    }

    fn task_ready_ns(&self, now_ns: u64) -> Option<u64> {
        let two_tick = 2 * self.tick_min_ns;
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Idle && t.wakeup_ns > now_ns + two_tick)
            .map(|t| t.wakeup_ns - now_ns)
            .min()
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

    fn attr(period_ms: u64, deadline_ms: u64, wcet_ms: u64) -> SchedAttr {
        SchedAttr {
            policy: crate::sched::task::Policy::Edf,
            priority: 10,
            period_ns: period_ms * 1_000_000,
            wcet_ns: wcet_ms * 1_000_000,
            deadline_rel_ns: deadline_ms * 1_000_000,
        }
    }

    #[test]
    fn admission_succeeds_under_utilisation_bound() {
        let mut cpus = [CpuAdmission::new()];
        let a = attr(100, 99, 30);
        let b = attr(10, 5, 1); // small filler task, low utilisation
        assert!(cpus[0].try_admit(a, 1_000).is_ok());
        assert!(cpus[0].try_admit(b, 1_000).is_ok());
    }

    #[test]
    fn admission_fails_when_wcet_exceeds_deadline() {
        let mut cpu = CpuAdmission::new();
        let bad = attr(10, 9, 10); // wcet == deadline_rel in ms but scaled ns 9.5 vs 9 case:
        let bad_ns = SchedAttr {
            wcet_ns: 9_500_000,
            ..bad
        };
        assert_eq!(
            cpu.try_admit(bad_ns, 1_000).unwrap_err(),
            AdmissionError::WcetExceedsDeadline
        );
    }

    #[test]
    fn best_fit_picks_a_cpu_for_admissible_set() {
        let mut cpus = [CpuAdmission::new(), CpuAdmission::new()];
        let a = attr(100, 99, 30);
        let b = SchedAttr {
            period_ns: 200_000,
            deadline_rel_ns: 100_000,
            wcet_ns: 40_000,
            ..a
        };
        assert!(admit_best_fit(&mut cpus, a, 1_000).is_ok());
        assert!(admit_best_fit(&mut cpus, b, 1_000).is_ok());
    }

    #[test]
    fn dispatch_runs_both_tasks_without_missing_deadlines() {
        let mut sched = EdfScheduler::new(100, 1_000);
        let a = Task::new("periodic-a", 0, attr(100, 99, 30));
        let b = Task::new(
            "periodic-b",
            0,
            SchedAttr {
                period_ns: 200_000,
                deadline_rel_ns: 100_000,
                wcet_ns: 40_000,
                ..attr(100, 99, 30)
            },
        );
        sched.enqueue_task(a).unwrap();
        sched.enqueue_task(b).unwrap();
        sched.tasks[0].state = TaskState::New;
        sched.tasks[1].state = TaskState::New;

        let mut now = 0u64;
        let mut missed = false;
        for _ in 0..20 {
            sched.wake_next_task(now);
            if let Some(idx) = sched.pick_next_task(now) {
                let deadline = sched.tasks[idx].deadline_ns;
                if now > deadline {
                    missed = true;
                }
                // Simulate the task running to completion within its
                // budget and re-arming for its next period, as
                // `Core::schedule` would once its elapsed runtime hits 0.
                let now_ns = now;
                EdfScheduler::reinit(&mut sched.tasks[idx], now_ns);
                now += sched.tasks[idx].attr.wcet_ns.min(50_000);
            } else {
                now += 10_000;
            }
        }
        assert!(!missed);
    }
}
