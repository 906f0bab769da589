//! EDAC fault/critical-region contract (spec.md §1, §7; new per
//! SPEC_FULL.md's memory-management expansion).
//!
//! The error-injection helpers themselves are out of scope (spec.md §1);
//! what belongs here is the contract a BSP's EDAC driver calls into: a
//! registry of critical regions, each with a user-supplied reset callback
//! invoked on a double-bit error, and plain counters for single-bit
//! corrections.

extern crate alloc;

use alloc::vec::Vec;
use spin::Mutex;

/// A double-bit error inside a registered critical region is
/// unrecoverable; the callback is expected to reset or quarantine
/// whatever the region protects.
pub type ResetCallback = fn(region_id: u32, fault_addr: usize);

struct CriticalRegion {
    id: u32,
    start: usize,
    end: usize,
    on_double_bit: ResetCallback,
}

#[derive(Default)]
struct EdacState {
    regions: Vec<CriticalRegion>,
    single_bit_count: u64,
    double_bit_count: u64,
}

pub struct Edac {
    state: Mutex<EdacState>,
}

impl Default for Edac {
    fn default() -> Self {
        Self::new()
    }
}

impl Edac {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(EdacState {
                regions: Vec::new(),
                single_bit_count: 0,
                double_bit_count: 0,
            }),
        }
    }

    /// Register `[start, end)` as a critical region; `on_double_bit` is
    /// invoked in place of the normal "log and continue" path when a
    /// double-bit error lands inside it.
    pub fn register_region(&self, id: u32, start: usize, end: usize, on_double_bit: ResetCallback) {
        self.state.lock().regions.push(CriticalRegion {
            id,
            start,
            end,
            on_double_bit,
        });
    }

    pub fn unregister_region(&self, id: u32) {
        self.state.lock().regions.retain(|r| r.id != id);
    }

    /// Single-bit error: increment the counter and continue (spec.md §7).
    pub fn report_single_bit(&self, _fault_addr: usize) {
        self.state.lock().single_bit_count += 1;
    }

    /// Double-bit error: increment the counter, and if `fault_addr` falls
    /// in a registered critical region, invoke its reset callback.
    pub fn report_double_bit(&self, fault_addr: usize) {
        let mut state = self.state.lock();
        state.double_bit_count += 1;
        let hit = state
            .regions
            .iter()
            .find(|r| fault_addr >= r.start && fault_addr < r.end)
            .map(|r| (r.id, r.on_double_bit));
        drop(state);
        if let Some((id, callback)) = hit {
            callback(id, fault_addr);
        }
    }

    pub fn single_bit_count(&self) -> u64 {
        self.state.lock().single_bit_count
    }

    pub fn double_bit_count(&self) -> u64 {
        self.state.lock().double_bit_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static RESET_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn test_reset(_region_id: u32, _fault_addr: usize) {
        RESET_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn double_bit_in_critical_region_invokes_callback() {
        let edac = Edac::new();
        edac.register_region(1, 0x1000, 0x2000, test_reset);
        let before = RESET_CALLS.load(Ordering::SeqCst);
        edac.report_double_bit(0x1500);
        assert_eq!(RESET_CALLS.load(Ordering::SeqCst), before + 1);
        assert_eq!(edac.double_bit_count(), 1);
    }

    #[test]
    fn single_bit_just_counts() {
        let edac = Edac::new();
        edac.report_single_bit(0x5000);
        edac.report_single_bit(0x5000);
        assert_eq!(edac.single_bit_count(), 2);
    }

    #[test]
    fn double_bit_outside_region_does_not_invoke_callback() {
        let edac = Edac::new();
        edac.register_region(2, 0x1000, 0x2000, test_reset);
        let before = RESET_CALLS.load(Ordering::SeqCst);
        edac.report_double_bit(0x9000);
        assert_eq!(RESET_CALLS.load(Ordering::SeqCst), before);
        assert_eq!(edac.double_bit_count(), 1);
    }
}
