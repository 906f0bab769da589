//! RAII patterns for kernel resources.
//!
//! This module provides scope guards for the resources the rest of the
//! crate takes and releases in matched pairs: the per-CPU IRQ mask
//! ([`local_irq_save`](crate::arch::local_irq_save)/`local_irq_restore`)
//! and the EDAC critical-region contract (spec.md §4, "Hardware fault"
//! entry in §7). Generic cleanup-on-drop is available via [`ScopeGuard`]/
//! [`defer!`] for anything else.

use core::ops::{Deref, DerefMut};

use crate::arch::{self, IrqFlags};

/// RAII wrapper around [`crate::arch::local_irq_save`]/`local_irq_restore`.
///
/// Every spinlock-protected critical section in the buddy pool, the page
/// map, kmalloc, the IRQ dispatcher and the scheduler is expected to hold
/// one of these for its duration (spec.md §5).
pub struct IrqGuard {
    flags: Option<IrqFlags>,
}

impl IrqGuard {
    /// Mask interrupts on `cpu` and hold them masked until dropped.
    pub fn new(cpu: usize) -> Self {
        Self {
            flags: Some(arch::local_irq_save(cpu)),
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if let Some(flags) = self.flags.take() {
            arch::local_irq_restore(flags);
        }
    }
}

/// RAII lock guard that also holds the per-CPU IRQ mask for its lifetime,
/// matching the "IRQ-masking spinlock" every allocator in spec.md §5 uses.
pub struct IrqLockGuard<'a, T> {
    _irq: IrqGuard,
    guard: spin::MutexGuard<'a, T>,
}

impl<'a, T> IrqLockGuard<'a, T> {
    pub fn new(mutex: &'a spin::Mutex<T>, cpu: usize) -> Self {
        let irq = IrqGuard::new(cpu);
        Self {
            _irq: irq,
            guard: mutex.lock(),
        }
    }
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Macro to create RAII scope guards: `defer!({ ... })` runs the block when
/// the enclosing scope exits, however it exits.
#[macro_export]
macro_rules! defer {
    ($e:expr) => {
        let _guard = $crate::raii::ScopeGuard::new(|| $e);
    };
}

/// Generic scope guard that runs cleanup code on drop unless cancelled.
pub struct ScopeGuard<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    /// Cancel the cleanup; the guard becomes a no-op on drop.
    pub fn cancel(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_guard_runs_on_drop() {
        let mut cleaned = false;
        {
            let _guard = ScopeGuard::new(|| {
                cleaned = true;
            });
        }
        assert!(cleaned);
    }

    #[test]
    fn scope_guard_cancel_skips_cleanup() {
        let mut cleaned = false;
        {
            let guard = ScopeGuard::new(|| {
                cleaned = true;
            });
            guard.cancel();
        }
        assert!(!cleaned);
    }

    #[test]
    fn irq_guard_masks_and_restores() {
        assert!(!arch::irqs_masked(0));
        {
            let _g = IrqGuard::new(0);
            assert!(arch::irqs_masked(0));
        }
        assert!(!arch::irqs_masked(0));
    }

    #[test]
    fn irq_guard_nests() {
        let g1 = IrqGuard::new(1);
        let g2 = IrqGuard::new(1);
        assert!(arch::irqs_masked(1));
        drop(g2);
        assert!(arch::irqs_masked(1));
        drop(g1);
        assert!(!arch::irqs_masked(1));
    }
}
