//! Observer (sysctl) interface (spec.md §6): a read-only tree of named
//! attributes exposing per-CPU load, per-task stats, memory-manager
//! totals, and per-link SpaceWire byte counters. Alloc-fail counters use
//! read-clear semantics so a monitoring task can poll without needing its
//! own baseline.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;

use crate::error::{KernelError, KernelResult};

/// One leaf of the attribute tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Counter(u64),
    /// Cleared to zero on read (e.g. allocator alloc-fail counts).
    ReadClearCounter(u64),
    Gauge(f64),
}

/// The sysctl tree: a flat namespace of dotted attribute paths (e.g.
/// `cpu.0.load`, `mm.alloc_fail`, `spw.0.rx_bytes`), populated by whichever
/// subsystem owns each attribute.
#[derive(Default)]
pub struct Observer {
    attrs: BTreeMap<String, Value>,
}

impl Observer {
    pub fn new() -> Self {
        Self {
            attrs: BTreeMap::new(),
        }
    }

    pub fn set_counter(&mut self, path: impl Into<String>, value: u64) {
        self.attrs.insert(path.into(), Value::Counter(value));
    }

    pub fn set_read_clear_counter(&mut self, path: impl Into<String>, value: u64) {
        self.attrs
            .insert(path.into(), Value::ReadClearCounter(value));
    }

    pub fn set_gauge(&mut self, path: impl Into<String>, value: f64) {
        self.attrs.insert(path.into(), Value::Gauge(value));
    }

    /// `sysctl show`: read an attribute, clearing it first if it's a
    /// read-clear counter.
    pub fn show(&mut self, path: &str) -> KernelResult<Value> {
        match self.attrs.get_mut(path) {
            Some(Value::ReadClearCounter(v)) => {
                let value = *v;
                *v = 0;
                Ok(Value::ReadClearCounter(value))
            }
            Some(v) => Ok(*v),
            None => Err(KernelError::NotFound {
                resource: "sysctl attribute",
            }),
        }
    }

    /// `sysctl store`: only attributes explicitly marked as gauges accept
    /// writes; counters are derived state and reject a direct store.
    pub fn store(&mut self, path: &str, value: f64) -> KernelResult<()> {
        match self.attrs.get_mut(path) {
            Some(Value::Gauge(v)) => {
                *v = value;
                Ok(())
            }
            Some(_) => Err(KernelError::ContractViolation {
                addr: 0,
                reason: crate::error::ContractError::OutsideRange,
            }),
            None => Err(KernelError::NotFound {
                resource: "sysctl attribute",
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_clear_counter_resets_after_show() {
        let mut obs = Observer::new();
        obs.set_read_clear_counter("mm.alloc_fail", 3);
        assert_eq!(obs.show("mm.alloc_fail").unwrap(), Value::ReadClearCounter(3));
        assert_eq!(obs.show("mm.alloc_fail").unwrap(), Value::ReadClearCounter(0));
    }

    #[test]
    fn storing_to_a_counter_is_rejected() {
        let mut obs = Observer::new();
        obs.set_counter("cpu.0.load", 50);
        assert!(obs.store("cpu.0.load", 10.0).is_err());
    }

    #[test]
    fn gauge_round_trips_through_store_and_show() {
        let mut obs = Observer::new();
        obs.set_gauge("spw.0.promiscuous", 0.0);
        obs.store("spw.0.promiscuous", 1.0).unwrap();
        assert_eq!(obs.show("spw.0.promiscuous").unwrap(), Value::Gauge(1.0));
    }

    #[test]
    fn unknown_attribute_is_not_found() {
        let mut obs = Observer::new();
        assert!(obs.show("does.not.exist").is_err());
    }
}
