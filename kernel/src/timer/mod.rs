//! Clock events & tick device (spec.md §4.6, L5).
//!
//! A clock event device is a vtable the BSP implements; the tick device
//! picks one per CPU (preferring periodic-capable devices), calibrates
//! `tick_period_min_ns`, and is what the scheduler programs for its next
//! timeslice (spec.md §4.7).

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        const PERIODIC = 1 << 0;
        const ONESHOT = 1 << 1;
        const KTIME = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unused,
    Shutdown,
    Periodic,
    Oneshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Periodic,
    Oneshot,
}

/// Error returned when a ktime deadline has already passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineInPast;

/// The vtable a concrete clock event driver implements (spec.md §6 "Tick/
/// clock device contract").
pub trait ClockEventDevice {
    fn features(&self) -> Features;
    fn min_delta_ns(&self) -> u64;
    fn max_delta_ns(&self) -> u64;
    /// Clock ticks per nanosecond, fixed-point with `mult_shift` bits of
    /// fraction.
    fn mult(&self) -> u64;
    fn set_next_event(&mut self, ticks: u64);
    fn set_next_ktime(&mut self, expires_ns: u64) {
        let _ = expires_ns;
    }
    fn set_state(&mut self, state: State) -> bool;
    fn suspend(&mut self) {}
    fn resume(&mut self) {}
}

/// `program_event(device, expires)`.
pub fn program_event(device: &mut dyn ClockEventDevice, expires_ktime_ns: u64) {
    device.set_next_ktime(expires_ktime_ns);
}

/// `program_timeout_ns(device, ns)`: clamps to the device's supported
/// range.
pub fn program_timeout_ns(device: &mut dyn ClockEventDevice, ns: u64) -> u64 {
    let clamped = ns.clamp(device.min_delta_ns(), device.max_delta_ns());
    let ticks = clamped.saturating_mul(device.mult());
    device.set_next_event(ticks);
    clamped
}

/// `set_state(device, state)`: rejects unsupported states.
pub fn set_state(device: &mut dyn ClockEventDevice, state: State) -> bool {
    let supported = match state {
        State::Periodic => device.features().contains(Features::PERIODIC),
        State::Oneshot => device.features().contains(Features::ONESHOT),
        State::Unused | State::Shutdown => true,
    };
    if !supported {
        return false;
    }
    device.set_state(state)
}

/// `set_mode(periodic|oneshot)`.
pub fn set_mode(device: &mut dyn ClockEventDevice, mode: Mode) -> bool {
    let state = match mode {
        Mode::Periodic => State::Periodic,
        Mode::Oneshot => State::Oneshot,
    };
    set_state(device, state)
}

/// Per-CPU tick device: a [`ClockEventDevice`] plus a calibrated minimum
/// reliable re-arm period.
pub struct TickDevice<D: ClockEventDevice> {
    device: D,
    pub tick_period_min_ns: u64,
    event_handler: Option<fn(now_ns: u64)>,
}

impl<D: ClockEventDevice> TickDevice<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            tick_period_min_ns: 0,
            event_handler: None,
        }
    }

    pub fn set_event_handler(&mut self, handler: fn(now_ns: u64)) {
        self.event_handler = Some(handler);
    }

    /// Calibrate `tick_period_min_ns` by arming the device for decreasing
    /// timeouts and observing the delta between fired events, converging
    /// to a minimum and doubling it for sampling jitter (spec.md §4.6).
    /// `measure` returns the observed firing delta for a given requested
    /// timeout, or `None` if the device stopped firing (partial fallback).
    pub fn calibrate(&mut self, mut measure: impl FnMut(u64) -> Option<u64>) {
        let mut candidate = self.device.max_delta_ns().max(self.device.min_delta_ns());
        let mut converged = self.device.min_delta_ns();
        loop {
            match measure(candidate) {
                Some(observed) => {
                    converged = observed.max(self.device.min_delta_ns());
                    if candidate <= self.device.min_delta_ns() * 2 {
                        break;
                    }
                    candidate /= 2;
                }
                None => break,
            }
        }
        self.tick_period_min_ns = converged.saturating_mul(2);
    }

    /// `set_next_ns(ns)`: clamps to `tick_period_min_ns` silently.
    pub fn set_next_ns(&mut self, ns: u64) -> u64 {
        let clamped = ns.max(self.tick_period_min_ns);
        program_timeout_ns(&mut self.device, clamped);
        clamped
    }

    /// `set_next_ktime(expires)`: returns the time-in-past error if the
    /// deadline already passed.
    pub fn set_next_ktime(&mut self, now_ns: u64, expires_ns: u64) -> Result<(), DeadlineInPast> {
        if expires_ns <= now_ns {
            return Err(DeadlineInPast);
        }
        self.device.set_next_ktime(expires_ns);
        Ok(())
    }

    /// Invoked from interrupt context on every device interrupt.
    pub fn on_interrupt(&self, now_ns: u64) {
        if let Some(handler) = self.event_handler {
            handler(now_ns);
        }
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDevice {
        features: Features,
        min: u64,
        max: u64,
        state: State,
        last_ticks: u64,
    }

    impl ClockEventDevice for FakeDevice {
        fn features(&self) -> Features {
            self.features
        }
        fn min_delta_ns(&self) -> u64 {
            self.min
        }
        fn max_delta_ns(&self) -> u64 {
            self.max
        }
        fn mult(&self) -> u64 {
            1
        }
        fn set_next_event(&mut self, ticks: u64) {
            self.last_ticks = ticks;
        }
        fn set_state(&mut self, state: State) -> bool {
            self.state = state;
            true
        }
    }

    #[test]
    fn set_next_ns_clamps_to_calibrated_minimum() {
        let device = FakeDevice {
            features: Features::ONESHOT,
            min: 1_000,
            max: 1_000_000_000,
            state: State::Unused,
            last_ticks: 0,
        };
        let mut tick = TickDevice::new(device);
        tick.tick_period_min_ns = 5_000;
        let programmed = tick.set_next_ns(100);
        assert_eq!(programmed, 5_000);
    }

    #[test]
    fn ktime_in_past_is_rejected() {
        let device = FakeDevice {
            features: Features::ONESHOT | Features::KTIME,
            min: 1_000,
            max: 1_000_000_000,
            state: State::Unused,
            last_ticks: 0,
        };
        let mut tick = TickDevice::new(device);
        assert!(tick.set_next_ktime(1_000, 500).is_err());
        assert!(tick.set_next_ktime(1_000, 2_000).is_ok());
    }

    #[test]
    fn set_state_rejects_unsupported_mode() {
        let mut device = FakeDevice {
            features: Features::ONESHOT,
            min: 1_000,
            max: 1_000_000_000,
            state: State::Unused,
            last_ticks: 0,
        };
        assert!(!set_state(&mut device, State::Periodic));
        assert!(set_state(&mut device, State::Oneshot));
    }
}
