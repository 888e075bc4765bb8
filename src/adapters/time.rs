//! Clock adapters.
//!
//! - [`MonotonicClock`] wraps `std::time::Instant` for real runs.
//! - [`ScaledClock`] runs N times faster than real time, for `--simulate`.
//! - [`ManualClock`] only moves when told to.  Tests use it to walk
//!   through multi-minute experiments in microseconds.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::app::ports::Clock;

/// Wall-clock-immune system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Real time stretched by a constant factor from construction on.
#[derive(Debug, Clone, Copy)]
pub struct ScaledClock {
    origin: Instant,
    scale: f64,
}

impl ScaledClock {
    /// Non-positive or non-finite scales fall back to real time.
    pub fn new(scale: f64) -> Self {
        let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
        Self {
            origin: Instant::now(),
            scale,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl Clock for ScaledClock {
    fn now(&self) -> Instant {
        self.origin + self.origin.elapsed().mul_f64(self.scale)
    }
}

/// Hand-advanced clock.  Clones share the same time line.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Rc<Cell<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    /// Move time forward by `step`.
    pub fn advance(&self, step: Duration) {
        self.offset.set(self.offset.get() + step);
    }

    /// Time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.offset.get()
    }
}
