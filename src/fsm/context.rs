//! Per-device context threaded through a driver's engines.
//!
//! Each driver owns one context: the serial link, the clock, protocol
//! timing and its setpoint cells.  Protocol states reach the link through
//! [`DeviceContext`], so the same `Send`/`WaitForAnswer` code serves every
//! instrument.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::trace;

use crate::app::ports::{Clock, Transport};
use crate::error::TransportError;

// ---------------------------------------------------------------------------
// Protocol timing
// ---------------------------------------------------------------------------

/// Timing shared by all command/response exchanges of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTiming {
    /// How long a `WaitForAnswer` waits for the terminator.
    pub response_timeout: Duration,
    /// Pause between two status polls in `Deactivated`/`Activated`.
    pub poll_interval: Duration,
    /// Local retries before a mismatch or timeout becomes an error.
    pub retries: u32,
}

impl Default for ProtocolTiming {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(500),
            retries: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Device I/O
// ---------------------------------------------------------------------------

/// Link, clock and timing for one device.
pub struct DeviceIo {
    name: String,
    transport: Box<dyn Transport>,
    clock: Rc<dyn Clock>,
    pub timing: ProtocolTiming,
}

impl DeviceIo {
    pub fn new(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        clock: Rc<dyn Clock>,
        timing: ProtocolTiming,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            clock,
            timing,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Absolute deadline `after` from now.
    pub fn deadline(&self, after: Duration) -> Instant {
        self.clock.now() + after
    }

    /// Write `command` followed by the carriage-return terminator.
    pub fn send_line(&mut self, command: &str) -> Result<(), TransportError> {
        trace!("{} <- {:?}", self.name, command);
        let mut frame = Vec::with_capacity(command.len() + 1);
        frame.extend_from_slice(command.as_bytes());
        frame.push(b'\r');
        self.transport.send(&frame)
    }

    /// Write `data` as is.
    pub fn send_raw(&mut self, data: &[u8]) -> Result<(), TransportError> {
        trace!("{} <- {:?}", self.name, String::from_utf8_lossy(data));
        self.transport.send(data)
    }

    pub fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        self.transport.receive()
    }

    pub fn clear_input_buffer(&mut self) -> Result<(), TransportError> {
        self.transport.clear_input_buffer()
    }
}

/// Anything the protocol layer can run against.
pub trait DeviceContext: 'static {
    fn io(&mut self) -> &mut DeviceIo;
}

impl DeviceContext for DeviceIo {
    fn io(&mut self) -> &mut DeviceIo {
        self
    }
}

/// Contexts whose monitoring states follow a setpoint.
pub trait SetpointContext: DeviceContext {
    /// Latch a pending setpoint as applied.  Returns `true` if one was pending.
    fn take_setpoint_change(&mut self) -> bool;
}

// ---------------------------------------------------------------------------
// Setpoint cell
// ---------------------------------------------------------------------------

/// Single-slot mailbox between the orchestration layer (writer) and a
/// driver's internal states (reader).
///
/// `target` is what was last requested.  `applied` is what the driver last
/// sent to the instrument.  A change is pending while they differ.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setpoint<T> {
    target: Option<T>,
    applied: Option<T>,
}

impl<T: Copy + PartialEq> Setpoint<T> {
    /// No target yet; nothing pending.
    pub const fn unset() -> Self {
        Self {
            target: None,
            applied: None,
        }
    }

    /// `initial` is pending until first applied.
    pub const fn new(initial: T) -> Self {
        Self {
            target: Some(initial),
            applied: None,
        }
    }

    pub fn request(&mut self, value: T) {
        self.target = Some(value);
    }

    pub fn target(&self) -> Option<T> {
        self.target
    }

    pub fn applied(&self) -> Option<T> {
        self.applied
    }

    pub fn is_pending(&self) -> bool {
        self.target.is_some() && self.target != self.applied
    }

    /// Apply the pending target, if any.
    pub fn take_pending(&mut self) -> Option<T> {
        if self.is_pending() {
            self.applied = self.target;
            return self.applied;
        }
        None
    }

    /// Apply the target unconditionally and return it.
    pub fn commit(&mut self) -> Option<T> {
        self.applied = self.target;
        self.applied
    }
}

// ---------------------------------------------------------------------------
// Retry budget
// ---------------------------------------------------------------------------

/// Retries left for one send-and-check exchange.  Shared between the
/// exchange's factory and every `WaitForAnswer` it builds, so the budget
/// survives the `Check -> Send -> Check` cycle.
#[derive(Debug, Clone)]
pub struct RetryBudget(Rc<Cell<u32>>);

impl RetryBudget {
    pub fn new(retries: u32) -> Self {
        Self(Rc::new(Cell::new(retries)))
    }

    /// Consume one retry.  `false` once the budget is spent.
    pub fn try_consume(&self) -> bool {
        match self.0.get() {
            0 => false,
            n => {
                self.0.set(n - 1);
                true
            }
        }
    }

    pub fn remaining(&self) -> u32 {
        self.0.get()
    }
}
