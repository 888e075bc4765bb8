//! Bottom protocol layer: one command out, one framed answer in.

use std::rc::Rc;
use std::time::Instant;

use log::{debug, warn};

use crate::error::ProtocolFault;
use crate::fsm::context::{DeviceContext, RetryBudget};
use crate::fsm::{Event, State};

/// Longest answer frame any instrument sends.  Longer frames are rejected.
pub const FRAME_CAPACITY: usize = 64;

/// End-of-frame byte for every ASCII instrument on the rig.
pub const TERMINATOR: u8 = b'\r';

/// Predicate over one answer frame (terminator stripped).
pub type Validator = Rc<dyn Fn(&str) -> bool>;

// ---------------------------------------------------------------------------
// Send
// ---------------------------------------------------------------------------

/// Clears the input buffer, writes `command\r` and yields `Next` on its first tick.
pub struct SendCommand {
    command: Rc<str>,
}

impl SendCommand {
    pub fn new(command: impl Into<Rc<str>>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl<C: DeviceContext> State<C> for SendCommand {
    fn tick(&mut self, ctx: &mut C) -> Option<Event> {
        let io = ctx.io();
        let sent = io
            .clear_input_buffer()
            .and_then(|()| io.send_line(&self.command));
        match sent {
            Ok(()) => Some(Event::Next),
            Err(e) => {
                warn!("{}: sending {:?} failed: {}", io.name(), self.command, e);
                Some(Event::Error)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame accumulator
// ---------------------------------------------------------------------------

/// Collects answer bytes across ticks until the terminator arrives.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    bytes: heapless::Vec<u8, FRAME_CAPACITY>,
    overflow: bool,
}

impl FrameBuffer {
    /// Append `input`.  Returns `true` once a terminator completes the
    /// frame; anything after it is dropped.
    pub fn feed(&mut self, input: &[u8]) -> bool {
        for &byte in input {
            match byte {
                TERMINATOR => return true,
                // some instruments answer with CR LF
                b'\n' => {}
                _ => {
                    if self.bytes.push(byte).is_err() {
                        self.overflow = true;
                    }
                }
            }
        }
        false
    }

    /// The frame as text, or `None` if it overflowed or is not UTF-8.
    pub fn text(&self) -> Option<&str> {
        if self.overflow {
            return None;
        }
        core::str::from_utf8(&self.bytes).ok()
    }

    pub fn lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

// ---------------------------------------------------------------------------
// Wait for answer
// ---------------------------------------------------------------------------

/// Accumulates bytes until the terminator, then validates the frame.
///
/// Yields `Next` on success.  A mismatch or a missed deadline consumes one
/// retry and yields `Retry`.  With the budget spent, a mismatch yields
/// `Error` and a missed deadline yields `Timeout`.
pub struct WaitForAnswer {
    validator: Validator,
    retries: RetryBudget,
    deadline: Instant,
    frame: FrameBuffer,
}

impl WaitForAnswer {
    pub fn new(validator: Validator, retries: RetryBudget, deadline: Instant) -> Self {
        Self {
            validator,
            retries,
            deadline,
            frame: FrameBuffer::default(),
        }
    }

    fn fail(&self, device: &str, fault: ProtocolFault) -> Event {
        if self.retries.try_consume() {
            debug!(
                "{}: {}, retrying ({} left)",
                device,
                fault,
                self.retries.remaining()
            );
            return Event::Retry;
        }
        warn!("{}: {} (frame {:?})", device, fault, self.frame.lossy());
        match fault {
            ProtocolFault::Timeout => Event::Timeout,
            ProtocolFault::Mismatch => Event::Error,
        }
    }
}

impl<C: DeviceContext> State<C> for WaitForAnswer {
    fn tick(&mut self, ctx: &mut C) -> Option<Event> {
        let io = ctx.io();
        let bytes = match io.receive() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{}: receive failed: {}", io.name(), e);
                return Some(Event::Error);
            }
        };

        if self.frame.feed(&bytes) {
            if self.frame.text().is_some_and(|text| (self.validator)(text)) {
                return Some(Event::Next);
            }
            return Some(self.fail(io.name(), ProtocolFault::Mismatch));
        }

        if io.now() >= self.deadline {
            return Some(self.fail(io.name(), ProtocolFault::Timeout));
        }
        None
    }
}
