//! Port traits: the boundary between the control core and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ drivers / Automation (domain)
//! ```
//!
//! Serial links, clocks and event sinks are reached only through these
//! traits.  Real adapters live in [`crate::adapters`]; tests and the
//! `--simulate` mode plug in simulated instruments and a manual clock.

use std::time::Instant;

use crate::config::SerialSettings;
use crate::error::{Result, TransportError};

// ───────────────────────────────────────────────────────────────
// Transport port (byte stream to one instrument)
// ───────────────────────────────────────────────────────────────

/// Byte-oriented link to a single instrument.
///
/// Every call is non-blocking.  Each device owns its transport exclusively.
pub trait Transport {
    /// Write `data` to the link.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Return whatever bytes are currently available (possibly none).
    fn receive(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Discard anything still sitting in the input buffer.
    fn clear_input_buffer(&mut self) -> Result<(), TransportError>;
}

/// A transport that accepts every write and never answers.
pub struct NullTransport;

impl Transport for NullTransport {
    fn send(&mut self, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        Ok(Vec::new())
    }

    fn clear_input_buffer(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// Port opener (builds one transport per configured device)
// ───────────────────────────────────────────────────────────────

/// Which instrument sits behind a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Hplc,
    Lambda { address: u8 },
    Fisher,
    Calorimeter,
}

/// Everything needed to open the link to one device.
#[derive(Debug, Clone, Copy)]
pub struct PortSpec<'a> {
    pub device: &'a str,
    pub kind: DeviceKind,
    pub port: &'a str,
    pub serial: SerialSettings,
}

/// Serial ports for real runs, instrument models for `--simulate`.
pub trait PortOpener {
    fn open(&mut self, spec: &PortSpec<'_>) -> Result<Box<dyn Transport>>;
}

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Monotonic time source.  All deadlines are absolute `Instant`s from here.
pub trait Clock {
    fn now(&self) -> Instant;
}

// ───────────────────────────────────────────────────────────────
// Event sink port (domain → logging / reporting)
// ───────────────────────────────────────────────────────────────

/// The automation emits structured [`RunEvent`](super::events::RunEvent)s
/// through this port.  Adapters decide where they go.
pub trait EventSink {
    fn emit(&mut self, event: &super::events::RunEvent);
}
