//! Unified error types for the calorimetry rig controller.
//!
//! Only setup can fail with an `Err`: configuration validation, transition
//! table validation, opening serial ports and calibration lookups.  Once
//! ticking starts, device faults are surfaced as events and terminal state
//! names instead.  The fault kinds that travel that way ([`ProtocolFault`],
//! [`TelegramError`]) still live here so they can be logged and tested as
//! values.

use core::fmt;

use crate::fsm::Event;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible setup operation funnels into this type.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Configuration is invalid (unknown device, bad pump head, pump count mismatch, ...).
    Config(String),
    /// A transition table failed validation.
    Fsm(FsmError),
    /// A transport could not be opened or failed outside of ticking.
    Transport(TransportError),
    /// A calibration lookup was out of range.
    Calibration(CalibrationError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Fsm(e) => write!(f, "fsm: {e}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Calibration(e) => write!(f, "calibration: {e}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// FSM errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmError {
    /// Two rows share a (source, event) pair but name different targets.
    ConflictingTransition {
        state: &'static str,
        event: Event,
    },
}

impl fmt::Display for FsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConflictingTransition { state, event } => {
                write!(f, "conflicting transitions for ({state}, {event:?})")
            }
        }
    }
}

impl From<FsmError> for Error {
    fn from(e: FsmError) -> Self {
        Self::Fsm(e)
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The port could not be opened.
    Open { port: String, reason: String },
    /// A read or write on an open port failed.
    Io(String),
    /// The crate was built without the `serial` feature.
    Unsupported,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { port, reason } => write!(f, "cannot open {port}: {reason}"),
            Self::Io(reason) => write!(f, "I/O error: {reason}"),
            Self::Unsupported => write!(f, "serial support not compiled in (enable feature `serial`)"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Calibration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationError {
    /// The input lies outside the calibrated range.
    OutOfRange { value: f64, lower: f64, upper: f64 },
    /// No calibration entry exists for the requested temperature.
    Missing { temperature: i64 },
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { value, lower, upper } => {
                write!(f, "{value} outside calibrated range [{lower}, {upper}]")
            }
            Self::Missing { temperature } => {
                write!(f, "no calorimeter calibration for {temperature} C")
            }
        }
    }
}

impl From<CalibrationError> for Error {
    fn from(e: CalibrationError) -> Self {
        Self::Calibration(e)
    }
}

// ---------------------------------------------------------------------------
// Faults that travel as events
// ---------------------------------------------------------------------------

/// Why a command/response exchange failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFault {
    /// No terminated response inside the response window.
    Timeout,
    /// The validator rejected the response.
    Mismatch,
}

impl fmt::Display for ProtocolFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "response timeout"),
            Self::Mismatch => write!(f, "response mismatch"),
        }
    }
}

/// A calorimeter line that does not look like a telegram.  Dropped, never escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramError {
    /// Wrong number of tab-separated fields.
    FieldCount(usize),
    /// The field at this index is not a number.
    NotNumeric(usize),
}

impl fmt::Display for TelegramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldCount(n) => write!(f, "malformed telegram: {n} fields"),
            Self::NotNumeric(idx) => write!(f, "malformed telegram: field {idx} not numeric"),
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T, E = Error> = core::result::Result<T, E>;
