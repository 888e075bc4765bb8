//! Outbound run events.
//!
//! The [`Automation`](super::automation::Automation) emits these through
//! the [`EventSink`](super::ports::EventSink) port.  Adapters on the other
//! side decide what to do with them: log them, record them in a test, or
//! hand them to a reporting front end.

use serde::Serialize;

/// Where a point started and what was actually applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointBoundary {
    /// Calorimeter elapsed time of the last row before the point, if any.
    pub elapsed_s: Option<f64>,
    pub temperature: f64,
    /// Bath setpoint derived from the thermostat calibration.
    pub bath_temperature: f64,
    pub set_flowrates: Vec<f64>,
    /// Flow rates after calibration rounding, as the pumps report them.
    pub accepted_flowrates: Vec<f64>,
    pub soak: bool,
}

/// Structured events emitted by the orchestration layer.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// Automation constructed, devices start configuring.
    Started { pumps: usize },

    /// The top-level automaton moved.
    StateChanged { from: &'static str, to: &'static str },

    /// A driver fell into its terminal `Error` state.
    DeviceFailed { device: String, state: &'static str },

    /// A new operation point (or soak step) was pushed to the devices.
    PointApplied(PointBoundary),

    /// The ordered shutdown began on the way to `target`.
    ShutdownStarted { target: &'static str },

    /// Shutdown done; nothing moves any more.
    Halted { state: &'static str },
}
