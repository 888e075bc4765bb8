//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by rendering every [`RunEvent`] as one log
//! line.  A reporting front end would implement the same trait.

use log::{error, info, warn};

use crate::app::events::RunEvent;
use crate::app::ports::EventSink;

/// Adapter that logs every [`RunEvent`].
#[derive(Debug, Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &RunEvent) {
        match event {
            RunEvent::Started { pumps } => {
                info!("START | pumps={}", pumps);
            }
            RunEvent::StateChanged { from, to } => {
                info!("STATE | {} -> {}", from, to);
            }
            RunEvent::DeviceFailed { device, state } => {
                error!("FAULT | {} stopped in {}", device, state);
            }
            RunEvent::PointApplied(p) => {
                info!(
                    "POINT | t={:?}s | T={:.2}\u{00b0}C bath={:.1}\u{00b0}C | flow={:?} accepted={:?}{}",
                    p.elapsed_s,
                    p.temperature,
                    p.bath_temperature,
                    p.set_flowrates,
                    p.accepted_flowrates,
                    if p.soak { " | soak" } else { "" },
                );
            }
            RunEvent::ShutdownStarted { target } => {
                warn!("SHUTDOWN | towards {}", target);
            }
            RunEvent::Halted { state } => {
                info!("HALT | {}", state);
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<RunEvent>,
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &RunEvent) {
        self.events.push(event.clone());
    }
}
