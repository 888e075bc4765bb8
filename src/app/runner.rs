//! Polling loop around the [`Automation`].
//!
//! ```text
//!   ┌──────────────┐  cancelled?  ┌──────────────┐
//!   │ Cancellation │─────────────▶│ abort() once │
//!   │ token        │              └──────┬───────┘
//!   └──────────────┘                     ▼
//!                        tick() ──▶ halted? ──yes──▶ RunOutcome
//!                          ▲           │ no
//!                          └─ pause() ◀┘
//! ```
//!
//! The loop never preempts a tick: cancellation is observed between
//! ticks and turned into the automaton's `Abort` event, so the ordered
//! shutdown always runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::info;
use serde::Serialize;

use super::automation::{Automation, RunState};
use super::events::PointBoundary;
use super::ports::EventSink;
use crate::drivers::SensorRow;
use crate::fsm::StateId;
use crate::strategy::PointMetrics;

/// Cooperative stop flag.  Clones share one flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub state: RunState,
    pub ticks: u64,
}

impl RunOutcome {
    pub fn finished(&self) -> bool {
        self.state == RunState::Finished
    }
}

/// Tick `automation` until it halts.
///
/// `pause` runs between two ticks: a sleep for real runs, a clock
/// advance in tests.
pub fn run(
    automation: &mut Automation,
    sink: &mut impl EventSink,
    cancel: &CancellationToken,
    mut pause: impl FnMut(),
) -> RunOutcome {
    let mut ticks = 0;
    let mut aborted = false;
    loop {
        if !aborted && cancel.is_cancelled() {
            info!("run: stop requested");
            automation.abort(sink);
            aborted = true;
        }

        automation.tick(sink);
        ticks += 1;
        if automation.is_halted() {
            let outcome = RunOutcome {
                state: automation.state(),
                ticks,
            };
            info!("run: ended in {} after {} ticks", outcome.state.name(), ticks);
            return outcome;
        }
        pause();
    }
}

/// Everything a reporting front end needs after a run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub final_state: &'static str,
    pub rows: Vec<SensorRow>,
    pub point_boundaries: Vec<PointBoundary>,
    pub metrics: Vec<PointMetrics>,
}

impl Report {
    pub fn collect(automation: &Automation) -> Self {
        Self {
            final_state: automation.state_name(),
            rows: automation.rows().to_vec(),
            point_boundaries: automation.point_boundaries().to_vec(),
            metrics: automation.metrics().to_vec(),
        }
    }
}
