//! Operation-point strategies.
//!
//! A strategy walks an ordered list of operation points and decides, from
//! the streamed calorimeter rows, when each point is settled and done.
//!
//! ```text
//!  next_operation_point()
//!        │ new temperature                       same temperature
//!        ▼                                             ▼
//!  Temperature_Equilibration ──point_complete──▶ Setting_Deadline
//!  (soak point, zero flow)                             │ point_complete arms
//!        ▲                                             ▼      the hold deadline
//!        └──── next_operation_point ◀──────── Waiting_For_Deadline
//! ```
//!
//! The bookkeeping shared by every strategy lives in [`PointScheduler`].
//! [`OperationPointList`] is the plain walker; [`AbsoluteEvaluation`] adds
//! per-point heat-flux and enthalpy aggregation.

pub mod evaluation;
pub mod list;

use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::Clock;
use crate::drivers::SensorRow;
use crate::error::{Error, Result};

pub use evaluation::{AbsoluteEvaluation, PointMetrics, Substance, SubstanceData};
pub use list::OperationPointList;

// ═══════════════════════════════════════════════════════════════
//  Operation points
// ═══════════════════════════════════════════════════════════════

/// One scripted target: temperature, per-pump flow rates, hold time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPoint {
    pub duration_ms: u64,
    /// Reactor temperature in °C.
    pub temperature: f64,
    /// ml/min, indexed like the configured pumps.
    pub flowrates: Vec<f64>,
}

impl OperationPoint {
    pub fn new(duration_ms: u64, temperature: f64, flowrates: Vec<f64>) -> Self {
        Self {
            duration_ms,
            temperature,
            flowrates,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn pump_count(&self) -> usize {
        self.flowrates.len()
    }
}

/// What the orchestration pushes to the devices for one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedPoint {
    pub temperature: f64,
    pub flowrates: Vec<f64>,
    /// Equilibration step: the point's temperature with every pump at zero.
    pub soak: bool,
}

// ═══════════════════════════════════════════════════════════════
//  Strategy trait
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StrategyPhase {
    TemperatureEquilibration,
    SettingDeadline,
    WaitingForDeadline,
}

impl StrategyPhase {
    pub fn name(self) -> &'static str {
        match self {
            Self::TemperatureEquilibration => "Temperature_Equilibration",
            Self::SettingDeadline => "Setting_Deadline",
            Self::WaitingForDeadline => "Waiting_For_Deadline",
        }
    }
}

/// Point-completion policy driven by the orchestration automaton.
pub trait Strategy {
    /// The next step to apply, or `None` once the list is exhausted.
    fn next_operation_point(&mut self) -> Option<AppliedPoint>;

    /// Feed one calorimeter row.  `None` marks a tick without new data.
    fn push_value(&mut self, row: Option<&SensorRow>);

    /// The current step is done.  May arm deadlines as a side effect.
    fn point_complete(&mut self) -> bool;

    /// The equilibration deadline passed without the step completing.
    fn has_error(&self) -> bool;

    /// Flow rates the pumps actually accepted, after calibration rounding.
    fn push_actual_flowrate(&mut self, values: &[f64]);

    /// Called once when shutdown starts.
    fn finish(&mut self);

    fn phase(&self) -> StrategyPhase;

    /// Per-point aggregation results, oldest first.
    fn metrics(&self) -> &[PointMetrics] {
        &[]
    }
}

// ═══════════════════════════════════════════════════════════════
//  Equilibration
// ═══════════════════════════════════════════════════════════════

/// How a new temperature is judged reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquilibrationSettings {
    /// Most recent rows inspected.
    pub window: usize,
    /// Allowed deviation from the target, °C.
    pub tolerance: f64,
    /// Row columns compared with the target (pre-heater and both reactor probes).
    pub channels: Vec<usize>,
    pub timeout_ms: u64,
    /// Require 90 % of the window within tolerance on every channel.
    /// Off: a full window is enough.
    pub strict: bool,
}

impl Default for EquilibrationSettings {
    fn default() -> Self {
        Self {
            window: 10,
            tolerance: 0.1,
            channels: vec![2, 3, 4],
            timeout_ms: 10 * 60 * 1000,
            strict: false,
        }
    }
}

impl EquilibrationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Rows within tolerance needed per channel.
    fn required(&self) -> usize {
        (self.window as f64 * 0.9).ceil() as usize
    }
}

// ═══════════════════════════════════════════════════════════════
//  Shared bookkeeping
// ═══════════════════════════════════════════════════════════════

/// Cursor, phase and deadlines common to every strategy.
pub struct PointScheduler {
    clock: Rc<dyn Clock>,
    points: Vec<OperationPoint>,
    cursor: usize,
    current: Option<OperationPoint>,
    current_temperature: Option<f64>,
    phase: StrategyPhase,
    /// Equilibration deadline, then the hold deadline.
    deadline: Option<Instant>,
    /// End of the dead time inside the hold.
    settled_at: Option<Instant>,
    dead_time: Duration,
    equilibration: EquilibrationSettings,
    rows: Vec<SensorRow>,
}

impl PointScheduler {
    /// Every point must outlast `dead_time`.
    pub fn new(
        points: Vec<OperationPoint>,
        dead_time: Duration,
        equilibration: EquilibrationSettings,
        clock: Rc<dyn Clock>,
    ) -> Result<Self> {
        if equilibration.window == 0 {
            return Err(Error::Config("equilibration window must hold at least one row".into()));
        }
        if let Some((idx, _)) = points
            .iter()
            .enumerate()
            .find(|(_, p)| p.duration() <= dead_time)
        {
            return Err(Error::Config(format!(
                "operation point {} lasts no longer than the dead time of {} ms",
                idx + 1,
                dead_time.as_millis()
            )));
        }
        Ok(Self {
            clock,
            points,
            cursor: 0,
            current: None,
            current_temperature: None,
            phase: StrategyPhase::TemperatureEquilibration,
            deadline: None,
            settled_at: None,
            dead_time,
            equilibration,
            rows: Vec::new(),
        })
    }

    pub fn next_operation_point(&mut self) -> Option<AppliedPoint> {
        let Some(point) = self.points.get(self.cursor).cloned() else {
            self.current = None;
            return None;
        };

        if self.current_temperature != Some(point.temperature) {
            self.deadline = Some(self.clock.now() + self.equilibration.timeout());
            self.phase = StrategyPhase::TemperatureEquilibration;
            self.current_temperature = Some(point.temperature);
            info!("strategy: equilibrating at {:.2} °C", point.temperature);
            let applied = AppliedPoint {
                temperature: point.temperature,
                flowrates: vec![0.0; point.pump_count()],
                soak: true,
            };
            self.current = Some(point);
            return Some(applied);
        }

        self.cursor += 1;
        self.phase = StrategyPhase::SettingDeadline;
        info!(
            "strategy: point {}/{} at {:.2} °C, flow {:?}",
            self.cursor,
            self.points.len(),
            point.temperature,
            point.flowrates
        );
        let applied = AppliedPoint {
            temperature: point.temperature,
            flowrates: point.flowrates.clone(),
            soak: false,
        };
        self.current = Some(point);
        Some(applied)
    }

    /// Append `row` to the log.  Returns `true` if one was appended.
    pub fn push_value(&mut self, row: Option<&SensorRow>) -> bool {
        match row {
            Some(row) => {
                self.rows.push(*row);
                true
            }
            None => false,
        }
    }

    pub fn point_complete(&mut self) -> bool {
        match self.phase {
            StrategyPhase::TemperatureEquilibration => self.equilibrated(),
            StrategyPhase::SettingDeadline => {
                let now = self.clock.now();
                let hold = self.current.as_ref().map_or(Duration::ZERO, OperationPoint::duration);
                self.deadline = Some(now + hold);
                self.settled_at = Some(now + self.dead_time);
                self.phase = StrategyPhase::WaitingForDeadline;
                debug!("strategy: holding for {:?}", hold);
                false
            }
            StrategyPhase::WaitingForDeadline => self.deadline_passed(),
        }
    }

    pub fn has_error(&self) -> bool {
        if self.phase != StrategyPhase::TemperatureEquilibration || !self.deadline_passed() {
            return false;
        }
        warn!("strategy: set temperature not reached at the reactor");
        true
    }

    pub fn phase(&self) -> StrategyPhase {
        self.phase
    }

    /// Point currently being equilibrated or held.
    pub fn current(&self) -> Option<&OperationPoint> {
        self.current.as_ref()
    }

    pub fn rows(&self) -> &[SensorRow] {
        &self.rows
    }

    /// The hold is running and its dead time is over.
    pub fn evaluation_open(&self) -> bool {
        self.phase == StrategyPhase::WaitingForDeadline
            && self.settled_at.is_some_and(|t| t < self.clock.now())
    }

    /// Points fully held so far.
    pub fn completed(&self) -> usize {
        self.cursor
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| d < self.clock.now())
    }

    fn equilibrated(&self) -> bool {
        let window = self.equilibration.window;
        if self.rows.len() < window {
            return false;
        }
        let Some(target) = self.current_temperature else {
            return false;
        };

        let recent = &self.rows[self.rows.len() - window..];
        let required = self.equilibration.required();
        let within = |channel: usize| {
            recent
                .iter()
                .filter(|row| {
                    row.column(channel)
                        .is_some_and(|v| (v - target).abs() < self.equilibration.tolerance)
                })
                .count()
        };
        let settled = self
            .equilibration
            .channels
            .iter()
            .all(|&channel| within(channel) >= required);

        if !settled {
            if self.equilibration.strict {
                return false;
            }
            debug!("strategy: tolerance not met at {:.2} °C, accepting full window", target);
        }
        true
    }
}
