//! Top-level orchestration automaton.
//!
//! ```text
//!  Apply_Configuration ──Next──▶ List_Processing ──Next──▶ Finished
//!          │                            │
//!          ├── ErrorPump ───────────────┼──▶ Error_Pump
//!          ├── ErrorThermostat ─────────┼──▶ Error_Thermostat
//!          ├── ErrorCalorimeter ────────┼──▶ Error_Calorimeter
//!          ├── Error ───────────────────┼──▶ Error
//!          └── Abort ───────────────────┴──▶ Aborted
//! ```
//!
//! Every target on the right is entered through the same ordered
//! shutdown: pumps off first, then (unless configured otherwise) the
//! thermostat.  While it runs the state reads `Shutdown_<target>`.
//!
//! `List_Processing` nests its own engine:
//!
//! ```text
//!  Set_Operating_Point ──Next──▶ Operating ──Next──▶ Set_Operating_Point
//!          │                         │
//!          └─Exhausted─▶ Finished    └─Error─▶ Error
//! ```
//!
//! Every automaton tick advances each device once (pumps, thermostat,
//! calorimeter) and then the active state.

use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::events::{PointBoundary, RunEvent};
use super::ports::{Clock, EventSink};
use crate::drivers::calibration::ThermostatCalibration;
use crate::drivers::{Calorimeter, DriverPhase, Pump, SensorRow, Thermostat};
use crate::error::Result;
use crate::fsm::states::Parked;
use crate::fsm::{Engine, Event, Row, State, StateFactory, StateId, TransitionTable};
use crate::strategy::{PointMetrics, Strategy};

// ═══════════════════════════════════════════════════════════════
//  Devices
// ═══════════════════════════════════════════════════════════════

/// Every instrument of one experiment.
pub struct Rig {
    pub pumps: Vec<Box<dyn Pump>>,
    pub thermostat: Box<dyn Thermostat>,
    pub calorimeter: Box<dyn Calorimeter>,
}

impl Rig {
    /// One step for every device, in fixed order.
    fn tick(&mut self) {
        for pump in &mut self.pumps {
            pump.tick();
        }
        self.thermostat.tick();
        self.calorimeter.tick();
    }

    /// The first failed device, mapped to its escalation event.
    fn failure(&self) -> Option<(Event, String, &'static str)> {
        if self.thermostat.is_error() {
            return Some((Event::ErrorThermostat, self.thermostat.name().to_string(), self.thermostat.state_name()));
        }
        if self.calorimeter.is_error() {
            return Some((
                Event::ErrorCalorimeter,
                self.calorimeter.name().to_string(),
                self.calorimeter.state_name(),
            ));
        }
        self.pumps
            .iter()
            .find(|p| p.is_error())
            .map(|p| (Event::ErrorPump, p.name().to_string(), p.state_name()))
    }

    fn pumps_settled(&self) -> bool {
        self.pumps
            .iter()
            .all(|p| matches!(p.phase(), DriverPhase::Deactivated | DriverPhase::Error))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Run states
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    ApplyConfiguration,
    ListProcessing,
    Finished,
    Error,
    ErrorPump,
    ErrorThermostat,
    ErrorCalorimeter,
    Aborted,
}

impl StateId for RunState {
    fn name(self) -> &'static str {
        match self {
            Self::ApplyConfiguration => "Apply_Configuration",
            Self::ListProcessing => "List_Processing",
            Self::Finished => "Finished",
            Self::Error => "Error",
            Self::ErrorPump => "Error_Pump",
            Self::ErrorThermostat => "Error_Thermostat",
            Self::ErrorCalorimeter => "Error_Calorimeter",
            Self::Aborted => "Aborted",
        }
    }
}

impl RunState {
    pub const ROWS: &'static [Row<Self>] = &[
        (Self::ApplyConfiguration, Event::Next, Self::ListProcessing),
        (Self::ListProcessing, Event::Next, Self::Finished),
        (Self::ApplyConfiguration, Event::ErrorCalorimeter, Self::ErrorCalorimeter),
        (Self::ListProcessing, Event::ErrorCalorimeter, Self::ErrorCalorimeter),
        (Self::ApplyConfiguration, Event::ErrorThermostat, Self::ErrorThermostat),
        (Self::ListProcessing, Event::ErrorThermostat, Self::ErrorThermostat),
        (Self::ApplyConfiguration, Event::ErrorPump, Self::ErrorPump),
        (Self::ListProcessing, Event::ErrorPump, Self::ErrorPump),
        (Self::ApplyConfiguration, Event::Error, Self::Error),
        (Self::ListProcessing, Event::Error, Self::Error),
        (Self::ApplyConfiguration, Event::Abort, Self::Aborted),
        (Self::ListProcessing, Event::Abort, Self::Aborted),
    ];

    /// States reached only through the ordered shutdown.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::ApplyConfiguration | Self::ListProcessing)
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::Error | Self::ErrorPump | Self::ErrorThermostat | Self::ErrorCalorimeter
        )
    }

    /// Name while the shutdown towards this state is still running.
    pub fn shutdown_name(self) -> &'static str {
        match self {
            Self::Finished => "Shutdown_Finished",
            Self::Error => "Shutdown_Error",
            Self::ErrorPump => "Shutdown_Error_Pump",
            Self::ErrorThermostat => "Shutdown_Error_Thermostat",
            Self::ErrorCalorimeter => "Shutdown_Error_Calorimeter",
            Self::Aborted => "Shutdown_Aborted",
            Self::ApplyConfiguration | Self::ListProcessing => self.name(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Context
// ═══════════════════════════════════════════════════════════════

/// Behaviour switches fixed for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub thermostat_calibration: ThermostatCalibration,
    /// Devices must be configured within this window.
    pub configuration_deadline: Duration,
    pub leave_thermostat_on: bool,
}

pub struct RunContext {
    rig: Rig,
    strategy: Box<dyn Strategy>,
    settings: RunSettings,
    clock: Rc<dyn Clock>,
    /// Rows already handed to the strategy.
    row_cursor: usize,
    boundaries: Vec<PointBoundary>,
    /// Events raised inside states, drained into the sink after each tick.
    outbox: Vec<RunEvent>,
    halted: bool,
}

impl RunContext {
    fn apply_point(&mut self) -> Option<Event> {
        let Some(point) = self.strategy.next_operation_point() else {
            info!("automation: operation point list exhausted");
            return Some(Event::Exhausted);
        };

        let bath = match self.settings.thermostat_calibration.forward(point.temperature) {
            Ok(bath) => bath,
            Err(e) => {
                error!("automation: {}", e);
                return Some(Event::Error);
            }
        };
        let elapsed_s = self.rig.calorimeter.rows().last().map(|r| r.elapsed_s);
        self.rig.calorimeter.set_target_temperature(point.temperature);
        let bath = self.rig.thermostat.set_target_temperature(bath);
        self.rig.thermostat.activate_pump();

        let mut accepted = Vec::with_capacity(self.rig.pumps.len());
        for (pump, &flow) in self.rig.pumps.iter_mut().zip(&point.flowrates) {
            accepted.push(pump.set_target_flowrate(flow));
            if flow > 0.0 {
                pump.activate_pump();
            } else {
                pump.deactivate_pump();
            }
        }
        self.strategy.push_actual_flowrate(&accepted);

        let boundary = PointBoundary {
            elapsed_s,
            temperature: point.temperature,
            bath_temperature: bath,
            set_flowrates: point.flowrates,
            accepted_flowrates: accepted,
            soak: point.soak,
        };
        info!(
            "automation: {} at {:.2} °C (bath {:.1} °C), flow {:?}",
            if boundary.soak { "soak" } else { "point" },
            boundary.temperature,
            boundary.bath_temperature,
            boundary.accepted_flowrates
        );
        self.outbox.push(RunEvent::PointApplied(boundary.clone()));
        self.boundaries.push(boundary);
        Some(Event::Next)
    }

    /// Hand every new row to the strategy, or mark an empty tick.
    fn drain_rows(&mut self) {
        let rows = self.rig.calorimeter.rows();
        if self.row_cursor >= rows.len() {
            self.strategy.push_value(None);
            return;
        }
        for row in &rows[self.row_cursor..] {
            self.strategy.push_value(Some(row));
        }
        self.row_cursor = rows.len();
    }

    fn report_failure(&mut self) -> Option<Event> {
        let (event, device, state) = self.rig.failure()?;
        error!("automation: {} failed in {}", device, state);
        self.outbox.push(RunEvent::DeviceFailed { device, state });
        Some(event)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Top-level states
// ═══════════════════════════════════════════════════════════════

struct ApplyConfiguration {
    deadline: Instant,
}

impl State<RunContext> for ApplyConfiguration {
    fn tick(&mut self, ctx: &mut RunContext) -> Option<Event> {
        ctx.rig.tick();

        if ctx.clock.now() > self.deadline {
            error!("automation: devices not configured within {:?}", ctx.settings.configuration_deadline);
            return Some(Event::Error);
        }
        if let Some(event) = ctx.report_failure() {
            return Some(event);
        }

        let ready = ctx.rig.pumps.iter().all(|p| p.phase() == DriverPhase::Deactivated)
            && ctx.rig.thermostat.phase() == DriverPhase::Deactivated
            && !ctx.rig.calorimeter.rows().is_empty();
        ready.then_some(Event::Next)
    }
}

struct ListProcessing {
    engine: Engine<RunContext, ListFactory>,
}

impl ListProcessing {
    fn enter(ctx: &mut RunContext) -> Self {
        // rows from the configuration phase are not part of any point
        ctx.row_cursor = ctx.rig.calorimeter.rows().len();
        let table = TransitionTable::trusted(ListStep::ROWS);
        Self {
            engine: Engine::enter(table, ListFactory, ListStep::SetOperatingPoint, ctx),
        }
    }
}

impl State<RunContext> for ListProcessing {
    fn tick(&mut self, ctx: &mut RunContext) -> Option<Event> {
        ctx.rig.tick();

        let before = self.engine.state();
        self.engine.tick(ctx);
        if self.engine.state() != before {
            debug!("automation: {} -> {}", before.name(), self.engine.state_name());
        }

        if let Some(event) = ctx.report_failure() {
            return Some(event);
        }
        match self.engine.state() {
            ListStep::Error => Some(Event::Error),
            ListStep::Finished => Some(Event::Next),
            ListStep::SetOperatingPoint | ListStep::Operating => None,
        }
    }

    fn exit(&mut self) {
        self.engine.exit();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownStage {
    WaitPumps,
    StopThermostat,
    WaitThermostat,
    Done,
}

/// Ordered shutdown on the way to a terminal state.
struct Shutdown {
    target: RunState,
    stage: ShutdownStage,
}

impl Shutdown {
    fn enter(target: RunState, ctx: &mut RunContext) -> Self {
        info!("automation: entering {}", target.shutdown_name());
        for pump in &mut ctx.rig.pumps {
            pump.deactivate_pump();
        }
        ctx.strategy.finish();
        ctx.outbox.push(RunEvent::ShutdownStarted { target: target.name() });
        Self {
            target,
            stage: ShutdownStage::WaitPumps,
        }
    }
}

impl State<RunContext> for Shutdown {
    fn tick(&mut self, ctx: &mut RunContext) -> Option<Event> {
        ctx.rig.tick();

        self.stage = match self.stage {
            ShutdownStage::WaitPumps if !ctx.rig.pumps_settled() => ShutdownStage::WaitPumps,
            ShutdownStage::WaitPumps if ctx.settings.leave_thermostat_on => {
                info!("automation: pumps stopped, thermostat left running");
                ShutdownStage::Done
            }
            ShutdownStage::WaitPumps => ShutdownStage::StopThermostat,
            ShutdownStage::StopThermostat => {
                info!("automation: pumps stopped, switching thermostat off");
                ctx.rig.thermostat.deactivate_pump();
                ShutdownStage::WaitThermostat
            }
            ShutdownStage::WaitThermostat => {
                if matches!(ctx.rig.thermostat.phase(), DriverPhase::Deactivated | DriverPhase::Error) {
                    ShutdownStage::Done
                } else {
                    ShutdownStage::WaitThermostat
                }
            }
            ShutdownStage::Done => ShutdownStage::Done,
        };

        if self.stage == ShutdownStage::Done && !ctx.halted {
            ctx.halted = true;
            if self.target.is_error() {
                warn!("automation: halted in {}", self.target.name());
            } else {
                info!("automation: halted in {}", self.target.name());
            }
            ctx.outbox.push(RunEvent::Halted { state: self.target.name() });
        }
        None
    }
}

struct RunFactory;

impl StateFactory<RunContext> for RunFactory {
    type Id = RunState;

    fn create(&mut self, id: RunState, ctx: &mut RunContext) -> Box<dyn State<RunContext>> {
        match id {
            RunState::ApplyConfiguration => Box::new(ApplyConfiguration {
                deadline: ctx.clock.now() + ctx.settings.configuration_deadline,
            }),
            RunState::ListProcessing => Box::new(ListProcessing::enter(ctx)),
            RunState::Finished
            | RunState::Error
            | RunState::ErrorPump
            | RunState::ErrorThermostat
            | RunState::ErrorCalorimeter
            | RunState::Aborted => Box::new(Shutdown::enter(id, ctx)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  List processing
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListStep {
    SetOperatingPoint,
    Operating,
    Finished,
    Error,
}

impl StateId for ListStep {
    fn name(self) -> &'static str {
        match self {
            Self::SetOperatingPoint => "Set_Operating_Point",
            Self::Operating => "Operating",
            Self::Finished => "Finished",
            Self::Error => "Error",
        }
    }
}

impl ListStep {
    pub const ROWS: &'static [Row<Self>] = &[
        (Self::SetOperatingPoint, Event::Next, Self::Operating),
        (Self::SetOperatingPoint, Event::Exhausted, Self::Finished),
        (Self::SetOperatingPoint, Event::Error, Self::Error),
        (Self::Operating, Event::Next, Self::SetOperatingPoint),
        (Self::Operating, Event::Error, Self::Error),
    ];
}

struct SetOperatingPoint;

impl State<RunContext> for SetOperatingPoint {
    fn tick(&mut self, ctx: &mut RunContext) -> Option<Event> {
        ctx.apply_point()
    }
}

struct Operating;

impl State<RunContext> for Operating {
    fn tick(&mut self, ctx: &mut RunContext) -> Option<Event> {
        ctx.drain_rows();
        if ctx.strategy.has_error() {
            error!("automation: equilibration deadline exceeded");
            return Some(Event::Error);
        }
        ctx.strategy.point_complete().then_some(Event::Next)
    }
}

struct ListFactory;

impl StateFactory<RunContext> for ListFactory {
    type Id = ListStep;

    fn create(&mut self, id: ListStep, _ctx: &mut RunContext) -> Box<dyn State<RunContext>> {
        match id {
            ListStep::SetOperatingPoint => Box::new(SetOperatingPoint),
            ListStep::Operating => Box::new(Operating),
            ListStep::Finished | ListStep::Error => Box::new(Parked),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Automation
// ═══════════════════════════════════════════════════════════════

/// The orchestration automaton and everything it drives.
pub struct Automation {
    engine: Engine<RunContext, RunFactory>,
    ctx: RunContext,
    started: bool,
}

impl Automation {
    pub fn new(rig: Rig, strategy: Box<dyn Strategy>, settings: RunSettings, clock: Rc<dyn Clock>) -> Result<Self> {
        TransitionTable::new(ListStep::ROWS)?;
        let table = TransitionTable::new(RunState::ROWS)?;
        let mut ctx = RunContext {
            rig,
            strategy,
            settings,
            clock,
            row_cursor: 0,
            boundaries: Vec::new(),
            outbox: Vec::new(),
            halted: false,
        };
        let engine = Engine::enter(table, RunFactory, RunState::ApplyConfiguration, &mut ctx);
        Ok(Self {
            engine,
            ctx,
            started: false,
        })
    }

    /// Advance every device and the automaton by one step.
    pub fn tick(&mut self, sink: &mut impl EventSink) {
        if !self.started {
            self.started = true;
            sink.emit(&RunEvent::Started {
                pumps: self.ctx.rig.pumps.len(),
            });
        }

        let from = self.state_name();
        self.engine.tick(&mut self.ctx);
        self.flush(sink, from);
    }

    /// Operator stop.  Runs the ordered shutdown into `Aborted`; ignored
    /// once a shutdown is already under way.
    pub fn abort(&mut self, sink: &mut impl EventSink) {
        let from = self.state_name();
        if self.engine.handle_event(Event::Abort, &mut self.ctx) {
            warn!("automation: aborted in {}", from);
        }
        self.flush(sink, from);
    }

    pub fn state(&self) -> RunState {
        self.engine.state()
    }

    /// `Shutdown_<target>` while the shutdown runs, then the target itself.
    pub fn state_name(&self) -> &'static str {
        let state = self.engine.state();
        if state.is_terminal() && !self.ctx.halted {
            state.shutdown_name()
        } else {
            state.name()
        }
    }

    /// A terminal state was reached and its shutdown completed.
    pub fn is_halted(&self) -> bool {
        self.ctx.halted
    }

    pub fn rig(&self) -> &Rig {
        &self.ctx.rig
    }

    pub fn rows(&self) -> &[SensorRow] {
        self.ctx.rig.calorimeter.rows()
    }

    pub fn point_boundaries(&self) -> &[PointBoundary] {
        &self.ctx.boundaries
    }

    pub fn metrics(&self) -> &[PointMetrics] {
        self.ctx.strategy.metrics()
    }

    fn flush(&mut self, sink: &mut impl EventSink, from: &'static str) {
        let to = self.state_name();
        if to != from {
            info!("automation: {} -> {}", from, to);
            sink.emit(&RunEvent::StateChanged { from, to });
        }
        for event in self.ctx.outbox.drain(..) {
            sink.emit(&event);
        }
    }
}

impl Drop for Automation {
    fn drop(&mut self) {
        self.engine.exit();
    }
}
