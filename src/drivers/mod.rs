//! Instrument drivers: one top-level engine per device.
//!
//! Pumps and the thermostat share one phase table:
//!
//! ```text
//!  Configuration ──Next──▶ Deactivated ──PumpOn──▶ Activating ──Next──▶ Activated
//!                               ▲                                           │
//!                               └────Next──── Deactivating ◀──PumpOff───────┘
//!
//!  any phase ──Error──▶ Error
//! ```
//!
//! `Deactivated` and `Activated` are [`Monitor`]s: they keep polling the
//! instrument and apply setpoint changes whenever their inner engine rests
//! in its waiting step.  Pump on/off requests are honoured at the same
//! point, never in the middle of an exchange.
//!
//! The calorimeter reader has its own engine and does not use the table.

pub mod calibration;
pub mod calorimeter;
pub mod fisher;
pub mod hplc;
pub mod lambda;
pub mod telegram;

use log::{debug, error, info};

use crate::error::FsmError;
use crate::fsm::context::SetpointContext;
use crate::fsm::{Engine, Event, Row, State, StateFactory, StateId, TransitionTable};
use crate::protocol::{Polling, SubMachine};

pub use telegram::SensorRow;

// ---------------------------------------------------------------------------
// Capability surface
// ---------------------------------------------------------------------------

/// What the orchestration layer needs from every instrument.
pub trait Device {
    fn name(&self) -> &str;

    /// Advance the driver by one bounded step.
    fn tick(&mut self);

    fn state_name(&self) -> &'static str;

    /// The driver sits in its terminal `Error` state.
    fn is_error(&self) -> bool;
}

pub trait Pump: Device {
    fn phase(&self) -> DriverPhase;

    fn activate_pump(&mut self);

    fn deactivate_pump(&mut self);

    /// Request a flow rate in ml/min.  Returns the rate the pump will
    /// actually run at after calibration rounding.
    fn set_target_flowrate(&mut self, ml_per_min: f64) -> f64;
}

pub trait Thermostat: Device {
    fn phase(&self) -> DriverPhase;

    /// Start bath circulation.
    fn activate_pump(&mut self);

    fn deactivate_pump(&mut self);

    /// Request a bath temperature in °C.  Returns the accepted value.
    fn set_target_temperature(&mut self, celsius: f64) -> f64;
}

pub trait Calorimeter: Device {
    /// Every telegram received so far, oldest first.
    fn rows(&self) -> &[SensorRow];

    /// Request a reactor set temperature in °C.  Returns the accepted value.
    fn set_target_temperature(&mut self, celsius: f64) -> f64;
}

// ---------------------------------------------------------------------------
// Shared phase table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverPhase {
    Configuration,
    Deactivated,
    Activating,
    Activated,
    Deactivating,
    Error,
}

impl StateId for DriverPhase {
    fn name(self) -> &'static str {
        match self {
            Self::Configuration => "Configuration",
            Self::Deactivated => "Deactivated",
            Self::Activating => "Activating",
            Self::Activated => "Activated",
            Self::Deactivating => "Deactivating",
            Self::Error => "Error",
        }
    }
}

impl DriverPhase {
    pub const ROWS: &'static [Row<Self>] = &[
        (Self::Configuration, Event::Next, Self::Deactivated),
        (Self::Configuration, Event::Error, Self::Error),
        (Self::Deactivated, Event::PumpOn, Self::Activating),
        (Self::Deactivated, Event::Error, Self::Error),
        (Self::Activating, Event::Next, Self::Activated),
        (Self::Activating, Event::Error, Self::Error),
        (Self::Activated, Event::PumpOff, Self::Deactivating),
        (Self::Activated, Event::Error, Self::Error),
        (Self::Deactivating, Event::Next, Self::Deactivated),
        (Self::Deactivating, Event::Error, Self::Error),
    ];
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Wraps a [`Polling`] sub-machine as the `Deactivated`/`Activated` phase.
///
/// Each tick the inner engine advances first.  Once it rests in `WAITING`,
/// a pending setpoint (if followed) is injected as `NewSetpoint`; otherwise
/// a latched pump request is surfaced as `PumpOn`/`PumpOff`.
pub struct Monitor<C, F: StateFactory<C>> {
    engine: Engine<C, F>,
    follow_setpoint: bool,
    request: Option<Event>,
}

impl<C, F> Monitor<C, F>
where
    C: SetpointContext,
    F: StateFactory<C>,
    F::Id: Polling,
{
    pub fn enter(factory: F, follow_setpoint: bool, ctx: &mut C) -> Self {
        let table = TransitionTable::trusted(<F::Id as SubMachine>::ROWS);
        Self {
            engine: Engine::enter(table, factory, <F::Id as SubMachine>::INITIAL, ctx),
            follow_setpoint,
            request: None,
        }
    }
}

impl<C, F> State<C> for Monitor<C, F>
where
    C: SetpointContext,
    F: StateFactory<C>,
    F::Id: Polling,
{
    fn tick(&mut self, ctx: &mut C) -> Option<Event> {
        if let Some(event) = self.engine.tick(ctx) {
            debug!("{}: {:?} unhandled in {}", ctx.io().name(), event, self.engine.state_name());
        }
        let step = self.engine.state();
        if step == <F::Id as SubMachine>::ERROR {
            return Some(Event::Error);
        }
        if step != <F::Id as Polling>::WAITING {
            return None;
        }
        if self.follow_setpoint && ctx.take_setpoint_change() {
            self.engine.handle_event(Event::NewSetpoint, ctx);
            return None;
        }
        self.request.take()
    }

    fn handle_event(&mut self, event: Event) -> bool {
        self.request = match event {
            Event::RequestPumpOn => Some(Event::PumpOn),
            Event::RequestPumpOff => Some(Event::PumpOff),
            _ => return false,
        };
        true
    }

    fn exit(&mut self) {
        self.engine.exit();
    }
}

// ---------------------------------------------------------------------------
// Driver core
// ---------------------------------------------------------------------------

/// Top-level engine plus the device context it runs against.
///
/// Concrete drivers wrap this with their own setpoint API.
pub struct DriverCore<C, F: StateFactory<C, Id = DriverPhase>> {
    name: String,
    engine: Engine<C, F>,
    ctx: C,
}

impl<C, F> DriverCore<C, F>
where
    C: SetpointContext,
    F: StateFactory<C, Id = DriverPhase>,
{
    pub fn new(name: impl Into<String>, factory: F, initial: DriverPhase, mut ctx: C) -> Result<Self, FsmError> {
        let table = TransitionTable::new(DriverPhase::ROWS)?;
        let engine = Engine::enter(table, factory, initial, &mut ctx);
        Ok(Self {
            name: name.into(),
            engine,
            ctx,
        })
    }

    /// Advance one step, then forward the desired pump state as a request.
    pub fn tick(&mut self, wants_on: bool) {
        let before = self.engine.state();
        if let Some(event) = self.engine.tick(&mut self.ctx) {
            debug!("{}: {:?} unhandled in {}", self.name, event, before.name());
        }

        match self.engine.state() {
            DriverPhase::Deactivated if wants_on => {
                self.engine.handle_event(Event::RequestPumpOn, &mut self.ctx);
            }
            DriverPhase::Activated if !wants_on => {
                self.engine.handle_event(Event::RequestPumpOff, &mut self.ctx);
            }
            _ => {}
        }

        let after = self.engine.state();
        if after != before {
            if after == DriverPhase::Error {
                error!("{}: {} -> {}", self.name, before.name(), after.name());
            } else {
                info!("{}: {} -> {}", self.name, before.name(), after.name());
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> DriverPhase {
        self.engine.state()
    }

    pub fn state_name(&self) -> &'static str {
        self.engine.state_name()
    }

    pub fn ctx(&self) -> &C {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut C {
        &mut self.ctx
    }
}

impl<C, F: StateFactory<C, Id = DriverPhase>> Drop for DriverCore<C, F> {
    fn drop(&mut self) {
        self.engine.exit();
    }
}
