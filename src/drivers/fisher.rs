//! Fisher bath circulator driver.
//!
//! ASCII protocol, `CMD[ value]\r` out, a bare value or `OK\r` back.
//! Configuration pins the unit to Celsius and sets pump speed and probe
//! mode once.  "Pump on" here means bath circulation.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::{Device, DriverCore, DriverPhase, Monitor, Thermostat};
use crate::error::Result;
use crate::fsm::context::{DeviceContext, DeviceIo, SetpointContext, Setpoint};
use crate::fsm::states::Parked;
use crate::fsm::{Event, Row, State, StateFactory, StateId};
use crate::protocol::composite::{Delay, Nested, send_and_check};
use crate::protocol::primitives::Validator;
use crate::protocol::{self, Polling, Sequence, SubMachine};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PumpSpeed {
    #[default]
    L,
    M,
    H,
}

impl PumpSpeed {
    fn code(self) -> &'static str {
        match self {
            Self::L => "L",
            Self::M => "M",
            Self::H => "H",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FisherSettings {
    #[serde(default)]
    pub pump_speed: PumpSpeed,
    /// Regulate on the external probe instead of the bath sensor.
    #[serde(default)]
    pub external_probe: bool,
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct FisherContext {
    io: DeviceIo,
    settings: FisherSettings,
    /// Bath setpoint in tenths of a degree.
    temperature: Setpoint<i32>,
}

impl DeviceContext for FisherContext {
    fn io(&mut self) -> &mut DeviceIo {
        &mut self.io
    }
}

impl SetpointContext for FisherContext {
    fn take_setpoint_change(&mut self) -> bool {
        self.temperature.take_pending().is_some()
    }
}

fn to_tenths(celsius: f64) -> i32 {
    (celsius * 10.0).round() as i32
}

fn from_tenths(tenths: i32) -> f64 {
    f64::from(tenths) / 10.0
}

// ---------------------------------------------------------------------------
// Validators and exchanges
// ---------------------------------------------------------------------------

fn expect(answer: &'static str) -> Validator {
    Rc::new(move |frame: &str| frame.trim() == answer)
}

/// `RS` answer `<float>C`.  Without an applied setpoint any reading passes.
fn expect_temperature(tenths: Option<i32>) -> Validator {
    Rc::new(move |frame: &str| {
        let reading = frame
            .trim()
            .strip_suffix('C')
            .and_then(|v| v.parse::<f64>().ok());
        match (reading, tenths) {
            (Some(value), Some(expected)) => to_tenths(value) == expected,
            (Some(_), None) => true,
            (None, _) => false,
        }
    })
}

fn check_running(ctx: &mut FisherContext, on: bool) -> Box<dyn State<FisherContext>> {
    send_and_check("RO", expect(if on { "1" } else { "0" }), ctx)
}

fn set_temperature(ctx: &mut FisherContext) -> Box<dyn State<FisherContext>> {
    let tenths = ctx.temperature.applied().unwrap_or(0);
    send_and_check(format!("SS {:.1}", from_tenths(tenths)), expect("OK"), ctx)
}

fn check_temperature(ctx: &mut FisherContext) -> Box<dyn State<FisherContext>> {
    let tenths = ctx.temperature.applied();
    send_and_check("RS", expect_temperature(tenths), ctx)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStep {
    PumpOff,
    CheckOff,
    SetUnit,
    CheckUnit,
    SetSpeed,
    CheckSpeed,
    SetProbe,
    CheckProbe,
    Finished,
    Error,
}

impl StateId for ConfigStep {
    fn name(self) -> &'static str {
        match self {
            Self::PumpOff => "Pump_Off",
            Self::CheckOff => "Check_Pump_State",
            Self::SetUnit => "Set_Temp_Unit",
            Self::CheckUnit => "Check_Temp_Unit",
            Self::SetSpeed => "Set_Pump_Speed",
            Self::CheckSpeed => "Check_Pump_Speed",
            Self::SetProbe => "Set_External_Probe",
            Self::CheckProbe => "Check_External_Probe",
            Self::Finished => "Finished",
            Self::Error => "Error",
        }
    }
}

impl SubMachine for ConfigStep {
    const ROWS: &'static [Row<Self>] = &[
        (Self::PumpOff, Event::Next, Self::CheckOff),
        (Self::PumpOff, Event::Error, Self::Error),
        (Self::CheckOff, Event::Next, Self::SetUnit),
        (Self::CheckOff, Event::Error, Self::Error),
        (Self::SetUnit, Event::Next, Self::CheckUnit),
        (Self::SetUnit, Event::Error, Self::Error),
        (Self::CheckUnit, Event::Next, Self::SetSpeed),
        (Self::CheckUnit, Event::Error, Self::Error),
        (Self::SetSpeed, Event::Next, Self::CheckSpeed),
        (Self::SetSpeed, Event::Error, Self::Error),
        (Self::CheckSpeed, Event::Next, Self::SetProbe),
        (Self::CheckSpeed, Event::Error, Self::Error),
        (Self::SetProbe, Event::Next, Self::CheckProbe),
        (Self::SetProbe, Event::Error, Self::Error),
        (Self::CheckProbe, Event::Next, Self::Finished),
        (Self::CheckProbe, Event::Error, Self::Error),
    ];
    const INITIAL: Self = Self::PumpOff;
    const ERROR: Self = Self::Error;
}

impl Sequence for ConfigStep {
    const FINISHED: Self = Self::Finished;
}

struct ConfigFactory;

impl StateFactory<FisherContext> for ConfigFactory {
    type Id = ConfigStep;

    fn create(&mut self, id: ConfigStep, ctx: &mut FisherContext) -> Box<dyn State<FisherContext>> {
        let speed = ctx.settings.pump_speed.code();
        let probe = if ctx.settings.external_probe { "1" } else { "0" };
        match id {
            ConfigStep::PumpOff => send_and_check("SO 0", expect("OK"), ctx),
            ConfigStep::CheckOff => check_running(ctx, false),
            ConfigStep::SetUnit => send_and_check("STU C", expect("OK"), ctx),
            ConfigStep::CheckUnit => send_and_check("RTU", expect("C"), ctx),
            ConfigStep::SetSpeed => send_and_check(format!("SPS {speed}"), expect("OK"), ctx),
            ConfigStep::CheckSpeed => send_and_check("RPS", expect(speed), ctx),
            ConfigStep::SetProbe => send_and_check(format!("SE {probe}"), expect("OK"), ctx),
            ConfigStep::CheckProbe => send_and_check("RE", expect(probe), ctx),
            ConfigStep::Finished | ConfigStep::Error => Box::new(Parked),
        }
    }
}

// ---------------------------------------------------------------------------
// Monitoring (Deactivated and Activated)
// ---------------------------------------------------------------------------

/// Steady-state polling.  `Deactivated` expects the circulator off and
/// rechecks that after a setpoint write.  `Activated` expects it on and
/// alternates between the run flag and the setpoint read-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStep {
    CheckRunning,
    Waiting,
    SetTemp,
    CheckTemp,
    Error,
}

impl StateId for WatchStep {
    fn name(self) -> &'static str {
        match self {
            Self::CheckRunning => "Check_Pump_State",
            Self::Waiting => "Waiting",
            Self::SetTemp => "Set_Temp",
            Self::CheckTemp => "Check_Temp",
            Self::Error => "Error",
        }
    }
}

impl SubMachine for WatchStep {
    const ROWS: &'static [Row<Self>] = &[
        (Self::CheckRunning, Event::Next, Self::Waiting),
        (Self::CheckRunning, Event::Error, Self::Error),
        (Self::Waiting, Event::Next, Self::CheckTemp),
        (Self::Waiting, Event::NewSetpoint, Self::SetTemp),
        (Self::SetTemp, Event::Next, Self::CheckTemp),
        (Self::SetTemp, Event::Error, Self::Error),
        (Self::CheckTemp, Event::Next, Self::CheckRunning),
        (Self::CheckTemp, Event::Error, Self::Error),
    ];
    const INITIAL: Self = Self::CheckRunning;
    const ERROR: Self = Self::Error;
}

impl Polling for WatchStep {
    const WAITING: Self = Self::Waiting;
}

struct WatchFactory {
    running: bool,
}

impl StateFactory<FisherContext> for WatchFactory {
    type Id = WatchStep;

    fn create(&mut self, id: WatchStep, ctx: &mut FisherContext) -> Box<dyn State<FisherContext>> {
        match id {
            WatchStep::CheckRunning => check_running(ctx, self.running),
            WatchStep::Waiting => Box::new(Delay::poll(ctx)),
            WatchStep::SetTemp => set_temperature(ctx),
            WatchStep::CheckTemp => check_temperature(ctx),
            WatchStep::Error => Box::new(Parked),
        }
    }
}

// ---------------------------------------------------------------------------
// Activating / Deactivating
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchStep {
    Switch,
    CheckRunning,
    Finished,
    Error,
}

impl StateId for SwitchStep {
    fn name(self) -> &'static str {
        match self {
            Self::Switch => "Switch",
            Self::CheckRunning => "Check_Pump_State",
            Self::Finished => "Finished",
            Self::Error => "Error",
        }
    }
}

impl SubMachine for SwitchStep {
    const ROWS: &'static [Row<Self>] = &[
        (Self::Switch, Event::Next, Self::CheckRunning),
        (Self::Switch, Event::Error, Self::Error),
        (Self::CheckRunning, Event::Next, Self::Finished),
        (Self::CheckRunning, Event::Error, Self::Error),
    ];
    const INITIAL: Self = Self::Switch;
    const ERROR: Self = Self::Error;
}

impl Sequence for SwitchStep {
    const FINISHED: Self = Self::Finished;
}

struct SwitchFactory {
    on: bool,
}

impl StateFactory<FisherContext> for SwitchFactory {
    type Id = SwitchStep;

    fn create(&mut self, id: SwitchStep, ctx: &mut FisherContext) -> Box<dyn State<FisherContext>> {
        match id {
            SwitchStep::Switch => {
                let command = if self.on { "SO 1" } else { "SO 0" };
                send_and_check(command, expect("OK"), ctx)
            }
            SwitchStep::CheckRunning => check_running(ctx, self.on),
            SwitchStep::Finished | SwitchStep::Error => Box::new(Parked),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct FisherFactory;

impl StateFactory<FisherContext> for FisherFactory {
    type Id = DriverPhase;

    fn create(&mut self, id: DriverPhase, ctx: &mut FisherContext) -> Box<dyn State<FisherContext>> {
        match id {
            DriverPhase::Configuration => Box::new(Nested::enter(ConfigFactory, ctx)),
            DriverPhase::Deactivated => Box::new(Monitor::enter(WatchFactory { running: false }, true, ctx)),
            DriverPhase::Activating => Box::new(Nested::enter(SwitchFactory { on: true }, ctx)),
            DriverPhase::Activated => Box::new(Monitor::enter(WatchFactory { running: true }, true, ctx)),
            DriverPhase::Deactivating => Box::new(Nested::enter(SwitchFactory { on: false }, ctx)),
            DriverPhase::Error => Box::new(Parked),
        }
    }
}

pub struct FisherThermostat {
    core: DriverCore<FisherContext, FisherFactory>,
    circulate: bool,
}

impl FisherThermostat {
    pub fn new(settings: FisherSettings, io: DeviceIo) -> Result<Self> {
        protocol::validate::<ConfigStep>()?;
        protocol::validate::<WatchStep>()?;
        protocol::validate::<SwitchStep>()?;

        let name = io.name().to_string();
        let ctx = FisherContext {
            io,
            settings,
            temperature: Setpoint::unset(),
        };
        let core = DriverCore::new(name, FisherFactory, DriverPhase::Configuration, ctx)?;
        Ok(Self {
            core,
            circulate: false,
        })
    }

    /// Setpoint last written to the bath, in °C.
    pub fn applied_temperature(&self) -> Option<f64> {
        self.core.ctx().temperature.applied().map(from_tenths)
    }
}

impl Device for FisherThermostat {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn tick(&mut self) {
        self.core.tick(self.circulate);
    }

    fn state_name(&self) -> &'static str {
        self.core.state_name()
    }

    fn is_error(&self) -> bool {
        self.core.phase() == DriverPhase::Error
    }
}

impl Thermostat for FisherThermostat {
    fn phase(&self) -> DriverPhase {
        self.core.phase()
    }

    fn activate_pump(&mut self) {
        self.circulate = true;
    }

    fn deactivate_pump(&mut self) {
        self.circulate = false;
    }

    fn set_target_temperature(&mut self, celsius: f64) -> f64 {
        let tenths = to_tenths(celsius);
        self.core.ctx_mut().temperature.request(tenths);
        from_tenths(tenths)
    }
}
