//! HPLC metering pump driver.
//!
//! ASCII protocol, `CMD[: value]\r` out, `LABEL:value\r` back.
//!
//! While idle the pump must show (almost) no pressure.  After every
//! activation or flow change the driver samples the working pressure ten
//! times, derives an acceptance band from mean and standard deviation, and
//! from then on checks every reading against that band.

use std::rc::Rc;
use std::time::Instant;

use log::{info, warn};

use super::calibration::FlowCalibration;
use super::{Device, DriverCore, DriverPhase, Monitor, Pump};
use crate::error::{Error, Result};
use crate::fsm::context::{DeviceContext, DeviceIo, SetpointContext, Setpoint};
use crate::fsm::states::Parked;
use crate::fsm::{Event, Row, State, StateFactory, StateId};
use crate::protocol::composite::{Delay, Nested, send_and_check};
use crate::protocol::primitives::{FrameBuffer, SendCommand, Validator};
use crate::protocol::{self, Polling, Sequence, SubMachine};

/// Largest value the five-digit `FLOW:` field can carry (µl/min).
pub const MAX_FLOW: u32 = 99_999;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct HplcSettings {
    head: u16,
    pmin: u32,
    pmax: u32,
    /// Highest pressure (bar) accepted as "pump is off".
    pub idle_pressure_limit: f64,
    /// Added on both sides of the derived pressure band (bar).
    pub band_margin: f64,
    /// Readings used to derive the pressure band.
    pub band_samples: usize,
}

impl HplcSettings {
    /// Defaults for a 10 ml or 50 ml head.
    pub fn new(head: u16) -> Result<Self> {
        if head != 10 && head != 50 {
            return Err(Error::Config(format!("invalid pump head {head} (expected 10 or 50)")));
        }
        Ok(Self {
            head,
            pmin: 0,
            pmax: 100,
            idle_pressure_limit: 40.0,
            band_margin: 1.0,
            band_samples: 10,
        })
    }

    /// Pressure limits the pump firmware enforces itself.
    pub fn with_pressure_limits(mut self, pmin: u32, pmax: u32) -> Result<Self> {
        if pmin >= pmax {
            return Err(Error::Config(format!("pmin {pmin} must be below pmax {pmax}")));
        }
        let ceiling = if self.head == 10 { 400 } else { 150 };
        if pmax > ceiling {
            return Err(Error::Config(format!(
                "pmax {pmax} exceeds {ceiling} bar for a {} ml head",
                self.head
            )));
        }
        self.pmin = pmin;
        self.pmax = pmax;
        Ok(self)
    }

    pub fn head(&self) -> u16 {
        self.head
    }

    pub fn pmin(&self) -> u32 {
        self.pmin
    }

    pub fn pmax(&self) -> u32 {
        self.pmax
    }
}

// ---------------------------------------------------------------------------
// Pressure band
// ---------------------------------------------------------------------------

/// Accepted working pressure range, derived from a batch of readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureBand {
    pub mean: f64,
    pub stdev: f64,
    pub lower: f64,
    pub upper: f64,
}

impl PressureBand {
    /// `[mean - 5σ - margin, mean + 20σ + margin]` with σ the sample
    /// standard deviation.  Needs at least two readings.
    pub fn from_samples(samples: &[f64], margin: f64) -> Option<Self> {
        if samples.len() < 2 {
            return None;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let stdev = variance.sqrt();
        Some(Self {
            mean,
            stdev,
            lower: mean - 5.0 * stdev - margin,
            upper: mean + 20.0 * stdev + margin,
        })
    }

    pub fn contains(&self, pressure: f64) -> bool {
        (self.lower..=self.upper).contains(&pressure)
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct HplcContext {
    io: DeviceIo,
    settings: HplcSettings,
    /// Flow in µl/min.
    flow: Setpoint<u32>,
    band: Option<PressureBand>,
    samples: Vec<f64>,
}

impl HplcContext {
    fn applied_flow(&self) -> u32 {
        self.flow.applied().unwrap_or(0)
    }
}

impl DeviceContext for HplcContext {
    fn io(&mut self) -> &mut DeviceIo {
        &mut self.io
    }
}

impl SetpointContext for HplcContext {
    fn take_setpoint_change(&mut self) -> bool {
        self.flow.take_pending().is_some()
    }
}

// ---------------------------------------------------------------------------
// Answer validators
// ---------------------------------------------------------------------------

/// The part after `LABEL:`.
fn answer_value(frame: &str) -> Option<&str> {
    frame.split_once(':').map(|(_, value)| value.trim())
}

fn answer_number(frame: &str) -> Option<f64> {
    answer_value(frame)?.parse().ok()
}

fn expect_ok() -> Validator {
    Rc::new(|frame: &str| answer_value(frame) == Some("OK"))
}

fn expect_echo(expected: u32) -> Validator {
    Rc::new(move |frame: &str| answer_value(frame).and_then(|v| v.parse::<u32>().ok()) == Some(expected))
}

fn expect_idle(limit: f64) -> Validator {
    Rc::new(move |frame: &str| answer_number(frame).is_some_and(|p| p <= limit))
}

fn expect_within(band: Option<PressureBand>) -> Validator {
    Rc::new(move |frame: &str| match (band, answer_number(frame)) {
        (Some(band), Some(p)) => band.contains(p),
        _ => false,
    })
}

fn check_idle(ctx: &mut HplcContext) -> Box<dyn State<HplcContext>> {
    let limit = ctx.settings.idle_pressure_limit;
    send_and_check("PRESSURE?", expect_idle(limit), ctx)
}

fn set_flow(ctx: &mut HplcContext) -> Box<dyn State<HplcContext>> {
    let flow = ctx.applied_flow();
    send_and_check(format!("FLOW: {flow:05}"), expect_ok(), ctx)
}

fn check_flow(ctx: &mut HplcContext) -> Box<dyn State<HplcContext>> {
    let flow = ctx.applied_flow();
    send_and_check("FLOW?", expect_echo(flow), ctx)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStep {
    PumpOff,
    CheckIdle,
    SetPmin,
    CheckPmin,
    SetPmax,
    CheckPmax,
    Finished,
    Error,
}

impl StateId for ConfigStep {
    fn name(self) -> &'static str {
        match self {
            Self::PumpOff => "Pump_Off",
            Self::CheckIdle => "Check_Pump_State",
            Self::SetPmin => "Set_PMin",
            Self::CheckPmin => "Check_PMin",
            Self::SetPmax => "Set_PMax",
            Self::CheckPmax => "Check_PMax",
            Self::Finished => "Finished",
            Self::Error => "Error",
        }
    }
}

impl SubMachine for ConfigStep {
    const ROWS: &'static [Row<Self>] = &[
        (Self::PumpOff, Event::Next, Self::CheckIdle),
        (Self::PumpOff, Event::Error, Self::Error),
        (Self::CheckIdle, Event::Next, Self::SetPmin),
        (Self::CheckIdle, Event::Error, Self::Error),
        (Self::SetPmin, Event::Next, Self::CheckPmin),
        (Self::SetPmin, Event::Error, Self::Error),
        (Self::CheckPmin, Event::Next, Self::SetPmax),
        (Self::CheckPmin, Event::Error, Self::Error),
        (Self::SetPmax, Event::Next, Self::CheckPmax),
        (Self::SetPmax, Event::Error, Self::Error),
        (Self::CheckPmax, Event::Next, Self::Finished),
        (Self::CheckPmax, Event::Error, Self::Error),
    ];
    const INITIAL: Self = Self::PumpOff;
    const ERROR: Self = Self::Error;
}

impl Sequence for ConfigStep {
    const FINISHED: Self = Self::Finished;
}

struct ConfigFactory;

impl StateFactory<HplcContext> for ConfigFactory {
    type Id = ConfigStep;

    fn create(&mut self, id: ConfigStep, ctx: &mut HplcContext) -> Box<dyn State<HplcContext>> {
        let head = ctx.settings.head;
        let (pmin, pmax) = (ctx.settings.pmin, ctx.settings.pmax);
        match id {
            ConfigStep::PumpOff => send_and_check("OFF", expect_ok(), ctx),
            ConfigStep::CheckIdle => check_idle(ctx),
            ConfigStep::SetPmin => send_and_check(format!("PMIN{head}: {pmin}"), expect_ok(), ctx),
            ConfigStep::CheckPmin => send_and_check(format!("PMIN{head}?"), expect_echo(pmin), ctx),
            ConfigStep::SetPmax => send_and_check(format!("PMAX{head}: {pmax}"), expect_ok(), ctx),
            ConfigStep::CheckPmax => send_and_check(format!("PMAX{head}?"), expect_echo(pmax), ctx),
            ConfigStep::Finished | ConfigStep::Error => Box::new(Parked),
        }
    }
}

// ---------------------------------------------------------------------------
// Deactivated: idle pressure, flow changes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStep {
    CheckPressure,
    Waiting,
    SetFlowrate,
    CheckFlowrate,
    Error,
}

impl StateId for IdleStep {
    fn name(self) -> &'static str {
        match self {
            Self::CheckPressure => "Check_Pump_State",
            Self::Waiting => "Waiting",
            Self::SetFlowrate => "Set_Flowrate",
            Self::CheckFlowrate => "Check_Flowrate",
            Self::Error => "Error",
        }
    }
}

impl SubMachine for IdleStep {
    const ROWS: &'static [Row<Self>] = &[
        (Self::CheckPressure, Event::Next, Self::Waiting),
        (Self::CheckPressure, Event::Error, Self::Error),
        (Self::Waiting, Event::Next, Self::CheckPressure),
        (Self::Waiting, Event::NewSetpoint, Self::SetFlowrate),
        (Self::SetFlowrate, Event::Next, Self::CheckFlowrate),
        (Self::SetFlowrate, Event::Error, Self::Error),
        (Self::CheckFlowrate, Event::Next, Self::CheckPressure),
        (Self::CheckFlowrate, Event::Error, Self::Error),
    ];
    const INITIAL: Self = Self::CheckPressure;
    const ERROR: Self = Self::Error;
}

impl Polling for IdleStep {
    const WAITING: Self = Self::Waiting;
}

struct IdleFactory;

impl StateFactory<HplcContext> for IdleFactory {
    type Id = IdleStep;

    fn create(&mut self, id: IdleStep, ctx: &mut HplcContext) -> Box<dyn State<HplcContext>> {
        match id {
            IdleStep::CheckPressure => check_idle(ctx),
            IdleStep::Waiting => Box::new(Delay::poll(ctx)),
            IdleStep::SetFlowrate => set_flow(ctx),
            IdleStep::CheckFlowrate => check_flow(ctx),
            IdleStep::Error => Box::new(Parked),
        }
    }
}

// ---------------------------------------------------------------------------
// Activated: pressure band, flow changes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveStep {
    BuildBand,
    CheckPressure,
    Waiting,
    CheckFlowrate,
    SetFlowrate,
    CheckNewFlowrate,
    Error,
}

impl StateId for ActiveStep {
    fn name(self) -> &'static str {
        match self {
            Self::BuildBand => "Get_Boundaries",
            Self::CheckPressure => "Check_Pump_State",
            Self::Waiting => "Waiting",
            Self::CheckFlowrate => "Check_Flowrate",
            Self::SetFlowrate => "Set_Flowrate",
            Self::CheckNewFlowrate => "Check_New_Flowrate",
            Self::Error => "Error",
        }
    }
}

impl SubMachine for ActiveStep {
    const ROWS: &'static [Row<Self>] = &[
        (Self::BuildBand, Event::Next, Self::CheckPressure),
        (Self::BuildBand, Event::Error, Self::Error),
        (Self::CheckPressure, Event::Next, Self::Waiting),
        (Self::CheckPressure, Event::Error, Self::Error),
        (Self::Waiting, Event::Next, Self::CheckFlowrate),
        (Self::Waiting, Event::NewSetpoint, Self::SetFlowrate),
        (Self::SetFlowrate, Event::Next, Self::CheckNewFlowrate),
        (Self::SetFlowrate, Event::Error, Self::Error),
        (Self::CheckNewFlowrate, Event::Next, Self::BuildBand),
        (Self::CheckNewFlowrate, Event::Error, Self::Error),
        (Self::CheckFlowrate, Event::Next, Self::CheckPressure),
        (Self::CheckFlowrate, Event::Error, Self::Error),
    ];
    const INITIAL: Self = Self::BuildBand;
    const ERROR: Self = Self::Error;
}

impl Polling for ActiveStep {
    const WAITING: Self = Self::Waiting;
}

struct ActiveFactory;

impl StateFactory<HplcContext> for ActiveFactory {
    type Id = ActiveStep;

    fn create(&mut self, id: ActiveStep, ctx: &mut HplcContext) -> Box<dyn State<HplcContext>> {
        match id {
            ActiveStep::BuildBand => {
                ctx.samples.clear();
                ctx.band = None;
                Box::new(Nested::enter(SampleFactory, ctx))
            }
            ActiveStep::CheckPressure => {
                let band = ctx.band;
                send_and_check("PRESSURE?", expect_within(band), ctx)
            }
            ActiveStep::Waiting => Box::new(Delay::poll(ctx)),
            ActiveStep::SetFlowrate => set_flow(ctx),
            ActiveStep::CheckFlowrate | ActiveStep::CheckNewFlowrate => check_flow(ctx),
            ActiveStep::Error => Box::new(Parked),
        }
    }
}

// ---------------------------------------------------------------------------
// Pressure sampling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStep {
    Send,
    Save,
    Waiting,
    Finished,
    Error,
}

impl StateId for SampleStep {
    fn name(self) -> &'static str {
        match self {
            Self::Send => "Send",
            Self::Save => "Save",
            Self::Waiting => "Waiting",
            Self::Finished => "Finished",
            Self::Error => "Error",
        }
    }
}

impl SubMachine for SampleStep {
    const ROWS: &'static [Row<Self>] = &[
        (Self::Send, Event::Next, Self::Save),
        (Self::Send, Event::Error, Self::Error),
        (Self::Save, Event::Next, Self::Waiting),
        (Self::Save, Event::Timeout, Self::Error),
        (Self::Save, Event::Error, Self::Error),
        (Self::Save, Event::Done, Self::Finished),
        (Self::Waiting, Event::Next, Self::Send),
    ];
    const INITIAL: Self = Self::Send;
    const ERROR: Self = Self::Error;
}

impl Sequence for SampleStep {
    const FINISHED: Self = Self::Finished;
}

struct SampleFactory;

impl StateFactory<HplcContext> for SampleFactory {
    type Id = SampleStep;

    fn create(&mut self, id: SampleStep, ctx: &mut HplcContext) -> Box<dyn State<HplcContext>> {
        match id {
            SampleStep::Send => Box::new(SendCommand::new("PRESSURE?")),
            SampleStep::Save => {
                let io = ctx.io();
                let deadline = io.deadline(io.timing.response_timeout);
                Box::new(SaveSample {
                    deadline,
                    frame: FrameBuffer::default(),
                })
            }
            SampleStep::Waiting => Box::new(Delay::poll(ctx)),
            SampleStep::Finished | SampleStep::Error => Box::new(Parked),
        }
    }
}

/// Reads one pressure answer into the sample list.  Yields `Done` once
/// enough samples exist to derive the band.
struct SaveSample {
    deadline: Instant,
    frame: FrameBuffer,
}

impl State<HplcContext> for SaveSample {
    fn tick(&mut self, ctx: &mut HplcContext) -> Option<Event> {
        let bytes = match ctx.io.receive() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{}: receive failed: {}", ctx.io.name(), e);
                return Some(Event::Error);
            }
        };

        if self.frame.feed(&bytes) {
            let Some(pressure) = self.frame.text().and_then(answer_number) else {
                warn!("{}: unreadable pressure {:?}", ctx.io.name(), self.frame.lossy());
                return Some(Event::Error);
            };
            ctx.samples.push(pressure);
            if ctx.samples.len() < ctx.settings.band_samples {
                return Some(Event::Next);
            }
            let band = PressureBand::from_samples(&ctx.samples, ctx.settings.band_margin)?;
            info!(
                "{}: pressure band [{:.2}, {:.2}] bar (mean {:.2}, sd {:.3})",
                ctx.io.name(),
                band.lower,
                band.upper,
                band.mean,
                band.stdev
            );
            ctx.band = Some(band);
            return Some(Event::Done);
        }

        if ctx.io.now() >= self.deadline {
            warn!("{}: no pressure reading", ctx.io.name());
            return Some(Event::Timeout);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Deactivating
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStep {
    PumpOff,
    CheckIdle,
    Finished,
    Error,
}

impl StateId for StopStep {
    fn name(self) -> &'static str {
        match self {
            Self::PumpOff => "Pump_Off",
            Self::CheckIdle => "Check_Pump_State",
            Self::Finished => "Finished",
            Self::Error => "Error",
        }
    }
}

impl SubMachine for StopStep {
    const ROWS: &'static [Row<Self>] = &[
        (Self::PumpOff, Event::Next, Self::CheckIdle),
        (Self::PumpOff, Event::Error, Self::Error),
        (Self::CheckIdle, Event::Next, Self::Finished),
        (Self::CheckIdle, Event::Error, Self::Error),
    ];
    const INITIAL: Self = Self::PumpOff;
    const ERROR: Self = Self::Error;
}

impl Sequence for StopStep {
    const FINISHED: Self = Self::Finished;
}

struct StopFactory;

impl StateFactory<HplcContext> for StopFactory {
    type Id = StopStep;

    fn create(&mut self, id: StopStep, ctx: &mut HplcContext) -> Box<dyn State<HplcContext>> {
        match id {
            StopStep::PumpOff => send_and_check("OFF", expect_ok(), ctx),
            StopStep::CheckIdle => check_idle(ctx),
            StopStep::Finished | StopStep::Error => Box::new(Parked),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct HplcFactory;

impl StateFactory<HplcContext> for HplcFactory {
    type Id = DriverPhase;

    fn create(&mut self, id: DriverPhase, ctx: &mut HplcContext) -> Box<dyn State<HplcContext>> {
        match id {
            DriverPhase::Configuration => Box::new(Nested::enter(ConfigFactory, ctx)),
            DriverPhase::Deactivated => Box::new(Monitor::enter(IdleFactory, true, ctx)),
            DriverPhase::Activating => send_and_check("ON", expect_ok(), ctx),
            DriverPhase::Activated => Box::new(Monitor::enter(ActiveFactory, true, ctx)),
            DriverPhase::Deactivating => Box::new(Nested::enter(StopFactory, ctx)),
            DriverPhase::Error => Box::new(Parked),
        }
    }
}

pub struct HplcPump {
    core: DriverCore<HplcContext, HplcFactory>,
    calibration: FlowCalibration,
    pump_on: bool,
}

impl HplcPump {
    pub fn new(settings: HplcSettings, calibration: FlowCalibration, io: DeviceIo) -> Result<Self> {
        protocol::validate::<ConfigStep>()?;
        protocol::validate::<IdleStep>()?;
        protocol::validate::<ActiveStep>()?;
        protocol::validate::<SampleStep>()?;
        protocol::validate::<StopStep>()?;

        let name = io.name().to_string();
        let ctx = HplcContext {
            io,
            settings,
            flow: Setpoint::new(0),
            band: None,
            samples: Vec::new(),
        };
        let core = DriverCore::new(name, HplcFactory, DriverPhase::Configuration, ctx)?;
        Ok(Self {
            core,
            calibration,
            pump_on: false,
        })
    }

    /// The band currently checked against, if one has been derived.
    pub fn pressure_band(&self) -> Option<PressureBand> {
        self.core.ctx().band
    }

    /// Flow last written to the pump, in µl/min.
    pub fn applied_flow(&self) -> Option<u32> {
        self.core.ctx().flow.applied()
    }
}

impl Device for HplcPump {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn tick(&mut self) {
        self.core.tick(self.pump_on);
    }

    fn state_name(&self) -> &'static str {
        self.core.state_name()
    }

    fn is_error(&self) -> bool {
        self.core.phase() == DriverPhase::Error
    }
}

impl Pump for HplcPump {
    fn phase(&self) -> DriverPhase {
        self.core.phase()
    }

    fn activate_pump(&mut self) {
        self.pump_on = true;
    }

    fn deactivate_pump(&mut self) {
        self.pump_on = false;
    }

    fn set_target_flowrate(&mut self, ml_per_min: f64) -> f64 {
        let device = self.calibration.to_device(ml_per_min, MAX_FLOW);
        self.core.ctx_mut().flow.request(device);
        self.calibration.backward(f64::from(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sim::{HplcModel, Journal, SimLink};
    use crate::adapters::time::ManualClock;
    use crate::app::ports::Clock;
    use crate::fsm::context::ProtocolTiming;
    use std::cell::RefCell;
    use std::time::Duration;

    struct Rig {
        pump: HplcPump,
        model: Rc<RefCell<HplcModel>>,
        clock: ManualClock,
        journal: Journal,
    }

    fn make_rig(model: HplcModel) -> Rig {
        let clock = ManualClock::new();
        let shared: Rc<dyn Clock> = Rc::new(clock.clone());
        let journal = Journal::default();
        let link = SimLink::new(model, Rc::clone(&shared)).with_journal("HPLC A", journal.clone());
        let handle = link.handle();
        let io = DeviceIo::new("HPLC A", Box::new(link), shared, ProtocolTiming::default());
        let pump = HplcPump::new(HplcSettings::new(50).unwrap(), FlowCalibration::new(1000.0), io).unwrap();
        Rig {
            pump,
            model: handle,
            clock,
            journal,
        }
    }

    fn run_until(rig: &mut Rig, done: impl Fn(&HplcPump) -> bool) -> bool {
        for _ in 0..2000 {
            rig.pump.tick();
            if done(&rig.pump) {
                return true;
            }
            rig.clock.advance(Duration::from_millis(100));
        }
        false
    }

    fn commands(journal: &Journal) -> Vec<String> {
        journal.borrow().iter().map(|(_, cmd)| cmd.clone()).collect()
    }

    #[test]
    fn settings_enforce_head_specific_limits() {
        assert!(HplcSettings::new(20).is_err());
        let head50 = HplcSettings::new(50).unwrap();
        assert!(head50.clone().with_pressure_limits(10, 150).is_ok());
        assert!(head50.clone().with_pressure_limits(10, 151).is_err());
        assert!(head50.clone().with_pressure_limits(100, 100).is_err());
        let head10 = HplcSettings::new(10).unwrap();
        assert!(head10.with_pressure_limits(0, 400).is_ok());
    }

    #[test]
    fn band_uses_sample_standard_deviation() {
        let samples = [30.0, 32.0, 28.0, 30.0];
        let band = PressureBand::from_samples(&samples, 1.0).unwrap();
        assert_eq!(band.mean, 30.0);
        // sum of squares 8 over n - 1 = 3
        assert!((band.stdev - (8.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((band.lower - (30.0 - 5.0 * band.stdev - 1.0)).abs() < 1e-12);
        assert!((band.upper - (30.0 + 20.0 * band.stdev + 1.0)).abs() < 1e-12);
        assert!(band.contains(30.0));
        assert!(!band.contains(band.upper + 0.01));
        assert!(PressureBand::from_samples(&[1.0], 0.0).is_none());
    }

    #[test]
    fn validators_read_the_value_after_the_label() {
        assert!(expect_ok()("FLOW:OK"));
        assert!(!expect_ok()("FLOW:ERR"));
        assert!(expect_echo(6100)("FLOW:06100"));
        assert!(expect_idle(40.0)("PRESSURE:40"));
        assert!(!expect_idle(40.0)("PRESSURE:40.5"));
        assert!(!expect_idle(40.0)("garbage"));
        assert!(!expect_within(None)("PRESSURE:30"));
    }

    #[test]
    fn configuration_then_initial_flow() {
        let mut rig = make_rig(HplcModel::default());
        assert_eq!(rig.pump.state_name(), "Configuration");
        assert!(run_until(&mut rig, |p| p.applied_flow() == Some(0) && p.phase() == DriverPhase::Deactivated));
        // let the flow read-back finish
        run_until(&mut rig, |_| false);

        let sent = commands(&rig.journal);
        assert_eq!(
            sent[..6],
            ["OFF", "PRESSURE?", "PMIN50: 0", "PMIN50?", "PMAX50: 100", "PMAX50?"]
        );
        assert!(sent.contains(&"FLOW: 00000".to_string()));
        assert!(!rig.pump.is_error());
        assert_eq!(rig.model.borrow().pmax, 100);
    }

    #[test]
    fn set_target_flowrate_returns_rounded_value() {
        let mut rig = make_rig(HplcModel::default());
        assert_eq!(rig.pump.set_target_flowrate(6.1004), 6.1);
        assert_eq!(rig.pump.set_target_flowrate(1000.0), 99.999);
    }

    #[test]
    fn activation_builds_band_and_overpressure_is_an_error() {
        let mut rig = make_rig(HplcModel::default());
        assert!(run_until(&mut rig, |p| p.phase() == DriverPhase::Deactivated));
        rig.pump.set_target_flowrate(6.1);
        rig.pump.activate_pump();

        assert!(run_until(&mut rig, |p| p.pressure_band().is_some()));
        assert_eq!(rig.pump.phase(), DriverPhase::Activated);
        assert!(rig.model.borrow().running);
        assert_eq!(rig.model.borrow().flow, 6100);
        let band = rig.pump.pressure_band().unwrap();
        assert_eq!((band.lower, band.upper), (29.0, 31.0));
        let samples = commands(&rig.journal)
            .iter()
            .rev()
            .take_while(|c| *c == "PRESSURE?")
            .count();
        assert!(samples >= 10, "band built from ten readings");

        rig.model.borrow_mut().pressure_override = Some(45.0);
        assert!(run_until(&mut rig, |p| p.is_error()));
        assert_eq!(rig.pump.state_name(), "Error");
    }

    #[test]
    fn flow_change_while_active_rebuilds_band() {
        let mut rig = make_rig(HplcModel::default());
        rig.pump.set_target_flowrate(6.0);
        rig.pump.activate_pump();
        assert!(run_until(&mut rig, |p| p.pressure_band().is_some()));

        rig.pump.set_target_flowrate(5.0);
        assert!(run_until(&mut rig, |p| p.pressure_band().is_none()));
        assert!(run_until(&mut rig, |p| p.pressure_band().is_some()));
        assert_eq!(rig.model.borrow().flow, 5000);
        assert_eq!(rig.pump.phase(), DriverPhase::Activated);
    }

    #[test]
    fn deactivation_switches_pump_off() {
        let mut rig = make_rig(HplcModel::default());
        rig.pump.set_target_flowrate(6.0);
        rig.pump.activate_pump();
        assert!(run_until(&mut rig, |p| p.pressure_band().is_some()));

        rig.pump.deactivate_pump();
        assert!(run_until(&mut rig, |p| p.phase() == DriverPhase::Deactivated));
        assert!(!rig.model.borrow().running);
    }

    #[test]
    fn residual_pressure_fails_configuration() {
        let model = HplcModel {
            pressure_override: Some(55.0),
            ..HplcModel::default()
        };
        let mut rig = make_rig(model);
        assert!(run_until(&mut rig, |p| p.is_error()));
        assert_eq!(commands(&rig.journal), ["OFF", "PRESSURE?"]);
    }
}
