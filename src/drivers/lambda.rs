//! Lambda peristaltic pump driver.
//!
//! Checksum-framed ASCII protocol:
//!
//! ```text
//!  set   #AA01rDDDCS\r     (no answer)
//!  read  #AA01GCS\r        ->  <AAMMrDDD...\r
//! ```
//!
//! `CS` is the byte sum of everything before it, modulo 256, as two
//! upper-case hex digits.  The pump has no configuration phase and counts
//! as off at flow value 0, so the driver starts by forcing it off.

use core::fmt;
use std::rc::Rc;

use super::calibration::FlowCalibration;
use super::{Device, DriverCore, DriverPhase, Monitor, Pump};
use crate::error::Result;
use crate::fsm::context::{DeviceContext, DeviceIo, SetpointContext, Setpoint};
use crate::fsm::states::Parked;
use crate::fsm::{Event, Row, State, StateFactory, StateId};
use crate::protocol::composite::{Delay, Nested, send_and_check};
use crate::protocol::primitives::{SendCommand, Validator};
use crate::protocol::{self, Polling, Sequence, SubMachine};

/// Largest value of the three-digit `DDD` field.
pub const MAX_VALUE: u16 = 999;

/// Frame mode used for every command.
const MODE: u8 = 1;

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// Byte sum of `prefix`, modulo 256.
pub fn checksum(prefix: &[u8]) -> u8 {
    prefix.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn with_checksum(prefix: String) -> String {
    let cs = checksum(prefix.as_bytes());
    format!("{prefix}{cs:02X}")
}

/// Set the flow value (terminator not included).
pub fn set_command(address: u8, value: u16) -> String {
    with_checksum(format!("#{address:02}{MODE:02}r{value:03}"))
}

/// Query the flow value (terminator not included).
pub fn read_command(address: u8) -> String {
    with_checksum(format!("#{address:02}{MODE:02}G"))
}

/// The pump's answer to a read (terminator not included).
pub fn response_frame(address: u8, value: u16) -> String {
    with_checksum(format!("<{address:02}{MODE:02}r{value:03}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `#...`, host to pump.
    Command,
    /// `<...`, pump to host.
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LambdaFrame {
    pub kind: FrameKind,
    pub address: u8,
    pub mode: u8,
    /// `r` for a value frame, `G` for a read request.
    pub relation: char,
    pub value: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Neither `#` nor `<` in front.
    Start,
    /// Too short or a non-digit where digits belong.
    Layout,
    Checksum { expected: u8, found: u8 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "unknown frame start"),
            Self::Layout => write!(f, "malformed frame"),
            Self::Checksum { expected, found } => {
                write!(f, "checksum mismatch: expected {expected:02X}, found {found:02X}")
            }
        }
    }
}

fn digits(bytes: &[u8]) -> Option<u16> {
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    bytes.iter().try_fold(0u16, |acc, b| {
        acc.checked_mul(10)?.checked_add(u16::from(b - b'0'))
    })
}

fn hex_byte(bytes: &[u8]) -> Option<u8> {
    let text = core::str::from_utf8(bytes).ok()?;
    if text.len() != 2 {
        return None;
    }
    u8::from_str_radix(text, 16).ok()
}

/// Parse a command or response frame (terminator stripped).
///
/// Command frames must carry a valid checksum.  Response frames are read
/// up to the value; anything after it is ignored.
pub fn parse_frame(frame: &[u8]) -> core::result::Result<LambdaFrame, FrameError> {
    let kind = match frame.first() {
        Some(b'#') => FrameKind::Command,
        Some(b'<') => FrameKind::Response,
        _ => return Err(FrameError::Start),
    };
    let head = frame.get(1..6).ok_or(FrameError::Layout)?;
    let address = digits(&head[..2]).ok_or(FrameError::Layout)?;
    let mode = digits(&head[2..4]).ok_or(FrameError::Layout)?;
    let relation = char::from(head[4]);
    let value_end = if relation == 'G' { 6 } else { 9 };

    let value = if relation == 'G' {
        None
    } else {
        let field = frame.get(6..9).ok_or(FrameError::Layout)?;
        Some(digits(field).ok_or(FrameError::Layout)?)
    };

    if kind == FrameKind::Command {
        let found = frame
            .get(value_end..)
            .and_then(hex_byte)
            .ok_or(FrameError::Layout)?;
        let expected = checksum(&frame[..value_end]);
        if expected != found {
            return Err(FrameError::Checksum { expected, found });
        }
    }

    Ok(LambdaFrame {
        kind,
        address: address as u8,
        mode: mode as u8,
        relation,
        value,
    })
}

/// A pump answer reporting `expected`.
fn expect_value(expected: u16) -> Validator {
    Rc::new(move |frame: &str| {
        parse_frame(frame.as_bytes()).is_ok_and(|f| {
            f.kind == FrameKind::Response && f.relation == 'r' && f.value == Some(expected)
        })
    })
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct LambdaContext {
    io: DeviceIo,
    address: u8,
    flow: Setpoint<u16>,
}

impl LambdaContext {
    fn applied_flow(&self) -> u16 {
        self.flow.applied().unwrap_or(0)
    }
}

impl DeviceContext for LambdaContext {
    fn io(&mut self) -> &mut DeviceIo {
        &mut self.io
    }
}

impl SetpointContext for LambdaContext {
    fn take_setpoint_change(&mut self) -> bool {
        self.flow.take_pending().is_some()
    }
}

fn send_value(ctx: &LambdaContext, value: u16) -> Box<dyn State<LambdaContext>> {
    Box::new(SendCommand::new(set_command(ctx.address, value)))
}

fn check_value(ctx: &mut LambdaContext, value: u16) -> Box<dyn State<LambdaContext>> {
    let read = read_command(ctx.address);
    send_and_check(read, expect_value(value), ctx)
}

// ---------------------------------------------------------------------------
// Switching: Deactivating and Activating
// ---------------------------------------------------------------------------

/// `Write` a value, then read it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchStep {
    Write,
    ReadBack,
    Finished,
    Error,
}

impl StateId for SwitchStep {
    fn name(self) -> &'static str {
        match self {
            Self::Write => "Write",
            Self::ReadBack => "Check_Pump_State",
            Self::Finished => "Finished",
            Self::Error => "Error",
        }
    }
}

impl SubMachine for SwitchStep {
    const ROWS: &'static [Row<Self>] = &[
        (Self::Write, Event::Next, Self::ReadBack),
        (Self::Write, Event::Error, Self::Error),
        (Self::ReadBack, Event::Next, Self::Finished),
        (Self::ReadBack, Event::Error, Self::Error),
    ];
    const INITIAL: Self = Self::Write;
    const ERROR: Self = Self::Error;
}

impl Sequence for SwitchStep {
    const FINISHED: Self = Self::Finished;
}

/// Drives the pump to a fixed value (0 when switching off).
struct SwitchFactory {
    value: u16,
}

impl StateFactory<LambdaContext> for SwitchFactory {
    type Id = SwitchStep;

    fn create(&mut self, id: SwitchStep, ctx: &mut LambdaContext) -> Box<dyn State<LambdaContext>> {
        match id {
            SwitchStep::Write => send_value(ctx, self.value),
            SwitchStep::ReadBack => check_value(ctx, self.value),
            SwitchStep::Finished | SwitchStep::Error => Box::new(Parked),
        }
    }
}

// ---------------------------------------------------------------------------
// Deactivated
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStep {
    CheckOff,
    Waiting,
    Error,
}

impl StateId for IdleStep {
    fn name(self) -> &'static str {
        match self {
            Self::CheckOff => "Check_Pump_State",
            Self::Waiting => "Waiting",
            Self::Error => "Error",
        }
    }
}

impl SubMachine for IdleStep {
    const ROWS: &'static [Row<Self>] = &[
        (Self::CheckOff, Event::Next, Self::Waiting),
        (Self::CheckOff, Event::Error, Self::Error),
        (Self::Waiting, Event::Next, Self::CheckOff),
    ];
    const INITIAL: Self = Self::CheckOff;
    const ERROR: Self = Self::Error;
}

impl Polling for IdleStep {
    const WAITING: Self = Self::Waiting;
}

struct IdleFactory;

impl StateFactory<LambdaContext> for IdleFactory {
    type Id = IdleStep;

    fn create(&mut self, id: IdleStep, ctx: &mut LambdaContext) -> Box<dyn State<LambdaContext>> {
        match id {
            IdleStep::CheckOff => check_value(ctx, 0),
            IdleStep::Waiting => Box::new(Delay::poll(ctx)),
            IdleStep::Error => Box::new(Parked),
        }
    }
}

// ---------------------------------------------------------------------------
// Activated
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveStep {
    CheckFlowrate,
    Waiting,
    SetFlowrate,
    Error,
}

impl StateId for ActiveStep {
    fn name(self) -> &'static str {
        match self {
            Self::CheckFlowrate => "Check_Pump_State",
            Self::Waiting => "Waiting",
            Self::SetFlowrate => "Set_Flowrate",
            Self::Error => "Error",
        }
    }
}

impl SubMachine for ActiveStep {
    const ROWS: &'static [Row<Self>] = &[
        (Self::CheckFlowrate, Event::Next, Self::Waiting),
        (Self::CheckFlowrate, Event::Error, Self::Error),
        (Self::Waiting, Event::Next, Self::CheckFlowrate),
        (Self::Waiting, Event::NewSetpoint, Self::SetFlowrate),
        (Self::SetFlowrate, Event::Next, Self::CheckFlowrate),
        (Self::SetFlowrate, Event::Error, Self::Error),
    ];
    const INITIAL: Self = Self::CheckFlowrate;
    const ERROR: Self = Self::Error;
}

impl Polling for ActiveStep {
    const WAITING: Self = Self::Waiting;
}

struct ActiveFactory;

impl StateFactory<LambdaContext> for ActiveFactory {
    type Id = ActiveStep;

    fn create(&mut self, id: ActiveStep, ctx: &mut LambdaContext) -> Box<dyn State<LambdaContext>> {
        let flow = ctx.applied_flow();
        match id {
            ActiveStep::CheckFlowrate => check_value(ctx, flow),
            ActiveStep::Waiting => Box::new(Delay::poll(ctx)),
            ActiveStep::SetFlowrate => send_value(ctx, flow),
            ActiveStep::Error => Box::new(Parked),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct LambdaFactory;

impl StateFactory<LambdaContext> for LambdaFactory {
    type Id = DriverPhase;

    fn create(&mut self, id: DriverPhase, ctx: &mut LambdaContext) -> Box<dyn State<LambdaContext>> {
        match id {
            // no configuration phase; the driver starts in Deactivating
            DriverPhase::Configuration | DriverPhase::Deactivating => {
                Box::new(Nested::enter(SwitchFactory { value: 0 }, ctx))
            }
            DriverPhase::Deactivated => Box::new(Monitor::enter(IdleFactory, false, ctx)),
            DriverPhase::Activating => {
                let value = ctx.flow.commit().unwrap_or(0);
                Box::new(Nested::enter(SwitchFactory { value }, ctx))
            }
            DriverPhase::Activated => Box::new(Monitor::enter(ActiveFactory, true, ctx)),
            DriverPhase::Error => Box::new(Parked),
        }
    }
}

pub struct LambdaPump {
    core: DriverCore<LambdaContext, LambdaFactory>,
    calibration: FlowCalibration,
    pump_on: bool,
}

impl LambdaPump {
    pub fn new(address: u8, calibration: FlowCalibration, io: DeviceIo) -> Result<Self> {
        protocol::validate::<SwitchStep>()?;
        protocol::validate::<IdleStep>()?;
        protocol::validate::<ActiveStep>()?;

        let name = io.name().to_string();
        let ctx = LambdaContext {
            io,
            address,
            flow: Setpoint::new(0),
        };
        let core = DriverCore::new(name, LambdaFactory, DriverPhase::Deactivating, ctx)?;
        Ok(Self {
            core,
            calibration,
            pump_on: false,
        })
    }

    /// Flow value last written to the pump.
    pub fn applied_value(&self) -> Option<u16> {
        self.core.ctx().flow.applied()
    }

    fn wants_on(&self) -> bool {
        self.pump_on && self.core.ctx().flow.target().is_some_and(|v| v != 0)
    }
}

impl Device for LambdaPump {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn tick(&mut self) {
        let wants_on = self.wants_on();
        self.core.tick(wants_on);
    }

    fn state_name(&self) -> &'static str {
        self.core.state_name()
    }

    fn is_error(&self) -> bool {
        self.core.phase() == DriverPhase::Error
    }
}

impl Pump for LambdaPump {
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
        let value = self.calibration.to_device(ml_per_min, u32::from(MAX_VALUE)) as u16;
        self.core.ctx_mut().flow.request(value);
        self.calibration.backward(f64::from(value))
    }
}
