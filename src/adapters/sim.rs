//! Simulated instruments.
//!
//! [`SimLink`] is a [`Transport`] backed by a [`DeviceModel`] that answers
//! commands the way the real instrument does.  Models exist for the HPLC
//! pump, the Lambda pump, the Fisher thermostat and the calorimeter.  Tests
//! and the `--simulate` CLI mode run the complete rig against them.
//!
//! [`ScriptedTransport`] is a lower-level double: input is pushed by hand
//! and every write is recorded.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::app::ports::{Clock, DeviceKind, PortOpener, PortSpec, Transport};
use crate::drivers::lambda::{self, FrameKind};
use crate::error::TransportError;

// ───────────────────────────────────────────────────────────────
// Scripted transport
// ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    input: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
    fail_next: bool,
}

/// Hand-fed transport.  Clones share the same buffers.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Rc<RefCell<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make bytes available to the next `receive`.
    pub fn push_input(&self, bytes: &[u8]) {
        self.inner.borrow_mut().input.extend(bytes);
    }

    /// Every write so far, oldest first.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.borrow().sent.clone()
    }

    /// Every write so far as text, terminator stripped.
    pub fn sent_text(&self) -> Vec<String> {
        self.inner
            .borrow()
            .sent
            .iter()
            .map(|s| command_text(s))
            .collect()
    }

    pub fn pending_input(&self) -> usize {
        self.inner.borrow().input.len()
    }

    /// Make the next transport call fail.
    pub fn fail_next_io(&self) {
        self.inner.borrow_mut().fail_next = true;
    }

    fn check_failure(script: &mut Script) -> Result<(), TransportError> {
        if script.fail_next {
            script.fail_next = false;
            return Err(TransportError::Io("injected failure".into()));
        }
        Ok(())
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut script = self.inner.borrow_mut();
        Self::check_failure(&mut script)?;
        script.sent.push(data.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut script = self.inner.borrow_mut();
        Self::check_failure(&mut script)?;
        Ok(script.input.drain(..).collect())
    }

    fn clear_input_buffer(&mut self) -> Result<(), TransportError> {
        let mut script = self.inner.borrow_mut();
        Self::check_failure(&mut script)?;
        script.input.clear();
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// Model-backed link
// ───────────────────────────────────────────────────────────────

/// Behaviour of one simulated instrument.
pub trait DeviceModel {
    /// React to one write.  Returns the instrument's answer, if any.
    fn respond(&mut self, data: &[u8], now: Instant) -> Vec<u8>;

    /// Bytes the instrument produced on its own up to `now`.
    fn stream(&mut self, _now: Instant) -> Vec<u8> {
        Vec::new()
    }
}

/// Shared record of `(device, command)` writes across several links.
pub type Journal = Rc<RefCell<Vec<(String, String)>>>;

/// Transport that talks to a [`DeviceModel`].
pub struct SimLink<M> {
    model: Rc<RefCell<M>>,
    clock: Rc<dyn Clock>,
    input: Vec<u8>,
    journal: Option<(String, Journal)>,
}

impl<M: DeviceModel> SimLink<M> {
    pub fn new(model: M, clock: Rc<dyn Clock>) -> Self {
        Self {
            model: Rc::new(RefCell::new(model)),
            clock,
            input: Vec::new(),
            journal: None,
        }
    }

    /// Record every write into `journal` under `device`.
    pub fn with_journal(mut self, device: impl Into<String>, journal: Journal) -> Self {
        self.journal = Some((device.into(), journal));
        self
    }

    /// Handle for inspecting or poking the model while the link is in use.
    pub fn handle(&self) -> Rc<RefCell<M>> {
        Rc::clone(&self.model)
    }

    fn pull_stream(&mut self) {
        let now = self.clock.now();
        let streamed = self.model.borrow_mut().stream(now);
        self.input.extend(streamed);
    }
}

impl<M: DeviceModel> Transport for SimLink<M> {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if let Some((device, journal)) = &self.journal {
            let text = String::from_utf8_lossy(data).trim_end().to_string();
            journal.borrow_mut().push((device.clone(), text));
        }
        let now = self.clock.now();
        let reply = self.model.borrow_mut().respond(data, now);
        self.input.extend(reply);
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        self.pull_stream();
        Ok(std::mem::take(&mut self.input))
    }

    fn clear_input_buffer(&mut self) -> Result<(), TransportError> {
        self.pull_stream();
        self.input.clear();
        Ok(())
    }
}

fn command_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim_end_matches(['\r', '\n']).to_string()
}

fn reply(text: &str) -> Vec<u8> {
    let mut out = text.as_bytes().to_vec();
    out.push(b'\r');
    out
}

// ───────────────────────────────────────────────────────────────
// HPLC pump
// ───────────────────────────────────────────────────────────────

/// HPLC pump: `LABEL:value` answers, pressure builds only while pumping.
#[derive(Debug, Clone)]
pub struct HplcModel {
    pub running: bool,
    /// Flow in µl/min as last set.
    pub flow: u32,
    pub pmin: u32,
    pub pmax: u32,
    /// Pressure reported while running with a non-zero flow.
    pub working_pressure: f64,
    /// Forces every pressure reading to this value.
    pub pressure_override: Option<f64>,
}

impl Default for HplcModel {
    fn default() -> Self {
        Self {
            running: false,
            flow: 0,
            pmin: 0,
            pmax: 0,
            working_pressure: 30.0,
            pressure_override: None,
        }
    }
}

impl HplcModel {
    fn pressure(&self) -> f64 {
        if let Some(p) = self.pressure_override {
            return p;
        }
        if self.running && self.flow > 0 {
            self.working_pressure
        } else {
            0.0
        }
    }
}

impl DeviceModel for HplcModel {
    fn respond(&mut self, data: &[u8], _now: Instant) -> Vec<u8> {
        let cmd = command_text(data);
        let answer = match cmd.as_str() {
            "PRESSURE?" => format!("PRESSURE:{}", self.pressure()),
            "FLOW?" => format!("FLOW:{:05}", self.flow),
            "ON" => {
                self.running = true;
                "ON:OK".to_string()
            }
            "OFF" => {
                self.running = false;
                "OFF:OK".to_string()
            }
            _ => {
                let (label, value) = cmd.split_once(':').unwrap_or((cmd.as_str(), ""));
                let value = value.trim().parse::<u32>().ok();
                match (label, value) {
                    ("FLOW", Some(v)) => {
                        self.flow = v;
                        "FLOW:OK".to_string()
                    }
                    (l, Some(v)) if l.starts_with("PMIN") => {
                        self.pmin = v;
                        format!("{l}:OK")
                    }
                    (l, Some(v)) if l.starts_with("PMAX") => {
                        self.pmax = v;
                        format!("{l}:OK")
                    }
                    (l, None) if l.starts_with("PMIN") && l.ends_with('?') => {
                        format!("{}:{}", l.trim_end_matches('?'), self.pmin)
                    }
                    (l, None) if l.starts_with("PMAX") && l.ends_with('?') => {
                        format!("{}:{}", l.trim_end_matches('?'), self.pmax)
                    }
                    _ => "ERROR:UNKNOWN".to_string(),
                }
            }
        };
        reply(&answer)
    }
}

// ───────────────────────────────────────────────────────────────
// Lambda pump
// ───────────────────────────────────────────────────────────────

/// Lambda pump: silent on set frames, echoes the value on read frames.
#[derive(Debug, Clone, Default)]
pub struct LambdaModel {
    pub address: u8,
    pub value: u16,
    /// Frames rejected for a bad checksum.
    pub rejected: usize,
}

impl LambdaModel {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }
}

impl DeviceModel for LambdaModel {
    fn respond(&mut self, data: &[u8], _now: Instant) -> Vec<u8> {
        let frame = data.strip_suffix(b"\r").unwrap_or(data);
        match lambda::parse_frame(frame) {
            Ok(parsed) if parsed.kind == FrameKind::Command && parsed.address == self.address => {
                match parsed.value {
                    Some(value) => {
                        self.value = value;
                        Vec::new()
                    }
                    None => reply(&lambda::response_frame(self.address, self.value)),
                }
            }
            Ok(_) => Vec::new(),
            Err(_) => {
                self.rejected += 1;
                Vec::new()
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Fisher thermostat
// ───────────────────────────────────────────────────────────────

/// Fisher bath circulator: bare values or `OK`.
#[derive(Debug, Clone)]
pub struct FisherModel {
    pub running: bool,
    pub unit: char,
    pub pump_speed: char,
    pub external_probe: bool,
    pub setpoint: f64,
}

impl Default for FisherModel {
    fn default() -> Self {
        Self {
            running: false,
            unit: 'F',
            pump_speed: 'M',
            external_probe: true,
            setpoint: 20.0,
        }
    }
}

impl DeviceModel for FisherModel {
    fn respond(&mut self, data: &[u8], _now: Instant) -> Vec<u8> {
        let cmd = command_text(data);
        let (name, arg) = cmd.split_once(' ').unwrap_or((cmd.as_str(), ""));
        let answer = match (name, arg) {
            ("RO", _) => (if self.running { "1" } else { "0" }).to_string(),
            ("SO", "1") => {
                self.running = true;
                "OK".into()
            }
            ("SO", "0") => {
                self.running = false;
                "OK".into()
            }
            ("STU", unit) if unit.len() == 1 => {
                self.unit = unit.chars().next().unwrap_or('C');
                "OK".into()
            }
            ("RTU", _) => self.unit.to_string(),
            ("SPS", speed) if ["L", "M", "H"].contains(&speed) => {
                self.pump_speed = speed.chars().next().unwrap_or('L');
                "OK".into()
            }
            ("RPS", _) => self.pump_speed.to_string(),
            ("SE", flag) if flag == "0" || flag == "1" => {
                self.external_probe = flag == "1";
                "OK".into()
            }
            ("RE", _) => (if self.external_probe { "1" } else { "0" }).to_string(),
            ("SS", value) => match value.parse::<f64>() {
                Ok(v) => {
                    self.setpoint = v;
                    "OK".into()
                }
                Err(_) => "BAD".into(),
            },
            ("RS", _) => format!("{:.1}C", self.setpoint),
            _ => "BAD".into(),
        };
        reply(&answer)
    }
}

// ───────────────────────────────────────────────────────────────
// Calorimeter
// ───────────────────────────────────────────────────────────────

/// Number of fields in one calorimeter telegram.
const TELEGRAM_FIELDS: usize = 29;

/// Calorimeter: streams one telegram per `period`, follows `<1,T>` set commands.
#[derive(Debug, Clone)]
pub struct CalorimeterModel {
    pub period: Duration,
    pub set_temperature: f64,
    /// Stops the telegram stream.
    pub silent: bool,
    /// Ignore set commands (simulates a stuck set temperature).
    pub ignore_set: bool,
    started: Option<Instant>,
    emitted: u64,
}

impl Default for CalorimeterModel {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            set_temperature: 20.0,
            silent: false,
            ignore_set: false,
            started: None,
            emitted: 0,
        }
    }
}

impl CalorimeterModel {
    fn telegram(&self, elapsed: f64) -> String {
        let ripple = if self.emitted % 2 == 0 { 0.03 } else { -0.03 };
        let t = self.set_temperature;
        let mut fields = vec![
            format!("{elapsed:.1}"),
            format!("{t:.2}"),
            format!("{:.3}", t + ripple),
            format!("{:.3}", t - ripple),
            format!("{:.3}", t + ripple / 2.0),
            format!("{:.3}", t - 0.4),
            format!("{:.3}", t - 0.5),
            format!("{:.3}", t + 0.2),
            "0.512".to_string(),
            "0.204".to_string(),
            "0.198".to_string(),
        ];
        fields.resize(TELEGRAM_FIELDS, "0".to_string());
        let mut line = fields.join("\t");
        line.push_str("\r\n");
        line
    }
}

impl DeviceModel for CalorimeterModel {
    fn respond(&mut self, data: &[u8], _now: Instant) -> Vec<u8> {
        let cmd = command_text(data);
        let value = cmd
            .strip_prefix("<1,")
            .and_then(|rest| rest.strip_suffix('>'))
            .and_then(|v| v.parse::<f64>().ok());
        if let (Some(v), false) = (value, self.ignore_set) {
            self.set_temperature = v;
        }
        Vec::new()
    }

    fn stream(&mut self, now: Instant) -> Vec<u8> {
        let started = *self.started.get_or_insert(now);
        if self.silent {
            return Vec::new();
        }
        let mut out = Vec::new();
        // never burst more than a handful of lines per read
        for _ in 0..8 {
            let due = started + self.period * (self.emitted as u32);
            if due > now {
                break;
            }
            let elapsed = (due - started).as_secs_f64();
            out.extend(self.telegram(elapsed).into_bytes());
            self.emitted += 1;
        }
        out
    }
}

// ───────────────────────────────────────────────────────────────
// Simulated rig
// ───────────────────────────────────────────────────────────────

/// Opens a model-backed link for every configured device.
pub struct SimulatedPorts {
    clock: Rc<dyn Clock>,
    journal: Journal,
}

impl SimulatedPorts {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            journal: Journal::default(),
        }
    }

    /// Every write to every simulated device, in order.
    pub fn journal(&self) -> Journal {
        Rc::clone(&self.journal)
    }

    fn link<M: DeviceModel + 'static>(&self, model: M, device: &str) -> Box<dyn Transport> {
        Box::new(SimLink::new(model, Rc::clone(&self.clock)).with_journal(device, Rc::clone(&self.journal)))
    }
}

impl PortOpener for SimulatedPorts {
    fn open(&mut self, spec: &PortSpec<'_>) -> crate::error::Result<Box<dyn Transport>> {
        Ok(match spec.kind {
            DeviceKind::Hplc => self.link(HplcModel::default(), spec.device),
            DeviceKind::Lambda { address } => self.link(LambdaModel::new(address), spec.device),
            DeviceKind::Fisher => self.link(FisherModel::default(), spec.device),
            DeviceKind::Calorimeter => self.link(CalorimeterModel::default(), spec.device),
        })
    }
}
