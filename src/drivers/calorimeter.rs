//! Calorimeter reader.
//!
//! The calorimeter streams telegrams on its own; the driver only listens,
//! persists and cross-checks.  Two watchdogs drive it:
//!
//! - `check` fires a few seconds after each read phase starts, to compare
//!   the reported set temperature with the commanded one and to give the
//!   outer layer a window to push a new one;
//! - `error` fires when no complete line has arrived for much longer.
//!
//! ```text
//!  Clear ──Next──▶ ReadAndCheck ──NewSetTemp──▶ SetTemp
//!                      ▲  │                        │
//!                      │  └──Error──▶ Error        │
//!                      └──────────Next─────────────┘
//! ```

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use super::telegram::{self, LineAccumulator, SensorRow};
use super::{Calorimeter, Device};
use crate::error::Result;
use crate::fsm::context::{DeviceContext, DeviceIo, Setpoint};
use crate::fsm::states::Parked;
use crate::fsm::{Engine, Event, Row, State, StateFactory, StateId, TransitionTable};
use crate::protocol::{self, SubMachine};

#[derive(Debug, Clone, PartialEq)]
pub struct CalorimeterSettings {
    /// Time in `Read` before the set temperature is cross-checked.
    pub check_interval: Duration,
    /// Longest silence before the reader gives up.
    pub telegram_timeout: Duration,
    /// Consecutive set-temperature corrections before `Error`.
    pub max_corrections: u32,
    /// Raw telegram log, truncated when the reader starts.
    pub log_path: Option<PathBuf>,
}

impl Default for CalorimeterSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            telegram_timeout: Duration::from_secs(30),
            max_corrections: 3,
            log_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct CaloContext {
    io: DeviceIo,
    settings: CalorimeterSettings,
    /// Set temperature in hundredths of a degree.
    temperature: Setpoint<i32>,
    rows: Vec<SensorRow>,
    lines: LineAccumulator,
    log: Option<File>,
    last_line: Instant,
    corrections: u32,
}

impl CaloContext {
    fn append_log(&mut self, line: &str) {
        let Some(file) = self.log.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(file, "{line}") {
            warn!("{}: telegram log write failed, logging stopped: {}", self.io.name(), e);
            self.log = None;
        }
    }
}

impl DeviceContext for CaloContext {
    fn io(&mut self) -> &mut DeviceIo {
        &mut self.io
    }
}

fn to_hundredths(celsius: f64) -> i32 {
    (celsius * 100.0).round() as i32
}

fn from_hundredths(hundredths: i32) -> f64 {
    f64::from(hundredths) / 100.0
}

// ---------------------------------------------------------------------------
// Top-level states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaloPhase {
    Clear,
    ReadAndCheck,
    SetTemp,
    Error,
}

impl StateId for CaloPhase {
    fn name(self) -> &'static str {
        match self {
            Self::Clear => "Clear",
            Self::ReadAndCheck => "Read_And_Check",
            Self::SetTemp => "Set_Temp",
            Self::Error => "Error",
        }
    }
}

impl CaloPhase {
    pub const ROWS: &'static [Row<Self>] = &[
        (Self::Clear, Event::Next, Self::ReadAndCheck),
        (Self::Clear, Event::Error, Self::Error),
        (Self::ReadAndCheck, Event::NewSetTemp, Self::SetTemp),
        (Self::ReadAndCheck, Event::Error, Self::Error),
        (Self::SetTemp, Event::Next, Self::ReadAndCheck),
        (Self::SetTemp, Event::Error, Self::Error),
    ];
}

/// Truncates the log, drops stale input and arms the silence watchdog.
struct Clear;

impl State<CaloContext> for Clear {
    fn tick(&mut self, ctx: &mut CaloContext) -> Option<Event> {
        if let Some(path) = ctx.settings.log_path.clone() {
            match File::create(&path) {
                Ok(file) => ctx.log = Some(file),
                Err(e) => {
                    error!("{}: cannot open telegram log {}: {}", ctx.io.name(), path.display(), e);
                    return Some(Event::Error);
                }
            }
        }
        if let Err(e) = ctx.io.clear_input_buffer() {
            warn!("{}: clearing input failed: {}", ctx.io.name(), e);
            return Some(Event::Error);
        }
        ctx.lines.clear();
        ctx.last_line = ctx.io.now();
        Some(Event::Next)
    }
}

/// Writes `<1,T>` without terminator.
struct SetTemp;

impl State<CaloContext> for SetTemp {
    fn tick(&mut self, ctx: &mut CaloContext) -> Option<Event> {
        let Some(hundredths) = ctx.temperature.applied() else {
            return Some(Event::Next);
        };
        let command = format!("<1,{:.2}>", from_hundredths(hundredths));
        match ctx.io.send_raw(command.as_bytes()) {
            Ok(()) => Some(Event::Next),
            Err(e) => {
                warn!("{}: sending {:?} failed: {}", ctx.io.name(), command, e);
                Some(Event::Error)
            }
        }
    }
}

/// Runs the `Read`/`Check` sub-engine.  Surfaces `NewSetTemp` when a new
/// target is pending or a correction is due.
struct ReadAndCheck {
    engine: Engine<CaloContext, ReadFactory>,
}

impl ReadAndCheck {
    fn enter(ctx: &mut CaloContext) -> Self {
        let table = TransitionTable::trusted(ReadStep::ROWS);
        Self {
            engine: Engine::enter(table, ReadFactory, ReadStep::INITIAL, ctx),
        }
    }
}

impl State<CaloContext> for ReadAndCheck {
    fn tick(&mut self, ctx: &mut CaloContext) -> Option<Event> {
        if let Some(Event::NewSetTemp) = self.engine.tick(ctx) {
            return Some(Event::NewSetTemp);
        }
        match self.engine.state() {
            ReadStep::Error => Some(Event::Error),
            ReadStep::Read if ctx.temperature.take_pending().is_some() => {
                ctx.corrections = 0;
                Some(Event::NewSetTemp)
            }
            _ => None,
        }
    }

    fn exit(&mut self) {
        self.engine.exit();
    }
}

// ---------------------------------------------------------------------------
// Read / Check sub-engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStep {
    Read,
    Check,
    Error,
}

impl StateId for ReadStep {
    fn name(self) -> &'static str {
        match self {
            Self::Read => "Read",
            Self::Check => "Check",
            Self::Error => "Error",
        }
    }
}

impl SubMachine for ReadStep {
    const ROWS: &'static [Row<Self>] = &[
        (Self::Read, Event::Check, Self::Check),
        (Self::Read, Event::Error, Self::Error),
        (Self::Check, Event::Next, Self::Read),
        (Self::Check, Event::Error, Self::Error),
    ];
    const INITIAL: Self = Self::Read;
    const ERROR: Self = Self::Error;
}

struct ReadFactory;

impl StateFactory<CaloContext> for ReadFactory {
    type Id = ReadStep;

    fn create(&mut self, id: ReadStep, ctx: &mut CaloContext) -> Box<dyn State<CaloContext>> {
        match id {
            ReadStep::Read => Box::new(ReadTelegrams {
                check_at: ctx.io.deadline(ctx.settings.check_interval),
            }),
            ReadStep::Check => Box::new(CheckSetTemp),
            ReadStep::Error => Box::new(Parked),
        }
    }
}

struct ReadTelegrams {
    check_at: Instant,
}

impl State<CaloContext> for ReadTelegrams {
    fn tick(&mut self, ctx: &mut CaloContext) -> Option<Event> {
        let bytes = match ctx.io.receive() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{}: receive failed: {}", ctx.io.name(), e);
                return Some(Event::Error);
            }
        };

        let now = ctx.io.now();
        for line in ctx.lines.feed(&bytes) {
            ctx.last_line = now;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            match telegram::parse(line) {
                Ok(row) => {
                    ctx.append_log(line);
                    ctx.rows.push(row);
                }
                Err(e) => warn!("{}: {}, line dropped", ctx.io.name(), e),
            }
        }

        if now > ctx.last_line + ctx.settings.telegram_timeout {
            error!(
                "{}: no telegram for {:?}",
                ctx.io.name(),
                ctx.settings.telegram_timeout
            );
            return Some(Event::Error);
        }
        if now >= self.check_at {
            return Some(Event::Check);
        }
        None
    }
}

/// Compares the last reported set temperature with the commanded one.
struct CheckSetTemp;

impl State<CaloContext> for CheckSetTemp {
    fn tick(&mut self, ctx: &mut CaloContext) -> Option<Event> {
        let (Some(expected), Some(last)) = (ctx.temperature.applied(), ctx.rows.last()) else {
            return Some(Event::Next);
        };
        let reported = last.t_set;
        if to_hundredths(reported) == expected {
            ctx.corrections = 0;
            return Some(Event::Next);
        }
        if ctx.corrections < ctx.settings.max_corrections {
            ctx.corrections += 1;
            warn!(
                "{}: set temperature reads {:.2}, expected {:.2}; resending ({}/{})",
                ctx.io.name(),
                reported,
                from_hundredths(expected),
                ctx.corrections,
                ctx.settings.max_corrections
            );
            return Some(Event::NewSetTemp);
        }
        error!(
            "{}: set temperature stuck at {:.2}, expected {:.2}",
            ctx.io.name(),
            reported,
            from_hundredths(expected)
        );
        Some(Event::Error)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct CaloFactory;

impl StateFactory<CaloContext> for CaloFactory {
    type Id = CaloPhase;

    fn create(&mut self, id: CaloPhase, ctx: &mut CaloContext) -> Box<dyn State<CaloContext>> {
        match id {
            CaloPhase::Clear => Box::new(Clear),
            CaloPhase::ReadAndCheck => Box::new(ReadAndCheck::enter(ctx)),
            CaloPhase::SetTemp => Box::new(SetTemp),
            CaloPhase::Error => Box::new(Parked),
        }
    }
}

pub struct CalorimeterReader {
    name: String,
    engine: Engine<CaloContext, CaloFactory>,
    ctx: CaloContext,
}

impl CalorimeterReader {
    pub fn new(settings: CalorimeterSettings, io: DeviceIo) -> Result<Self> {
        protocol::validate::<ReadStep>()?;
        let table = TransitionTable::new(CaloPhase::ROWS)?;

        let name = io.name().to_string();
        let last_line = io.now();
        let mut ctx = CaloContext {
            io,
            settings,
            temperature: Setpoint::unset(),
            rows: Vec::new(),
            lines: LineAccumulator::default(),
            log: None,
            last_line,
            corrections: 0,
        };
        let engine = Engine::enter(table, CaloFactory, CaloPhase::Clear, &mut ctx);
        Ok(Self { name, engine, ctx })
    }

    pub fn phase(&self) -> CaloPhase {
        self.engine.state()
    }
}

impl Device for CalorimeterReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self) {
        let before = self.engine.state();
        self.engine.tick(&mut self.ctx);
        let after = self.engine.state();
        if after == before {
            return;
        }
        match after {
            CaloPhase::Error => error!("{}: {} -> {}", self.name, before.name(), after.name()),
            CaloPhase::ReadAndCheck => {}
            _ => info!("{}: {} -> {}", self.name, before.name(), after.name()),
        }
    }

    fn state_name(&self) -> &'static str {
        self.engine.state_name()
    }

    fn is_error(&self) -> bool {
        self.engine.state() == CaloPhase::Error
    }
}

impl Calorimeter for CalorimeterReader {
    fn rows(&self) -> &[SensorRow] {
        &self.ctx.rows
    }

    fn set_target_temperature(&mut self, celsius: f64) -> f64 {
        let hundredths = to_hundredths(celsius);
        self.ctx.temperature.request(hundredths);
        from_hundredths(hundredths)
    }
}

impl Drop for CalorimeterReader {
    fn drop(&mut self) {
        self.engine.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sim::{CalorimeterModel, Journal, ScriptedTransport, SimLink};
    use crate::adapters::time::ManualClock;
    use crate::app::ports::Clock;
    use crate::fsm::context::ProtocolTiming;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Rig {
        reader: CalorimeterReader,
        model: Rc<RefCell<CalorimeterModel>>,
        clock: ManualClock,
        journal: Journal,
    }

    fn make_rig(settings: CalorimeterSettings) -> Rig {
        let clock = ManualClock::new();
        let shared: Rc<dyn Clock> = Rc::new(clock.clone());
        let journal = Journal::default();
        let link = SimLink::new(CalorimeterModel::default(), Rc::clone(&shared)).with_journal("Calo", journal.clone());
        let model = link.handle();
        let io = DeviceIo::new("Calo", Box::new(link), shared, ProtocolTiming::default());
        let reader = CalorimeterReader::new(settings, io).unwrap();
        Rig {
            reader,
            model,
            clock,
            journal,
        }
    }

    fn run_for(rig: &mut Rig, duration: Duration) {
        let step = Duration::from_millis(250);
        let mut elapsed = Duration::ZERO;
        while elapsed < duration {
            rig.reader.tick();
            rig.clock.advance(step);
            elapsed += step;
        }
    }

    #[test]
    fn telegrams_become_rows_and_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calo.log");
        std::fs::write(&path, "stale\n").unwrap();
        let mut rig = make_rig(CalorimeterSettings {
            log_path: Some(path.clone()),
            ..CalorimeterSettings::default()
        });

        run_for(&mut rig, Duration::from_secs(10));
        let rows = rig.reader.rows().len();
        assert!((9..=11).contains(&rows), "about one row per second, got {rows}");
        assert_eq!(rig.reader.state_name(), "Read_And_Check");

        let log = std::fs::read_to_string(&path).unwrap();
        assert!(!log.contains("stale"));
        assert_eq!(log.lines().count(), rows);
        assert!(log.lines().all(|l| l.split('\t').count() == telegram::TELEGRAM_FIELDS));
    }

    #[test]
    fn set_temperature_is_sent_and_confirmed() {
        let mut rig = make_rig(CalorimeterSettings::default());
        run_for(&mut rig, Duration::from_secs(1));
        assert_eq!(rig.reader.set_target_temperature(25.004), 25.0);
        run_for(&mut rig, Duration::from_secs(12));

        let sent: Vec<String> = rig.journal.borrow().iter().map(|(_, c)| c.clone()).collect();
        assert_eq!(sent, ["<1,25.00>"]);
        assert_eq!(rig.reader.rows().last().unwrap().t_set, 25.0);
        assert!(!rig.reader.is_error());
    }

    #[test]
    fn stuck_set_temperature_is_corrected_then_fails() {
        let mut rig = make_rig(CalorimeterSettings::default());
        rig.model.borrow_mut().ignore_set = true;
        rig.reader.set_target_temperature(30.0);
        run_for(&mut rig, Duration::from_secs(40));

        assert!(rig.reader.is_error());
        // first write plus three corrections
        assert_eq!(rig.journal.borrow().len(), 4);
    }

    #[test]
    fn silence_trips_the_error_watchdog() {
        let mut rig = make_rig(CalorimeterSettings::default());
        run_for(&mut rig, Duration::from_secs(3));
        rig.model.borrow_mut().silent = true;
        run_for(&mut rig, Duration::from_secs(29));
        assert!(!rig.reader.is_error());
        run_for(&mut rig, Duration::from_secs(3));
        assert!(rig.reader.is_error());
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let clock = ManualClock::new();
        let script = ScriptedTransport::new();
        let io = DeviceIo::new("Calo", Box::new(script.clone()), Rc::new(clock.clone()), ProtocolTiming::default());
        let mut reader = CalorimeterReader::new(CalorimeterSettings::default(), io).unwrap();
        reader.tick();

        let good = (0..29).map(|i| i.to_string()).collect::<Vec<_>>().join("\t");
        script.push_input(format!("garbage\r\n{good}\r\n1\t2\n").as_bytes());
        reader.tick();
        assert_eq!(reader.rows().len(), 1);
        assert_eq!(reader.rows()[0].t_set, 1.0);
        assert!(!reader.is_error());
    }

    #[test]
    fn unwritable_log_fails_clear() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new();
        let io = DeviceIo::new(
            "Calo",
            Box::new(ScriptedTransport::new()),
            Rc::new(clock),
            ProtocolTiming::default(),
        );
        let settings = CalorimeterSettings {
            log_path: Some(dir.path().join("missing").join("calo.log")),
            ..CalorimeterSettings::default()
        };
        let mut reader = CalorimeterReader::new(settings, io).unwrap();
        reader.tick();
        assert!(reader.is_error());
    }
}
