//! Middle protocol layer: retrying exchanges, delays and nested sequences.

use std::marker::PhantomData;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::primitives::{SendCommand, Validator, WaitForAnswer};
use super::{Sequence, SubMachine};
use crate::fsm::context::{DeviceContext, RetryBudget};
use crate::fsm::states::Parked;
use crate::fsm::{Engine, Event, Row, State, StateFactory, StateId, TransitionTable};

// ---------------------------------------------------------------------------
// Nested sequence
// ---------------------------------------------------------------------------

/// Runs a [`Sequence`] to completion and reports `Next` or `Error` to
/// the enclosing engine.  Intermediate steps never leak out.
pub struct Nested<C, F: StateFactory<C>> {
    engine: Engine<C, F>,
}

impl<C, F> Nested<C, F>
where
    F: StateFactory<C>,
    F::Id: Sequence,
{
    pub fn enter(factory: F, ctx: &mut C) -> Self {
        let table = TransitionTable::trusted(<F::Id as SubMachine>::ROWS);
        Self {
            engine: Engine::enter(table, factory, <F::Id as SubMachine>::INITIAL, ctx),
        }
    }

    pub fn step(&self) -> F::Id {
        self.engine.state()
    }
}

impl<C, F> State<C> for Nested<C, F>
where
    F: StateFactory<C>,
    F::Id: Sequence,
{
    fn tick(&mut self, ctx: &mut C) -> Option<Event> {
        self.engine.tick(ctx);
        let step = self.engine.state();
        if step == <F::Id as Sequence>::FINISHED {
            Some(Event::Next)
        } else if step == <F::Id as SubMachine>::ERROR {
            Some(Event::Error)
        } else {
            None
        }
    }

    fn exit(&mut self) {
        self.engine.exit();
    }
}

// ---------------------------------------------------------------------------
// Send and check
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStep {
    Send,
    Check,
    Finished,
    Error,
}

impl StateId for ExchangeStep {
    fn name(self) -> &'static str {
        match self {
            Self::Send => "Send",
            Self::Check => "Check",
            Self::Finished => "Finished",
            Self::Error => "Error",
        }
    }
}

impl SubMachine for ExchangeStep {
    const ROWS: &'static [Row<Self>] = &[
        (Self::Send, Event::Next, Self::Check),
        (Self::Send, Event::Error, Self::Error),
        (Self::Check, Event::Next, Self::Finished),
        (Self::Check, Event::Retry, Self::Send),
        (Self::Check, Event::Timeout, Self::Error),
        (Self::Check, Event::Error, Self::Error),
    ];
    const INITIAL: Self = Self::Send;
    const ERROR: Self = Self::Error;
}

impl Sequence for ExchangeStep {
    const FINISHED: Self = Self::Finished;
}

pub struct ExchangeFactory<C> {
    command: Rc<str>,
    validator: Validator,
    retries: RetryBudget,
    _ctx: PhantomData<fn(&mut C)>,
}

impl<C: DeviceContext> StateFactory<C> for ExchangeFactory<C> {
    type Id = ExchangeStep;

    fn create(&mut self, id: ExchangeStep, ctx: &mut C) -> Box<dyn State<C>> {
        match id {
            ExchangeStep::Send => Box::new(SendCommand::new(Rc::clone(&self.command))),
            ExchangeStep::Check => {
                let io = ctx.io();
                let deadline = io.deadline(io.timing.response_timeout);
                Box::new(WaitForAnswer::new(
                    Rc::clone(&self.validator),
                    self.retries.clone(),
                    deadline,
                ))
            }
            ExchangeStep::Finished | ExchangeStep::Error => Box::new(Parked),
        }
    }
}

/// `Send -> WaitForAnswer`, retried on mismatch until the device's retry
/// budget is spent.  Surfaces only `Next` or `Error`.
pub type SendAndCheck<C> = Nested<C, ExchangeFactory<C>>;

/// Build a boxed send-and-check state using the device's retry budget.
pub fn send_and_check<C: DeviceContext>(
    command: impl Into<Rc<str>>,
    validator: Validator,
    ctx: &mut C,
) -> Box<dyn State<C>> {
    let retries = ctx.io().timing.retries;
    let factory = ExchangeFactory {
        command: command.into(),
        validator,
        retries: RetryBudget::new(retries),
        _ctx: PhantomData,
    };
    Box::new(SendAndCheck::enter(factory, ctx))
}

// ---------------------------------------------------------------------------
// Delay
// ---------------------------------------------------------------------------

/// Holds until `deadline`, then yields its configured event.
pub struct Delay {
    deadline: Instant,
    event: Event,
}

impl Delay {
    pub fn new<C: DeviceContext>(ctx: &mut C, duration: Duration, event: Event) -> Self {
        Self {
            deadline: ctx.io().deadline(duration),
            event,
        }
    }

    /// Pause for the device's poll interval, then yield `Next`.
    pub fn poll<C: DeviceContext>(ctx: &mut C) -> Self {
        let interval = ctx.io().timing.poll_interval;
        Self::new(ctx, interval, Event::Next)
    }
}

impl<C: DeviceContext> State<C> for Delay {
    fn tick(&mut self, ctx: &mut C) -> Option<Event> {
        if ctx.io().now() >= self.deadline {
            return Some(self.event);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sim::ScriptedTransport;
    use crate::adapters::time::ManualClock;
    use crate::fsm::context::{DeviceIo, ProtocolTiming};

    fn make_io(script: &ScriptedTransport, clock: &ManualClock, retries: u32) -> DeviceIo {
        DeviceIo::new(
            "TEST",
            Box::new(script.clone()),
            Rc::new(clock.clone()),
            ProtocolTiming {
                retries,
                ..ProtocolTiming::default()
            },
        )
    }

    fn expect_ok() -> Validator {
        Rc::new(|frame: &str| frame == "OK")
    }

    #[test]
    fn exchange_table_is_valid() {
        assert!(super::super::validate::<ExchangeStep>().is_ok());
    }

    #[test]
    fn send_and_check_succeeds() {
        let script = ScriptedTransport::new();
        let clock = ManualClock::new();
        let mut io = make_io(&script, &clock, 0);
        let mut state = send_and_check("SO 1", expect_ok(), &mut io);

        assert_eq!(state.tick(&mut io), None, "Send -> Check");
        assert_eq!(script.sent(), vec![b"SO 1\r".to_vec()]);
        script.push_input(b"OK\r");
        assert_eq!(state.tick(&mut io), Some(Event::Next));
    }

    #[test]
    fn send_and_check_retries_then_succeeds() {
        let script = ScriptedTransport::new();
        let clock = ManualClock::new();
        let mut io = make_io(&script, &clock, 3);
        let mut state = send_and_check("RO", Rc::new(|f: &str| f == "1"), &mut io);

        state.tick(&mut io);
        script.push_input(b"0\r");
        assert_eq!(state.tick(&mut io), None, "mismatch -> Send again");
        state.tick(&mut io);
        script.push_input(b"1\r");
        assert_eq!(state.tick(&mut io), Some(Event::Next));
        assert_eq!(script.sent().len(), 2);
    }

    #[test]
    fn send_and_check_surfaces_error_once_retries_exhausted() {
        let script = ScriptedTransport::new();
        let clock = ManualClock::new();
        let mut io = make_io(&script, &clock, 1);
        let mut state = send_and_check("RO", Rc::new(|f: &str| f == "1"), &mut io);

        let mut events = Vec::new();
        for _ in 0..6 {
            if let Some(e) = state.tick(&mut io) {
                events.push(e);
            }
            script.push_input(b"0\r");
        }
        assert_eq!(events.first(), Some(&Event::Error));
        assert_eq!(script.sent().len(), 2, "one try plus one retry");
    }

    #[test]
    fn send_and_check_timeout_is_error() {
        let script = ScriptedTransport::new();
        let clock = ManualClock::new();
        let mut io = make_io(&script, &clock, 0);
        let mut state = send_and_check("RO", expect_ok(), &mut io);

        state.tick(&mut io);
        clock.advance(Duration::from_millis(1000));
        assert_eq!(state.tick(&mut io), Some(Event::Error));
    }

    #[test]
    fn delay_fires_after_duration() {
        let script = ScriptedTransport::new();
        let clock = ManualClock::new();
        let mut io = make_io(&script, &clock, 0);
        let mut delay = Delay::new(&mut io, Duration::from_millis(500), Event::Check);

        assert_eq!(delay.tick(&mut io), None);
        clock.advance(Duration::from_millis(499));
        assert_eq!(delay.tick(&mut io), None);
        clock.advance(Duration::from_millis(1));
        assert_eq!(delay.tick(&mut io), Some(Event::Check));
    }
}
