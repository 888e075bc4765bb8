//! Table-driven, event-based finite state machine engine.
//!
//! Every layer of the rig (protocol exchanges, device drivers, the
//! orchestration automaton) is one of these engines:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  TransitionTable (ordered, first match wins)             │
//! │  ┌──────────────┬───────────┬──────────────┐             │
//! │  │ from         │ event     │ to           │             │
//! │  ├──────────────┼───────────┼──────────────┤             │
//! │  │ Send         │ Next      │ Check        │             │
//! │  │ Check        │ Retry     │ Send         │             │
//! │  │ Check        │ Next      │ Finished     │             │
//! │  │ Check        │ Timeout   │ Error        │             │
//! │  └──────────────┴───────────┴──────────────┘             │
//! │  StateFactory: id ──▶ Box<dyn State<C>>                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Each tick the engine calls [`State::tick`] on the **current** state.
//! If it yields an event, the table is scanned top to bottom for the first
//! `(current, event)` row.  On a match the current state is exited and the
//! factory builds the target.  Without a match the event is handed back to
//! the caller, so an enclosing layer can react to it.  At most one hop
//! happens per tick.

pub mod context;
pub mod states;

use core::fmt;

use log::trace;

use crate::error::FsmError;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Every event any engine in the crate can emit or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Next,
    Retry,
    Timeout,
    Error,
    Done,
    /// Periodic watchdog ("check") of the calorimeter reader.
    Check,
    /// The strategy has no further operation point.
    Exhausted,
    PumpOn,
    PumpOff,
    RequestPumpOn,
    RequestPumpOff,
    /// A setpoint cell holds a value the device has not seen yet.
    NewSetpoint,
    /// The calorimeter needs its set temperature (re)sent.
    NewSetTemp,
    ErrorPump,
    ErrorThermostat,
    ErrorCalorimeter,
    /// Operator stop: run the ordered shutdown and halt.
    Abort,
}

// ---------------------------------------------------------------------------
// State identity and behaviour
// ---------------------------------------------------------------------------

/// Closed set of state identifiers for one engine.
pub trait StateId: Copy + Eq + fmt::Debug + 'static {
    fn name(self) -> &'static str;
}

/// One live state.  Created on entry, dropped on the transition out.
pub trait State<C> {
    /// Advance by one bounded, non-blocking step.
    /// `None` means "no transition yet".
    fn tick(&mut self, ctx: &mut C) -> Option<Event>;

    /// React to an externally injected event.  Returns `true` if handled.
    fn handle_event(&mut self, _event: Event) -> bool {
        false
    }

    /// Runs once when the engine leaves this state.
    fn exit(&mut self) {}
}

/// Builds a fresh state for an identifier.  Exhaustive `match` on `Id`
/// replaces any "unknown state" runtime failure.
pub trait StateFactory<C> {
    type Id: StateId;

    fn create(&mut self, id: Self::Id, ctx: &mut C) -> Box<dyn State<C>>;
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// `(from, event, to)`
pub type Row<S> = (S, Event, S);

/// Ordered transition rows.  Immutable for the lifetime of an engine.
pub struct TransitionTable<S: 'static> {
    rows: &'static [Row<S>],
}

impl<S: 'static> Clone for TransitionTable<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: 'static> Copy for TransitionTable<S> {}

impl<S: StateId> TransitionTable<S> {
    /// Validate and wrap `rows`.
    ///
    /// Repeating an identical row is harmless.  Two rows with the same
    /// `(from, event)` but different targets are rejected.
    pub fn new(rows: &'static [Row<S>]) -> Result<Self, FsmError> {
        for (idx, (from, event, to)) in rows.iter().enumerate() {
            let conflict = rows[..idx]
                .iter()
                .any(|(f, e, t)| f == from && e == event && t != to);
            if conflict {
                return Err(FsmError::ConflictingTransition {
                    state: from.name(),
                    event: *event,
                });
            }
        }
        Ok(Self { rows })
    }

    /// Wrap rows that were already validated with [`TransitionTable::new`]
    /// (every driver validates its nested tables at construction).
    pub(crate) const fn trusted(rows: &'static [Row<S>]) -> Self {
        Self { rows }
    }

    /// Target of the first row matching `(from, event)`.
    pub fn lookup(&self, from: S, event: Event) -> Option<S> {
        self.rows
            .iter()
            .find(|(f, e, _)| *f == from && *e == event)
            .map(|(_, _, to)| *to)
    }

    pub fn rows(&self) -> &'static [Row<S>] {
        self.rows
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The state machine engine.
///
/// Owns its table, its factory and the current state.  The context `C` is
/// threaded through every call rather than owned, so nested engines can
/// share their parent's context.
pub struct Engine<C, F: StateFactory<C>> {
    table: TransitionTable<F::Id>,
    factory: F,
    current_id: F::Id,
    current: Box<dyn State<C>>,
    exited: bool,
}

impl<C, F: StateFactory<C>> Engine<C, F> {
    /// Build the initial state and return a running engine.
    pub fn enter(table: TransitionTable<F::Id>, mut factory: F, initial: F::Id, ctx: &mut C) -> Self {
        let current = factory.create(initial, ctx);
        Self {
            table,
            factory,
            current_id: initial,
            current,
            exited: false,
        }
    }

    /// Tick the current state.
    ///
    /// Returns an event only when the table had no row for it (bubble-up).
    pub fn tick(&mut self, ctx: &mut C) -> Option<Event> {
        if self.exited {
            return None;
        }
        let event = self.current.tick(ctx)?;
        if self.transition(event, ctx) {
            None
        } else {
            Some(event)
        }
    }

    /// Inject an event from outside.  The table is consulted first, then
    /// the current state's own handler.
    pub fn handle_event(&mut self, event: Event, ctx: &mut C) -> bool {
        if self.exited {
            return false;
        }
        self.transition(event, ctx) || self.current.handle_event(event)
    }

    /// Tear down the current state.  Later ticks do nothing.
    pub fn exit(&mut self) {
        if !self.exited {
            self.current.exit();
            self.exited = true;
        }
    }

    pub fn state(&self) -> F::Id {
        self.current_id
    }

    pub fn state_name(&self) -> &'static str {
        self.current_id.name()
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn transition(&mut self, event: Event, ctx: &mut C) -> bool {
        let Some(target) = self.table.lookup(self.current_id, event) else {
            return false;
        };

        trace!(
            "{} --{:?}--> {}",
            self.current_id.name(),
            event,
            target.name()
        );

        self.current.exit();
        self.current = self.factory.create(target, ctx);
        self.current_id = target;
        true
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Node(u8);

    impl StateId for Node {
        fn name(self) -> &'static str {
            ["n0", "n1", "n2", "n3"][self.0 as usize]
        }
    }

    const EVENTS: [Event; 4] = [Event::Next, Event::Retry, Event::Error, Event::Done];

    /// Emits a fixed event from the context on every tick.
    struct Emit;

    impl State<Option<Event>> for Emit {
        fn tick(&mut self, ctx: &mut Option<Event>) -> Option<Event> {
            *ctx
        }
    }

    struct EmitFactory;

    impl StateFactory<Option<Event>> for EmitFactory {
        type Id = Node;

        fn create(&mut self, _id: Node, _ctx: &mut Option<Event>) -> Box<dyn State<Option<Event>>> {
            Box::new(Emit)
        }
    }

    fn arb_row() -> impl Strategy<Value = Row<Node>> {
        (0u8..4, 0usize..4, 0u8..4).prop_map(|(f, e, t)| (Node(f), EVENTS[e], Node(t)))
    }

    proptest! {
        #[test]
        fn tick_follows_first_matching_row(
            rows in proptest::collection::vec(arb_row(), 0..12),
            events in proptest::collection::vec(proptest::option::of(0usize..4), 1..40),
        ) {
            let rows: &'static [Row<Node>] = Box::leak(rows.into_boxed_slice());
            let conflicting = rows.iter().enumerate().any(|(i, (f, e, t))| {
                rows[..i].iter().any(|(f2, e2, t2)| f2 == f && e2 == e && t2 != t)
            });
            let table = TransitionTable::new(rows);
            prop_assert_eq!(table.is_err(), conflicting);
            let Ok(table) = table else { return Ok(()); };

            let mut ctx: Option<Event> = None;
            let mut engine = Engine::enter(table, EmitFactory, Node(0), &mut ctx);
            for ev in events {
                ctx = ev.map(|i| EVENTS[i]);
                let before = engine.state();
                let bubbled = engine.tick(&mut ctx);
                let expected = ctx.and_then(|e| {
                    rows.iter().find(|(f, ev, _)| *f == before && *ev == e).map(|(_, _, t)| *t)
                });
                match expected {
                    Some(target) => {
                        prop_assert_eq!(engine.state(), target);
                        prop_assert_eq!(bubbled, None);
                    }
                    None => {
                        prop_assert_eq!(engine.state(), before);
                        prop_assert_eq!(bubbled, ctx);
                    }
                }
            }
        }
    }
}
