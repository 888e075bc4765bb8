//! Protocol layers shared by every instrument driver.
//!
//! ```text
//!  drivers (HPLC, Lambda, Fisher, Calorimeter)      top layer
//!      │
//!  composite: SendAndCheck, Delay, Nested           middle layer
//!      │
//!  primitives: SendCommand, WaitForAnswer           bottom layer
//!      │
//!  Transport (serial link)
//! ```

pub mod composite;
pub mod primitives;

use crate::error::FsmError;
use crate::fsm::{Row, StateId, TransitionTable};

/// A nested engine with a fixed table, start and error states.
pub trait SubMachine: StateId {
    const ROWS: &'static [Row<Self>];
    const INITIAL: Self;
    const ERROR: Self;
}

/// A sub-machine that runs to a success terminal.
pub trait Sequence: SubMachine {
    const FINISHED: Self;
}

/// A sub-machine that polls forever, pausing in `WAITING`.
pub trait Polling: SubMachine {
    const WAITING: Self;
}

/// Check a sub-machine's table for conflicting rows.
pub fn validate<S: SubMachine>() -> Result<(), FsmError> {
    TransitionTable::new(S::ROWS).map(|_| ())
}
