//! States shared by every engine in the crate.

use super::{Event, State};

/// Terminal placeholder (`Finished`, `Error`, ...).
///
/// Never yields an event.  Enclosing layers detect it by polling the
/// engine's current state id.
#[derive(Debug, Clone, Copy, Default)]
pub struct Parked;

impl<C> State<C> for Parked {
    fn tick(&mut self, _ctx: &mut C) -> Option<Event> {
        None
    }
}
