//! Application core: the orchestration automaton and its run loop.
//!
//! Everything here reaches the outside world only through the **port
//! traits** in [`ports`] (transports, clock, event sink), so complete
//! experiments run in tests against simulated instruments.

pub mod automation;
pub mod builder;
pub mod events;
pub mod ports;
pub mod runner;
