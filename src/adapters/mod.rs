//! Adapters: concrete implementations of the port traits.
//!
//! | Adapter    | Implements            | Connects to               |
//! |------------|-----------------------|---------------------------|
//! | `log_sink` | EventSink             | `log` facade              |
//! | `serial`   | Transport, PortOpener | `serialport` (feature)    |
//! | `sim`      | Transport, PortOpener | instrument models         |
//! | `time`     | Clock                 | `Instant`, manual, scaled |

pub mod log_sink;
pub mod serial;
pub mod sim;
pub mod time;
