//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises the orchestration layer
//! against mock or simulated instruments.  Nothing here needs a serial
//! port.

mod automation_tests;
mod mock_devices;
mod simulated_rig_tests;
