//! Calorimetry rig controller.
//!
//! A poll-driven stack of table-driven state machines: protocol
//! exchanges, one driver per instrument, and an orchestration automaton
//! that walks a list of operation points under a pluggable strategy.
//! The binary in `main.rs` is a thin CLI around [`app::builder`] and
//! [`app::runner`].

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod drivers;
pub mod error;
pub mod fsm;
pub mod protocol;
pub mod strategy;
