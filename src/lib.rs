//! Core library for the AutoPatterning workstation.
//!
//! Keeps a session with a three-axis stage controller alive, streams its axis
//! positions at a fixed rate, and drives a USB flip mount that gates the
//! patterning laser. The binary in `main.rs` and any presentation layer use
//! the [`workstation::Workstation`] context.

pub mod actuator;
pub mod config;
pub mod error;
pub mod hardware;
pub mod scheduler;
pub mod stage;
pub mod telemetry;
pub mod workstation;
