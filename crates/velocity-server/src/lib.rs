//! # Velocity Server Library
//!
//! Built-in run functions and startup helpers for the `velocity-workerd`
//! worker host.

pub mod runners;
pub mod startup;
