//! # Velocity Core
//!
//! Error types and tracing initialisation shared by the Velocity job
//! scheduler crates and the worker host binary.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::{init_telemetry, LogFormat, TelemetryConfig};
