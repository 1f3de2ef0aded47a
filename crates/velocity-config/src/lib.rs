//! # Velocity Config
//!
//! Configuration management for the Velocity job worker host.
//! Supports layered configuration from files and environment variables,
//! with validation and runtime refresh.

mod app_config;
mod loader;
mod validation;

pub use app_config::*;
pub use loader::*;
pub use validation::*;
