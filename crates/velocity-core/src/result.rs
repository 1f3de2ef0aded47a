//! Result type aliases for Velocity.

use crate::VelocityError;

/// A specialized `Result` type for Velocity operations.
pub type VelocityResult<T> = Result<T, VelocityError>;
