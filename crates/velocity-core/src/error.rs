//! Unified error type for the Velocity crates and the worker host.

use std::fmt::Debug;
use thiserror::Error;

/// Unified error type for Velocity.
///
/// Library crates keep their own precise error enums and convert into this
/// one at the application boundary.
#[derive(Error, Debug)]
pub enum VelocityError {
    /// Resource not found
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound {
        resource_type: &'static str,
        id: String,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Persistence backend error
    #[error("Store error: {0}")]
    Store(String),

    /// Job scheduling or execution error
    #[error("Job error: {0}")]
    Job(String),

    /// Tracing/telemetry setup error
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VelocityError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Job(_) => "JOB_ERROR",
            Self::Telemetry(_) => "TELEMETRY_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a not found error for a resource.
    #[must_use]
    pub fn not_found<T: ToString>(resource_type: &'static str, id: T) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    /// Checks if this error is retriable.
    ///
    /// Only backend faults qualify; everything else needs a code or
    /// configuration change before a retry can succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl From<serde_json::Error> for VelocityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(VelocityError::not_found("Job", "jobs/a/1").error_code(), "NOT_FOUND");
        assert_eq!(VelocityError::validation("bad").error_code(), "VALIDATION_ERROR");
        assert_eq!(VelocityError::configuration("missing").error_code(), "CONFIGURATION_ERROR");
        assert_eq!(VelocityError::Store("down".into()).error_code(), "STORE_ERROR");
        assert_eq!(VelocityError::internal("oops").error_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_retriable_errors() {
        assert!(VelocityError::Store("connection reset".into()).is_retriable());
        assert!(!VelocityError::validation("priority out of range").is_retriable());
        assert!(!VelocityError::Job("boom".into()).is_retriable());
    }

    #[test]
    fn test_not_found_display() {
        let err = VelocityError::not_found("Job", "jobs/echo/42");
        let msg = err.to_string();
        assert!(msg.contains("Job") && msg.contains("jobs/echo/42"));
    }

    #[test]
    fn test_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = VelocityError::from(json_err);
        assert!(matches!(err, VelocityError::Internal(msg) if msg.contains("JSON")));
    }

    #[test]
    fn test_from_anyhow() {
        let err: VelocityError = anyhow::anyhow!("wrapped").into();
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
        assert_eq!(err.to_string(), "wrapped");
    }
}
