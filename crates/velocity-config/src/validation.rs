//! Configuration validation module.
//!
//! Collects every problem in one pass so a bad deployment fails at startup
//! with the full list instead of one error at a time.

use crate::AppConfig;
use std::fmt;
use url::Url;
use velocity_jobs::{LeaseConfig, ManagerConfig, RedisConfig};

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Pool size must be at least one.
    EmptyPool,
    /// Pool size exceeds maximum allowed.
    PoolSizeTooLarge { value: usize, maximum: usize },
    /// The worker pool must hold at least one worker.
    NoWorkers,
    /// Worker count exceeds maximum allowed.
    TooManyWorkers { value: usize, maximum: usize },
    /// Interval or timeout must be positive.
    NonPositiveInterval { name: String },
    /// Priority level count above the supported maximum.
    TooManyPriorityLevels { value: u32, maximum: u32 },
    /// Key prefix must not be empty.
    EmptyKeyPrefix,
    /// Service name must not be empty.
    EmptyServiceName,
    /// Metrics listen address is not a socket address.
    InvalidListenAddr { value: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::EmptyPool => write!(f, "Redis pool size must be at least 1"),
            Self::PoolSizeTooLarge { value, maximum } => {
                write!(f, "Pool size {} exceeds maximum allowed ({})", value, maximum)
            }
            Self::NoWorkers => write!(f, "max_workers must be at least 1"),
            Self::TooManyWorkers { value, maximum } => {
                write!(f, "max_workers {} exceeds maximum allowed ({})", value, maximum)
            }
            Self::NonPositiveInterval { name } => write!(f, "{} must be positive", name),
            Self::TooManyPriorityLevels { value, maximum } => {
                write!(
                    f,
                    "priority_levels {} exceeds maximum allowed ({})",
                    value, maximum
                )
            }
            Self::EmptyKeyPrefix => write!(f, "Redis key prefix must not be empty"),
            Self::EmptyServiceName => write!(f, "Telemetry service name must not be empty"),
            Self::InvalidListenAddr { value } => {
                write!(f, "Invalid metrics listen address: {}", value)
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of configuration validation containing all errors found.
#[derive(Debug)]
pub struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the validation errors.
    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.errors
    }

    /// Converts to Result, returning Err with all errors if any exist.
    pub fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum connections per pool.
    const MAX_POOL_SIZE: usize = 256;
    /// Maximum workers per manager.
    const MAX_WORKERS: usize = 1024;
    /// Maximum priority queues per store.
    const MAX_PRIORITY_LEVELS: u32 = 64;

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::new();

        Self::validate_redis(&config.jobs.redis, &mut result);
        Self::validate_manager(&config.jobs.manager, &mut result);
        Self::validate_lease(&config.jobs.lease, &mut result);

        if config.telemetry.enabled && config.telemetry.service_name.trim().is_empty() {
            result.add_error(ConfigValidationError::EmptyServiceName);
        }

        if config.metrics.enabled && config.metrics.socket_addr().is_err() {
            result.add_error(ConfigValidationError::InvalidListenAddr {
                value: config.metrics.listen_addr.clone(),
            });
        }

        result.into_result()
    }

    fn validate_redis(config: &RedisConfig, result: &mut ValidationResult) {
        match Url::parse(&config.url) {
            Ok(url) if matches!(url.scheme(), "redis" | "rediss" | "redis+unix") => {}
            Ok(url) => result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: format!("unsupported scheme {}", url.scheme()),
            }),
            Err(e) => result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: format!("{}: {}", e, config.url),
            }),
        }

        if config.pool_size == 0 {
            result.add_error(ConfigValidationError::EmptyPool);
        } else if config.pool_size > Self::MAX_POOL_SIZE {
            result.add_error(ConfigValidationError::PoolSizeTooLarge {
                value: config.pool_size,
                maximum: Self::MAX_POOL_SIZE,
            });
        }

        if config.key_prefix.trim().is_empty() {
            result.add_error(ConfigValidationError::EmptyKeyPrefix);
        }
    }

    fn validate_manager(config: &ManagerConfig, result: &mut ValidationResult) {
        if config.max_workers == 0 {
            result.add_error(ConfigValidationError::NoWorkers);
        } else if config.max_workers > Self::MAX_WORKERS {
            result.add_error(ConfigValidationError::TooManyWorkers {
                value: config.max_workers,
                maximum: Self::MAX_WORKERS,
            });
        }

        if config.poll_interval_ms == 0 {
            result.add_error(ConfigValidationError::NonPositiveInterval {
                name: "jobs.manager.poll_interval_ms".to_string(),
            });
        }

        // A zero BLPOP timeout blocks forever.
        if config.pop_timeout_ms == 0 {
            result.add_error(ConfigValidationError::NonPositiveInterval {
                name: "jobs.manager.pop_timeout_ms".to_string(),
            });
        }

        if config.priority_levels > Self::MAX_PRIORITY_LEVELS {
            result.add_error(ConfigValidationError::TooManyPriorityLevels {
                value: config.priority_levels,
                maximum: Self::MAX_PRIORITY_LEVELS,
            });
        }
    }

    fn validate_lease(config: &LeaseConfig, result: &mut ValidationResult) {
        if config.enabled && config.duration_ms == 0 {
            result.add_error(ConfigValidationError::NonPositiveInterval {
                name: "jobs.lease.duration_ms".to_string(),
            });
        }
    }
}

/// Formats validation errors for display.
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}
