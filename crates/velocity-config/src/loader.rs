//! Configuration loader with layered sources.

use crate::{format_validation_errors, AppConfig, ConfigValidator};
use config::{Config, ConfigError, Environment, File, Map};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use velocity_core::{VelocityError, VelocityResult};

/// Environment variable naming the environment-specific config file.
pub const ENVIRONMENT_VAR: &str = "VELOCITY_ENVIRONMENT";

/// Prefix of environment variable overrides, e.g.
/// `VELOCITY__JOBS__MANAGER__MAX_WORKERS=8`.
pub const ENV_PREFIX: &str = "VELOCITY";

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `VELOCITY__` prefix
    pub fn new(config_dir: impl Into<String>) -> VelocityResult<Self> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> VelocityResult<Self> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    ///
    /// The current configuration is kept if the new one fails to load.
    pub async fn reload(&self) -> VelocityResult<()> {
        let new_config = Self::load_config(&self.config_dir)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Gets a specific configuration value by dotted key path.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }

    fn load_config(config_dir: &str) -> VelocityResult<AppConfig> {
        // Load .env file if present
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string());

        load_from(config_dir, &environment, None)
    }
}

/// Builds and validates an [`AppConfig`] from `config_dir`.
///
/// `env` replaces the process environment as the source of overrides when
/// given.
pub fn load_from(
    config_dir: &str,
    environment: &str,
    env: Option<Map<String, String>>,
) -> VelocityResult<AppConfig> {
    info!(config_dir, environment, "Loading configuration");

    let mut builder = Config::builder()
        .set_default("app.environment", environment)
        .map_err(config_error)?;

    for name in ["default", environment, "local"] {
        let path = format!("{}/{}.toml", config_dir, name);
        if Path::new(&path).exists() {
            debug!(path = %path, "Loading config file");
            builder = builder.add_source(File::with_name(&path).required(false));
        }
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(env),
    );

    let app_config: AppConfig = builder
        .build()
        .map_err(config_error)?
        .try_deserialize()
        .map_err(config_error)?;

    ConfigValidator::validate(&app_config)
        .map_err(|errors| VelocityError::configuration(format_validation_errors(&errors)))?;

    if app_config.app.is_production() && app_config.jobs.redis.url.contains("localhost") {
        warn!("Production configuration points the job store at localhost");
    }

    Ok(app_config)
}

fn config_error(err: ConfigError) -> VelocityError {
    VelocityError::configuration(err.to_string())
}
