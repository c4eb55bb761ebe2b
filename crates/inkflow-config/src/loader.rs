//! Configuration loader with layered sources.

use crate::AppConfig;
use config::{Config, ConfigError, Environment, File};
use inkflow_core::InkflowError;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

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
    /// 4. Environment variables with `INKFLOW__` prefix
    pub fn new(config_dir: impl Into<String>) -> Result<Self, InkflowError> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, InkflowError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    pub async fn reload(&self) -> Result<(), InkflowError> {
        let new_config = Self::load_config(&self.config_dir)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Loads configuration from the specified directory.
    fn load_config(config_dir: &str) -> Result<AppConfig, InkflowError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var("INKFLOW_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        info!("Loading configuration for environment: {}", environment);

        let mut builder = Config::builder();

        // 1. Load default configuration
        let default_path = format!("{}/default.toml", config_dir);
        if Path::new(&default_path).exists() {
            debug!("Loading default config from: {}", default_path);
            builder = builder.add_source(File::with_name(&default_path).required(false));
        }

        // 2. Load environment-specific configuration
        let env_path = format!("{}/{}.toml", config_dir, environment);
        if Path::new(&env_path).exists() {
            debug!("Loading environment config from: {}", env_path);
            builder = builder.add_source(File::with_name(&env_path).required(false));
        }

        // 3. Load local overrides (not committed to version control)
        let local_path = format!("{}/local.toml", config_dir);
        if Path::new(&local_path).exists() {
            debug!("Loading local config from: {}", local_path);
            builder = builder.add_source(File::with_name(&local_path).required(false));
        }

        // 4. Override with environment variables (INKFLOW__SECTION__KEY)
        builder = builder.add_source(
            Environment::with_prefix("INKFLOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error_to_inkflow_error)?;

        let mut app_config: AppConfig = config
            .try_deserialize()
            .map_err(config_error_to_inkflow_error)?;

        if app_config.app.environment != environment {
            app_config.app.environment = environment;
        }

        Self::validate_config(&app_config)?;

        Ok(app_config)
    }

    /// Validates the configuration.
    pub fn validate_config(config: &AppConfig) -> Result<(), InkflowError> {
        if config.broker.queue.trim().is_empty() {
            return Err(InkflowError::Configuration("Broker queue name is required".to_string()));
        }

        if config.broker.reconnect_delay_secs == 0 {
            return Err(InkflowError::Configuration(
                "Broker reconnect delay must be at least one second".to_string(),
            ));
        }

        if config.broker.lease_ttl_secs <= config.broker.heartbeat_secs {
            return Err(InkflowError::Configuration(
                "Broker lease TTL must be longer than the heartbeat interval".to_string(),
            ));
        }

        if config.consumer.prefetch == 0 {
            return Err(InkflowError::Configuration(
                "Consumer prefetch must be greater than zero".to_string(),
            ));
        }

        if config.warmup.page_limit == 0 {
            return Err(InkflowError::Configuration(
                "Warm-up page limit must be greater than zero".to_string(),
            ));
        }

        if config.database.url.is_empty() {
            return Err(InkflowError::Configuration("Database URL is required".to_string()));
        }

        if !config.redis.enabled {
            warn!("Redis cache is disabled; invalidation jobs will be acknowledged without effect");
        }

        Ok(())
    }

    /// Gets a specific configuration value by key path.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }
}

fn config_error_to_inkflow_error(err: ConfigError) -> InkflowError {
    InkflowError::Configuration(err.to_string())
}
