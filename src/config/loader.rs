//! Configuration Loader
//!
//! Builds a [`RuntimeConfig`] with the `config` crate: one TOML source, then
//! `DISPATCH__SECTION__KEY` environment overrides on top, then validation.

use super::error::{ConfigResult, ConfigurationError};
use super::RuntimeConfig;
use config::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "DISPATCH";

/// Separator between prefix, section and key in override variables
pub const ENV_SEPARATOR: &str = "__";

/// Loaded, validated runtime configuration
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: RuntimeConfig,
    source_name: String,
}

impl ConfigManager {
    /// Load configuration from a TOML file plus process environment overrides
    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))?;
        Self::load(&contents, &path.display().to_string(), None)
    }

    /// Load configuration from TOML text plus process environment overrides
    pub fn load_from_str(toml: &str) -> ConfigResult<Arc<ConfigManager>> {
        Self::load(toml, "inline configuration", None)
    }

    /// Load configuration from TOML text with an explicit override map
    /// instead of the process environment
    ///
    /// Useful for testing without modifying global environment variables.
    pub fn load_from_str_with_env(
        toml: &str,
        overrides: HashMap<String, String>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load(toml, "inline configuration", Some(overrides))
    }

    /// Wrap an already-built configuration
    pub fn from_config(config: RuntimeConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            source_name: "programmatic configuration".to_string(),
        }))
    }

    fn load(
        toml: &str,
        source_name: &str,
        overrides: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        debug!(source = %source_name, "Loading runtime configuration");

        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(overrides);

        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .add_source(environment)
            .build()
            .and_then(|built| built.try_deserialize::<RuntimeConfig>())
            .map_err(|e| ConfigurationError::parse_error(source_name, e))?;

        config.validate()?;

        info!(
            source = %source_name,
            host = %config.broker.sanitized_host(),
            queue = %config.broker.queue,
            publish_queue = %config.broker.publish_queue(),
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            source_name: source_name.to_string(),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Where the configuration came from
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Configuration as JSON with secrets masked, for logging
    pub fn sanitized(&self) -> serde_json::Value {
        let mut config = self.config.clone();
        config.broker.host = config.broker.sanitized_host();
        serde_json::to_value(&config).unwrap_or(serde_json::Value::Null)
    }
}
